// SPDX-License-Identifier: Apache-2.0

//! Stage-2 data-abort handling.
//!
//! Entered with a snapshot of the guest's general registers after the MMU
//! trapped an access to a software-mapped region. The faulting address is
//! stage-1-translated, the stage-2 tables are walked, the trapped
//! instruction is fetched and decoded, and the access is emulated against
//! the descriptor's mapping kind. Within one abort the order is: emulate,
//! hook/proxy side effects, trace event, optional flush, load writeback.

use log::error;

use crate::insn::Insn;
use crate::layout::GuestAddrSpace;
use crate::mem::{AccessSize, MemoryRegion};
use crate::pagetable::{HvHook, SpteKind, Stage2Tables, TableAlloc};
use crate::proxy::{mmio_evt_flags, EventType, MmioTraceEvent, ProxyPort, VmHookData};

/// Write-not-Read bit of the data-abort syndrome.
const ESR_ISS_DABORT_WNR: u64 = 1 << 6;

/// The system-register surface the handler consumes. Implemented over the
/// EL2 registers on hardware and by test doubles on the host.
pub trait GuestCpu {
    /// Exception syndrome of the abort.
    fn esr(&self) -> u64;

    /// Faulting guest virtual address.
    fn far(&self) -> u64;

    /// Exception return address (the trapped instruction).
    fn elr(&self) -> u64;

    fn set_elr(&mut self, elr: u64);

    /// Stage-1-only translation of a guest virtual address, honoring the
    /// guest's exception level and the access direction. `None` on fault.
    fn stage1_translate(&mut self, va: u64, write: bool) -> Option<u64>;

    /// Combined stage-1 + stage-2 translation, used to fetch the trapped
    /// instruction through the hypervisor's own mapping.
    fn full_translate(&mut self, va: u64) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Guest stage-1 translation of the faulting address failed.
    Stage1Fault,
    /// The IPA exceeds the guest physical address space.
    OutOfRange,
    /// The stage-2 walk found nothing.
    Unmapped,
    /// The abort hit a hardware-valid descriptor.
    UnexpectedHwFault,
    /// The trapped instruction could not be fetched.
    FetchFault,
    /// The instruction is not one of the emulated forms.
    Decode,
    /// An in-process hook refused the access.
    HookFailed,
    /// The software descriptor kind field is out of range.
    BadDescriptor,
    /// The remote side went away during a proxy hook.
    ProxyFailed,
}

fn phys_read(paddr: u64, width: AccessSize) -> u64 {
    MemoryRegion::new(paddr, width.bytes()).io_read_width(0, width)
}

fn phys_write(paddr: u64, width: AccessSize, val: u64) {
    MemoryRegion::new(paddr, width.bytes()).io_write_width(0, width, val)
}

/// Emulate the trapped access and return with the guest ready to resume
/// past it. Errors are surfaced to the caller's exception path; the guest
/// must not be resumed after one.
pub fn handle_data_abort<C, A, P>(
    cpu: &mut C,
    tables: &Stage2Tables<A>,
    port: &mut P,
    regs: &mut [u64; 32],
) -> Result<(), Error>
where
    C: GuestCpu,
    A: TableAlloc,
    P: ProxyPort,
{
    let esr = cpu.esr();
    let is_write = esr & ESR_ISS_DABORT_WNR != 0;
    let far = cpu.far();

    let ipa = match cpu.stage1_translate(far, is_write) {
        Some(ipa) => ipa,
        None => {
            error!("stage 1 translation failed at VA {:#x}", far);
            return Err(Error::Stage1Fault);
        }
    };

    if ipa >= GuestAddrSpace::SIZE as u64 {
        error!("IPA out of bounds: {:#x} -> {:#x}", far, ipa);
        return Err(Error::OutOfRange);
    }

    let pte = tables.walk(ipa);
    if pte.is_zero() {
        error!("unmapped IPA {:#x}", ipa);
        return Err(Error::Unmapped);
    }
    if pte.is_hw() {
        error!("data abort on mapped page ({:#x} -> {:#x})", far, pte.0);
        return Err(Error::UnexpectedHwFault);
    }

    let target = pte.target();
    let paddr = target | (ipa & 3);

    let elr = cpu.elr();
    let elr_pa = match cpu.full_translate(elr) {
        Some(pa) => pa,
        None => {
            error!("failed to fetch instruction for data abort at {:#x}", elr);
            return Err(Error::FetchFault);
        }
    };

    let word = MemoryRegion::new(elr_pa, 4).io_read_u32(0);
    let insn = match Insn::decode(word) {
        Some(insn) => insn,
        None => {
            error!("instruction not emulated: {:#010x}", word);
            return Err(Error::Decode);
        }
    };
    if insn.is_store() != is_write {
        error!(
            "instruction {:#010x} does not match abort direction",
            word
        );
        return Err(Error::Decode);
    }
    let width = insn.width;

    let kind = match pte.kind() {
        Some(kind) => kind,
        None => {
            error!("invalid descriptor {:#018x} for IPA {:#x}", pte.0, ipa);
            return Err(Error::BadDescriptor);
        }
    };

    if is_write {
        let val = insn.store_value(regs);
        match kind {
            SpteKind::Map => phys_write(paddr, width, val),
            // A read-proxied region passes writes through to the faulting
            // address itself.
            SpteKind::ProxyHookR => phys_write(ipa, width, val),
            SpteKind::Hook => {
                let hook: HvHook = unsafe { core::mem::transmute(target as usize) };
                let mut v = val;
                if !hook(ipa, &mut v, true, width) {
                    return Err(Error::HookFailed);
                }
            }
            SpteKind::ProxyHookW | SpteKind::ProxyHookRw => {
                let mut data = VmHookData {
                    flags: mmio_evt_flags(width, true) as u32,
                    id: (target >> 2) as u32,
                    addr: ipa,
                    data: val,
                };
                if !port.vm_hook(&mut data) {
                    return Err(Error::ProxyFailed);
                }
            }
        }

        if pte.trace_write() {
            emit_trace(port, width, true, elr, ipa, val, pte.sync_trace());
        }
    } else {
        let val = match kind {
            SpteKind::Map => phys_read(paddr, width),
            // A write-proxied region passes reads through.
            SpteKind::ProxyHookW => phys_read(ipa, width),
            SpteKind::Hook => {
                let hook: HvHook = unsafe { core::mem::transmute(target as usize) };
                let mut v = 0;
                if !hook(ipa, &mut v, false, width) {
                    return Err(Error::HookFailed);
                }
                v
            }
            SpteKind::ProxyHookR | SpteKind::ProxyHookRw => {
                let mut data = VmHookData {
                    flags: mmio_evt_flags(width, false) as u32,
                    id: (target >> 2) as u32,
                    addr: ipa,
                    data: 0,
                };
                if !port.vm_hook(&mut data) {
                    return Err(Error::ProxyFailed);
                }
                data.data
            }
        };

        if pte.trace_read() {
            emit_trace(port, width, false, elr, ipa, val, pte.sync_trace());
        }

        insn.commit_load(regs, val);
    }

    cpu.set_elr(elr + 4);
    Ok(())
}

fn emit_trace<P: ProxyPort>(
    port: &mut P,
    width: AccessSize,
    write: bool,
    pc: u64,
    addr: u64,
    data: u64,
    sync: bool,
) {
    let evt = MmioTraceEvent {
        flags: mmio_evt_flags(width, write),
        pc,
        addr,
        data,
    };
    port.send_event(EventType::MmioTrace, &evt.to_bytes());
    if sync {
        port.flush_events();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iodev::tests::FakePool;
    use crate::iodev::IodevId;
    use crate::pagetable::tests::CountingAlloc;
    use crate::pagetable::{ProxyMode, Stage2Tables, TraceFlags};
    use crate::proxy::{self, UartProxy, MMIO_EVT_WRITE};
    use std::sync::Mutex;
    use std::vec::Vec;

    // Assembled by hand; see the decoder tests for the field breakdown.
    const LDR_X2_X3_POST8: u32 = 0xf840_8462;
    const LDR_W1_X0: u32 = 0xb940_0401;
    const STR_X12_X13: u32 = 0xf900_01ac;
    const STR_W12_X13: u32 = 0xb900_01ac;
    const NOP: u32 = 0xd503_201f;

    struct FakeCpu {
        esr: u64,
        far: u64,
        elr: u64,
        ipa: Option<u64>,
        insn: u32,
        fetch_fault: bool,
    }

    impl FakeCpu {
        fn aborting(ipa: u64, insn: u32, write: bool) -> FakeCpu {
            FakeCpu {
                esr: if write { ESR_ISS_DABORT_WNR } else { 0 },
                far: ipa,
                elr: 0x8000_0100,
                ipa: Some(ipa),
                insn,
                fetch_fault: false,
            }
        }
    }

    impl GuestCpu for FakeCpu {
        fn esr(&self) -> u64 {
            self.esr
        }
        fn far(&self) -> u64 {
            self.far
        }
        fn elr(&self) -> u64 {
            self.elr
        }
        fn set_elr(&mut self, elr: u64) {
            self.elr = elr;
        }
        fn stage1_translate(&mut self, _va: u64, _write: bool) -> Option<u64> {
            self.ipa
        }
        fn full_translate(&mut self, _va: u64) -> Option<u64> {
            if self.fetch_fault {
                None
            } else {
                Some(&self.insn as *const u32 as u64)
            }
        }
    }

    #[derive(Default)]
    struct RecordingPort {
        events: Vec<(EventType, Vec<u8>)>,
        flushes: usize,
        hooks: Vec<VmHookData>,
        hook_reply_data: u64,
        hook_ok: bool,
    }

    impl RecordingPort {
        fn new() -> RecordingPort {
            RecordingPort {
                hook_ok: true,
                ..RecordingPort::default()
            }
        }
    }

    impl ProxyPort for RecordingPort {
        fn send_event(&mut self, event: EventType, payload: &[u8]) {
            self.events.push((event, payload.to_vec()));
        }
        fn flush_events(&mut self) {
            self.flushes += 1;
        }
        fn vm_hook(&mut self, data: &mut VmHookData) -> bool {
            self.hooks.push(*data);
            if data.flags as u64 & MMIO_EVT_WRITE == 0 {
                data.data = self.hook_reply_data;
            }
            self.hook_ok
        }
    }

    fn new_tables() -> Stage2Tables<CountingAlloc> {
        let (alloc, _) = CountingAlloc::new();
        Stage2Tables::new(alloc).unwrap()
    }

    fn regs() -> [u64; 32] {
        let mut r = [0u64; 32];
        for (i, v) in r.iter_mut().enumerate() {
            *v = 0x100 * i as u64;
        }
        r
    }

    static ECHO_CALLS: Mutex<Vec<(u64, u64, bool, AccessSize)>> = Mutex::new(Vec::new());

    fn echo_hook(addr: u64, val: &mut u64, write: bool, width: AccessSize) -> bool {
        if !write {
            *val |= 1;
        }
        ECHO_CALLS.lock().unwrap().push((addr, *val, write, width));
        true
    }

    fn deny_hook(_addr: u64, _val: &mut u64, _write: bool, _width: AccessSize) -> bool {
        false
    }

    #[test]
    fn test_hook_round_trip() {
        let base = 0x1_0000_0000;
        let mut s2 = new_tables();
        s2.map_hook(base, echo_hook, 0x4000, TraceFlags::empty()).unwrap();
        ECHO_CALLS.lock().unwrap().clear();

        // A 64-bit load gets the hook-provided value.
        let mut cpu = FakeCpu::aborting(base, LDR_X2_X3_POST8, false);
        let mut port = RecordingPort::new();
        let mut r = regs();
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();
        assert_eq!(r[2], 1);
        assert_eq!(r[3], 0x300 + 8);
        assert_eq!(cpu.elr, 0x8000_0104);

        // A store hands the value to the hook.
        let mut cpu = FakeCpu::aborting(base, STR_X12_X13, true);
        let mut r = regs();
        r[12] = 0x42;
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();

        let calls = ECHO_CALLS.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], (base, 1, false, AccessSize::Double));
        assert_eq!(calls[1], (base, 0x42, true, AccessSize::Double));
    }

    #[test]
    fn test_traced_store_reaches_memory_and_transport() {
        let base = 0x2_0000_0000;
        let mut backing = 0u64;
        let mut s2 = new_tables();
        s2.map_sw(
            base,
            &mut backing as *mut u64 as u64,
            4,
            TraceFlags::WRITE | TraceFlags::SYNC,
        )
        .unwrap();

        let mut pool = FakePool::new();
        let mut processor = proxy::tests::ScriptedProcessor::new(0xff);
        let mut ram = proxy::tests::FakeRam::new(0x4000, 64);
        let mut port = UartProxy::new(&mut pool, &mut processor, &mut ram);

        let mut cpu = FakeCpu::aborting(base, STR_W12_X13, true);
        let mut r = regs();
        r[12] = 0x1122_3344;
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();
        drop(port);

        assert_eq!(backing, 0x1122_3344);

        // Exactly one trace event, drained before the handler returned.
        let dev = pool.dev(IodevId::Uart);
        assert_eq!(dev.flushes, 1);
        let tx = &dev.tx;
        assert_eq!(tx.len(), 8 + 32 + 4);
        assert_eq!(u32::from_le_bytes([tx[0], tx[1], tx[2], tx[3]]), proxy::REQ_EVENT);
        let flags = u64::from_le_bytes(tx[8..16].try_into().unwrap());
        assert_eq!(flags, AccessSize::Word as u64 | MMIO_EVT_WRITE);
        let pc = u64::from_le_bytes(tx[16..24].try_into().unwrap());
        assert_eq!(pc, 0x8000_0100);
        let addr = u64::from_le_bytes(tx[24..32].try_into().unwrap());
        assert_eq!(addr, base);
        let data = u64::from_le_bytes(tx[32..40].try_into().unwrap());
        assert_eq!(data, 0x1122_3344);
    }

    #[test]
    fn test_traced_load_emits_event() {
        let base = 0x2_0000_0000;
        let mut backing = 0xaabb_ccdd_1122_3344u64;
        let mut s2 = new_tables();
        s2.map_sw(
            base,
            &mut backing as *mut u64 as u64,
            8,
            TraceFlags::READ,
        )
        .unwrap();

        let mut cpu = FakeCpu::aborting(base, LDR_W1_X0, false);
        let mut port = RecordingPort::new();
        let mut r = regs();
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();

        assert_eq!(r[1], 0x1122_3344);
        assert_eq!(port.events.len(), 1);
        assert_eq!(port.flushes, 0); // no sync flag
    }

    #[test]
    fn test_proxy_hook_dispatch() {
        let base = 0x3_0000_0000;
        let mut s2 = new_tables();
        s2.map_proxy_hook(base, 0x33, 4, ProxyMode::ReadWrite, TraceFlags::empty())
            .unwrap();

        // Store: forwarded with the value.
        let mut cpu = FakeCpu::aborting(base, STR_X12_X13, true);
        let mut port = RecordingPort::new();
        port.hook_reply_data = 0x5555;
        let mut r = regs();
        r[12] = 0x77;
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();
        assert_eq!(port.hooks.len(), 1);
        assert_eq!(port.hooks[0].id, 0x33);
        assert_eq!(port.hooks[0].addr, base);
        assert_eq!(port.hooks[0].data, 0x77);
        assert_ne!(port.hooks[0].flags as u64 & MMIO_EVT_WRITE, 0);

        // Load: the reply's data lands in the destination register.
        let mut cpu = FakeCpu::aborting(base, LDR_X2_X3_POST8, false);
        let mut r = regs();
        handle_data_abort(&mut cpu, &s2, &mut port, &mut r).unwrap();
        assert_eq!(r[2], 0x5555);
        assert_eq!(port.hooks[1].flags as u64 & MMIO_EVT_WRITE, 0);
    }

    #[test]
    fn test_proxy_hook_remote_gone() {
        let base = 0x3_0000_0000;
        let mut s2 = new_tables();
        s2.map_proxy_hook(base, 1, 4, ProxyMode::Write, TraceFlags::empty())
            .unwrap();

        let mut cpu = FakeCpu::aborting(base, STR_X12_X13, true);
        let mut port = RecordingPort::new();
        port.hook_ok = false;
        let mut r = regs();
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::ProxyFailed)
        );
    }

    #[test]
    fn test_hook_refusal_fails_abort() {
        let base = 0x1_0000_0000;
        let mut s2 = new_tables();
        s2.map_hook(base, deny_hook, 4, TraceFlags::empty()).unwrap();

        let mut cpu = FakeCpu::aborting(base, LDR_W1_X0, false);
        let mut port = RecordingPort::new();
        let mut r = regs();
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::HookFailed)
        );
        // The guest must not be resumed: no ELR advance.
        assert_eq!(cpu.elr, 0x8000_0100);
    }

    #[test]
    fn test_error_classification() {
        let mut s2 = new_tables();
        s2.map_hw(0x4000_0000, 0x4000_0000, 0x4000).unwrap();
        let mut port = RecordingPort::new();
        let mut r = regs();

        // Unmapped IPA.
        let mut cpu = FakeCpu::aborting(0x8_0000, LDR_W1_X0, false);
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::Unmapped)
        );

        // Abort on a hardware-valid page.
        let mut cpu = FakeCpu::aborting(0x4000_0000, LDR_W1_X0, false);
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::UnexpectedHwFault)
        );

        // Stage-1 fault.
        let mut cpu = FakeCpu::aborting(0x8_0000, LDR_W1_X0, false);
        cpu.ipa = None;
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::Stage1Fault)
        );

        // IPA beyond the 36-bit space.
        let mut cpu = FakeCpu::aborting(0x8_0000, LDR_W1_X0, false);
        cpu.ipa = Some(1 << 36);
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::OutOfRange)
        );
    }

    #[test]
    fn test_decode_failures() {
        let base = 0x1_0000_0000;
        let mut s2 = new_tables();
        s2.map_hook(base, echo_hook, 4, TraceFlags::empty()).unwrap();
        let mut port = RecordingPort::new();
        let mut r = regs();

        // Not a load/store at all.
        let mut cpu = FakeCpu::aborting(base, NOP, false);
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::Decode)
        );

        // A load encoding on a write abort.
        let mut cpu = FakeCpu::aborting(base, LDR_W1_X0, true);
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::Decode)
        );

        // Instruction fetch failure.
        let mut cpu = FakeCpu::aborting(base, LDR_W1_X0, false);
        cpu.fetch_fault = true;
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::FetchFault)
        );
    }

    #[test]
    fn test_undefined_kind_rejected() {
        let mut s2 = new_tables();
        // Kind 5 is outside the defined software kinds.
        s2.map(0x8_0000, (5u64 << 50) | 0x1000, 4, 0).unwrap();

        let mut cpu = FakeCpu::aborting(0x8_0000, LDR_W1_X0, false);
        let mut port = RecordingPort::new();
        let mut r = regs();
        assert_eq!(
            handle_data_abort(&mut cpu, &s2, &mut port, &mut r),
            Err(Error::BadDescriptor)
        );
    }
}
