// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(test, allow(dead_code, unused_imports))]

#[cfg(not(test))]
use core::panic::PanicInfo;

mod abort;
mod arch;
mod guard;
mod insn;
mod iodev;
mod layout;
mod logger;
mod mem;
mod pagetable;
mod proxy;
mod serial;
mod table_alloc;
mod uart_pl011;

#[cfg(all(not(test), feature = "log-panic"))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("PANIC: {}", info);
    loop {}
}

#[cfg(all(not(test), not(feature = "log-panic")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {}
}

// The hypervisor only runs at EL2 on the target; a host build has nothing
// to do but must still link.
#[cfg(all(not(test), not(target_arch = "aarch64")))]
#[no_mangle]
extern "C" fn main() -> i32 {
    0
}

#[cfg(all(not(test), target_arch = "aarch64"))]
mod start {
    use core::ptr::addr_of_mut;

    use crate::arch::aarch64::mmu;
    use crate::guard::PhysRam;
    use crate::iodev::SystemIo;
    use crate::pagetable::Stage2Tables;
    use crate::proxy::{self, ProxyAction, ProxyProcessor, ProxyReply, ProxyRequest, UartProxy};
    use crate::table_alloc::TablePool;
    use crate::{layout, logger};

    /// Enough tables for the root plus a realistic hook population.
    const ARENA_SIZE: usize = 2 * 1024 * 1024;

    #[repr(align(16384))]
    struct TableArena([u8; ARENA_SIZE]);

    static mut TABLE_ARENA: TableArena = TableArena([0; ARENA_SIZE]);

    /// Minimal RPC processor: enough for a host to ping the loop and shut
    /// it down; anything richer arrives over these opcodes later.
    struct BasicProcessor;

    impl BasicProcessor {
        const P_NOP: u64 = 0x000;
        const P_EXIT: u64 = 0x001;
    }

    impl ProxyProcessor for BasicProcessor {
        fn process(&mut self, request: &ProxyRequest, reply: &mut ProxyReply) -> ProxyAction {
            reply.opcode = request.opcode;
            match request.opcode {
                Self::P_NOP => ProxyAction::Continue,
                Self::P_EXIT => ProxyAction::Exit(request.args[0] as i32),
                _ => {
                    reply.status = i64::from(proxy::ST_INVAL);
                    ProxyAction::Continue
                }
            }
        }
    }

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        logger::init();
        log::info!("stage-2 MMIO trap core starting");

        let pool = unsafe { TablePool::new(addr_of_mut!(TABLE_ARENA.0) as *mut u8, ARENA_SIZE) };
        let mut tables = match Stage2Tables::new(pool) {
            Ok(tables) => tables,
            Err(e) => panic!("stage-2 root allocation failed: {:?}", e),
        };

        // Guest DRAM passes through untouched; everything else faults
        // into the abort handler until the host installs its mappings.
        let dram = layout::map::dram::START as u64;
        if let Err(e) = tables.map_hw(dram, dram, layout::map::dram::SIZE as u64) {
            panic!("guest DRAM map failed: {:?}", e);
        }
        mmu::enable(&tables);
        mmu::invalidate_guest_tlb();

        let mut io = SystemIo::new();
        let mut processor = BasicProcessor;
        let mut ram = PhysRam;
        let mut port = UartProxy::new(&mut io, &mut processor, &mut ram);
        let code = port.serve(None);
        log::info!("proxy loop exited: {:?}", code);

        loop {
            aarch64_cpu::asm::wfe();
        }
    }
}
