// SPDX-License-Identifier: Apache-2.0

//! Framed request/reply/event transport over the character devices.
//!
//! Every frame type word carries the sentinel `0xAA55FF` in its low 24 bits
//! with the opcode selector in the high byte. Incoming bytes are shifted
//! through a per-device window until the sentinel lines up, so the stream
//! self-synchronizes after noise. All frames end in a keyed checksum; this
//! is an integrity check against line corruption, not cryptography.

use log::warn;

use crate::guard::GuardedRam;
use crate::iodev::{IodevId, Iodevs, IODEV_COUNT, PRIMARY};
use crate::mem::AccessSize;

/// Low 24 bits of every frame type word.
pub const SENTINEL: u32 = 0xAA55FF;

pub const REQ_NOP: u32 = 0x00AA55FF;
pub const REQ_PROXY: u32 = 0x01AA55FF;
pub const REQ_MEMREAD: u32 = 0x02AA55FF;
pub const REQ_MEMWRITE: u32 = 0x03AA55FF;
pub const REQ_BOOT: u32 = 0x04AA55FF;
pub const REQ_EVENT: u32 = 0x05AA55FF;

pub const ST_OK: i32 = 0;
pub const ST_BADCMD: i32 = -1;
pub const ST_INVAL: i32 = -2;
pub const ST_XFRERR: i32 = -3;
pub const ST_CSUMERR: i32 = -4;

/// Request frame: type word, payload, checksum over both.
const REQ_PAYLOAD: usize = 52;
const REQ_WIRE: usize = 4 + REQ_PAYLOAD + 4;

/// Reply frame: type word, signed status, payload, checksum.
const REPLY_PAYLOAD: usize = 24;
const REPLY_WIRE: usize = 4 + 4 + REPLY_PAYLOAD + 4;

const EVENT_HDR: usize = 8;

const CHECKSUM_INIT: u32 = 0xDEAD_BEEF;
const CHECKSUM_FINAL: u32 = 0xADDE_DBAD;

/// Fold `data` into a running checksum.
pub fn checksum_add(data: &[u8], mut sum: u32) -> u32 {
    for &b in data {
        sum = sum.wrapping_mul(31337).wrapping_add(u32::from(b ^ 0x5a));
    }
    sum
}

pub fn checksum_finish(sum: u32) -> u32 {
    sum ^ CHECKSUM_FINAL
}

pub fn checksum(data: &[u8]) -> u32 {
    checksum_finish(checksum_add(data, CHECKSUM_INIT))
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le64(b: &[u8], off: usize) -> u64 {
    u64::from(le32(b, off)) | u64::from(le32(b, off + 4)) << 32
}

/// Generic RPC body of a `PROXY` request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyRequest {
    pub opcode: u64,
    pub args: [u64; 5],
}

impl ProxyRequest {
    fn parse(payload: &[u8]) -> ProxyRequest {
        let mut req = ProxyRequest {
            opcode: le64(payload, 0),
            args: [0; 5],
        };
        for (i, arg) in req.args.iter_mut().enumerate() {
            *arg = le64(payload, 8 + 8 * i);
        }
        req
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyReply {
    pub opcode: u64,
    pub status: i64,
    pub retval: u64,
}

impl ProxyReply {
    fn serialize(&self, payload: &mut [u8; REPLY_PAYLOAD]) {
        payload[0..8].copy_from_slice(&self.opcode.to_le_bytes());
        payload[8..16].copy_from_slice(&self.status.to_le_bytes());
        payload[16..24].copy_from_slice(&self.retval.to_le_bytes());
    }
}

/// What the external RPC processor wants the serve loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    Continue,
    Exit(i32),
}

/// The external command processor behind the `PROXY` opcode.
pub trait ProxyProcessor {
    fn process(&mut self, request: &ProxyRequest, reply: &mut ProxyReply) -> ProxyAction;
}

/// Carried in the `BOOT`-typed reply announcing a nested serve-loop entry.
#[derive(Debug, Clone, Copy)]
pub struct StartMessage {
    pub reason: u32,
    pub code: u32,
    pub info: u64,
}

impl StartMessage {
    /// A hypervisor hook wants the host's attention.
    pub const REASON_HV_HOOK: u32 = 3;

    /// The hook is a trapped guest memory access.
    pub const HOOK_VM: u32 = 1;

    fn serialize(&self, payload: &mut [u8; REPLY_PAYLOAD]) {
        payload[0..4].copy_from_slice(&self.reason.to_le_bytes());
        payload[4..8].copy_from_slice(&self.code.to_le_bytes());
        payload[8..16].copy_from_slice(&self.info.to_le_bytes());
    }
}

/// Asynchronous event stream identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    MmioTrace = 1,
}

/// `flags` bit marking the traced access as a store.
pub const MMIO_EVT_WRITE: u64 = 1 << 3;

pub fn mmio_evt_flags(width: AccessSize, write: bool) -> u64 {
    width as u64 | if write { MMIO_EVT_WRITE } else { 0 }
}

/// Payload of an `MmioTrace` event.
#[derive(Debug, Clone, Copy)]
pub struct MmioTraceEvent {
    pub flags: u64,
    pub pc: u64,
    pub addr: u64,
    pub data: u64,
}

impl MmioTraceEvent {
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut b = [0u8; 32];
        b[0..8].copy_from_slice(&self.flags.to_le_bytes());
        b[8..16].copy_from_slice(&self.pc.to_le_bytes());
        b[16..24].copy_from_slice(&self.addr.to_le_bytes());
        b[24..32].copy_from_slice(&self.data.to_le_bytes());
        b
    }
}

/// Trapped-access data exchanged with the host over a proxy hook. The host
/// reads and updates it through `MEMREAD`/`MEMWRITE` of `StartMessage::info`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VmHookData {
    pub flags: u32,
    pub id: u32,
    pub addr: u64,
    pub data: u64,
}

/// The transport surface the abort path is allowed to touch.
pub trait ProxyPort {
    /// Emit an event frame without interleaving reply traffic.
    fn send_event(&mut self, event: EventType, payload: &[u8]);

    /// Drain pending transport output to the active device.
    fn flush_events(&mut self);

    /// Hand a trapped access to the host and wait for it to release the
    /// guest; `data` may be updated by the host. Returns `false` if the
    /// host side went away.
    fn vm_hook(&mut self, data: &mut VmHookData) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The active device failed mid-frame during a nested entry.
    ReadFailed,
}

/// Serves synchronous command traffic and carries asynchronous events.
///
/// Owns the process-wide transport state: the latched active device and the
/// per-device sentinel windows.
pub struct UartProxy<'a, D: Iodevs, P: ProxyProcessor, R: GuardedRam> {
    devices: &'a mut D,
    processor: &'a mut P,
    ram: &'a mut R,
    active: IodevId,
    windows: [u32; IODEV_COUNT],
}

impl<'a, D: Iodevs, P: ProxyProcessor, R: GuardedRam> UartProxy<'a, D, P, R> {
    pub fn new(devices: &'a mut D, processor: &'a mut P, ram: &'a mut R) -> Self {
        UartProxy {
            devices,
            processor,
            ram,
            active: PRIMARY,
            windows: [0; IODEV_COUNT],
        }
    }

    /// Run the command loop until the processor requests an exit.
    ///
    /// Without a start descriptor (initial boot) this announces itself on
    /// the primary device and then polls every device for a sentinel,
    /// latching the first one that produces a valid frame. With one (nested
    /// entry from a hypervisor event) it sticks to the active device and
    /// fails if that device fails.
    pub fn serve(&mut self, start: Option<StartMessage>) -> Result<i32, Error> {
        let mut payload = [0u8; REPLY_PAYLOAD];
        match &start {
            None => {
                let frame = build_reply(REQ_BOOT, ST_OK, &payload);
                self.devices.write(PRIMARY, &frame);
            }
            Some(msg) => {
                msg.serialize(&mut payload);
                let frame = build_reply(REQ_BOOT, ST_OK, &payload);
                self.devices.write(self.active, &frame);
            }
        }

        let mut ret = 0;
        loop {
            let dev = if start.is_none() {
                self.wait_any()
            } else {
                self.wait_active()?
            };

            let req_type = self.windows[dev.index()];

            let mut rest = [0u8; REQ_WIRE - 4];
            if self.devices.read(dev, &mut rest) != rest.len() {
                // Short frame: drop it and resynchronize on the sentinel.
                continue;
            }

            let mut covered = [0u8; 4 + REQ_PAYLOAD];
            covered[..4].copy_from_slice(&req_type.to_le_bytes());
            covered[4..].copy_from_slice(&rest[..REQ_PAYLOAD]);
            if checksum(&covered) != le32(&rest, REQ_PAYLOAD) {
                let frame = build_reply(req_type, ST_CSUMERR, &[0u8; REPLY_PAYLOAD]);
                self.devices.write(dev, &frame);
                continue;
            }

            let payload = &rest[..REQ_PAYLOAD];
            self.active = dev;

            let mut status = ST_OK;
            let mut reply_payload = [0u8; REPLY_PAYLOAD];
            let mut stream = None;
            let mut running = true;

            match req_type {
                REQ_NOP => {}
                REQ_PROXY => {
                    let request = ProxyRequest::parse(payload);
                    let mut preply = ProxyReply::default();
                    match self.processor.process(&request, &mut preply) {
                        ProxyAction::Continue => {}
                        ProxyAction::Exit(code) => {
                            if code < 0 {
                                warn!("proxy request error: {}", code);
                            }
                            ret = code;
                            running = false;
                        }
                    }
                    preply.serialize(&mut reply_payload);
                }
                REQ_MEMREAD => {
                    let addr = le64(payload, 0);
                    let size = le64(payload, 8);
                    if size != 0 {
                        match self.ram.checksum(addr, size) {
                            Ok(sum) => {
                                reply_payload[..4].copy_from_slice(&sum.to_le_bytes());
                                stream = Some((addr, size));
                            }
                            Err(_) => status = ST_XFRERR,
                        }
                    }
                }
                REQ_MEMWRITE => {
                    let addr = le64(payload, 0);
                    let size = le64(payload, 8);
                    let dchecksum = le32(payload, 16);

                    // Probe both ends before pulling data off the wire; the
                    // full range cannot be pre-checked without dropping it.
                    if size != 0 && self.ram.probe_write(addr, size).is_err() {
                        status = ST_XFRERR;
                    } else {
                        let buf = self.ram.slice_mut(addr, size);
                        if self.devices.read(dev, buf) != buf.len() {
                            status = ST_XFRERR;
                        } else {
                            let sum = checksum(self.ram.slice(addr, size));
                            reply_payload[..4].copy_from_slice(&sum.to_le_bytes());
                            if sum != dchecksum {
                                status = ST_XFRERR;
                            }
                        }
                    }
                }
                _ => status = ST_BADCMD,
            }

            let frame = build_reply(req_type, status, &reply_payload);
            self.devices.write(dev, &frame);

            if status == ST_OK {
                if let Some((addr, size)) = stream {
                    let data = self.ram.slice(addr, size);
                    self.devices.write(dev, data);
                }
            }

            if !running {
                return Ok(ret);
            }
        }
    }

    /// Poll every device round-robin until a sentinel lines up.
    fn wait_any(&mut self) -> IodevId {
        let mut i = 0;
        loop {
            let dev = IodevId::ALL[i];
            self.devices.handle_events(dev);
            if self.devices.can_read(dev) {
                let mut b = [0u8; 1];
                if self.devices.read(dev, &mut b) == 1 && self.shift(dev, b[0]) {
                    return dev;
                }
            }
            i = (i + 1) % IODEV_COUNT;
        }
    }

    /// Scan the active device only; a failed read aborts the nested entry.
    fn wait_active(&mut self) -> Result<IodevId, Error> {
        let dev = self.active;
        loop {
            self.devices.handle_events(dev);
            let mut b = [0u8; 1];
            if self.devices.read(dev, &mut b) != 1 {
                warn!("proxy: device read failed, exiting");
                return Err(Error::ReadFailed);
            }
            if self.shift(dev, b[0]) {
                return Ok(dev);
            }
        }
    }

    fn shift(&mut self, dev: IodevId, byte: u8) -> bool {
        let w = &mut self.windows[dev.index()];
        *w = (*w >> 8) | (u32::from(byte) << 24);
        *w & 0x00ff_ffff == SENTINEL
    }
}

impl<D: Iodevs, P: ProxyProcessor, R: GuardedRam> ProxyPort for UartProxy<'_, D, P, R> {
    fn send_event(&mut self, event: EventType, payload: &[u8]) {
        let mut hdr = [0u8; EVENT_HDR];
        hdr[0..4].copy_from_slice(&REQ_EVENT.to_le_bytes());
        hdr[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        hdr[6..8].copy_from_slice(&(event as u16).to_le_bytes());

        let sum = checksum_finish(checksum_add(payload, checksum_add(&hdr, CHECKSUM_INIT)));
        self.devices.queue(self.active, &hdr);
        self.devices.queue(self.active, payload);
        self.devices.write(self.active, &sum.to_le_bytes());
    }

    fn flush_events(&mut self) {
        self.devices.flush(self.active);
    }

    fn vm_hook(&mut self, data: &mut VmHookData) -> bool {
        let start = StartMessage {
            reason: StartMessage::REASON_HV_HOOK,
            code: StartMessage::HOOK_VM,
            info: data as *mut VmHookData as u64,
        };
        self.serve(Some(start)).is_ok()
    }
}

fn build_reply(ty: u32, status: i32, payload: &[u8; REPLY_PAYLOAD]) -> [u8; REPLY_WIRE] {
    let mut f = [0u8; REPLY_WIRE];
    f[0..4].copy_from_slice(&ty.to_le_bytes());
    f[4..8].copy_from_slice(&status.to_le_bytes());
    f[8..8 + REPLY_PAYLOAD].copy_from_slice(payload);
    let sum = checksum(&f[..REPLY_WIRE - 4]);
    f[REPLY_WIRE - 4..].copy_from_slice(&sum.to_le_bytes());
    f
}
