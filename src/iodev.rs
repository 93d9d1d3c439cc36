// SPDX-License-Identifier: Apache-2.0

//! Character I/O devices the framed transport multiplexes over.

use heapless::Deque;

/// Handles for the devices a host can attach through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IodevId {
    Uart = 0,
    Usb = 1,
}

pub const IODEV_COUNT: usize = 2;

/// Startup notifications go out on the UART only.
pub const PRIMARY: IodevId = IodevId::Uart;

impl IodevId {
    pub const ALL: [IodevId; IODEV_COUNT] = [IodevId::Uart, IodevId::Usb];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A raw byte device.
pub trait CharDev {
    fn can_read(&self) -> bool;

    /// Blocking single-byte read; `None` on a receive error.
    fn read_byte(&mut self) -> Option<u8>;

    fn write_byte(&mut self, byte: u8);

    /// Wait until previously written bytes have left the device.
    fn flush(&mut self) {}

    /// Poll for device state changes (e.g. link events).
    fn handle_events(&mut self) {}
}

/// The device-set contract the transport runs over: bulk reads and writes,
/// plus write-side queueing so an event frame can be assembled without
/// interleaving other traffic.
pub trait Iodevs {
    fn can_read(&mut self, dev: IodevId) -> bool;

    /// Read exactly `buf.len()` bytes; a short count signals a device error.
    fn read(&mut self, dev: IodevId, buf: &mut [u8]) -> usize;

    /// Write `data`, after any queued bytes.
    fn write(&mut self, dev: IodevId, data: &[u8]) -> usize;

    /// Buffer `data` for a later `write` or `flush`.
    fn queue(&mut self, dev: IodevId, data: &[u8]);

    /// Drain queued bytes and wait for the device to finish transmitting.
    fn flush(&mut self, dev: IodevId);

    fn handle_events(&mut self, dev: IodevId);
}

const TX_QUEUE_LEN: usize = 1024;

/// Adds transmit queueing on top of a raw device.
pub struct Queued<D: CharDev> {
    dev: D,
    txq: Deque<u8, TX_QUEUE_LEN>,
}

impl<D: CharDev> Queued<D> {
    pub const fn new(dev: D) -> Self {
        Queued {
            dev,
            txq: Deque::new(),
        }
    }

    pub fn can_read(&self) -> bool {
        self.dev.can_read()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.dev.read_byte() {
                Some(b) => *slot = b,
                None => return i,
            }
        }
        buf.len()
    }

    pub fn write(&mut self, data: &[u8]) -> usize {
        self.drain();
        for &b in data {
            self.dev.write_byte(b);
        }
        data.len()
    }

    pub fn queue(&mut self, data: &[u8]) {
        for &b in data {
            if self.txq.push_back(b).is_err() {
                self.drain();
                let _ = self.txq.push_back(b);
            }
        }
    }

    pub fn flush(&mut self) {
        self.drain();
        self.dev.flush();
    }

    pub fn handle_events(&mut self) {
        self.dev.handle_events();
    }

    fn drain(&mut self) {
        while let Some(b) = self.txq.pop_front() {
            self.dev.write_byte(b);
        }
    }
}

/// The hardware device set: a PL011 console; the USB handle is not wired
/// up on this platform and reports itself unreadable.
#[cfg(not(test))]
pub struct SystemIo {
    uart: Queued<crate::uart_pl011::Pl011>,
}

#[cfg(not(test))]
impl SystemIo {
    pub const fn new() -> Self {
        SystemIo {
            uart: Queued::new(crate::uart_pl011::Pl011::new(
                crate::layout::map::mmio::PL011_START,
            )),
        }
    }
}

#[cfg(not(test))]
impl Iodevs for SystemIo {
    fn can_read(&mut self, dev: IodevId) -> bool {
        match dev {
            IodevId::Uart => self.uart.can_read(),
            IodevId::Usb => false,
        }
    }

    fn read(&mut self, dev: IodevId, buf: &mut [u8]) -> usize {
        match dev {
            IodevId::Uart => self.uart.read(buf),
            IodevId::Usb => 0,
        }
    }

    fn write(&mut self, dev: IodevId, data: &[u8]) -> usize {
        match dev {
            IodevId::Uart => self.uart.write(data),
            IodevId::Usb => 0,
        }
    }

    fn queue(&mut self, dev: IodevId, data: &[u8]) {
        if dev == IodevId::Uart {
            self.uart.queue(data);
        }
    }

    fn flush(&mut self, dev: IodevId) {
        if dev == IodevId::Uart {
            self.uart.flush();
        }
    }

    fn handle_events(&mut self, dev: IodevId) {
        if dev == IodevId::Uart {
            self.uart.handle_events();
        }
    }
}
