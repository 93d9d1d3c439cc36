// SPDX-License-Identifier: Apache-2.0

//! Console handle used by the logger.

use core::fmt;

use atomic_refcell::AtomicRefCell;

use crate::{layout::map, uart_pl011::Pl011 as UartPl011};

pub static PORT: AtomicRefCell<UartPl011> =
    AtomicRefCell::new(UartPl011::new(map::mmio::PL011_START));

pub struct Serial;
impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        PORT.borrow_mut().write_str(s)
    }
}
