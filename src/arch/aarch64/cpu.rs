// SPDX-License-Identifier: Apache-2.0

//! EL2 system-register surface of the abort handler.

use aarch64_cpu::registers::{ELR_EL2, ESR_EL2, FAR_EL2, PAR_EL1, SPSR_EL2};
use core::arch::asm;
use log::debug;
use tock_registers::interfaces::{Readable, Writeable};

use crate::abort::GuestCpu;

const SCTLR_M: u64 = 1;
const PAR_F: u64 = 1;
const PAR_PA: u64 = 0x000f_ffff_ffff_f000;

/// The guest's stage-1 control register, through the EL2 alias.
fn guest_sctlr() -> u64 {
    let v: u64;
    unsafe { asm!("mrs {v}, sctlr_el12", v = out(reg) v) };
    v
}

pub struct El2Cpu;

impl El2Cpu {
    /// Exception level the abort was taken from, out of the saved
    /// program status.
    fn faulting_el(&self) -> u64 {
        (SPSR_EL2.get() >> 2) & 3
    }

    /// Run the address-translation instruction matching stage selection,
    /// exception level and access direction, preserving PAR_EL1.
    fn at(&self, addr: u64, s1_only: bool, write: bool) -> u64 {
        let saved = PAR_EL1.get();
        unsafe {
            match (s1_only, self.faulting_el() == 0, write) {
                (true, true, true) => asm!("at s1e0w, {a}", a = in(reg) addr),
                (true, true, false) => asm!("at s1e0r, {a}", a = in(reg) addr),
                (true, false, true) => asm!("at s1e1w, {a}", a = in(reg) addr),
                (true, false, false) => asm!("at s1e1r, {a}", a = in(reg) addr),
                (false, true, true) => asm!("at s12e0w, {a}", a = in(reg) addr),
                (false, true, false) => asm!("at s12e0r, {a}", a = in(reg) addr),
                (false, false, true) => asm!("at s12e1w, {a}", a = in(reg) addr),
                (false, false, false) => asm!("at s12e1r, {a}", a = in(reg) addr),
            }
            asm!("isb");
        }
        let par = PAR_EL1.get();
        PAR_EL1.set(saved);
        par
    }

    fn translate(&self, addr: u64, s1_only: bool, write: bool) -> Option<u64> {
        if guest_sctlr() & SCTLR_M == 0 {
            return Some(addr); // guest MMU off
        }
        let par = self.at(addr, s1_only, write);
        if par & PAR_F != 0 {
            debug!("translate({:#x}): fault {:#x}", addr, par);
            return None;
        }
        Some((par & PAR_PA) | (addr & 0xfff))
    }
}

impl GuestCpu for El2Cpu {
    fn esr(&self) -> u64 {
        ESR_EL2.get()
    }

    fn far(&self) -> u64 {
        FAR_EL2.get()
    }

    fn elr(&self) -> u64 {
        ELR_EL2.get()
    }

    fn set_elr(&mut self, elr: u64) {
        ELR_EL2.set(elr);
    }

    fn stage1_translate(&mut self, va: u64, write: bool) -> Option<u64> {
        self.translate(va, true, write)
    }

    fn full_translate(&mut self, va: u64) -> Option<u64> {
        self.translate(va, false, false)
    }
}
