// SPDX-License-Identifier: Apache-2.0

//! Process-wide fault guard for touching caller-supplied memory.
//!
//! The transport's memory commands operate on addresses the host picked,
//! which may be unmapped. Before touching them, a guard mode is armed; the
//! exception vector consults [`on_fault`], which either skips the faulting
//! instruction or diverts to a registered recovery point, and counts the
//! trip either way.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mem::MemoryRegion;
use crate::proxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    Off = 0,
    /// Divert to the registered recovery address.
    Return = 1,
    /// Advance past the faulting instruction.
    Skip = 2,
}

static GUARD: AtomicU32 = AtomicU32::new(GuardMode::Off as u32);
static FAULT_COUNT: AtomicU32 = AtomicU32::new(0);
static RECOVERY: AtomicU64 = AtomicU64::new(0);

/// Arm the guard and reset the fault counter.
pub fn arm(mode: GuardMode) {
    FAULT_COUNT.store(0, Ordering::Relaxed);
    GUARD.store(mode as u32, Ordering::Release);
}

/// Disarm the guard; returns the number of faults taken while armed.
pub fn disarm() -> u32 {
    GUARD.store(GuardMode::Off as u32, Ordering::Release);
    FAULT_COUNT.load(Ordering::Relaxed)
}

/// Register the resume point for `GuardMode::Return`.
pub fn set_recovery(addr: u64) {
    RECOVERY.store(addr, Ordering::Relaxed);
}

/// Called from the synchronous exception vector on a data abort taken by
/// the hypervisor itself. Adjusts `elr` and returns `true` if the fault was
/// absorbed by the guard.
pub fn on_fault(elr: &mut u64) -> bool {
    match GUARD.load(Ordering::Acquire) {
        x if x == GuardMode::Return as u32 => {
            FAULT_COUNT.fetch_add(1, Ordering::Relaxed);
            *elr = RECOVERY.load(Ordering::Relaxed);
            true
        }
        x if x == GuardMode::Skip as u32 => {
            FAULT_COUNT.fetch_add(1, Ordering::Relaxed);
            *elr += 4;
            true
        }
        _ => false,
    }
}

/// A fault tripped the guard while touching the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFault;

/// Guarded view of the memory ranges named by transport requests.
pub trait GuardedRam {
    /// Checksum `[addr, addr + size)` under a return-on-fault guard.
    fn checksum(&mut self, addr: u64, size: u64) -> Result<u32, MemFault>;

    /// Probe the first and last byte for writability under a skip-on-fault
    /// guard.
    fn probe_write(&mut self, addr: u64, size: u64) -> Result<(), MemFault>;

    fn slice(&mut self, addr: u64, size: u64) -> &[u8];

    fn slice_mut(&mut self, addr: u64, size: u64) -> &mut [u8];
}

/// Physical memory, accessed in place.
pub struct PhysRam;

impl GuardedRam for PhysRam {
    fn checksum(&mut self, addr: u64, size: u64) -> Result<u32, MemFault> {
        let region = MemoryRegion::new(addr, size);
        arm(GuardMode::Return);
        let sum = proxy::checksum(region.as_slice(0, size));
        if disarm() != 0 {
            return Err(MemFault);
        }
        Ok(sum)
    }

    fn probe_write(&mut self, addr: u64, size: u64) -> Result<(), MemFault> {
        let region = MemoryRegion::new(addr, size);
        arm(GuardMode::Skip);
        region.io_write_u8(0, 0);
        region.io_write_u8(size - 1, 0);
        if disarm() != 0 {
            return Err(MemFault);
        }
        Ok(())
    }

    fn slice(&mut self, addr: u64, size: u64) -> &[u8] {
        unsafe { core::slice::from_raw_parts(addr as *const u8, size as usize) }
    }

    fn slice_mut(&mut self, addr: u64, size: u64) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, size as usize) }
    }
}
