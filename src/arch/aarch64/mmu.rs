// SPDX-License-Identifier: Apache-2.0

//! Stage-2 translation control.

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{VTCR_EL2, VTTBR_EL2};
use tock_registers::interfaces::Writeable;

use crate::pagetable::{Stage2Tables, TableAlloc};

/// Point stage 2 at the given tables: 64 GiB physical range, 16 KiB
/// granule, inner-shareable write-back cacheable table walks, starting at
/// level 2.
pub fn enable<A: TableAlloc>(tables: &Stage2Tables<A>) {
    VTCR_EL2.write(
        VTCR_EL2::PS.val(1)      // 64GB PA size
            + VTCR_EL2::TG0.val(2)   // 16KB granule
            + VTCR_EL2::SH0.val(3)   // PTWs inner-shareable
            + VTCR_EL2::ORGN0.val(1) // PTWs cacheable
            + VTCR_EL2::IRGN0.val(1) // PTWs cacheable
            + VTCR_EL2::SL0.val(1)   // start at level 2
            + VTCR_EL2::T0SZ.val(28), // 64GB translation region
    );
    VTTBR_EL2.set(tables.root_address());

    barrier::isb(barrier::SY);
}

/// Make stage-2 table updates visible to the MMU.
pub fn invalidate_guest_tlb() {
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalls12e1is",
            "dsb ish",
            "isb",
            options(nomem, nostack)
        );
    }
}
