// SPDX-License-Identifier: Apache-2.0

//! Guest address-space geometry and the host MMIO map.

/// Describes the characteristics of a translation granule.
pub struct TranslationGranule<const GRANULE_SIZE: usize>;

/// Describes properties of an address space.
pub struct AddressSpace<const AS_SIZE: usize>;

impl<const GRANULE_SIZE: usize> TranslationGranule<GRANULE_SIZE> {
    /// The granule's size.
    pub const SIZE: usize = Self::size_checked();

    /// The granule's shift, aka log2(size).
    pub const SHIFT: usize = Self::SIZE.trailing_zeros() as usize;

    /// Mask covering the granule's offset bits.
    pub const MASK: u64 = (Self::SIZE - 1) as u64;

    const fn size_checked() -> usize {
        assert!(GRANULE_SIZE.is_power_of_two());

        GRANULE_SIZE
    }
}

impl<const AS_SIZE: usize> AddressSpace<AS_SIZE> {
    /// The address space size.
    pub const SIZE: usize = Self::size_checked();

    /// The address space shift, aka log2(size).
    pub const SIZE_SHIFT: usize = Self::SIZE.trailing_zeros() as usize;

    const fn size_checked() -> usize {
        assert!(AS_SIZE.is_power_of_two());

        // Check for architectural restrictions as well.
        Self::arch_address_space_size_sanity_checks();

        AS_SIZE
    }

    const fn arch_address_space_size_sanity_checks() {
        // Stage 2 starts its walk at level 2, so the space must fit in one
        // root table of 32 MiB blocks.
        assert!(AS_SIZE <= (2048 * 32 * 1024 * 1024));
    }
}

/// Hardware translation granule of the stage-2 tables.
pub type Granule16KiB = TranslationGranule<{ 16 * 1024 }>;

/// Coverage of one root-level block descriptor.
pub type Granule32MiB = TranslationGranule<{ 32 * 1024 * 1024 }>;

/// The guest physical address space: 64 GiB, 36 bits.
pub type GuestAddrSpace = AddressSpace<{ 64 * 1024 * 1024 * 1024 }>;

pub mod map {
    pub mod mmio {
        pub const PL011_START: usize = 0x0900_0000;
    }

    pub mod dram {
        pub const START: usize = 0x8_0000_0000;
        pub const SIZE: usize = 0x2_0000_0000;
    }
}
