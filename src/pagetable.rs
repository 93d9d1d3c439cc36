// SPDX-License-Identifier: Apache-2.0

//! Stage-2 translation tables with software sub-page extensions.
//!
//! The hardware walk uses a 16 KiB granule over a 36-bit guest physical
//! address space, starting at level 2:
//!
//! ```text
//! [L2 index]  [L3 index] [page offset]
//!  11 bits     11 bits    14 bits
//! ```
//!
//! 32 MiB L2 block mappings collapse the L3 level. For software MMIO hooks
//! we add a fourth, software-only level providing word granularity:
//!
//! ```text
//! [L2 index]  [L3 index] [L4 index]  [word offset]
//!  11 bits     11 bits    12 bits     2 bits
//! ```
//!
//! Descriptors with `VALID` clear are invisible to the MMU and carry the
//! software mapping kind in bits [52:50]; the hardware traps any access to
//! them, which is what lets the abort handler emulate the access. An entry
//! pointing to an L4 table is always such a software descriptor.

use log::warn;
use tock_registers::{
    interfaces::{ReadWriteable, Readable, Writeable},
    register_bitfields,
    registers::InMemoryRegister,
};

use crate::layout::{Granule16KiB, Granule32MiB};
use crate::mem::AccessSize;

const L2_INDEX_BITS: usize = 11;
const L3_INDEX_BITS: usize = 11;
const L4_INDEX_BITS: usize = 12;

const L2_OFFSET_BITS: usize = Granule32MiB::SHIFT;
const L3_OFFSET_BITS: usize = Granule16KiB::SHIFT;
const L4_OFFSET_BITS: usize = 2;

pub const ENTRIES_PER_L2_TABLE: usize = 1 << L2_INDEX_BITS;
pub const ENTRIES_PER_L3_TABLE: usize = 1 << L3_INDEX_BITS;
pub const ENTRIES_PER_L4_TABLE: usize = 1 << L4_INDEX_BITS;

const fn mask(bits: usize) -> u64 {
    (1u64 << bits) - 1
}

const fn genmask(high: usize, low: usize) -> u64 {
    mask(high - low + 1) << low
}

// A stage-2 descriptor. The split between hardware and software
// interpretation hinges on VALID: the MMU ignores everything with VALID
// clear, so the KIND and trace bits are only meaningful there.
register_bitfields! {u64,
    pub STAGE2_DESCRIPTOR [
        /// Emit a trace event when a load hits this descriptor.
        TRACE_READ OFFSET(63) NUMBITS(1) [],

        /// Emit a trace event when a store hits this descriptor.
        TRACE_WRITE OFFSET(62) NUMBITS(1) [],

        /// Drain the transport before returning from the abort handler.
        SYNC_TRACE OFFSET(61) NUMBITS(1) [],

        /// Software mapping kind.
        KIND OFFSET(50) NUMBITS(3) [
            Map = 0,
            Hook = 1,
            ProxyHookR = 2,
            ProxyHookW = 3,
            ProxyHookRw = 4
        ],

        /// Access flag.
        AF OFFSET(10) NUMBITS(1) [],

        /// Shareability field.
        SH OFFSET(8) NUMBITS(2) [
            InnerShareable = 0b11
        ],

        /// Stage-2 access permissions.
        S2AP OFFSET(6) NUMBITS(2) [
            ReadWrite = 0b11
        ],

        /// Stage-2 memory attributes (keep the stage-1 type unchanged).
        MEMATTR OFFSET(2) NUMBITS(4) [
            Unchanged = 0b1111
        ],

        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            Table = 1
        ],

        VALID OFFSET(0) NUMBITS(1) [
            False = 0,
            True = 1
        ]
    ]
}

bitflags::bitflags! {
    /// Trace request bits carried by software descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceFlags: u64 {
        const READ = 1 << 63;
        const WRITE = 1 << 62;
        const SYNC = 1 << 61;
    }
}

/// Software mapping kinds, bits [52:50] of a software descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpteKind {
    Map = 0,
    Hook = 1,
    ProxyHookR = 2,
    ProxyHookW = 3,
    ProxyHookRw = 4,
}

/// Access direction served remotely by a proxy hook; the other direction
/// (if any) passes through to the faulting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    Read,
    Write,
    ReadWrite,
}

impl ProxyMode {
    fn kind(self) -> SpteKind {
        match self {
            ProxyMode::Read => SpteKind::ProxyHookR,
            ProxyMode::Write => SpteKind::ProxyHookW,
            ProxyMode::ReadWrite => SpteKind::ProxyHookRw,
        }
    }
}

/// In-process MMIO hook: `(addr, &mut value, is_write, width)`.
///
/// Returning `false` fails the emulated access.
pub type HvHook = fn(u64, &mut u64, bool, AccessSize) -> bool;

/// A single 64-bit stage-2 descriptor word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub u64);

impl Descriptor {
    /// Payload of block/page/table descriptors (16 KiB-aligned).
    pub const TARGET_MASK: u64 = genmask(49, L3_OFFSET_BITS);

    /// Payload of L4 word descriptors (4-byte-aligned).
    pub const TARGET_MASK_L4: u64 = genmask(49, L4_OFFSET_BITS);

    /// Hardware attribute bits below the payload field.
    const LOWER_ATTRIBUTES: u64 = genmask(13, 2);

    const TYPE_BIT: u64 = 1 << 1;

    fn reg(self) -> InMemoryRegister<u64, STAGE2_DESCRIPTOR::Register> {
        InMemoryRegister::new(self.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// A descriptor the MMU interprets directly.
    pub fn is_hw(self) -> bool {
        self.0 != 0 && self.reg().is_set(STAGE2_DESCRIPTOR::VALID)
    }

    /// A descriptor only the hypervisor interprets.
    pub fn is_sw(self) -> bool {
        self.0 != 0 && !self.reg().is_set(STAGE2_DESCRIPTOR::VALID)
    }

    fn is_table_type(self) -> bool {
        self.reg()
            .matches_all(STAGE2_DESCRIPTOR::TYPE::Table)
    }

    /// Software mapping kind; `None` if the field holds an undefined value.
    pub fn kind(self) -> Option<SpteKind> {
        match self.reg().read(STAGE2_DESCRIPTOR::KIND) {
            0 => Some(SpteKind::Map),
            1 => Some(SpteKind::Hook),
            2 => Some(SpteKind::ProxyHookR),
            3 => Some(SpteKind::ProxyHookW),
            4 => Some(SpteKind::ProxyHookRw),
            _ => None,
        }
    }

    pub fn trace_read(self) -> bool {
        self.reg().is_set(STAGE2_DESCRIPTOR::TRACE_READ)
    }

    pub fn trace_write(self) -> bool {
        self.reg().is_set(STAGE2_DESCRIPTOR::TRACE_WRITE)
    }

    pub fn sync_trace(self) -> bool {
        self.reg().is_set(STAGE2_DESCRIPTOR::SYNC_TRACE)
    }

    /// Word-granularity payload (host address, callback, or proxy id).
    pub fn target(self) -> u64 {
        self.0 & Self::TARGET_MASK_L4
    }

    fn table_ptr(self) -> *mut u64 {
        (self.0 & Self::TARGET_MASK) as *mut u64
    }

    // Level predicates. TYPE is odd: 0 means block, but 1 means both
    // table (above the leaf level) and page (at it).

    fn l2_is_table(self) -> bool {
        self.0 != 0 && self.is_table_type()
    }

    fn l2_is_hw_block(self) -> bool {
        self.is_hw() && !self.is_table_type()
    }

    fn l2_is_sw_block(self) -> bool {
        self.is_sw() && !self.is_table_type() && self.kind() == Some(SpteKind::Map)
    }

    fn l3_is_table(self) -> bool {
        self.is_sw() && self.is_table_type()
    }

    fn l3_is_hw_page(self) -> bool {
        self.is_hw() && self.is_table_type()
    }

    fn l3_is_sw_block(self) -> bool {
        self.l2_is_sw_block()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `from`, `size`, or a hardware target is misaligned for the
    /// requested mapping kind.
    Misaligned,
    /// The table allocator is exhausted.
    AllocFailed,
}

/// Supplies zeroed, 16 KiB-aligned tables of `entries` descriptors.
pub trait TableAlloc {
    fn alloc(&mut self, entries: usize) -> Result<*mut u64, Error>;

    /// # Safety
    ///
    /// `table` must come from `alloc` with the same `entries` and must not
    /// be referenced afterwards.
    unsafe fn free(&mut self, table: *mut u64, entries: usize);
}

#[inline]
unsafe fn read_entry(table: *const u64, idx: usize) -> Descriptor {
    Descriptor(table.add(idx).read_volatile())
}

// Descriptors the MMU walks concurrently; a single 64-bit store keeps the
// update untorn.
#[inline]
unsafe fn write_entry(table: *mut u64, idx: usize, desc: u64) {
    table.add(idx).write_volatile(desc);
}

/// The stage-2 translation structure: a root L2 table plus on-demand
/// children, exclusively owned by their parent descriptor.
pub struct Stage2Tables<A: TableAlloc> {
    root: *mut u64,
    alloc: A,
}

// The tables are plain memory; the raw pointers are owned by this struct.
unsafe impl<A: TableAlloc + Send> Send for Stage2Tables<A> {}

impl<A: TableAlloc> Stage2Tables<A> {
    /// Allocate an empty root table. The stage-2 control registers are
    /// programmed separately by the architecture layer.
    pub fn new(mut alloc: A) -> Result<Self, Error> {
        let root = alloc.alloc(ENTRIES_PER_L2_TABLE)?;
        Ok(Stage2Tables { root, alloc })
    }

    /// Physical base of the root table, for the translation base register.
    pub fn root_address(&self) -> u64 {
        self.root as u64
    }

    /// Install descriptors across `[from, from + size)`.
    ///
    /// `to` carries the payload and the mapping kind; `incr` is the payload
    /// stride multiplier (1 for linear mappings, 0 to replicate the same
    /// descriptor across the range). Descriptors are emitted at the
    /// coarsest level the alignment of `from`, `to` and `size` permits.
    pub fn map(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<(), Error> {
        let hw = Descriptor(to).is_hw();

        if from & mask(L4_OFFSET_BITS) != 0 || size & mask(L4_OFFSET_BITS) != 0 {
            return Err(Error::Misaligned);
        }

        if hw && (from & mask(L3_OFFSET_BITS) != 0 || size & mask(L3_OFFSET_BITS) != 0) {
            warn!(
                "cannot use sub-page granularity with HW mappings ({:#x} -> {:#x})",
                from, to
            );
            return Err(Error::Misaligned);
        }

        let l3_mask = mask(L3_OFFSET_BITS);
        let l2_mask = mask(L2_OFFSET_BITS);

        // L4 mappings to the next page boundary
        let mut chunk = size.min(((from + l3_mask) & !l3_mask) - from);
        if chunk != 0 {
            self.map_l4(from, to, chunk, incr)?;
            from += chunk;
            to += incr * chunk;
            size -= chunk;
        }

        // L3 mappings to the next block boundary
        chunk = size.min(((from + l2_mask) & !l2_mask) - from) & !l3_mask;
        if chunk != 0 {
            self.map_l3(from, to, chunk, incr)?;
            from += chunk;
            to += incr * chunk;
            size -= chunk;
        }

        // L2 mappings; hardware blocks need a 32 MiB-aligned target, the
        // misaligned case falls through to the L3 loop below.
        chunk = size & !l2_mask;
        if chunk != 0 && (!hw || to & genmask(24, L3_OFFSET_BITS) == 0) {
            self.map_l2(from, to, chunk, incr)?;
            from += chunk;
            to += incr * chunk;
            size -= chunk;
        }

        // L3 mappings to the end
        chunk = size & !l3_mask;
        if chunk != 0 {
            self.map_l3(from, to, chunk, incr)?;
            from += chunk;
            to += incr * chunk;
            size -= chunk;
        }

        // L4 mappings to the end
        if size != 0 {
            self.map_l4(from, to, size, incr)?;
        }

        Ok(())
    }

    pub fn unmap(&mut self, from: u64, size: u64) -> Result<(), Error> {
        self.map(from, 0, size, 0)
    }

    /// Hardware pass-through: the MMU serves the range without traps.
    pub fn map_hw(&mut self, from: u64, to: u64, size: u64) -> Result<(), Error> {
        let attrs = InMemoryRegister::<u64, STAGE2_DESCRIPTOR::Register>::new(0);
        attrs.write(
            STAGE2_DESCRIPTOR::AF::SET
                + STAGE2_DESCRIPTOR::SH::InnerShareable
                + STAGE2_DESCRIPTOR::S2AP::ReadWrite
                + STAGE2_DESCRIPTOR::MEMATTR::Unchanged
                + STAGE2_DESCRIPTOR::VALID::True,
        );
        self.map(from, to | attrs.get(), size, 1)
    }

    /// Software pass-through: every access traps and is emulated against
    /// `to + offset`, e.g. for tracing.
    pub fn map_sw(&mut self, from: u64, to: u64, size: u64, trace: TraceFlags) -> Result<(), Error> {
        self.map(from, to | Self::kind_bits(SpteKind::Map) | trace.bits(), size, 1)
    }

    /// Every access in the range invokes `hook` in-process.
    pub fn map_hook(
        &mut self,
        from: u64,
        hook: HvHook,
        size: u64,
        trace: TraceFlags,
    ) -> Result<(), Error> {
        self.map(
            from,
            hook as u64 | Self::kind_bits(SpteKind::Hook) | trace.bits(),
            size,
            0,
        )
    }

    /// Accesses in `mode`'s direction are forwarded to the remote side
    /// tagged `id`; the opposite direction passes through.
    pub fn map_proxy_hook(
        &mut self,
        from: u64,
        id: u64,
        size: u64,
        mode: ProxyMode,
        trace: TraceFlags,
    ) -> Result<(), Error> {
        let payload = (id << L4_OFFSET_BITS) & Descriptor::TARGET_MASK_L4;
        self.map(
            from,
            payload | Self::kind_bits(mode.kind()) | trace.bits(),
            size,
            0,
        )
    }

    fn kind_bits(kind: SpteKind) -> u64 {
        (kind as u64) << 50
    }

    /// Return the lowest descriptor resolving `addr`, with the intra-block
    /// offset folded into pass-through payloads and hardware attribute bits
    /// stripped, so the caller obtains the effective host address directly.
    pub fn walk(&self, addr: u64) -> Descriptor {
        let idx = ((addr >> L2_OFFSET_BITS) & mask(L2_INDEX_BITS)) as usize;
        let l2d = unsafe { read_entry(self.root, idx) };

        if !l2d.l2_is_table() {
            let mut d = l2d.0;
            if l2d.l2_is_hw_block() {
                d &= !Descriptor::LOWER_ATTRIBUTES;
                d |= addr & genmask(24, L4_OFFSET_BITS);
            } else if l2d.l2_is_sw_block() {
                d |= addr & genmask(24, L4_OFFSET_BITS);
            }
            return Descriptor(d);
        }

        let l3 = l2d.table_ptr();
        let idx = ((addr >> L3_OFFSET_BITS) & mask(L3_INDEX_BITS)) as usize;
        let l3d = unsafe { read_entry(l3, idx) };

        if !l3d.l3_is_table() {
            let mut d = l3d.0;
            if l3d.l3_is_hw_page() {
                d &= !Descriptor::LOWER_ATTRIBUTES;
                d |= addr & genmask(13, L4_OFFSET_BITS);
            } else if l3d.l3_is_sw_block() {
                d |= addr & genmask(13, L4_OFFSET_BITS);
            }
            return Descriptor(d);
        }

        let l4 = l3d.table_ptr();
        let idx = ((addr >> L4_OFFSET_BITS) & mask(L4_INDEX_BITS)) as usize;
        unsafe { read_entry(l4, idx) }
    }

    fn map_l2(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<(), Error> {
        if from & mask(L2_OFFSET_BITS) != 0 || size & mask(L2_OFFSET_BITS) != 0 {
            return Err(Error::Misaligned);
        }
        let d = Descriptor(to);
        if d.is_hw() && to & Descriptor::TARGET_MASK & mask(L2_OFFSET_BITS) != 0 {
            return Err(Error::Misaligned);
        }

        // TYPE stays Block for both hardware and software descriptors.
        while size != 0 {
            let idx = ((from >> L2_OFFSET_BITS) & mask(L2_INDEX_BITS)) as usize;

            let old = unsafe { read_entry(self.root, idx) };
            if old.l2_is_table() {
                unsafe { self.free_l3(old.table_ptr()) };
            }

            unsafe { write_entry(self.root, idx, to) };
            from += 1 << L2_OFFSET_BITS;
            to += incr << L2_OFFSET_BITS;
            size -= 1 << L2_OFFSET_BITS;
        }
        Ok(())
    }

    fn map_l3(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<(), Error> {
        if from & mask(L3_OFFSET_BITS) != 0 || size & mask(L3_OFFSET_BITS) != 0 {
            return Err(Error::Misaligned);
        }
        let d = Descriptor(to);
        if d.is_hw() {
            if to & Descriptor::TARGET_MASK & mask(L3_OFFSET_BITS) != 0 {
                return Err(Error::Misaligned);
            }
            to |= Descriptor::TYPE_BIT; // page
        }

        while size != 0 {
            let idx = ((from >> L3_OFFSET_BITS) & mask(L3_INDEX_BITS)) as usize;
            let l3 = self.get_l3(from)?;

            let old = unsafe { read_entry(l3, idx) };
            if old.l3_is_table() {
                unsafe { self.alloc.free(old.table_ptr(), ENTRIES_PER_L4_TABLE) };
            }

            unsafe { write_entry(l3, idx, to) };
            from += 1 << L3_OFFSET_BITS;
            to += incr << L3_OFFSET_BITS;
            size -= 1 << L3_OFFSET_BITS;
        }
        Ok(())
    }

    fn map_l4(&mut self, mut from: u64, mut to: u64, mut size: u64, incr: u64) -> Result<(), Error> {
        debug_assert!(!Descriptor(to).is_hw());

        if Descriptor(to).is_sw() {
            to |= Descriptor::TYPE_BIT; // page
        }

        while size != 0 {
            let idx = ((from >> L4_OFFSET_BITS) & mask(L4_INDEX_BITS)) as usize;
            let l4 = self.get_l4(from)?;

            unsafe { write_entry(l4, idx, to) };
            from += 1 << L4_OFFSET_BITS;
            to += incr << L4_OFFSET_BITS;
            size -= 1 << L4_OFFSET_BITS;
        }
        Ok(())
    }

    /// Materialize the L3 table under the L2 slot covering `from`,
    /// replicating an existing block's semantics across its entries.
    fn get_l3(&mut self, from: u64) -> Result<*mut u64, Error> {
        let l2idx = ((from >> L2_OFFSET_BITS) & mask(L2_INDEX_BITS)) as usize;
        let l2d = unsafe { read_entry(self.root, l2idx) };

        if l2d.l2_is_table() {
            return Ok(l2d.table_ptr());
        }

        let l3 = self.alloc.alloc(ENTRIES_PER_L3_TABLE)?;
        if !l2d.is_zero() {
            let mut incr = 0u64;
            let mut l3d = l2d.0;
            if l2d.is_hw() {
                l3d |= Descriptor::TYPE_BIT; // block becomes page
                incr = 1 << L3_OFFSET_BITS;
            } else if l2d.kind() == Some(SpteKind::Map) {
                incr = 1 << L3_OFFSET_BITS;
            }
            for idx in 0..ENTRIES_PER_L3_TABLE {
                unsafe { write_entry(l3, idx, l3d) };
                l3d += incr;
            }
        }

        let table = InMemoryRegister::<u64, STAGE2_DESCRIPTOR::Register>::new(l3 as u64);
        table.modify(STAGE2_DESCRIPTOR::TYPE::Table + STAGE2_DESCRIPTOR::VALID::True);
        unsafe { write_entry(self.root, l2idx, table.get()) };
        Ok(l3)
    }

    /// Materialize the software L4 table under the L3 slot covering `from`.
    /// A hardware page is first reclassified as a software Map so its
    /// entries can replicate it.
    fn get_l4(&mut self, from: u64) -> Result<*mut u64, Error> {
        let l3 = self.get_l3(from)?;
        let l3idx = ((from >> L3_OFFSET_BITS) & mask(L3_INDEX_BITS)) as usize;
        let mut l3d = unsafe { read_entry(l3, l3idx) };

        if l3d.l3_is_table() {
            return Ok(l3d.table_ptr());
        }

        if l3d.is_hw() {
            debug_assert!(l3d.is_table_type());
            l3d = Descriptor((l3d.0 & Descriptor::TARGET_MASK) | Self::kind_bits(SpteKind::Map));
        }

        let l4 = self.alloc.alloc(ENTRIES_PER_L4_TABLE)?;
        if !l3d.is_zero() {
            let mut l4d = l3d.0 | Descriptor::TYPE_BIT; // block becomes page
            let incr = if l3d.kind() == Some(SpteKind::Map) {
                1 << L4_OFFSET_BITS
            } else {
                0
            };
            for idx in 0..ENTRIES_PER_L4_TABLE {
                unsafe { write_entry(l4, idx, l4d) };
                l4d += incr;
            }
        }

        // Software table descriptor: VALID stays clear, the MMU never
        // follows it.
        unsafe { write_entry(l3, l3idx, l4 as u64 | Descriptor::TYPE_BIT) };
        Ok(l4)
    }

    unsafe fn free_l3(&mut self, l3: *mut u64) {
        for idx in 0..ENTRIES_PER_L3_TABLE {
            let d = read_entry(l3, idx);
            if d.l3_is_table() {
                self.alloc.free(d.table_ptr(), ENTRIES_PER_L4_TABLE);
            }
        }
        self.alloc.free(l3, ENTRIES_PER_L3_TABLE);
    }
}

impl<A: TableAlloc> Drop for Stage2Tables<A> {
    fn drop(&mut self) {
        unsafe {
            for idx in 0..ENTRIES_PER_L2_TABLE {
                let d = read_entry(self.root, idx);
                if d.l2_is_table() {
                    self.free_l3(d.table_ptr());
                }
            }
            self.alloc.free(self.root, ENTRIES_PER_L2_TABLE);
        }
    }
}
