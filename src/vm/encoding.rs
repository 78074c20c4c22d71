//! Compressed pointer encodings.
//!
//! A narrow oop is a 32-bit offset from a base, scaled by a shift. The archive records the
//! encoding in effect at dump time; heap regions store their address in encoded form, and
//! every reference inside an archived heap region is a narrow oop. Translating between
//! encodings always goes through [`NarrowOopEncoding::encode`] and
//! [`NarrowOopEncoding::decode`], never through raw pointer arithmetic.

use crate::error::{ArchiveError, Result};
use crate::util::constants::BYTES_IN_GBYTE;
use crate::util::{Address, MemRange};
use strum_macros::{Display, FromRepr};

/// How the heap is placed relative to the encoding base.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum NarrowOopMode {
    /// Base 0, shift 0: the heap ends below 4 GB.
    #[strum(serialize = "unscaled")]
    Unscaled = 0,
    /// Base 0, scaled by the object alignment: the heap ends below 32 GB.
    #[strum(serialize = "zero-based")]
    ZeroBased = 1,
    /// A base whose bits do not overlap the shifted offsets.
    #[strum(serialize = "disjoint-base")]
    DisjointBase = 2,
    /// A base just below the heap start.
    #[strum(serialize = "heap-based")]
    HeapBased = 3,
}

/// The narrow-oop encoding of a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NarrowOopEncoding {
    pub mode: NarrowOopMode,
    pub base: Address,
    pub shift: u8,
}

const UNSCALED_OOP_HEAP_MAX: usize = 4 * BYTES_IN_GBYTE;

impl NarrowOopEncoding {
    pub const fn new(mode: NarrowOopMode, base: Address, shift: u8) -> Self {
        NarrowOopEncoding { mode, base, shift }
    }

    /// Choose the encoding for a heap reserved at `heap`, given the object alignment.
    pub fn for_heap(heap: MemRange, object_alignment: usize) -> Self {
        let shift = object_alignment.trailing_zeros() as u8;
        let end = heap.end().as_usize();
        if end <= UNSCALED_OOP_HEAP_MAX {
            Self::new(NarrowOopMode::Unscaled, Address::ZERO, 0)
        } else if end <= UNSCALED_OOP_HEAP_MAX << shift {
            Self::new(NarrowOopMode::ZeroBased, Address::ZERO, shift)
        } else {
            // Keep the base one page below the heap so that no heap address encodes to 0.
            let base = heap.start.sub(crate::util::constants::BYTES_IN_PAGE);
            Self::new(NarrowOopMode::HeapBased, base, shift)
        }
    }

    /// Encode `addr`. The zero address encodes to 0.
    pub fn encode(&self, addr: Address) -> Result<u32> {
        if addr.is_zero() {
            return Ok(0);
        }
        let overflow = || ArchiveError::EncodingOverflow {
            addr,
            base: self.base,
            shift: self.shift,
        };
        if addr < self.base {
            return Err(overflow());
        }
        let offset = addr - self.base;
        if offset & ((1usize << self.shift) - 1) != 0 {
            return Err(overflow());
        }
        match u32::try_from(offset >> self.shift) {
            Ok(0) | Err(_) => Err(overflow()),
            Ok(v) => Ok(v),
        }
    }

    /// Decode a narrow oop. 0 decodes to the zero address.
    pub fn decode(&self, v: u32) -> Address {
        if v == 0 {
            Address::ZERO
        } else {
            self.decode_not_null(v)
        }
    }

    pub fn decode_not_null(&self, v: u32) -> Address {
        self.base + ((v as usize) << self.shift)
    }
}

/// The narrow-klass encoding of a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NarrowKlassEncoding {
    pub base: Address,
    pub shift: u8,
}

impl NarrowKlassEncoding {
    pub const fn new(base: Address, shift: u8) -> Self {
        NarrowKlassEncoding { base, shift }
    }
}
