//! # CINDER Core Types
//!
//! Addresses, handles and identifiers shared across the control plane.

use core::fmt;
use core::ops::Add;

use static_assertions::const_assert;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Size of one DMA page, as seen by both host and card
pub const PAGE_SIZE: usize = 4096;

/// Page shift matching [`PAGE_SIZE`]
pub const PAGE_SHIFT: u32 = 12;

/// Width of a page frame number on the wire
pub const DMA_PFN_BITS: u32 = 45;

/// Mask selecting a wire page frame number
pub const DMA_PFN_MASK: u64 = (1 << DMA_PFN_BITS) - 1;

const_assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
const_assert!(PAGE_SIZE.is_power_of_two());

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Host-chosen context id (8 bits on the wire)
pub type ContextId = u8;

/// Host-chosen id of a context child object (16 bits on the wire)
pub type ObjectId = u16;

// =============================================================================
// DMA ADDRESS
// =============================================================================

/// Bus address usable by the DMA engine
///
/// Either a host page (decoded from a wire page frame number or reserved
/// from a host ring) or a card-side DMA page owned by the page pool.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DmaAddr(u64);

impl DmaAddr {
    /// Create a new DMA address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null DMA address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Address of the first byte of a page frame number
    #[inline]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self((pfn & DMA_PFN_MASK) << PAGE_SHIFT)
    }

    /// Page frame number of this address
    #[inline]
    pub const fn pfn(self) -> u64 {
        (self.0 >> PAGE_SHIFT) & DMA_PFN_MASK
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for DmaAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// PAGE HANDLE
// =============================================================================

/// Handle of a page inside the DMA page pool
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageHandle(u8);

impl PageHandle {
    /// Create a page handle
    #[inline]
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw 8-bit handle
    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Index into the pool's page table
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageHandle({})", self.0)
    }
}

// =============================================================================
// DRIVER HANDLE
// =============================================================================

/// Opaque value sent with every remote request and echoed back in the reply
///
/// Never zero for a live object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DriverHandle(u64);

impl DriverHandle {
    /// Wrap a raw handle value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverHandle(0x{:x})", self.0)
    }
}

// =============================================================================
// RUNTIME HANDLE
// =============================================================================

/// Handle assigned by the card-side runtime to an object it created
pub type RuntimeHandle = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pfn_round_trip() {
        let addr = DmaAddr::from_pfn(0x1234);
        assert_eq!(addr.raw(), 0x1234 << PAGE_SHIFT);
        assert_eq!(addr.pfn(), 0x1234);
    }

    #[test]
    fn test_pfn_is_masked() {
        let addr = DmaAddr::from_pfn(u64::MAX);
        assert_eq!(addr.pfn(), DMA_PFN_MASK);
    }

    #[test]
    fn test_offset() {
        let base = DmaAddr::from_pfn(2);
        assert_eq!((base + 16).raw(), 2 * PAGE_SIZE as u64 + 16);
        assert_eq!(base.offset(PAGE_SIZE as u64).pfn(), 3);
    }
}
