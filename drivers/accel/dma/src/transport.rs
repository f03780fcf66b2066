//! # DMA Transport Interfaces
//!
//! The DMA engine and the host ring buffer live outside this driver layer;
//! these traits are the seam. Completion continuations run in
//! interrupt-adjacent context and must never block.

use alloc::boxed::Box;

use cinder_core::{DmaAddr, Result};

// =============================================================================
// TRANSFER DESCRIPTION
// =============================================================================

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDirection {
    /// Host memory into a card page
    HostToCard,
    /// Card page into host memory
    CardToHost,
}

/// Engine-level transfer attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaDescriptor {
    /// Direction
    pub direction: XferDirection,
    /// Engine priority, 0 is normal
    pub priority: u8,
}

impl DmaDescriptor {
    /// Normal priority host-to-card descriptor
    pub const fn h2c() -> Self {
        Self {
            direction: XferDirection::HostToCard,
            priority: 0,
        }
    }

    /// Normal priority card-to-host descriptor
    pub const fn c2h() -> Self {
        Self {
            direction: XferDirection::CardToHost,
            priority: 0,
        }
    }
}

/// One contiguous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferRequest {
    /// Engine attributes
    pub desc: DmaDescriptor,
    /// Source bus address
    pub src: DmaAddr,
    /// Destination bus address
    pub dst: DmaAddr,
    /// Bytes to move
    pub size: u32,
}

/// Outcome of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferStatus {
    /// Data arrived
    Ok,
    /// Engine reported an error
    Failed,
}

impl XferStatus {
    /// Whether the transfer succeeded
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Engine-assigned transfer id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XferHandle(pub u64);

/// Continuation invoked exactly once with the status and the elapsed time
/// in microseconds
pub type XferCompletion = Box<dyn FnOnce(XferStatus, u32) + Send>;

// =============================================================================
// TRANSPORT TRAITS
// =============================================================================

/// DMA engine
pub trait DmaTransport: Send + Sync {
    /// Queue one transfer
    ///
    /// On `Ok` the completion will be invoked exactly once; on `Err` it is
    /// dropped without being called.
    fn start_single_transfer(&self, xfer: XferRequest, done: XferCompletion)
        -> Result<XferHandle>;
}

/// Host-side ring buffer used by channel-based contexts
pub trait HostRing: Send + Sync {
    /// Reserve the next `size` bytes; returns their address and the
    /// contiguous length available there
    fn reserve(&self, size: usize) -> Result<(DmaAddr, usize)>;

    /// Hand consumed host-to-card bytes back to the host
    fn advance_free(&self, size: usize);

    /// Publish card-to-host bytes to the host
    fn advance_avail(&self, size: usize);
}
