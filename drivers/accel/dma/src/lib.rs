//! # CINDER DMA
//!
//! DMA page pool and the interfaces to the DMA engine and host ring.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       cinder-dma                         │
//! │  ┌────────────────────┐   ┌───────────────────────────┐  │
//! │  │    DmaPagePool     │   │  DmaTransport / HostRing  │  │
//! │  │ (free/full/sent,   │   │  (external engine seam)   │  │
//! │  │  response refill)  │   └───────────────────────────┘  │
//! │  └────────────────────┘   ┌───────────────────────────┐  │
//! │                           │  SgChain (copy lists)     │  │
//! │                           └───────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod pool;
pub mod sg;
pub mod transport;

pub use pool::{DmaPagePool, PageLease, PageState, PoolStats, ResponseCallback, ResponseEntry};
pub use sg::{SgChain, SgEntry};
pub use transport::{
    DmaDescriptor, DmaTransport, HostRing, XferCompletion, XferDirection, XferHandle, XferRequest,
    XferStatus,
};
