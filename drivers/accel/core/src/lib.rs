//! # CINDER Core
//!
//! Foundational types shared by every layer of the accelerator control plane.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         cinder-core                           │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────────┐  │
//! │  │  Error    │  │  Types    │  │  Events   │  │   Config   │  │
//! │  │ (Result)  │  │ (DmaAddr, │  │ (codes,   │  │ (pool and  │  │
//! │  │           │  │  handles) │  │  report)  │  │  service)  │  │
//! │  └───────────┘  └───────────┘  └───────────┘  └────────────┘  │
//! │                  ┌──────────────────────────┐                 │
//! │                  │  Sync (WaitQueue)        │                 │
//! │                  └──────────────────────────┘                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod event;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use config::{PoolConfig, ServiceConfig};
pub use error::{Error, Result};
pub use event::{EventCode, EventReport, EventSink, EventValue};
pub use sync::WaitQueue;
pub use types::*;
