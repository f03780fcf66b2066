//! # CINDER Inference Service
//!
//! Card-side control plane for inference sessions: contexts and the objects
//! they own, the two-phase create and destroy protocol against the daemon
//! and runtime, payloads staged through DMA pages, and command-list
//! scheduling.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        InferenceService                          │
//! │  ┌──────────┐  ┌───────────┐  ┌───────────┐  ┌────────────────┐  │
//! │  │ protocol │─▶│ work      │─▶│ object    │─▶│ exec / sched   │  │
//! │  │ (decode) │  │ queues    │  │ graph     │  │ (backends)     │  │
//! │  └──────────┘  └───────────┘  └─────┬─────┘  └────────────────┘  │
//! │                                     │                            │
//! │  ┌──────────────┐  ┌────────────────▼──┐  ┌──────────────────┐   │
//! │  │ staging      │  │ remote (daemon,   │  │ errlist / sync   │   │
//! │  │ (DMA pages)  │  │ runtime replies)  │  │                  │   │
//! │  └──────────────┘  └───────────────────┘  └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Object graph
//!
//! ```text
//! Context ─┬─ DevRes
//!          ├─ CopyHandle ──▶ DevRes
//!          ├─ DevNet ──▶ DevRes*
//!          │    └─ InfReq
//!          └─ CmdList ──▶ CopyHandle*, InfReq*
//! ```
//!
//! Children point at their parent; parents index their children by id.

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

pub mod cmdlist;
pub mod codec;
pub mod context;
pub mod copy;
mod daemon;
pub mod devnet;
pub mod devres;
pub mod errlist;
pub mod exec;
pub mod infreq;
pub mod object;
pub mod protocol;
pub mod remote;
pub mod sched;
pub mod service;
pub mod staging;
pub mod workqueue;

#[cfg(test)]
mod tests;

pub use cmdlist::{CmdItem, CmdList, CmdListStatus, CopyListTemplate};
pub use context::{AttachState, Context, ContextState};
pub use copy::CopyHandle;
pub use devnet::{DevNet, EditStatus};
pub use devres::{DevRes, DevResStatus};
pub use errlist::{ErrorEntry, ErrorList};
pub use exec::{DmaCopyBackend, ExecBackend, ExecKind, ExecRequest, ExecWork, Rejected};
pub use infreq::{InfReq, InfreqStatus};
pub use protocol::{HostCommand, HostOpcode, SchedParams, UsageFlags};
pub use remote::{
    AllocReply, CreateReply, ExecDoneReply, RemoteOpcode, ReservationReply, RuntimeNotice,
    RuntimeStatus,
};
pub use sched::{Edit, ItemEdit};
pub use service::InferenceService;
