//! # CINDER Command Queue
//!
//! Opcoded FIFOs carrying requests from the card driver to the privileged
//! daemon and to each context's runtime process.
//!
//! ```text
//!   driver ── push(opcode, payload) ──▶ [ hdr | payload ][ hdr | ... ] ──▶ pop_into(buf) ── reader
//!                                                                    ▲
//!                                    hangup() ── wakes every reader ─┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod queue;

pub use queue::{CommandHeader, CommandQueue, PayloadProducer, PollFlags, RawCommand, HEADER_SIZE};
