//! # CINDER Error Handling
//!
//! One error type for the whole control plane.
//!
//! Every variant maps onto a host-visible [`EventValue`](crate::EventValue),
//! so a failure anywhere below the dispatcher can be turned into an event
//! report without losing its category.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CINDER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CINDER unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Object with this id already exists
    AlreadyExists,
    /// Resource is busy
    Busy,
    /// Operation not supported
    NotSupported,
    /// Operation not permitted on this object
    AccessDenied,

    // =========================================================================
    // Resource Exhaustion
    // =========================================================================
    /// Allocation failed
    OutOfMemory,
    /// No free page left in the DMA page pool
    ExhaustedPool,

    // =========================================================================
    // Object Graph Errors
    // =========================================================================
    /// No such context
    NoSuchContext,
    /// No such device resource
    NoSuchDevres,
    /// No such copy handle
    NoSuchCopy,
    /// No such device network
    NoSuchNetwork,
    /// No such inference request
    NoSuchInfreq,
    /// No such command list
    NoSuchCmdList,
    /// Context is in a broken state
    ContextBroken,
    /// Object was destroyed while the operation was in flight
    Destroyed,
    /// No daemon is attached
    NoDaemon,
    /// A daemon is already attached
    DaemonExists,
    /// Device (daemon side) went away
    NoDevice,
    /// Network edit already in flight
    EditBusy,
    /// Network edit continuation without an open edit
    EditError,

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// DMA transfer failed
    DmaFailed,
    /// Queue was hung up
    HangUp,
    /// No data available right now
    WouldBlock,
    /// Caller buffer is too small
    BufferTooSmall,
    /// Page handle does not belong to the pool
    InvalidPage,
    /// Address is not inside a mapped DMA page
    InvalidDmaAddress,

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Unknown host opcode
    UnknownOpcode(u8),
    /// Unknown staged item kind
    UnknownItemKind(u8),
    /// Malformed command or payload
    MalformedCommand,
    /// Payload exceeds what the protocol allows
    PayloadTooLarge,
}

impl Error {
    /// Whether this is a resource-exhaustion error
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::ExhaustedPool)
    }

    /// Whether this is a protocol violation by the host
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnknownOpcode(_)
                | Self::UnknownItemKind(_)
                | Self::MalformedCommand
                | Self::PayloadTooLarge
                | Self::AlreadyExists
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::AlreadyExists => write!(f, "object already exists"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::AccessDenied => write!(f, "access denied"),

            // Exhaustion
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::ExhaustedPool => write!(f, "DMA page pool exhausted"),

            // Object graph
            Self::NoSuchContext => write!(f, "no such context"),
            Self::NoSuchDevres => write!(f, "no such device resource"),
            Self::NoSuchCopy => write!(f, "no such copy handle"),
            Self::NoSuchNetwork => write!(f, "no such device network"),
            Self::NoSuchInfreq => write!(f, "no such inference request"),
            Self::NoSuchCmdList => write!(f, "no such command list"),
            Self::ContextBroken => write!(f, "context is broken"),
            Self::Destroyed => write!(f, "object destroyed"),
            Self::NoDaemon => write!(f, "no daemon attached"),
            Self::DaemonExists => write!(f, "daemon already attached"),
            Self::NoDevice => write!(f, "device went away"),
            Self::EditBusy => write!(f, "network edit in flight"),
            Self::EditError => write!(f, "no network edit in flight"),

            // Transport
            Self::DmaFailed => write!(f, "DMA transfer failed"),
            Self::HangUp => write!(f, "queue hung up"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::InvalidPage => write!(f, "invalid page handle"),
            Self::InvalidDmaAddress => write!(f, "invalid DMA address"),

            // Protocol
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {}", op),
            Self::UnknownItemKind(kind) => write!(f, "unknown item kind {}", kind),
            Self::MalformedCommand => write!(f, "malformed command"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
