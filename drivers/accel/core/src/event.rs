//! # Event Reports
//!
//! Fire-and-forget notifications from the card to the host.
//!
//! Each report carries an [`EventCode`] naming what happened, an
//! [`EventValue`] with a stable reason code, and up to three ids
//! (context, object, secondary object).
//!
//! ## Wire Layout
//!
//! ```text
//!  63  62  61  60      53 52        37 36        21 20      13 12     5 4    0
//! ┌───┬───┬───┬──────────┬────────────┬────────────┬──────────┬────────┬──────┐
//! │v2 │vo │vc │  value   │  obj id 2  │   obj id   │ context  │  code  │opcode│
//! └───┴───┴───┴──────────┴────────────┴────────────┴──────────┴────────┴──────┘
//! ```

use crate::error::Error;
use crate::types::{ContextId, ObjectId};

/// Card-to-host opcode carried in the low bits of every event report
pub const EVENT_REPORT_OPCODE: u8 = 0x04;

// =============================================================================
// EVENT CODE
// =============================================================================

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventCode {
    // Context
    /// Context created and runtime attached
    CreateContextSuccess = 0x01,
    /// Context creation failed
    CreateContextFailed = 0x02,
    /// Context fully torn down
    DestroyContextSuccess = 0x03,
    /// Context destroy failed
    DestroyContextFailed = 0x04,
    /// Context returned to OK
    RecoverContextSuccess = 0x05,
    /// Context recover failed
    RecoverContextFailed = 0x06,
    /// Runtime of a live context died
    ErrorRuntimeDied = 0x07,

    // Device resource
    /// Device resource created
    CreateDevresSuccess = 0x10,
    /// Device resource creation failed
    CreateDevresFailed = 0x11,
    /// Device resource released
    DestroyDevresSuccess = 0x12,
    /// Device resource destroy failed
    DestroyDevresFailed = 0x13,

    // Copy
    /// Copy handle created
    CreateCopySuccess = 0x18,
    /// Copy handle creation failed
    CreateCopyFailed = 0x19,
    /// Copy handle released
    DestroyCopySuccess = 0x1a,
    /// Copy handle destroy failed
    DestroyCopyFailed = 0x1b,
    /// Standalone copy executed
    ExecuteCopySuccess = 0x1c,
    /// Standalone copy failed
    ExecuteCopyFailed = 0x1d,

    // Device network
    /// Network created
    CreateDevnetSuccess = 0x20,
    /// Network creation failed
    CreateDevnetFailed = 0x21,
    /// Resources added to a network
    DevnetAddResSuccess = 0x22,
    /// Adding resources to a network failed
    DevnetAddResFailed = 0x23,
    /// Network released
    DestroyDevnetSuccess = 0x24,
    /// Network destroy failed
    DestroyDevnetFailed = 0x25,
    /// Network resources reserved
    DevnetReserveSuccess = 0x26,
    /// Network resource reservation failed
    DevnetReserveFailed = 0x27,
    /// Network resources released
    DevnetReleaseSuccess = 0x28,
    /// Network resource release failed
    DevnetReleaseFailed = 0x29,
    /// Network property set
    DevnetSetPropertySuccess = 0x2a,
    /// Network property failed
    DevnetSetPropertyFailed = 0x2b,

    // Inference request
    /// Inference request created
    CreateInfreqSuccess = 0x30,
    /// Inference request creation failed
    CreateInfreqFailed = 0x31,
    /// Inference request released
    DestroyInfreqSuccess = 0x32,
    /// Inference request destroy failed
    DestroyInfreqFailed = 0x33,
    /// Standalone inference executed
    ExecuteInfreqSuccess = 0x34,
    /// Standalone inference failed
    ExecuteInfreqFailed = 0x35,

    // Command list
    /// Command list created
    CreateCmdSuccess = 0x40,
    /// Command list creation failed
    CreateCmdFailed = 0x41,
    /// Command list released
    DestroyCmdSuccess = 0x42,
    /// Command list destroy failed
    DestroyCmdFailed = 0x43,
    /// All items of one command-list schedule reported
    ExecuteCmdComplete = 0x44,

    // Error list and sync
    /// One packet of a packed error list was written to the host
    ErrorListReply = 0x50,
    /// Error list query or clear failed
    ErrorListFailed = 0x51,
    /// Error list cleared
    ErrorListCleared = 0x52,
    /// Sync point reached
    SyncPointReached = 0x58,
    /// Sync point could not be created
    CreateSyncFailed = 0x59,
}

impl EventCode {
    /// Decode a raw event code
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::CreateContextSuccess,
            0x02 => Self::CreateContextFailed,
            0x03 => Self::DestroyContextSuccess,
            0x04 => Self::DestroyContextFailed,
            0x05 => Self::RecoverContextSuccess,
            0x06 => Self::RecoverContextFailed,
            0x07 => Self::ErrorRuntimeDied,
            0x10 => Self::CreateDevresSuccess,
            0x11 => Self::CreateDevresFailed,
            0x12 => Self::DestroyDevresSuccess,
            0x13 => Self::DestroyDevresFailed,
            0x18 => Self::CreateCopySuccess,
            0x19 => Self::CreateCopyFailed,
            0x1a => Self::DestroyCopySuccess,
            0x1b => Self::DestroyCopyFailed,
            0x1c => Self::ExecuteCopySuccess,
            0x1d => Self::ExecuteCopyFailed,
            0x20 => Self::CreateDevnetSuccess,
            0x21 => Self::CreateDevnetFailed,
            0x22 => Self::DevnetAddResSuccess,
            0x23 => Self::DevnetAddResFailed,
            0x24 => Self::DestroyDevnetSuccess,
            0x25 => Self::DestroyDevnetFailed,
            0x26 => Self::DevnetReserveSuccess,
            0x27 => Self::DevnetReserveFailed,
            0x28 => Self::DevnetReleaseSuccess,
            0x29 => Self::DevnetReleaseFailed,
            0x2a => Self::DevnetSetPropertySuccess,
            0x2b => Self::DevnetSetPropertyFailed,
            0x30 => Self::CreateInfreqSuccess,
            0x31 => Self::CreateInfreqFailed,
            0x32 => Self::DestroyInfreqSuccess,
            0x33 => Self::DestroyInfreqFailed,
            0x34 => Self::ExecuteInfreqSuccess,
            0x35 => Self::ExecuteInfreqFailed,
            0x40 => Self::CreateCmdSuccess,
            0x41 => Self::CreateCmdFailed,
            0x42 => Self::DestroyCmdSuccess,
            0x43 => Self::DestroyCmdFailed,
            0x44 => Self::ExecuteCmdComplete,
            0x50 => Self::ErrorListReply,
            0x51 => Self::ErrorListFailed,
            0x52 => Self::ErrorListCleared,
            0x58 => Self::SyncPointReached,
            0x59 => Self::CreateSyncFailed,
            _ => return None,
        })
    }
}

// =============================================================================
// EVENT VALUE
// =============================================================================

/// Stable reason code carried by an event report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum EventValue {
    /// No error
    #[default]
    NoError = 0,

    // Resource exhaustion
    /// Out of memory on the card
    NoMemory = 1,

    // Missing objects
    /// No such context
    NoSuchContext = 2,
    /// No such device resource
    NoSuchDevres = 3,
    /// No such copy handle
    NoSuchCopy = 4,
    /// No such network
    NoSuchNet = 5,
    /// No such inference request
    NoSuchInfreq = 6,
    /// No such command list
    NoSuchCmd = 7,
    /// Id already in use
    AlreadyExist = 8,

    // Context and remote side
    /// Context broken
    ContextBroken = 9,
    /// No daemon attached
    NoDaemon = 10,
    /// Daemon went away
    NoDevice = 11,
    /// Runtime could not be launched
    RuntimeLaunchFailed = 12,
    /// Runtime reported a failure
    RuntimeFailed = 13,
    /// Runtime does not support the request
    RuntimeNotSupported = 14,
    /// Runtime died while the request was pending
    RuntimeDied = 15,
    /// Operation not supported
    NotSupported = 16,
    /// Network binary rejected
    InvalidExecutableNetworkBinary = 17,
    /// Inference request refers to missing resources
    InferMissingResource = 18,
    /// ECC memory allocation failed
    EccAllocFailed = 19,
    /// Not enough resources for a reservation
    InsufficientResources = 20,
    /// Reservation timed out
    TimeoutExceeded = 21,

    // Transport and protocol
    /// DMA transfer failed
    DmaError = 22,
    /// Protocol violation in a command or staged payload
    ProtocolError = 23,
    /// Network edit already in flight
    DevnetEditBusy = 24,
    /// Network edit continuation without an open edit
    DevnetEditError = 25,
    /// Command list still has a schedule in flight
    CmdListBusy = 26,

    // Execution
    /// Inference execution error
    InferExecError = 27,
    /// Device driver error
    IceDrvError = 28,
    /// Device driver error, device reset
    IceDrvErrorReset = 29,
    /// Device driver error, card reset
    IceDrvErrorCardReset = 30,
    /// Scheduling error
    ScheduleError = 31,
    /// At least one item of a command-list schedule failed
    ExecErrors = 32,
    /// Error list is empty
    NoExecErrors = 33,
}

impl EventValue {
    /// Raw wire value
    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }

    /// Whether this value denotes success
    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::NoError)
    }

    /// Whether an execution failure with this value breaks the context
    pub const fn breaks_context(self) -> bool {
        matches!(
            self,
            Self::InferExecError
                | Self::IceDrvError
                | Self::IceDrvErrorReset
                | Self::IceDrvErrorCardReset
                | Self::ScheduleError
                | Self::RuntimeDied
        )
    }

    /// Whether a context broken by this value can never recover
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::IceDrvErrorCardReset | Self::RuntimeDied)
    }
}

impl From<Error> for EventValue {
    fn from(e: Error) -> Self {
        match e {
            Error::OutOfMemory | Error::ExhaustedPool => Self::NoMemory,
            Error::NoSuchContext => Self::NoSuchContext,
            Error::NoSuchDevres => Self::NoSuchDevres,
            Error::NoSuchCopy => Self::NoSuchCopy,
            Error::NoSuchNetwork => Self::NoSuchNet,
            Error::NoSuchInfreq => Self::NoSuchInfreq,
            Error::NoSuchCmdList => Self::NoSuchCmd,
            Error::AlreadyExists => Self::AlreadyExist,
            Error::ContextBroken | Error::Destroyed => Self::ContextBroken,
            Error::NoDaemon | Error::DaemonExists => Self::NoDaemon,
            Error::NoDevice | Error::HangUp => Self::NoDevice,
            Error::EditBusy => Self::DevnetEditBusy,
            Error::EditError => Self::DevnetEditError,
            Error::Busy => Self::CmdListBusy,
            Error::DmaFailed | Error::InvalidPage | Error::InvalidDmaAddress => Self::DmaError,
            Error::NotSupported | Error::UnknownItemKind(_) => Self::RuntimeNotSupported,
            Error::UnknownOpcode(_)
            | Error::MalformedCommand
            | Error::PayloadTooLarge
            | Error::BufferTooSmall
            | Error::InvalidParameter
            | Error::WouldBlock
            | Error::AccessDenied => Self::ProtocolError,
        }
    }
}

// =============================================================================
// EVENT REPORT
// =============================================================================

/// One event report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReport {
    /// What happened
    pub code: EventCode,
    /// Reason code
    pub value: EventValue,
    /// Context the event refers to
    pub context: Option<ContextId>,
    /// Primary object id
    pub object: Option<ObjectId>,
    /// Secondary object id
    pub object2: Option<ObjectId>,
}

impl EventReport {
    /// Create a report with no ids
    pub const fn new(code: EventCode, value: EventValue) -> Self {
        Self {
            code,
            value,
            context: None,
            object: None,
            object2: None,
        }
    }

    /// Attach a context id
    pub const fn context(mut self, id: ContextId) -> Self {
        self.context = Some(id);
        self
    }

    /// Attach a primary object id
    pub const fn object(mut self, id: ObjectId) -> Self {
        self.object = Some(id);
        self
    }

    /// Attach a secondary object id
    pub const fn object2(mut self, id: ObjectId) -> Self {
        self.object2 = Some(id);
        self
    }

    /// Pack into the 64-bit wire word
    pub const fn encode(&self) -> u64 {
        let mut word = EVENT_REPORT_OPCODE as u64 & 0x1f;
        word |= (self.code as u64) << 5;
        if let Some(ctx) = self.context {
            word |= (ctx as u64) << 13;
            word |= 1 << 61;
        }
        if let Some(obj) = self.object {
            word |= (obj as u64) << 21;
            word |= 1 << 62;
        }
        if let Some(obj2) = self.object2 {
            word |= (obj2 as u64) << 37;
            word |= 1 << 63;
        }
        word |= (self.value as u64) << 53;
        word
    }

    /// Unpack a wire word
    ///
    /// Returns `None` if the opcode, event code or value is unknown.
    pub fn decode(word: u64) -> Option<Self> {
        if word & 0x1f != EVENT_REPORT_OPCODE as u64 {
            return None;
        }
        let code = EventCode::from_raw(((word >> 5) & 0xff) as u8)?;
        let value = decode_value(((word >> 53) & 0xff) as u8)?;
        let mut report = Self::new(code, value);
        if word & (1 << 61) != 0 {
            report.context = Some(((word >> 13) & 0xff) as u8);
        }
        if word & (1 << 62) != 0 {
            report.object = Some(((word >> 21) & 0xffff) as u16);
        }
        if word & (1 << 63) != 0 {
            report.object2 = Some(((word >> 37) & 0xffff) as u16);
        }
        Some(report)
    }
}

fn decode_value(raw: u8) -> Option<EventValue> {
    const ALL: [EventValue; 34] = [
        EventValue::NoError,
        EventValue::NoMemory,
        EventValue::NoSuchContext,
        EventValue::NoSuchDevres,
        EventValue::NoSuchCopy,
        EventValue::NoSuchNet,
        EventValue::NoSuchInfreq,
        EventValue::NoSuchCmd,
        EventValue::AlreadyExist,
        EventValue::ContextBroken,
        EventValue::NoDaemon,
        EventValue::NoDevice,
        EventValue::RuntimeLaunchFailed,
        EventValue::RuntimeFailed,
        EventValue::RuntimeNotSupported,
        EventValue::RuntimeDied,
        EventValue::NotSupported,
        EventValue::InvalidExecutableNetworkBinary,
        EventValue::InferMissingResource,
        EventValue::EccAllocFailed,
        EventValue::InsufficientResources,
        EventValue::TimeoutExceeded,
        EventValue::DmaError,
        EventValue::ProtocolError,
        EventValue::DevnetEditBusy,
        EventValue::DevnetEditError,
        EventValue::CmdListBusy,
        EventValue::InferExecError,
        EventValue::IceDrvError,
        EventValue::IceDrvErrorReset,
        EventValue::IceDrvErrorCardReset,
        EventValue::ScheduleError,
        EventValue::ExecErrors,
        EventValue::NoExecErrors,
    ];
    ALL.get(raw as usize).copied()
}

// =============================================================================
// EVENT SINK
// =============================================================================

/// Where event reports go
///
/// Implementations must not block; reports are emitted from DMA completion
/// continuations as well as from worker context.
pub trait EventSink: Send + Sync {
    /// Deliver one report to the host
    fn report(&self, event: EventReport);
}
