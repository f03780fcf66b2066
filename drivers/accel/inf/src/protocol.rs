//! # Host Wire Commands
//!
//! Host commands arrive as one to three little 64-bit words. Every command
//! shares the first seven bits of word 0:
//!
//! ```text
//!  63                                   14 13        6 5        0
//! ┌───────────────────────────────────────┬───────────┬──────────┐
//! │          command-specific fields      │  context  │  opcode  │
//! └───────────────────────────────────────┴───────────┴──────────┘
//! ```
//!
//! | Opcode | Words | Word 0 fields (bit ranges) | Word 1 / 2 |
//! |---|---|---|---|
//! | ContextOp | 1 | destroy 14, recover 15, flags 16..24 | |
//! | DevresOp | 2 | devres 14..30, destroy 30, usage 31..39 | size |
//! | CopyOp | 2 | copy 14..30, devres 30..46, destroy 46, c2h 47, d2d 48 | host pfn 0..45 |
//! | ScheduleCopy | 2 | copy 14..30, priority 30..32 | size |
//! | NetworkOp | 3 | net 14..30, destroy 30, create 31, chained 32, num_res 33..57 | w1: chunk size 0..13, config size 13..26, start_res_idx 26..50; w2: host pfn |
//! | InfreqOp | 2 | net 14..30, infreq 30..46, destroy 46, size 47..60 | host pfn |
//! | ScheduleInfreq | 2 | net 14..30, infreq 30..46, no params 46, priority 47..49, debug 49, collect 50 | batch 0..16 |
//! | CmdListOp | 2 | cmd 14..30, destroy 30, first 31, last 32, size 33..46 | host pfn |
//! | ScheduleCmdList | 2 | cmd 14..30, first 31, last 32, size 33..46 | host pfn |
//! | ErrorListOp | 2 | cmd 14..30, for cmdlist 30, clear 31 | host pfn |
//! | NetworkReservation | 2 | net 14..30, reserve 30 | timeout 0..32 |
//! | NetworkProperty | 2 | net 14..30, property 30..38 | value 0..32, timeout 32..64 |
//! | Sync | 1 | seq 14..30 | |

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use cinder_core::{
    ContextId, DmaAddr, Error, EventCode, EventReport, EventValue, ObjectId, Result, PAGE_SIZE,
};

// =============================================================================
// FIELD HELPERS
// =============================================================================

#[inline]
const fn field(word: u64, lo: u32, width: u32) -> u64 {
    (word >> lo) & ((1u64 << width) - 1)
}

#[inline]
const fn bit(word: u64, at: u32) -> bool {
    (word >> at) & 1 != 0
}

#[inline]
fn put(word: &mut u64, lo: u32, width: u32, value: u64) {
    *word |= (value & ((1u64 << width) - 1)) << lo;
}

#[inline]
fn put_bit(word: &mut u64, at: u32, value: bool) {
    *word |= (value as u64) << at;
}

fn header(op: HostOpcode, ctx: ContextId) -> u64 {
    let mut w = 0;
    put(&mut w, 0, 6, op as u64);
    put(&mut w, 6, 8, ctx as u64);
    w
}

fn obj(word: u64, lo: u32) -> ObjectId {
    field(word, lo, 16) as ObjectId
}

fn chunk_size(raw: u64) -> Result<u16> {
    if raw as usize > PAGE_SIZE {
        return Err(Error::PayloadTooLarge);
    }
    Ok(raw as u16)
}

// =============================================================================
// SHARED FIELD TYPES
// =============================================================================

bitflags! {
    /// Device resource usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UsageFlags: u8 {
        /// Network input
        const INPUT = 1 << 0;
        /// Network output
        const OUTPUT = 1 << 1;
        /// Holds a network binary
        const NETWORK = 1 << 2;
        /// Must live below 4 GiB
        const FORCE_4G = 1 << 3;
        /// ECC protected
        const ECC = 1 << 4;
        /// Peer-to-peer destination
        const P2P_DST = 1 << 5;
        /// Peer-to-peer source
        const P2P_SRC = 1 << 6;
    }
}

/// Per-invocation inference parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedParams {
    /// Batch size, 0 means the network default
    pub batch_size: u16,
    /// Priority 0..=3
    pub priority: u8,
    /// Device debug mode
    pub debug_on: bool,
    /// Collect execution info
    pub collect_info: bool,
}

/// Settable network properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkProperty {
    /// Serialize inference executions of the network
    SerialInfExecution = 0,
    /// Reserve (value != 0) or release the network's device resources
    ResourcesReservation = 1,
}

impl NetworkProperty {
    /// Decode a raw property id
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::SerialInfExecution),
            1 => Some(Self::ResourcesReservation),
            _ => None,
        }
    }
}

// =============================================================================
// OPCODES
// =============================================================================

/// Host command opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostOpcode {
    /// Create, destroy or recover a context
    ContextOp = 1,
    /// Create or destroy a device resource
    DevresOp = 2,
    /// Create or destroy a copy handle
    CopyOp = 3,
    /// Execute a copy handle
    ScheduleCopy = 4,
    /// Create, extend or destroy a device network
    NetworkOp = 5,
    /// Create or destroy an inference request
    InfreqOp = 6,
    /// Execute an inference request
    ScheduleInfreq = 7,
    /// Create or destroy a command list
    CmdListOp = 8,
    /// Execute a command list
    ScheduleCmdList = 9,
    /// Query or clear an error list
    ErrorListOp = 10,
    /// Reserve or release network resources
    NetworkReservation = 11,
    /// Set a network property
    NetworkProperty = 12,
    /// Request a sync point
    Sync = 13,
}

impl HostOpcode {
    /// Decode a raw opcode
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::ContextOp,
            2 => Self::DevresOp,
            3 => Self::CopyOp,
            4 => Self::ScheduleCopy,
            5 => Self::NetworkOp,
            6 => Self::InfreqOp,
            7 => Self::ScheduleInfreq,
            8 => Self::CmdListOp,
            9 => Self::ScheduleCmdList,
            10 => Self::ErrorListOp,
            11 => Self::NetworkReservation,
            12 => Self::NetworkProperty,
            13 => Self::Sync,
            _ => return None,
        })
    }

    /// Number of 64-bit words of this command
    pub const fn words(self) -> usize {
        match self {
            Self::ContextOp | Self::Sync => 1,
            Self::NetworkOp => 3,
            _ => 2,
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Context create, destroy or recover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOp {
    pub ctx_id: ContextId,
    pub destroy: bool,
    pub recover: bool,
    pub flags: u8,
}

/// Device resource create or destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevresOp {
    pub ctx_id: ContextId,
    pub devres_id: ObjectId,
    pub destroy: bool,
    pub usage: UsageFlags,
    pub size: u64,
}

/// Copy handle create or destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub ctx_id: ContextId,
    pub copy_id: ObjectId,
    pub devres_id: ObjectId,
    pub destroy: bool,
    pub c2h: bool,
    pub d2d: bool,
    pub host_addr: DmaAddr,
}

/// Standalone copy execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleCopyOp {
    pub ctx_id: ContextId,
    pub copy_id: ObjectId,
    pub priority: u8,
    /// Bytes to move, 0 for the full resource
    pub size: u64,
}

/// One chunk of a network create or add-resources edit, or a destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkOp {
    pub ctx_id: ContextId,
    pub net_id: ObjectId,
    pub destroy: bool,
    /// Create a new network rather than extend an existing one
    pub create: bool,
    /// Legacy transport: non-final chunks end with a chain trailer
    pub chained: bool,
    /// Resource ids in the whole edit
    pub num_res: u32,
    /// Bytes in the first transfer of this command
    pub size: u16,
    /// Network config bytes trailing the id table
    pub config_size: u16,
    /// Index of the first resource id carried by this command
    pub start_res_idx: u32,
    pub host_addr: DmaAddr,
}

/// Inference request create or destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfreqOp {
    pub ctx_id: ContextId,
    pub net_id: ObjectId,
    pub infreq_id: ObjectId,
    pub destroy: bool,
    /// Config bytes staged from the host
    pub size: u16,
    pub host_addr: DmaAddr,
}

/// Standalone inference execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleInfreqOp {
    pub ctx_id: ContextId,
    pub net_id: ObjectId,
    pub infreq_id: ObjectId,
    pub params: Option<SchedParams>,
}

/// One chunk of a command list body, or a destroy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdListOp {
    pub ctx_id: ContextId,
    pub cmd_id: ObjectId,
    pub destroy: bool,
    pub is_first: bool,
    pub is_last: bool,
    pub size: u16,
    pub host_addr: DmaAddr,
}

/// One chunk of schedule-time edits of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleCmdListOp {
    pub ctx_id: ContextId,
    pub cmd_id: ObjectId,
    pub is_first: bool,
    pub is_last: bool,
    /// Edit bytes in this chunk, 0 when scheduling without edits
    pub size: u16,
    pub host_addr: DmaAddr,
}

/// Error list query or clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorListOp {
    pub ctx_id: ContextId,
    /// Command list whose list is addressed, `None` for the context list
    pub cmd_id: Option<ObjectId>,
    pub clear: bool,
    pub host_addr: DmaAddr,
}

/// Network resource reservation or release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationOp {
    pub ctx_id: ContextId,
    pub net_id: ObjectId,
    pub reserve: bool,
    pub timeout: u32,
}

/// Network property update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyOp {
    pub ctx_id: ContextId,
    pub net_id: ObjectId,
    /// Raw property id, see [`NetworkProperty`]
    pub property: u8,
    pub value: u32,
    pub timeout: u32,
}

/// Sync point request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOp {
    pub ctx_id: ContextId,
    pub seq: u16,
}

/// Decoded host command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Context(ContextOp),
    Devres(DevresOp),
    Copy(CopyOp),
    ScheduleCopy(ScheduleCopyOp),
    Network(NetworkOp),
    Infreq(InfreqOp),
    ScheduleInfreq(ScheduleInfreqOp),
    CmdList(CmdListOp),
    ScheduleCmdList(ScheduleCmdListOp),
    ErrorList(ErrorListOp),
    Reservation(ReservationOp),
    Property(PropertyOp),
    Sync(SyncOp),
}

impl HostCommand {
    /// Decode a command from its wire words
    pub fn decode(words: &[u64]) -> Result<Self> {
        let w0 = *words.first().ok_or(Error::MalformedCommand)?;
        let raw = field(w0, 0, 6) as u8;
        let op = HostOpcode::from_raw(raw).ok_or(Error::UnknownOpcode(raw))?;
        if words.len() < op.words() {
            return Err(Error::MalformedCommand);
        }
        let ctx_id = field(w0, 6, 8) as ContextId;
        let w1 = words.get(1).copied().unwrap_or(0);

        Ok(match op {
            HostOpcode::ContextOp => Self::Context(ContextOp {
                ctx_id,
                destroy: bit(w0, 14),
                recover: bit(w0, 15),
                flags: field(w0, 16, 8) as u8,
            }),
            HostOpcode::DevresOp => Self::Devres(DevresOp {
                ctx_id,
                devres_id: obj(w0, 14),
                destroy: bit(w0, 30),
                usage: UsageFlags::from_bits_truncate(field(w0, 31, 8) as u8),
                size: w1,
            }),
            HostOpcode::CopyOp => Self::Copy(CopyOp {
                ctx_id,
                copy_id: obj(w0, 14),
                devres_id: obj(w0, 30),
                destroy: bit(w0, 46),
                c2h: bit(w0, 47),
                d2d: bit(w0, 48),
                host_addr: DmaAddr::from_pfn(w1),
            }),
            HostOpcode::ScheduleCopy => Self::ScheduleCopy(ScheduleCopyOp {
                ctx_id,
                copy_id: obj(w0, 14),
                priority: field(w0, 30, 2) as u8,
                size: w1,
            }),
            HostOpcode::NetworkOp => {
                let config_size = chunk_size(field(w1, 13, 13))?;
                Self::Network(NetworkOp {
                    ctx_id,
                    net_id: obj(w0, 14),
                    destroy: bit(w0, 30),
                    create: bit(w0, 31),
                    chained: bit(w0, 32),
                    num_res: field(w0, 33, 24) as u32,
                    size: chunk_size(field(w1, 0, 13))?,
                    config_size,
                    start_res_idx: field(w1, 26, 24) as u32,
                    host_addr: DmaAddr::from_pfn(words[2]),
                })
            }
            HostOpcode::InfreqOp => Self::Infreq(InfreqOp {
                ctx_id,
                net_id: obj(w0, 14),
                infreq_id: obj(w0, 30),
                destroy: bit(w0, 46),
                size: chunk_size(field(w0, 47, 13))?,
                host_addr: DmaAddr::from_pfn(w1),
            }),
            HostOpcode::ScheduleInfreq => Self::ScheduleInfreq(ScheduleInfreqOp {
                ctx_id,
                net_id: obj(w0, 14),
                infreq_id: obj(w0, 30),
                params: (!bit(w0, 46)).then(|| SchedParams {
                    batch_size: field(w1, 0, 16) as u16,
                    priority: field(w0, 47, 2) as u8,
                    debug_on: bit(w0, 49),
                    collect_info: bit(w0, 50),
                }),
            }),
            HostOpcode::CmdListOp => Self::CmdList(CmdListOp {
                ctx_id,
                cmd_id: obj(w0, 14),
                destroy: bit(w0, 30),
                is_first: bit(w0, 31),
                is_last: bit(w0, 32),
                size: chunk_size(field(w0, 33, 13))?,
                host_addr: DmaAddr::from_pfn(w1),
            }),
            HostOpcode::ScheduleCmdList => Self::ScheduleCmdList(ScheduleCmdListOp {
                ctx_id,
                cmd_id: obj(w0, 14),
                is_first: bit(w0, 31),
                is_last: bit(w0, 32),
                size: chunk_size(field(w0, 33, 13))?,
                host_addr: DmaAddr::from_pfn(w1),
            }),
            HostOpcode::ErrorListOp => Self::ErrorList(ErrorListOp {
                ctx_id,
                cmd_id: bit(w0, 30).then(|| obj(w0, 14)),
                clear: bit(w0, 31),
                host_addr: DmaAddr::from_pfn(w1),
            }),
            HostOpcode::NetworkReservation => Self::Reservation(ReservationOp {
                ctx_id,
                net_id: obj(w0, 14),
                reserve: bit(w0, 30),
                timeout: field(w1, 0, 32) as u32,
            }),
            HostOpcode::NetworkProperty => Self::Property(PropertyOp {
                ctx_id,
                net_id: obj(w0, 14),
                property: field(w0, 30, 8) as u8,
                value: field(w1, 0, 32) as u32,
                timeout: field(w1, 32, 32) as u32,
            }),
            HostOpcode::Sync => Self::Sync(SyncOp {
                ctx_id,
                seq: obj(w0, 14),
            }),
        })
    }

    /// Encode into wire words
    pub fn encode(&self) -> Vec<u64> {
        let mut w0 = header(self.opcode(), self.context_id());
        match *self {
            Self::Context(c) => {
                put_bit(&mut w0, 14, c.destroy);
                put_bit(&mut w0, 15, c.recover);
                put(&mut w0, 16, 8, c.flags as u64);
                vec![w0]
            }
            Self::Devres(d) => {
                put(&mut w0, 14, 16, d.devres_id as u64);
                put_bit(&mut w0, 30, d.destroy);
                put(&mut w0, 31, 8, d.usage.bits() as u64);
                vec![w0, d.size]
            }
            Self::Copy(c) => {
                put(&mut w0, 14, 16, c.copy_id as u64);
                put(&mut w0, 30, 16, c.devres_id as u64);
                put_bit(&mut w0, 46, c.destroy);
                put_bit(&mut w0, 47, c.c2h);
                put_bit(&mut w0, 48, c.d2d);
                vec![w0, c.host_addr.pfn()]
            }
            Self::ScheduleCopy(s) => {
                put(&mut w0, 14, 16, s.copy_id as u64);
                put(&mut w0, 30, 2, s.priority as u64);
                vec![w0, s.size]
            }
            Self::Network(n) => {
                put(&mut w0, 14, 16, n.net_id as u64);
                put_bit(&mut w0, 30, n.destroy);
                put_bit(&mut w0, 31, n.create);
                put_bit(&mut w0, 32, n.chained);
                put(&mut w0, 33, 24, n.num_res as u64);
                let mut w1 = 0;
                put(&mut w1, 0, 13, n.size as u64);
                put(&mut w1, 13, 13, n.config_size as u64);
                put(&mut w1, 26, 24, n.start_res_idx as u64);
                vec![w0, w1, n.host_addr.pfn()]
            }
            Self::Infreq(i) => {
                put(&mut w0, 14, 16, i.net_id as u64);
                put(&mut w0, 30, 16, i.infreq_id as u64);
                put_bit(&mut w0, 46, i.destroy);
                put(&mut w0, 47, 13, i.size as u64);
                vec![w0, i.host_addr.pfn()]
            }
            Self::ScheduleInfreq(s) => {
                put(&mut w0, 14, 16, s.net_id as u64);
                put(&mut w0, 30, 16, s.infreq_id as u64);
                let mut w1 = 0;
                match s.params {
                    Some(p) => {
                        put(&mut w0, 47, 2, p.priority as u64);
                        put_bit(&mut w0, 49, p.debug_on);
                        put_bit(&mut w0, 50, p.collect_info);
                        put(&mut w1, 0, 16, p.batch_size as u64);
                    }
                    None => put_bit(&mut w0, 46, true),
                }
                vec![w0, w1]
            }
            Self::CmdList(c) => {
                put(&mut w0, 14, 16, c.cmd_id as u64);
                put_bit(&mut w0, 30, c.destroy);
                put_bit(&mut w0, 31, c.is_first);
                put_bit(&mut w0, 32, c.is_last);
                put(&mut w0, 33, 13, c.size as u64);
                vec![w0, c.host_addr.pfn()]
            }
            Self::ScheduleCmdList(s) => {
                put(&mut w0, 14, 16, s.cmd_id as u64);
                put_bit(&mut w0, 31, s.is_first);
                put_bit(&mut w0, 32, s.is_last);
                put(&mut w0, 33, 13, s.size as u64);
                vec![w0, s.host_addr.pfn()]
            }
            Self::ErrorList(e) => {
                if let Some(cmd) = e.cmd_id {
                    put(&mut w0, 14, 16, cmd as u64);
                    put_bit(&mut w0, 30, true);
                }
                put_bit(&mut w0, 31, e.clear);
                vec![w0, e.host_addr.pfn()]
            }
            Self::Reservation(r) => {
                put(&mut w0, 14, 16, r.net_id as u64);
                put_bit(&mut w0, 30, r.reserve);
                vec![w0, r.timeout as u64]
            }
            Self::Property(p) => {
                put(&mut w0, 14, 16, p.net_id as u64);
                put(&mut w0, 30, 8, p.property as u64);
                vec![w0, p.value as u64 | ((p.timeout as u64) << 32)]
            }
            Self::Sync(s) => {
                put(&mut w0, 14, 16, s.seq as u64);
                vec![w0]
            }
        }
    }

    /// Opcode of this command
    pub fn opcode(&self) -> HostOpcode {
        match self {
            Self::Context(_) => HostOpcode::ContextOp,
            Self::Devres(_) => HostOpcode::DevresOp,
            Self::Copy(_) => HostOpcode::CopyOp,
            Self::ScheduleCopy(_) => HostOpcode::ScheduleCopy,
            Self::Network(_) => HostOpcode::NetworkOp,
            Self::Infreq(_) => HostOpcode::InfreqOp,
            Self::ScheduleInfreq(_) => HostOpcode::ScheduleInfreq,
            Self::CmdList(_) => HostOpcode::CmdListOp,
            Self::ScheduleCmdList(_) => HostOpcode::ScheduleCmdList,
            Self::ErrorList(_) => HostOpcode::ErrorListOp,
            Self::Reservation(_) => HostOpcode::NetworkReservation,
            Self::Property(_) => HostOpcode::NetworkProperty,
            Self::Sync(_) => HostOpcode::Sync,
        }
    }

    /// Context the command addresses
    pub fn context_id(&self) -> ContextId {
        match *self {
            Self::Context(c) => c.ctx_id,
            Self::Devres(c) => c.ctx_id,
            Self::Copy(c) => c.ctx_id,
            Self::ScheduleCopy(c) => c.ctx_id,
            Self::Network(c) => c.ctx_id,
            Self::Infreq(c) => c.ctx_id,
            Self::ScheduleInfreq(c) => c.ctx_id,
            Self::CmdList(c) => c.ctx_id,
            Self::ScheduleCmdList(c) => c.ctx_id,
            Self::ErrorList(c) => c.ctx_id,
            Self::Reservation(c) => c.ctx_id,
            Self::Property(c) => c.ctx_id,
            Self::Sync(c) => c.ctx_id,
        }
    }

    /// The terminal failure report for this command when it is rejected
    /// before reaching its object
    pub fn rejection(&self, value: EventValue) -> EventReport {
        use EventCode as C;
        let (code, obj, obj2) = match *self {
            Self::Context(c) => {
                let code = if c.destroy {
                    C::DestroyContextFailed
                } else if c.recover {
                    C::RecoverContextFailed
                } else {
                    C::CreateContextFailed
                };
                (code, None, None)
            }
            Self::Devres(d) => {
                let code = if d.destroy {
                    C::DestroyDevresFailed
                } else {
                    C::CreateDevresFailed
                };
                (code, Some(d.devres_id), None)
            }
            Self::Copy(c) => {
                let code = if c.destroy {
                    C::DestroyCopyFailed
                } else {
                    C::CreateCopyFailed
                };
                (code, Some(c.copy_id), None)
            }
            Self::ScheduleCopy(s) => (C::ExecuteCopyFailed, Some(s.copy_id), None),
            Self::Network(n) => {
                let code = if n.destroy {
                    C::DestroyDevnetFailed
                } else if n.create {
                    C::CreateDevnetFailed
                } else {
                    C::DevnetAddResFailed
                };
                (code, Some(n.net_id), None)
            }
            Self::Infreq(i) => {
                let code = if i.destroy {
                    C::DestroyInfreqFailed
                } else {
                    C::CreateInfreqFailed
                };
                (code, Some(i.infreq_id), Some(i.net_id))
            }
            Self::ScheduleInfreq(s) => (C::ExecuteInfreqFailed, Some(s.infreq_id), Some(s.net_id)),
            Self::CmdList(c) => {
                let code = if c.destroy {
                    C::DestroyCmdFailed
                } else {
                    C::CreateCmdFailed
                };
                (code, Some(c.cmd_id), None)
            }
            Self::ScheduleCmdList(s) => (C::ExecuteCmdComplete, Some(s.cmd_id), None),
            Self::ErrorList(e) => (C::ErrorListFailed, e.cmd_id, None),
            Self::Reservation(r) => {
                let code = if r.reserve {
                    C::DevnetReserveFailed
                } else {
                    C::DevnetReleaseFailed
                };
                (code, Some(r.net_id), None)
            }
            Self::Property(p) => (C::DevnetSetPropertyFailed, Some(p.net_id), None),
            Self::Sync(s) => (C::CreateSyncFailed, Some(s.seq), None),
        };
        let mut report = EventReport::new(code, value).context(self.context_id());
        report.object = obj;
        report.object2 = obj2;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_op_fields() {
        let op = NetworkOp {
            ctx_id: 3,
            net_id: 9,
            destroy: false,
            create: true,
            chained: true,
            num_res: 3,
            size: 10,
            config_size: 4,
            start_res_idx: 0,
            host_addr: DmaAddr::from_pfn(0x1234),
        };
        let words = HostCommand::Network(op).encode();
        assert_eq!(words.len(), 3);
        assert_eq!(words[0] & 0x3f, HostOpcode::NetworkOp as u64);
        assert_eq!((words[0] >> 6) & 0xff, 3);
        assert_eq!((words[0] >> 14) & 0xffff, 9);
        assert_eq!(HostCommand::decode(&words), Ok(HostCommand::Network(op)));
    }

    #[test]
    fn test_schedule_infreq_null_params() {
        let cmd = HostCommand::ScheduleInfreq(ScheduleInfreqOp {
            ctx_id: 1,
            net_id: 2,
            infreq_id: 3,
            params: None,
        });
        let words = cmd.encode();
        assert!(bit(words[0], 46));
        assert_eq!(HostCommand::decode(&words), Ok(cmd));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(HostCommand::decode(&[]), Err(Error::MalformedCommand));
        assert_eq!(HostCommand::decode(&[63]), Err(Error::UnknownOpcode(63)));
        // Devres needs two words
        assert_eq!(HostCommand::decode(&[2]), Err(Error::MalformedCommand));

        let mut w0 = header(HostOpcode::CmdListOp, 1);
        put(&mut w0, 33, 13, (PAGE_SIZE + 1) as u64);
        assert_eq!(HostCommand::decode(&[w0, 0]), Err(Error::PayloadTooLarge));
    }

    #[test]
    fn test_error_list_target() {
        let ctx_list = HostCommand::ErrorList(ErrorListOp {
            ctx_id: 4,
            cmd_id: None,
            clear: true,
            host_addr: DmaAddr::null(),
        });
        let words = ctx_list.encode();
        assert!(!bit(words[0], 30));
        assert_eq!(HostCommand::decode(&words), Ok(ctx_list));
    }

    #[test]
    fn test_rejection_ids() {
        let cmd = HostCommand::Infreq(InfreqOp {
            ctx_id: 2,
            net_id: 7,
            infreq_id: 11,
            destroy: true,
            size: 0,
            host_addr: DmaAddr::null(),
        });
        let report = cmd.rejection(EventValue::NoSuchContext);
        assert_eq!(report.code, EventCode::DestroyInfreqFailed);
        assert_eq!(report.context, Some(2));
        assert_eq!(report.object, Some(11));
        assert_eq!(report.object2, Some(7));
    }
}
