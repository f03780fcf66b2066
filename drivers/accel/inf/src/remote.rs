//! # Daemon and Runtime Messages
//!
//! Requests pushed onto the daemon queue or a context queue, and the replies
//! the card-side processes send back. Every reply echoes the driver handle
//! it answers so the service can find the pending object.

use alloc::vec::Vec;

use cinder_core::{
    ContextId, DmaAddr, DriverHandle, Error, EventValue, ObjectId, Result, RuntimeHandle,
};

use crate::codec::{ByteReader, ByteWriter};
use crate::protocol::{SchedParams, UsageFlags};

// =============================================================================
// OPCODES
// =============================================================================

/// Opcode of a request pushed to the daemon or a runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RemoteOpcode {
    // Daemon queue
    /// Launch a runtime for a new context
    CreateContext = 0x01,
    /// Allocate device memory for a resource
    AllocResource = 0x02,
    /// Free device memory
    FreeResource = 0x03,

    // Context queue
    /// Register an allocated buffer with the runtime
    CreateDevres = 0x10,
    /// Drop a runtime resource
    DestroyDevres = 0x11,
    /// Create or extend a network
    CreateNetwork = 0x12,
    /// Drop a runtime network
    DestroyNetwork = 0x13,
    /// Create an inference request
    CreateInfreq = 0x14,
    /// Drop a runtime inference request
    DestroyInfreq = 0x15,
    /// Run an inference request
    ScheduleInfreq = 0x16,
    /// Reserve or release network resources
    NetworkReservation = 0x17,
}

impl RemoteOpcode {
    /// Raw queue opcode
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Decode a raw queue opcode
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0x01 => Self::CreateContext,
            0x02 => Self::AllocResource,
            0x03 => Self::FreeResource,
            0x10 => Self::CreateDevres,
            0x11 => Self::DestroyDevres,
            0x12 => Self::CreateNetwork,
            0x13 => Self::DestroyNetwork,
            0x14 => Self::CreateInfreq,
            0x15 => Self::DestroyInfreq,
            0x16 => Self::ScheduleInfreq,
            0x17 => Self::NetworkReservation,
            _ => return None,
        })
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Launch a runtime for a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateContextRequest {
    pub drv_handle: DriverHandle,
    pub ctx_id: ContextId,
    pub flags: u8,
}

impl CreateContextRequest {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u8(self.ctx_id)
            .u8(self.flags)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            drv_handle: DriverHandle::new(r.u64()?),
            ctx_id: r.u8()?,
            flags: r.u8()?,
        })
    }
}

/// Allocate backing memory for a device resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub drv_handle: DriverHandle,
    pub ctx_id: ContextId,
    pub size: u64,
    pub usage: UsageFlags,
}

impl AllocRequest {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u8(self.ctx_id)
            .u64(self.size)
            .u8(self.usage.bits())
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            drv_handle: DriverHandle::new(r.u64()?),
            ctx_id: r.u8()?,
            size: r.u64()?,
            usage: UsageFlags::from_bits_truncate(r.u8()?),
        })
    }
}

/// Register an allocated buffer with the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateDevresRequest {
    pub drv_handle: DriverHandle,
    pub buf_handle: u64,
    pub size: u64,
    pub usage: UsageFlags,
}

impl CreateDevresRequest {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u64(self.buf_handle)
            .u64(self.size)
            .u8(self.usage.bits())
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            drv_handle: DriverHandle::new(r.u64()?),
            buf_handle: r.u64()?,
            size: r.u64()?,
            usage: UsageFlags::from_bits_truncate(r.u8()?),
        })
    }
}

/// Body of the release requests (free buffer, destroy devres/network/infreq)
pub fn encode_handle(handle: u64) -> Vec<u8> {
    ByteWriter::new().u64(handle).finish()
}

/// Decode a release request body
pub fn decode_handle(bytes: &[u8]) -> Result<u64> {
    ByteReader::new(bytes).u64()
}

/// Create a network or add resources to one
///
/// `rt_handle` is zero on create and names the network on an add-resources
/// edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateNetworkRequest {
    pub drv_handle: DriverHandle,
    pub rt_handle: RuntimeHandle,
    pub net_id: ObjectId,
    pub resources: Vec<RuntimeHandle>,
    pub config: Vec<u8>,
}

impl CreateNetworkRequest {
    /// Bytes before the handle table
    const HEAD: usize = 8 + 8 + 2 + 4;

    pub fn encoded_len(&self) -> usize {
        Self::HEAD + self.resources.len() * 8 + 4 + self.config.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = ByteWriter::try_with_capacity(self.encoded_len())?;
        w.u64(self.drv_handle.raw())
            .u64(self.rt_handle)
            .u16(self.net_id)
            .u32(self.resources.len() as u32);
        for h in &self.resources {
            w.u64(*h);
        }
        w.u32(self.config.len() as u32).bytes(&self.config);
        Ok(w.finish())
    }

    /// Fill `dst` with the encoded bytes starting at `offset`
    ///
    /// The handle table is never serialized as a whole; a queue reader
    /// pulls it piece by piece.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        if offset + dst.len() > self.encoded_len() {
            return Err(Error::InvalidParameter);
        }
        let head = ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u64(self.rt_handle)
            .u16(self.net_id)
            .u32(self.resources.len() as u32)
            .finish();
        let table_end = Self::HEAD + self.resources.len() * 8;
        let config_len = (self.config.len() as u32).to_le_bytes();
        for (pos, out) in (offset..).zip(dst.iter_mut()) {
            *out = if pos < Self::HEAD {
                head[pos]
            } else if pos < table_end {
                let k = pos - Self::HEAD;
                self.resources[k / 8].to_le_bytes()[k % 8]
            } else if pos < table_end + 4 {
                config_len[pos - table_end]
            } else {
                self.config[pos - table_end - 4]
            };
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let drv_handle = DriverHandle::new(r.u64()?);
        let rt_handle = r.u64()?;
        let net_id = r.u16()?;
        let n = r.u32()? as usize;
        let mut resources = Vec::new();
        for _ in 0..n {
            resources.push(r.u64()?);
        }
        let cfg = r.u32()? as usize;
        Ok(Self {
            drv_handle,
            rt_handle,
            net_id,
            resources,
            config: r.bytes(cfg)?.to_vec(),
        })
    }
}

/// Create an inference request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInfreqRequest {
    pub drv_handle: DriverHandle,
    pub net_rt_handle: RuntimeHandle,
    pub infreq_id: ObjectId,
    pub config: Vec<u8>,
}

impl CreateInfreqRequest {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u64(self.net_rt_handle)
            .u16(self.infreq_id)
            .u32(self.config.len() as u32)
            .bytes(&self.config)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let drv_handle = DriverHandle::new(r.u64()?);
        let net_rt_handle = r.u64()?;
        let infreq_id = r.u16()?;
        let n = r.u32()? as usize;
        Ok(Self {
            drv_handle,
            net_rt_handle,
            infreq_id,
            config: r.bytes(n)?.to_vec(),
        })
    }
}

/// Run an inference request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleInfreqRequest {
    /// Execution sequence echoed by the exec-done reply
    pub seq: u64,
    pub infreq_rt_handle: RuntimeHandle,
    /// Serialize with other executions of the same network
    pub serial: bool,
    pub params: Option<SchedParams>,
}

impl ScheduleInfreqRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.u64(self.seq)
            .u64(self.infreq_rt_handle)
            .u8(self.serial as u8);
        match self.params {
            Some(p) => {
                w.u8(1)
                    .u16(p.batch_size)
                    .u8(p.priority)
                    .u8(p.debug_on as u8)
                    .u8(p.collect_info as u8);
            }
            None => {
                w.u8(0);
            }
        }
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let seq = r.u64()?;
        let infreq_rt_handle = r.u64()?;
        let serial = r.u8()? != 0;
        let params = if r.u8()? != 0 {
            Some(SchedParams {
                batch_size: r.u16()?,
                priority: r.u8()?,
                debug_on: r.u8()? != 0,
                collect_info: r.u8()? != 0,
            })
        } else {
            None
        };
        Ok(Self {
            seq,
            infreq_rt_handle,
            serial,
            params,
        })
    }
}

/// Reserve or release a network's device resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationRequest {
    pub drv_handle: DriverHandle,
    pub net_rt_handle: RuntimeHandle,
    pub reserve: bool,
    pub timeout: u32,
}

impl ReservationRequest {
    pub fn encode(&self) -> Vec<u8> {
        ByteWriter::new()
            .u64(self.drv_handle.raw())
            .u64(self.net_rt_handle)
            .u8(self.reserve as u8)
            .u32(self.timeout)
            .finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            drv_handle: DriverHandle::new(r.u64()?),
            net_rt_handle: r.u64()?,
            reserve: r.u8()? != 0,
            timeout: r.u32()?,
        })
    }
}

// =============================================================================
// REPLIES
// =============================================================================

/// Status code carried by every remote reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeStatus {
    #[default]
    Ok,
    AllocFailed,
    NoMemory,
    NotSupported,
    InvalidNetworkBinary,
    MissingResource,
    EccAllocFailed,
    InsufficientResources,
    TimeoutExceeded,
    InferExecError,
    IceDrvError,
    IceDrvErrorReset,
    IceDrvErrorCardReset,
    ScheduleError,
    /// Anything the driver has no specific code for
    Failed,
}

impl RuntimeStatus {
    /// Whether the remote side succeeded
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Host value for a failed resource allocation or registration
    pub const fn devres_value(self) -> EventValue {
        match self {
            Self::Ok => EventValue::NoError,
            Self::AllocFailed | Self::NoMemory => EventValue::NoMemory,
            _ => EventValue::RuntimeFailed,
        }
    }

    /// Host value for a failed network create or edit
    pub const fn network_value(self) -> EventValue {
        match self {
            Self::Ok => EventValue::NoError,
            Self::NotSupported => EventValue::RuntimeNotSupported,
            Self::InvalidNetworkBinary => EventValue::InvalidExecutableNetworkBinary,
            Self::NoMemory => EventValue::NoMemory,
            Self::EccAllocFailed => EventValue::EccAllocFailed,
            _ => EventValue::RuntimeFailed,
        }
    }

    /// Host value for a failed inference request create
    pub const fn infreq_value(self) -> EventValue {
        match self {
            Self::Ok => EventValue::NoError,
            Self::NotSupported => EventValue::RuntimeNotSupported,
            Self::MissingResource => EventValue::InferMissingResource,
            Self::NoMemory => EventValue::NoMemory,
            _ => EventValue::RuntimeFailed,
        }
    }

    /// Host value for a failed reservation
    pub const fn reservation_value(self) -> EventValue {
        match self {
            Self::Ok => EventValue::NoError,
            Self::InsufficientResources => EventValue::InsufficientResources,
            Self::TimeoutExceeded => EventValue::TimeoutExceeded,
            Self::NoMemory => EventValue::NoMemory,
            _ => EventValue::RuntimeFailed,
        }
    }

    /// Host value for a finished inference execution
    pub const fn exec_value(self) -> EventValue {
        match self {
            Self::Ok => EventValue::NoError,
            Self::NotSupported => EventValue::NotSupported,
            Self::IceDrvError => EventValue::IceDrvError,
            Self::IceDrvErrorReset => EventValue::IceDrvErrorReset,
            Self::IceDrvErrorCardReset => EventValue::IceDrvErrorCardReset,
            Self::ScheduleError => EventValue::ScheduleError,
            _ => EventValue::InferExecError,
        }
    }
}

/// Daemon answer to [`AllocRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocReply {
    pub drv_handle: DriverHandle,
    pub status: RuntimeStatus,
    pub buf_handle: u64,
    pub dma_addr: DmaAddr,
}

/// Runtime answer to a devres, network or infreq create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateReply {
    pub drv_handle: DriverHandle,
    pub status: RuntimeStatus,
    pub rt_handle: RuntimeHandle,
}

/// Runtime answer to [`ReservationRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationReply {
    pub drv_handle: DriverHandle,
    pub status: RuntimeStatus,
}

/// Runtime report that an inference execution finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecDoneReply {
    pub seq: u64,
    pub status: RuntimeStatus,
    /// Optional error text from the device
    pub message: Vec<u8>,
}

/// Daemon notices about a context's runtime process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeNotice {
    /// The runtime could not be started
    LaunchFailed,
    /// The runtime exited abnormally
    Died,
    /// The runtime exited after its context was destroyed
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_request_layout() {
        let req = CreateNetworkRequest {
            drv_handle: DriverHandle::new(7),
            rt_handle: 0,
            net_id: 9,
            resources: alloc::vec![0x10, 0x20],
            config: alloc::vec![0xaa; 3],
        };
        let bytes = req.encode().unwrap();
        assert_eq!(bytes.len(), 8 + 8 + 2 + 4 + 16 + 4 + 3);
        assert_eq!(CreateNetworkRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_network_request_read_in_pieces() {
        let req = CreateNetworkRequest {
            drv_handle: DriverHandle::new(0x1122),
            rt_handle: 0x907,
            net_id: 4,
            resources: alloc::vec![0x501, 0x502, 0x503],
            config: alloc::vec![1, 2, 3, 4, 5],
        };
        let whole = req.encode().unwrap();
        assert_eq!(req.encoded_len(), whole.len());

        // Odd piece sizes cross every field boundary
        let mut pieced = alloc::vec![0u8; whole.len()];
        for (i, piece) in pieced.chunks_mut(5).enumerate() {
            req.read_at(i * 5, piece).unwrap();
        }
        assert_eq!(pieced, whole);

        let mut over = [0u8; 4];
        assert_eq!(req.read_at(whole.len() - 2, &mut over), Err(Error::InvalidParameter));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(RuntimeStatus::AllocFailed.devres_value(), EventValue::NoMemory);
        assert_eq!(RuntimeStatus::MissingResource.devres_value(), EventValue::RuntimeFailed);
        assert_eq!(
            RuntimeStatus::InvalidNetworkBinary.network_value(),
            EventValue::InvalidExecutableNetworkBinary
        );
        assert_eq!(
            RuntimeStatus::NotSupported.network_value(),
            EventValue::RuntimeNotSupported
        );
        assert_eq!(
            RuntimeStatus::TimeoutExceeded.reservation_value(),
            EventValue::TimeoutExceeded
        );
        assert_eq!(RuntimeStatus::Failed.exec_value(), EventValue::InferExecError);
        assert!(RuntimeStatus::IceDrvErrorCardReset.exec_value().is_fatal());
    }

    #[test]
    fn test_opcode_raw() {
        for op in [RemoteOpcode::CreateContext, RemoteOpcode::ScheduleInfreq] {
            assert_eq!(RemoteOpcode::from_raw(op.raw()), Some(op));
        }
        assert_eq!(RemoteOpcode::from_raw(0x99), None);
    }
}
