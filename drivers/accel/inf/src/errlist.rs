//! Execution error lists kept per context and per command list.
//!
//! Packed record layout, little-endian:
//!
//! ```text
//! ┌──────┬───────┬────────┬────────┬─────────┬──────────────┐
//! │ kind │ value │ obj id │ obj id2│ msg len │  msg bytes   │
//! │  u8  │  u8   │  u16   │  u16   │   u32   │  msg len     │
//! └──────┴───────┴────────┴────────┴─────────┴──────────────┘
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{
    DmaAddr, Error, EventCode, EventReport, EventValue, ObjectId, Result, PAGE_SIZE,
};
use cinder_dma::{PageLease, XferStatus};

use crate::cmdlist::CmdList;
use crate::codec::ByteWriter;
use crate::context::Context;
use crate::exec::ExecKind;
use crate::protocol::{ErrorListOp, HostCommand, SyncOp};
use crate::service::InferenceService;

/// Packed size of a record without its message
pub const ENTRY_HEADER_SIZE: usize = 10;

/// Secondary id written for records that have none
pub const NO_OBJECT: u16 = 0xffff;

/// One failed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// What failed
    pub kind: ExecKind,
    /// Reason
    pub value: EventValue,
    /// Copy, infreq or command list id
    pub obj: ObjectId,
    /// Network id for inference failures
    pub obj2: Option<ObjectId>,
    /// Device message, already truncated
    pub message: Vec<u8>,
}

impl ErrorEntry {
    /// Packed size of this record
    pub fn packed_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.message.len()
    }
}

/// Ordered list of failed executions
#[derive(Debug, Default)]
pub struct ErrorList {
    entries: Vec<ErrorEntry>,
}

impl ErrorList {
    /// Empty list
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a record
    pub fn push(&mut self, entry: ErrorEntry) {
        self.entries.push(entry);
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Records
    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no records
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize, oldest first, stopping before the first record that would
    /// push the result past `max_bytes`
    pub fn pack(&self, max_bytes: usize) -> Vec<u8> {
        let mut w = ByteWriter::new();
        let mut len = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if len + e.packed_len() > max_bytes {
                log::warn!(
                    "cinder: error list truncated at {} of {} records",
                    i,
                    self.entries.len()
                );
                break;
            }
            len += e.packed_len();
            w.u8(e.kind as u8)
                .u8(e.value.raw())
                .u16(e.obj)
                .u16(e.obj2.unwrap_or(NO_OBJECT))
                .u32(e.message.len() as u32)
                .bytes(&e.message);
        }
        w.finish()
    }
}

// =============================================================================
// HOST QUERIES
// =============================================================================

/// A packed list being written to the host one page at a time
struct ErrorListSend {
    ctx: Arc<Context>,
    op: ErrorListOp,
    /// Keeps the command list alive until the last packet
    _cmd: Option<Arc<CmdList>>,
    packed: Vec<u8>,
    sent: usize,
    current: usize,
}

impl ErrorListSend {
    fn fail(&self, value: EventValue) {
        self.ctx.report(HostCommand::ErrorList(self.op).rejection(value));
    }
}

impl InferenceService {
    pub(crate) fn error_list_op(self: &Arc<Self>, ctx: &Arc<Context>, op: ErrorListOp) {
        let cmd = match op.cmd_id {
            Some(id) => match ctx.find_cmdlist(id) {
                Some(cmd) => Some(cmd),
                None => {
                    ctx.report(HostCommand::ErrorList(op).rejection(EventValue::NoSuchCmd));
                    return;
                }
            },
            None => None,
        };
        if op.clear {
            let result = match &cmd {
                Some(cmd) => {
                    cmd.errors().lock().clear();
                    Ok(())
                }
                None if ctx.is_destroyed() => Err(Error::NoSuchContext),
                None => ctx.clear_errors(),
            };
            let report = match result {
                Ok(()) => {
                    let mut report = EventReport::new(EventCode::ErrorListCleared, EventValue::NoError);
                    report.object = op.cmd_id;
                    report
                }
                Err(e) => HostCommand::ErrorList(op).rejection(e.into()),
            };
            ctx.report(report);
            return;
        }

        let packed = match &cmd {
            Some(cmd) => cmd.errors().lock().pack(self.config.max_error_list_bytes),
            None => ctx.errors().lock().pack(self.config.max_error_list_bytes),
        };
        if packed.is_empty() {
            ctx.report(HostCommand::ErrorList(op).rejection(EventValue::NoExecErrors));
            return;
        }
        let job = ErrorListSend {
            ctx: ctx.clone(),
            op,
            _cmd: cmd,
            packed,
            sent: 0,
            current: 0,
        };
        let lease = self.pool.acquire();
        self.send_error_packet(lease, job);
    }

    fn send_error_packet(self: &Arc<Self>, lease: PageLease, mut job: ErrorListSend) {
        job.current = (job.packed.len() - job.sent).min(PAGE_SIZE);
        let chunk = &job.packed[job.sent..job.sent + job.current];
        let dst = self
            .pool
            .write(lease.handle, 0, chunk)
            .and_then(|_| self.packet_dst(&job));
        let dst = match dst {
            Ok(dst) => dst,
            Err(e) => {
                self.release_page(lease);
                job.fail(e.into());
                return;
            }
        };
        let (ctx, op, size) = (job.ctx.clone(), job.op, job.current);
        let staged = self.stage_out(lease, dst, size, move |svc, lease, status| {
            svc.error_packet_done(job, lease, status)
        });
        if let Err(e) = staged {
            ctx.report(HostCommand::ErrorList(op).rejection(e.into()));
        }
    }

    /// Channel contexts take the next ring page; legacy contexts get the
    /// packets back to back from the command's address
    fn packet_dst(&self, job: &ErrorListSend) -> Result<DmaAddr> {
        match job.ctx.ring() {
            Some(ring) => {
                let (addr, avail) = ring.reserve(PAGE_SIZE)?;
                if avail < job.current {
                    return Err(Error::NotSupported);
                }
                Ok(addr)
            }
            None => Ok(job.op.host_addr + job.sent as u64),
        }
    }

    fn error_packet_done(self: &Arc<Self>, mut job: ErrorListSend, lease: PageLease, status: XferStatus) {
        if !status.is_ok() {
            self.release_page(lease);
            job.fail(EventValue::DmaError);
            return;
        }
        if let Some(ring) = job.ctx.ring() {
            ring.advance_avail(job.current);
        }
        job.sent += job.current;
        job.ctx.report(
            EventReport::new(EventCode::ErrorListReply, EventValue::NoError)
                .object(job.current as ObjectId)
                .object2(job.packed.len() as ObjectId),
        );
        if job.sent < job.packed.len() {
            self.send_error_packet(lease, job);
        } else {
            self.release_page(lease);
        }
    }

    pub(crate) fn sync_op(&self, ctx: &Arc<Context>, op: SyncOp) {
        if ctx.is_destroyed() {
            ctx.report(HostCommand::Sync(op).rejection(EventValue::NoSuchContext));
            return;
        }
        ctx.add_sync_point(op.seq);
    }
}
