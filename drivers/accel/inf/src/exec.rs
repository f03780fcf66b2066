//! # Execution Requests
//!
//! Every scheduled copy, copy list or inference becomes an [`ExecRequest`].
//! Copies go to the pluggable [`ExecBackend`]; inferences are sent to the
//! context's runtime and finish with an exec-done reply.
//!
//! A request is completed exactly once, through
//! [`InferenceService::complete_exec`]. Failures are recorded in the error
//! list of the command list or the context, device errors break the
//! context, and the completion is accounted against the command list round
//! or reported as a standalone execution event.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{Error, EventCode, EventReport, EventValue, ObjectId};
use cinder_dma::{DmaDescriptor, DmaTransport, SgChain, XferDirection, XferRequest, XferStatus};
use spin::Mutex;

use crate::cmdlist::{CmdList, CopyListTemplate};
use crate::context::Context;
use crate::copy::CopyHandle;
use crate::errlist::ErrorEntry;
use crate::infreq::InfReq;
use crate::object::Indexed;
use crate::protocol::SchedParams;
use crate::remote::{ExecDoneReply, RemoteOpcode, ScheduleInfreqRequest};
use crate::service::InferenceService;

/// What an execution does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecKind {
    /// Single copy
    Copy = 0,
    /// Batched copies
    CopyList = 1,
    /// Inference
    Infer = 2,
}

/// Payload of an execution
pub enum ExecWork {
    /// Single copy over its segment
    Copy {
        copy: Arc<CopyHandle>,
        chain: SgChain,
    },
    /// Copy list over its chain, shared with the template when unedited
    CopyList {
        list: Arc<CopyListTemplate>,
        chain: Arc<SgChain>,
    },
    /// Inference invocation
    Infer {
        infreq: Arc<InfReq>,
        params: Option<SchedParams>,
    },
}

/// One scheduled execution
pub struct ExecRequest {
    seq: u64,
    ctx: Arc<Context>,
    work: ExecWork,
    priority: u8,
    /// Command list and item index, for list items
    owner: Option<(Arc<CmdList>, u32)>,
}

impl ExecRequest {
    /// Service-wide sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Payload
    pub fn work(&self) -> &ExecWork {
        &self.work
    }

    /// Effective priority
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Kind of execution
    pub fn kind(&self) -> ExecKind {
        match self.work {
            ExecWork::Copy { .. } => ExecKind::Copy,
            ExecWork::CopyList { .. } => ExecKind::CopyList,
            ExecWork::Infer { .. } => ExecKind::Infer,
        }
    }

    /// Scatter-gather chain of a copy or copy list
    pub fn chain(&self) -> Option<&SgChain> {
        match &self.work {
            ExecWork::Copy { chain, .. } => Some(chain),
            ExecWork::CopyList { chain, .. } => Some(chain),
            ExecWork::Infer { .. } => None,
        }
    }

    /// Index of the item in its command list
    pub fn item_index(&self) -> Option<u32> {
        self.owner.as_ref().map(|(_, index)| *index)
    }

    /// Ids recorded in the error list
    fn error_ids(&self) -> (ObjectId, Option<ObjectId>) {
        match &self.work {
            ExecWork::Copy { copy, .. } => (copy.id(), None),
            ExecWork::CopyList { .. } => (self.item_index().unwrap_or(0) as ObjectId, None),
            ExecWork::Infer { infreq, .. } => (infreq.id(), Some(infreq.net_id())),
        }
    }
}

/// A request the backend refused to start
pub struct Rejected {
    /// The request, handed back for a synthetic completion
    pub req: ExecRequest,
    /// Why
    pub error: Error,
}

/// Executes copies and copy lists
///
/// On `Ok` the backend owns the request and must eventually pass it to
/// [`InferenceService::complete_exec`].
pub trait ExecBackend: Send + Sync {
    /// Start `req`
    fn schedule(&self, svc: &Arc<InferenceService>, req: ExecRequest) -> Result<(), Rejected>;
}

// =============================================================================
// DMA COPY BACKEND
// =============================================================================

/// Copy backend that moves each chain segment with one DMA transfer
pub struct DmaCopyBackend {
    dma: Arc<dyn DmaTransport>,
}

struct CopyProgress {
    /// Segments not yet finished, plus one while starting
    remaining: AtomicUsize,
    failed: AtomicBool,
    req: Mutex<Option<ExecRequest>>,
}

impl CopyProgress {
    fn segment_done(&self, svc: &Arc<InferenceService>, ok: bool) {
        if !ok {
            self.failed.store(true, Ordering::Release);
        }
        self.finish(svc, 1);
    }

    fn finish(&self, svc: &Arc<InferenceService>, n: usize) {
        if self.remaining.fetch_sub(n, Ordering::AcqRel) != n {
            return;
        }
        let req = self.req.lock().take();
        if let Some(req) = req {
            let value = if self.failed.load(Ordering::Acquire) {
                EventValue::DmaError
            } else {
                EventValue::NoError
            };
            svc.complete_exec(req, value, &[]);
        }
    }
}

impl DmaCopyBackend {
    /// Backend on top of `dma`
    pub fn new(dma: Arc<dyn DmaTransport>) -> Self {
        Self { dma }
    }

    fn direction(req: &ExecRequest) -> XferDirection {
        let c2h = match &req.work {
            ExecWork::Copy { copy, .. } => copy.is_c2h(),
            ExecWork::CopyList { list, .. } => list.members().first().is_some_and(|m| m.copy.is_c2h()),
            ExecWork::Infer { .. } => false,
        };
        if c2h {
            XferDirection::CardToHost
        } else {
            XferDirection::HostToCard
        }
    }
}

impl ExecBackend for DmaCopyBackend {
    fn schedule(&self, svc: &Arc<InferenceService>, req: ExecRequest) -> Result<(), Rejected> {
        let Some(chain) = req.chain() else {
            return Err(Rejected {
                req,
                error: Error::NotSupported,
            });
        };
        if chain.entries().iter().any(|s| s.len > u32::MAX as u64) {
            return Err(Rejected {
                req,
                error: Error::PayloadTooLarge,
            });
        }
        let segments = chain.entries().to_vec();
        let desc = DmaDescriptor {
            direction: Self::direction(&req),
            priority: req.priority,
        };
        if segments.is_empty() {
            svc.complete_exec(req, EventValue::NoError, &[]);
            return Ok(());
        }

        let n = segments.len();
        let progress = Arc::new(CopyProgress {
            remaining: AtomicUsize::new(n + 1),
            failed: AtomicBool::new(false),
            req: Mutex::new(Some(req)),
        });
        for (i, seg) in segments.iter().enumerate() {
            let xfer = XferRequest {
                desc,
                src: seg.src,
                dst: seg.dst,
                size: seg.len as u32,
            };
            let (p, s) = (progress.clone(), svc.clone());
            let done = Box::new(move |status: XferStatus, _elapsed_us: u32| {
                p.segment_done(&s, status.is_ok())
            });
            if let Err(error) = self.dma.start_single_transfer(xfer, done) {
                if i == 0 {
                    let req = progress.req.lock().take();
                    if let Some(req) = req {
                        return Err(Rejected { req, error });
                    }
                }
                log::warn!("cinder: copy segment {} of {} not started: {}", i, n, error);
                progress.failed.store(true, Ordering::Release);
                progress.finish(svc, n - i + 1);
                return Ok(());
            }
        }
        progress.finish(svc, 1);
        Ok(())
    }
}

// =============================================================================
// SUBMISSION AND COMPLETION
// =============================================================================

impl InferenceService {
    /// Wrap `work` into a request and count it for sync points
    pub(crate) fn new_exec(
        &self,
        ctx: &Arc<Context>,
        work: ExecWork,
        priority: u8,
        owner: Option<(Arc<CmdList>, u32)>,
    ) -> ExecRequest {
        ctx.note_submitted();
        ExecRequest {
            seq: self.next_seq(),
            ctx: ctx.clone(),
            work,
            priority,
            owner,
        }
    }

    /// Start `req`; a refused request is completed with the refusal
    pub(crate) fn start_exec(self: &Arc<Self>, req: ExecRequest) {
        let started = if req.kind() == ExecKind::Infer {
            self.dispatch_infer(req)
        } else {
            self.copy_backend.schedule(self, req)
        };
        if let Err(Rejected { req, error }) = started {
            log::debug!("cinder: exec {} not started: {}", req.seq, error);
            self.complete_exec(req, error.into(), &[]);
        }
    }

    fn dispatch_infer(&self, req: ExecRequest) -> Result<(), Rejected> {
        let ExecWork::Infer { infreq, params } = &req.work else {
            return Err(Rejected {
                req,
                error: Error::InvalidParameter,
            });
        };
        if !infreq.is_usable() {
            return Err(Rejected {
                req,
                error: Error::NoSuchInfreq,
            });
        }
        let msg = ScheduleInfreqRequest {
            seq: req.seq,
            infreq_rt_handle: infreq.rt_handle(),
            serial: infreq.devnet().is_serial(),
            params: *params,
        }
        .encode();
        let (seq, infreq, cmdq) = (req.seq, infreq.clone(), req.ctx.cmdq().clone());

        infreq.set_active(seq);
        self.inflight.lock().insert(seq, req);
        if let Err(error) = cmdq.push(RemoteOpcode::ScheduleInfreq.raw(), msg) {
            infreq.clear_active(seq);
            if let Some(req) = self.inflight.lock().remove(&seq) {
                return Err(Rejected { req, error });
            }
        }
        Ok(())
    }

    /// Runtime finished an inference execution
    pub fn handle_exec_done(&self, reply: ExecDoneReply) -> cinder_core::Result<()> {
        let req = self
            .inflight
            .lock()
            .remove(&reply.seq)
            .ok_or(Error::InvalidParameter)?;
        self.complete_exec(req, reply.status.exec_value(), &reply.message);
        Ok(())
    }

    /// Finish an execution
    pub fn complete_exec(&self, mut req: ExecRequest, value: EventValue, message: &[u8]) {
        let ctx = req.ctx.clone();
        if !value.is_ok() {
            let (obj, obj2) = req.error_ids();
            let keep = message.len().min(self.config.max_error_message);
            let entry = ErrorEntry {
                kind: req.kind(),
                value,
                obj,
                obj2,
                message: message[..keep].to_vec(),
            };
            match &req.owner {
                Some((cmd, _)) => cmd.errors().lock().push(entry),
                None => ctx.errors().lock().push(entry),
            }
            if value.breaks_context() {
                ctx.set_broken(value.is_fatal());
            }
        }
        if let ExecWork::Infer { infreq, .. } = &req.work {
            infreq.clear_active(req.seq);
        }

        match req.owner.take() {
            Some((cmd, _)) => {
                if !value.is_ok() {
                    cmd.failed.store(true, Ordering::Release);
                }
                self.cmdlist_round_step(&cmd);
            }
            None => {
                let report = match &req.work {
                    ExecWork::Infer { infreq, .. } => {
                        let code = if value.is_ok() {
                            EventCode::ExecuteInfreqSuccess
                        } else {
                            EventCode::ExecuteInfreqFailed
                        };
                        Some(
                            EventReport::new(code, value)
                                .object(infreq.id())
                                .object2(infreq.net_id()),
                        )
                    }
                    ExecWork::Copy { copy, .. } => {
                        let code = if value.is_ok() {
                            EventCode::ExecuteCopySuccess
                        } else {
                            EventCode::ExecuteCopyFailed
                        };
                        Some(EventReport::new(code, value).object(copy.id()))
                    }
                    ExecWork::CopyList { .. } => None,
                };
                if let Some(report) = report {
                    ctx.report(report);
                }
            }
        }
        // Sync points follow the completion they wait for
        ctx.note_completed();
    }

    /// Account one finished item (or the submission guard) of a command
    /// list round; the last one reports the round
    pub(crate) fn cmdlist_round_step(&self, cmd: &CmdList) {
        if cmd.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let value = if cmd.failed.swap(false, Ordering::AcqRel) {
            EventValue::ExecErrors
        } else {
            EventValue::NoError
        };
        cmd.report(EventCode::ExecuteCmdComplete, value);
    }

    /// Complete every in-flight inference of `ctx` with `value`
    pub(crate) fn fail_inflight(&self, ctx: &Context, value: EventValue) {
        let failed: Vec<ExecRequest> = {
            let mut inflight = self.inflight.lock();
            let seqs: Vec<u64> = inflight
                .iter()
                .filter(|(_, r)| r.ctx.drv_handle() == ctx.drv_handle())
                .map(|(seq, _)| *seq)
                .collect();
            seqs.iter().filter_map(|seq| inflight.remove(seq)).collect()
        };
        for req in failed {
            self.complete_exec(req, value, &[]);
        }
    }
}
