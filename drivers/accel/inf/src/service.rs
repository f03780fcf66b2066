//! # Inference Service
//!
//! The single long-lived object every component is reached through. It
//! owns the page pool, the context table, the pending remote replies and
//! the in-flight executions, and routes host commands to the serial work
//! queue of their context.
//!
//! ```text
//!   host words ──decode──▶ HostCommand ──▶ context work queue ──▶ object ops
//!                                              │
//!   DMA completions ──▶ continuations ─────────┤
//!   daemon / runtime replies ──▶ reply table ──┘──▶ event reports
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use cinder_cmdq::CommandQueue;
use cinder_core::{
    ContextId, DriverHandle, Error, EventSink, EventValue, Result, ServiceConfig,
};
use cinder_dma::{DmaPagePool, DmaTransport, HostRing};
use hashbrown::HashMap;
use spin::Mutex;

use crate::context::Context;
use crate::devnet::DevNet;
use crate::devres::DevRes;
use crate::exec::{DmaCopyBackend, ExecBackend, ExecRequest};
use crate::infreq::InfReq;
use crate::protocol::HostCommand;
use crate::remote::CreateReply;
use crate::workqueue::SerialQueue;

/// An object waiting for a daemon or runtime reply
///
/// The entry holds the reference that keeps the object alive until the
/// reply arrives or is failed.
pub(crate) enum PendingReply {
    /// Daemon memory allocation of a device resource
    Alloc(Arc<DevRes>),
    /// Runtime registration of a device resource
    DevRes(Arc<DevRes>),
    /// Runtime network create or edit
    DevNet(Arc<DevNet>),
    /// Runtime inference request create
    InfReq(Arc<InfReq>),
    /// Runtime resource reservation or release
    Reservation { devnet: Arc<DevNet>, reserve: bool },
}

impl PendingReply {
    fn ctx(&self) -> &Arc<Context> {
        match self {
            Self::Alloc(d) | Self::DevRes(d) => d.ctx(),
            Self::DevNet(n) | Self::Reservation { devnet: n, .. } => n.ctx(),
            Self::InfReq(i) => i.ctx(),
        }
    }

    /// Whether the daemon, not the runtime, will answer
    pub(crate) fn from_daemon(&self) -> bool {
        matches!(self, Self::Alloc(_))
    }

    /// The reply will never come
    pub(crate) fn fail(self, svc: &InferenceService, value: EventValue) {
        match self {
            Self::Alloc(d) | Self::DevRes(d) => svc.abort_devres(d, value),
            Self::DevNet(n) => svc.fail_network_edit(&n, value),
            Self::InfReq(i) => svc.rollback_infreq(&i, value),
            Self::Reservation { devnet, reserve } => svc.finish_reservation(&devnet, reserve, value),
        }
    }
}

/// Card-side inference control plane
pub struct InferenceService {
    pub(crate) config: ServiceConfig,
    pub(crate) pool: Arc<DmaPagePool>,
    pub(crate) dma: Arc<dyn DmaTransport>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) copy_backend: Arc<dyn ExecBackend>,
    /// Queue the daemon reads, while one is attached
    pub(crate) daemon: Mutex<Option<Arc<CommandQueue>>>,
    /// Contexts whose runtime process the daemon still tracks
    pub(crate) daemon_refs: Mutex<HashMap<DriverHandle, Arc<Context>>>,
    /// Contexts with an attached runtime
    pub(crate) runtimes: Mutex<HashMap<DriverHandle, Arc<Context>>>,
    /// Live contexts by host id
    pub(crate) contexts: Mutex<HashMap<ContextId, Arc<Context>>>,
    pub(crate) by_handle: Mutex<HashMap<DriverHandle, Weak<Context>>>,
    replies: Mutex<HashMap<DriverHandle, PendingReply>>,
    /// Inference executions sent to a runtime, by sequence
    pub(crate) inflight: Mutex<HashMap<u64, ExecRequest>>,
    pub(crate) global_wq: Arc<SerialQueue>,
    /// Work queues with pending items
    pub(crate) ready: Mutex<VecDeque<Arc<SerialQueue>>>,
    next_handle: AtomicU64,
    next_seq: AtomicU64,
}

impl InferenceService {
    /// Service copying through `dma` segment by segment
    pub fn new(
        config: ServiceConfig,
        dma: Arc<dyn DmaTransport>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let backend = Arc::new(DmaCopyBackend::new(dma.clone()));
        Self::with_copy_backend(config, dma, events, backend)
    }

    /// Service with its own copy backend
    pub fn with_copy_backend(
        config: ServiceConfig,
        dma: Arc<dyn DmaTransport>,
        events: Arc<dyn EventSink>,
        copy_backend: Arc<dyn ExecBackend>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(DmaPagePool::new(config.pool.clone())?);
        log::info!(
            "cinder: inference service up, {} staging pages",
            pool.capacity()
        );
        Ok(Arc::new(Self {
            config,
            pool,
            dma,
            events,
            copy_backend,
            daemon: Mutex::new(None),
            daemon_refs: Mutex::new(HashMap::new()),
            runtimes: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            by_handle: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            global_wq: Arc::new(SerialQueue::new("global")),
            ready: Mutex::new(VecDeque::new()),
            next_handle: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }))
    }

    /// Staging page pool
    pub fn pool(&self) -> &Arc<DmaPagePool> {
        &self.pool
    }

    /// Active configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Live context by host id
    pub fn context(&self, id: ContextId) -> Option<Arc<Context>> {
        self.contexts.lock().get(&id).cloned()
    }

    /// Replies still awaited from the daemon or runtimes
    pub fn pending_replies(&self) -> usize {
        self.replies.lock().len()
    }

    /// Inference executions awaiting their exec-done reply
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Switch a context to ring addressing
    pub fn attach_host_ring(&self, ctx_id: ContextId, ring: Arc<dyn HostRing>) -> Result<()> {
        let ctx = self.context(ctx_id).ok_or(Error::NoSuchContext)?;
        ctx.set_ring(ring);
        Ok(())
    }

    pub(crate) fn next_handle(&self) -> DriverHandle {
        DriverHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Pending replies
    // =========================================================================

    pub(crate) fn expect_reply(&self, handle: DriverHandle, pending: PendingReply) {
        let stale = self.replies.lock().insert(handle, pending);
        if stale.is_some() {
            log::error!("cinder: reply for {:?} registered twice", handle);
        }
    }

    pub(crate) fn take_reply(&self, handle: DriverHandle) -> Option<PendingReply> {
        self.replies.lock().remove(&handle)
    }

    /// Remove every pending reply of `ctx` matching `pred`
    pub(crate) fn take_replies_of(
        &self,
        ctx: &Context,
        pred: impl Fn(&PendingReply) -> bool,
    ) -> Vec<PendingReply> {
        let mut replies = self.replies.lock();
        let handles: Vec<DriverHandle> = replies
            .iter()
            .filter(|(_, p)| p.ctx().drv_handle() == ctx.drv_handle() && pred(p))
            .map(|(h, _)| *h)
            .collect();
        handles.iter().filter_map(|h| replies.remove(h)).collect()
    }

    /// Remove every pending reply matching `pred`
    pub(crate) fn take_replies(&self, pred: impl Fn(&PendingReply) -> bool) -> Vec<PendingReply> {
        let mut replies = self.replies.lock();
        let handles: Vec<DriverHandle> = replies
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(h, _)| *h)
            .collect();
        handles.iter().filter_map(|h| replies.remove(h)).collect()
    }

    /// Runtime answered a devres, network or infreq create
    pub fn handle_create_reply(&self, reply: CreateReply) -> Result<()> {
        match self.take_reply(reply.drv_handle) {
            Some(PendingReply::DevRes(devres)) => self.finish_devres(devres, reply),
            Some(PendingReply::DevNet(devnet)) => self.finish_network_edit(devnet, reply),
            Some(PendingReply::InfReq(infreq)) => self.finish_infreq(infreq, reply),
            Some(other) => {
                self.expect_reply(reply.drv_handle, other);
                return Err(Error::InvalidParameter);
            }
            None => return Err(Error::InvalidParameter),
        }
        Ok(())
    }

    // =========================================================================
    // Host commands
    // =========================================================================

    /// Decode one host command and queue it
    pub fn submit(&self, words: &[u64]) -> Result<()> {
        let cmd = HostCommand::decode(words).map_err(|e| {
            log::warn!("cinder: dropping undecodable host command: {}", e);
            e
        })?;
        self.dispatch(cmd);
        Ok(())
    }

    /// Queue a decoded host command on the work queue it belongs to
    ///
    /// Context creation runs on the global queue; everything else runs on
    /// the queue of its context, or is rejected if there is none.
    pub fn dispatch(&self, cmd: HostCommand) {
        log::trace!("cinder: host {:?} for ctx {}", cmd.opcode(), cmd.context_id());
        if let HostCommand::Context(op) = cmd {
            if !op.destroy && !op.recover {
                self.queue_work(&self.global_wq, Box::new(move |svc| svc.create_context(op)));
                return;
            }
        }
        let Some(ctx) = self.context(cmd.context_id()) else {
            self.events.report(cmd.rejection(EventValue::NoSuchContext));
            return;
        };
        let target = ctx.clone();
        self.queue_work(ctx.wq(), Box::new(move |svc| svc.run_command(&target, cmd)));
    }

    fn run_command(self: &Arc<Self>, ctx: &Arc<Context>, cmd: HostCommand) {
        match cmd {
            HostCommand::Context(op) if op.destroy => self.destroy_context(ctx),
            HostCommand::Context(_) => self.recover_context(ctx),
            HostCommand::Devres(op) => self.devres_op(ctx, op),
            HostCommand::Copy(op) => self.copy_op(ctx, op),
            HostCommand::ScheduleCopy(op) => self.schedule_copy_op(ctx, op),
            HostCommand::Network(op) => self.network_op(ctx, op),
            HostCommand::Infreq(op) => self.infreq_op(ctx, op),
            HostCommand::ScheduleInfreq(op) => self.schedule_infreq_op(ctx, op),
            HostCommand::CmdList(op) => self.cmdlist_op(ctx, op),
            HostCommand::ScheduleCmdList(op) => self.schedule_cmdlist_op(ctx, op),
            HostCommand::ErrorList(op) => self.error_list_op(ctx, op),
            HostCommand::Reservation(op) => self.reservation_op(ctx, op),
            HostCommand::Property(op) => self.property_op(ctx, op),
            HostCommand::Sync(op) => self.sync_op(ctx, op),
        }
    }
}
