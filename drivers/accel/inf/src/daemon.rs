//! # Daemon and Runtime Attachment
//!
//! Contexts are created in two steps. The daemon gets a `CreateContext`
//! request and launches a runtime process; the context reports
//! `CreateContextSuccess` only once that runtime attaches and starts
//! reading the context command queue.
//!
//! ```text
//!  ContextOp ──▶ daemon queue ──▶ runtime launched ──attach──▶ CreateContextSuccess
//!       │              │                  │
//!   no daemon      daemon gone       launch failed / died
//!       └──────────────┴──────────────────┴──▶ CreateContextFailed, rolled back
//! ```
//!
//! Both the daemon and the runtime hold a context reference while they
//! track it, so a destroyed context is released only after both let go.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_cmdq::CommandQueue;
use cinder_core::{DriverHandle, Error, EventCode, EventReport, EventValue, Result};

use crate::context::{AttachState, Context};
use crate::object::DestroyReason;
use crate::protocol::{ContextOp, HostCommand};
use crate::remote::{encode_handle, CreateContextRequest, RemoteOpcode, RuntimeNotice};
use crate::service::InferenceService;

impl InferenceService {
    // =========================================================================
    // Daemon
    // =========================================================================

    /// Register the daemon and hand it its command queue
    pub fn attach_daemon(&self) -> Result<Arc<CommandQueue>> {
        let mut daemon = self.daemon.lock();
        if daemon.is_some() {
            return Err(Error::DaemonExists);
        }
        let queue = Arc::new(CommandQueue::new("daemon"));
        *daemon = Some(queue.clone());
        log::info!("cinder: daemon attached");
        Ok(queue)
    }

    /// The daemon went away
    ///
    /// Pending allocations fail with `NoDevice`, contexts whose create
    /// request was never read fail with `NoDaemon`, and every daemon
    /// reference is released.
    pub fn detach_daemon(&self) {
        let Some(queue) = self.daemon.lock().take() else {
            return;
        };
        log::info!("cinder: daemon detached");

        for pending in self.take_replies(|p| p.from_daemon()) {
            pending.fail(self, EventValue::NoDevice);
        }

        let mut unread: Vec<DriverHandle> = Vec::new();
        queue.execute_matching(RemoteOpcode::CreateContext.raw(), |payload| {
            if let Ok(req) = CreateContextRequest::decode(payload) {
                unread.push(req.drv_handle);
            }
        });
        queue.hangup();
        for handle in unread {
            let ctx = self.daemon_refs.lock().remove(&handle);
            if let Some(ctx) = ctx {
                self.rollback_context(&ctx, EventValue::NoDaemon);
            }
        }

        let released: Vec<Arc<Context>> = self.daemon_refs.lock().drain().map(|(_, c)| c).collect();
        drop(released);
    }

    pub(crate) fn send_to_daemon(&self, op: RemoteOpcode, payload: Vec<u8>) -> Result<()> {
        let queue = self.daemon.lock().clone().ok_or(Error::NoDaemon)?;
        queue.push(op.raw(), payload)
    }

    /// Ask the daemon to free device memory it allocated
    pub(crate) fn free_device_buffer(&self, buf_handle: u64) {
        if let Err(e) = self.send_to_daemon(RemoteOpcode::FreeResource, encode_handle(buf_handle)) {
            log::warn!("cinder: device buffer 0x{:x} leaked: {}", buf_handle, e);
        }
    }

    /// Daemon news about the runtime of a context
    pub fn handle_runtime_notice(&self, drv_handle: DriverHandle, notice: RuntimeNotice) -> Result<()> {
        let ctx = self
            .daemon_refs
            .lock()
            .remove(&drv_handle)
            .ok_or(Error::NoSuchContext)?;
        log::debug!("cinder: ctx {} runtime {:?}", ctx.id(), notice);
        if ctx.attach_state() == AttachState::Unattached {
            match notice {
                RuntimeNotice::LaunchFailed => {
                    self.rollback_context(&ctx, EventValue::RuntimeLaunchFailed)
                }
                RuntimeNotice::Died => self.rollback_context(&ctx, EventValue::RuntimeFailed),
                RuntimeNotice::Done => {}
            }
        }
        Ok(())
    }

    // =========================================================================
    // Runtime
    // =========================================================================

    /// The runtime of a context started; returns the queue it reads
    pub fn attach_runtime(&self, drv_handle: DriverHandle) -> Result<Arc<CommandQueue>> {
        let ctx = self
            .by_handle
            .lock()
            .get(&drv_handle)
            .and_then(|w| w.upgrade())
            .ok_or(Error::NoSuchContext)?;
        if let Err(e) = ctx.attach() {
            log::debug!("cinder: ctx {} runtime attach refused: {}", ctx.id(), e);
            if e == Error::Destroyed {
                ctx.teardown();
            }
            return Err(e);
        }
        self.runtimes.lock().insert(drv_handle, ctx.clone());
        ctx.report(EventReport::new(EventCode::CreateContextSuccess, EventValue::NoError));
        Ok(ctx.cmdq().clone())
    }

    /// The runtime of a context exited
    ///
    /// A live context is broken for good. Replies only the runtime could
    /// send are failed and in-flight inferences complete with
    /// `RuntimeDied`.
    pub fn detach_runtime(&self, drv_handle: DriverHandle) -> Result<()> {
        let ctx = self
            .runtimes
            .lock()
            .remove(&drv_handle)
            .ok_or(Error::NoSuchContext)?;
        if ctx.detach() {
            log::warn!("cinder: ctx {} runtime died", ctx.id());
            ctx.report(EventReport::new(EventCode::ErrorRuntimeDied, EventValue::RuntimeDied));
        }
        for pending in self.take_replies_of(&ctx, |p| !p.from_daemon()) {
            pending.fail(self, EventValue::RuntimeFailed);
        }
        self.fail_inflight(&ctx, EventValue::RuntimeDied);
        ctx.cmdq().hangup();
        Ok(())
    }

    // =========================================================================
    // Context operations
    // =========================================================================

    pub(crate) fn create_context(&self, op: ContextOp) {
        if let Err(e) = self.start_context(op) {
            log::debug!("cinder: ctx {} create: {}", op.ctx_id, e);
            self.events
                .report(HostCommand::Context(op).rejection(e.into()));
        }
    }

    fn start_context(&self, op: ContextOp) -> Result<()> {
        let daemon = self.daemon.lock().clone().ok_or(Error::NoDaemon)?;
        let ctx = {
            let mut contexts = self.contexts.lock();
            if contexts.contains_key(&op.ctx_id) {
                return Err(Error::AlreadyExists);
            }
            contexts.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
            let ctx = Arc::new(Context::new(
                op.ctx_id,
                self.next_handle(),
                op.flags,
                self.events.clone(),
            ));
            contexts.insert(op.ctx_id, ctx.clone());
            ctx
        };
        let handle = ctx.drv_handle();
        self.by_handle.lock().insert(handle, Arc::downgrade(&ctx));
        self.daemon_refs.lock().insert(handle, ctx.clone());

        let req = CreateContextRequest {
            drv_handle: handle,
            ctx_id: op.ctx_id,
            flags: op.flags,
        };
        if let Err(e) = daemon.push(RemoteOpcode::CreateContext.raw(), req.encode()) {
            self.daemon_refs.lock().remove(&handle);
            self.rollback_context(&ctx, e.into());
        }
        Ok(())
    }

    /// Fail a context create and drop every reference the service holds
    pub(crate) fn rollback_context(&self, ctx: &Arc<Context>, value: EventValue) {
        let was_live = ctx.mark_destroyed(DestroyReason::CreateFailed);
        self.unlink_context(ctx);
        ctx.teardown();
        if was_live {
            log::debug!("cinder: ctx {} rolled back: {:?}", ctx.id(), value);
            self.events.report(
                EventReport::new(EventCode::CreateContextFailed, value).context(ctx.id()),
            );
        }
    }

    /// Remove `ctx` from the host-visible table
    fn unlink_context(&self, ctx: &Arc<Context>) {
        let removed = {
            let mut contexts = self.contexts.lock();
            match contexts.get(&ctx.id()) {
                Some(c) if Arc::ptr_eq(c, ctx) => contexts.remove(&ctx.id()),
                _ => None,
            }
        };
        self.by_handle.lock().remove(&ctx.drv_handle());
        drop(removed);
    }

    pub(crate) fn destroy_context(&self, ctx: &Arc<Context>) {
        if !ctx.mark_destroyed(DestroyReason::Host) {
            self.events.report(
                EventReport::new(EventCode::DestroyContextFailed, EventValue::NoSuchContext)
                    .context(ctx.id()),
            );
            return;
        }
        log::debug!("cinder: ctx {} destroy", ctx.id());
        self.unlink_context(ctx);
        ctx.teardown();
    }

    pub(crate) fn recover_context(&self, ctx: &Arc<Context>) {
        let (code, value) = match ctx.recover() {
            Ok(()) => (EventCode::RecoverContextSuccess, EventValue::NoError),
            Err(e) => (EventCode::RecoverContextFailed, e.into()),
        };
        ctx.report(EventReport::new(code, value));
    }
}
