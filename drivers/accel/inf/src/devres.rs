//! # Device Resources
//!
//! Creation takes two remote hops: the daemon allocates backing memory,
//! then the runtime registers the buffer. The pending reply table holds a
//! reference across each hop.
//!
//! ```text
//!  host ──DevresOp──▶ AwaitingAlloc ──AllocReply──▶ AwaitingRuntime ──CreateReply──▶ Created
//!                          │                              │
//!                          └─ failure / NoDaemon ─────────┴──▶ CreateDevresFailed, rolled back
//! ```

use alloc::sync::Arc;

use cinder_core::{
    DmaAddr, DriverHandle, Error, EventCode, EventReport, EventValue, ObjectId, Result,
    RuntimeHandle,
};
use spin::Mutex;

use crate::context::Context;
use crate::object::{DestroyReason, Indexed, Lifecycle};
use crate::protocol::{DevresOp, UsageFlags};
use crate::remote::{
    encode_handle, AllocReply, AllocRequest, CreateDevresRequest, CreateReply, RemoteOpcode,
};
use crate::service::{InferenceService, PendingReply};

/// Creation progress of a device resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevResStatus {
    /// Waiting for the daemon to allocate memory
    AwaitingAlloc,
    /// Waiting for the runtime to register the buffer
    AwaitingRuntime,
    /// Usable
    Created,
}

struct DevResState {
    status: DevResStatus,
    buf_handle: u64,
    dma_addr: DmaAddr,
    rt_handle: RuntimeHandle,
}

/// A registered device buffer
pub struct DevRes {
    id: ObjectId,
    ctx: Arc<Context>,
    drv_handle: DriverHandle,
    size: u64,
    usage: UsageFlags,
    life: Lifecycle,
    state: Mutex<DevResState>,
}

impl DevRes {
    fn new(
        id: ObjectId,
        ctx: Arc<Context>,
        drv_handle: DriverHandle,
        size: u64,
        usage: UsageFlags,
    ) -> Self {
        Self {
            id,
            ctx,
            drv_handle,
            size,
            usage,
            life: Lifecycle::new(),
            state: Mutex::new(DevResState {
                status: DevResStatus::AwaitingAlloc,
                buf_handle: 0,
                dma_addr: DmaAddr::null(),
                rt_handle: 0,
            }),
        }
    }

    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Handle echoed by remote replies
    pub fn drv_handle(&self) -> DriverHandle {
        self.drv_handle
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Usage flags
    pub fn usage(&self) -> UsageFlags {
        self.usage
    }

    /// Creation progress
    pub fn status(&self) -> DevResStatus {
        self.state.lock().status
    }

    /// Device address of the buffer, null until allocated
    pub fn dma_addr(&self) -> DmaAddr {
        self.state.lock().dma_addr
    }

    /// Runtime handle, 0 until registered
    pub fn rt_handle(&self) -> RuntimeHandle {
        self.state.lock().rt_handle
    }

    /// Whether the resource was destroyed or rolled back
    pub fn is_destroyed(&self) -> bool {
        self.life.is_destroyed()
    }

    /// Created and still indexed
    pub fn is_usable(&self) -> bool {
        !self.is_destroyed() && self.status() == DevResStatus::Created
    }
}

impl Indexed for DevRes {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn life(&self) -> &Lifecycle {
        &self.life
    }
}

impl Drop for DevRes {
    fn drop(&mut self) {
        let rt = self.state.get_mut().rt_handle;
        if rt != 0 {
            if let Err(e) = self
                .ctx
                .cmdq()
                .push(RemoteOpcode::DestroyDevres.raw(), encode_handle(rt))
            {
                log::debug!("cinder: devres {} runtime release dropped: {}", self.id, e);
            }
        }
        if self.life.host_destroyed() {
            self.ctx.report(
                EventReport::new(EventCode::DestroyDevresSuccess, EventValue::NoError)
                    .object(self.id),
            );
        }
    }
}

// =============================================================================
// SERVICE OPERATIONS
// =============================================================================

impl InferenceService {
    pub(crate) fn devres_op(self: &Arc<Self>, ctx: &Arc<Context>, op: DevresOp) {
        if op.destroy {
            let taken = ctx.remove_children(|c| c.devres.take(op.devres_id, DestroyReason::Host));
            if taken.is_none() {
                ctx.report(
                    EventReport::new(EventCode::DestroyDevresFailed, EventValue::NoSuchDevres)
                        .object(op.devres_id),
                );
            }
            return;
        }
        if let Err(e) = self.create_devres(ctx, op) {
            log::debug!("cinder: ctx {} devres {} create: {}", ctx.id(), op.devres_id, e);
            ctx.report(
                EventReport::new(EventCode::CreateDevresFailed, e.into()).object(op.devres_id),
            );
        }
    }

    /// Errors are returned only while nothing is indexed yet
    fn create_devres(&self, ctx: &Arc<Context>, op: DevresOp) -> Result<()> {
        ctx.check_usable()?;
        if op.size == 0 {
            return Err(Error::InvalidParameter);
        }
        let devres = Arc::new(DevRes::new(
            op.devres_id,
            ctx.clone(),
            self.next_handle(),
            op.size,
            op.usage,
        ));
        ctx.with_children(|c| c.devres.insert(&devres))??;

        let req = AllocRequest {
            drv_handle: devres.drv_handle,
            ctx_id: ctx.id(),
            size: op.size,
            usage: op.usage,
        };
        self.expect_reply(devres.drv_handle, PendingReply::Alloc(devres.clone()));
        if let Err(e) = self.send_to_daemon(RemoteOpcode::AllocResource, req.encode()) {
            self.take_reply(devres.drv_handle);
            self.rollback_devres(&devres, e.into());
        }
        Ok(())
    }

    /// Unindex a resource whose creation failed and report the failure
    /// unless the host destroyed it meanwhile
    pub(crate) fn rollback_devres(&self, devres: &Arc<DevRes>, value: EventValue) {
        let ctx = devres.ctx();
        let (was_live, taken) = ctx.remove_children(|c| {
            let live = !devres.is_destroyed();
            (live, c.devres.take_exact(devres, DestroyReason::CreateFailed))
        });
        drop(taken);
        if was_live {
            log::debug!("cinder: ctx {} devres {} rolled back: {:?}", ctx.id(), devres.id, value);
            ctx.report(EventReport::new(EventCode::CreateDevresFailed, value).object(devres.id));
        }
    }

    /// Daemon finished allocating a resource's memory
    pub fn handle_alloc_reply(&self, reply: AllocReply) -> Result<()> {
        let devres = match self.take_reply(reply.drv_handle) {
            Some(PendingReply::Alloc(devres)) => devres,
            Some(other) => {
                self.expect_reply(reply.drv_handle, other);
                return Err(Error::InvalidParameter);
            }
            None => return Err(Error::NoSuchDevres),
        };
        if devres.is_destroyed() {
            if reply.status.is_ok() {
                self.free_device_buffer(reply.buf_handle);
            }
            return Ok(());
        }
        if !reply.status.is_ok() {
            self.rollback_devres(&devres, reply.status.devres_value());
            return Ok(());
        }

        {
            let mut st = devres.state.lock();
            st.buf_handle = reply.buf_handle;
            st.dma_addr = reply.dma_addr;
            st.status = DevResStatus::AwaitingRuntime;
        }
        let req = CreateDevresRequest {
            drv_handle: devres.drv_handle,
            buf_handle: reply.buf_handle,
            size: devres.size,
            usage: devres.usage,
        };
        self.expect_reply(devres.drv_handle, PendingReply::DevRes(devres.clone()));
        if let Err(e) = devres
            .ctx
            .cmdq()
            .push(RemoteOpcode::CreateDevres.raw(), req.encode())
        {
            self.take_reply(devres.drv_handle);
            self.free_device_buffer(reply.buf_handle);
            self.rollback_devres(&devres, e.into());
        }
        Ok(())
    }

    /// Runtime finished registering a resource
    pub(crate) fn finish_devres(&self, devres: Arc<DevRes>, reply: CreateReply) {
        let ctx = devres.ctx().clone();
        if !reply.status.is_ok() {
            let buf = devres.state.lock().buf_handle;
            self.free_device_buffer(buf);
            self.rollback_devres(&devres, reply.status.devres_value());
            return;
        }
        devres.state.lock().rt_handle = reply.rt_handle;
        let live = ctx.finalize_if_live(&devres.life, || {
            devres.state.lock().status = DevResStatus::Created;
        });
        if live {
            ctx.report(
                EventReport::new(EventCode::CreateDevresSuccess, EventValue::NoError)
                    .object(devres.id),
            );
        }
    }

    /// A pending reply will never come; fail the resource
    pub(crate) fn abort_devres(&self, devres: Arc<DevRes>, value: EventValue) {
        let buf = devres.state.lock().buf_handle;
        if buf != 0 {
            self.free_device_buffer(buf);
        }
        self.rollback_devres(&devres, value);
    }
}
