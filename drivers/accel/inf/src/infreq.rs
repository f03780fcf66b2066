//! # Inference Requests
//!
//! Reusable invocation descriptors bound to a created network. An optional
//! config blob is staged from the host before the runtime is asked to
//! create the request.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{
    DriverHandle, Error, EventCode, EventReport, EventValue, ObjectId, Result, RuntimeHandle,
};
use cinder_dma::{PageLease, XferStatus};
use spin::Mutex;

use crate::context::Context;
use crate::devnet::DevNet;
use crate::object::{DestroyReason, Indexed, Lifecycle};
use crate::protocol::InfreqOp;
use crate::remote::{encode_handle, CreateInfreqRequest, CreateReply, RemoteOpcode};
use crate::service::{InferenceService, PendingReply};

/// Creation progress of an inference request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfreqStatus {
    /// Config staged or being staged, runtime not done yet
    PayloadStaged,
    /// Usable
    Created,
}

struct InfReqState {
    status: InfreqStatus,
    rt_handle: RuntimeHandle,
    /// Sequence of the execution currently running
    active: Option<u64>,
}

/// Invocation template of a network
pub struct InfReq {
    id: ObjectId,
    devnet: Arc<DevNet>,
    drv_handle: DriverHandle,
    life: Lifecycle,
    state: Mutex<InfReqState>,
}

impl InfReq {
    /// Network the request runs
    pub fn devnet(&self) -> &Arc<DevNet> {
        &self.devnet
    }

    /// Id of the network
    pub fn net_id(&self) -> ObjectId {
        self.devnet.id()
    }

    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        self.devnet.ctx()
    }

    /// Creation progress
    pub fn status(&self) -> InfreqStatus {
        self.state.lock().status
    }

    /// Runtime handle, 0 until created
    pub fn rt_handle(&self) -> RuntimeHandle {
        self.state.lock().rt_handle
    }

    /// Whether the request was destroyed or rolled back
    pub fn is_destroyed(&self) -> bool {
        self.life.is_destroyed()
    }

    /// Created and still indexed
    pub fn is_usable(&self) -> bool {
        !self.is_destroyed() && self.status() == InfreqStatus::Created
    }

    /// Sequence of the running execution
    pub fn active(&self) -> Option<u64> {
        self.state.lock().active
    }

    pub(crate) fn set_active(&self, seq: u64) {
        self.state.lock().active = Some(seq);
    }

    pub(crate) fn clear_active(&self, seq: u64) {
        let mut st = self.state.lock();
        if st.active == Some(seq) {
            st.active = None;
        }
    }

    fn report(&self, code: EventCode, value: EventValue) {
        self.ctx().report(
            EventReport::new(code, value)
                .object(self.id)
                .object2(self.net_id()),
        );
    }
}

impl Indexed for InfReq {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn life(&self) -> &Lifecycle {
        &self.life
    }
}

impl Drop for InfReq {
    fn drop(&mut self) {
        let rt = self.state.get_mut().rt_handle;
        if rt != 0 {
            if let Err(e) = self
                .ctx()
                .cmdq()
                .push(RemoteOpcode::DestroyInfreq.raw(), encode_handle(rt))
            {
                log::debug!("cinder: infreq {} runtime release dropped: {}", self.id, e);
            }
        }
        if self.life.host_destroyed() {
            self.report(EventCode::DestroyInfreqSuccess, EventValue::NoError);
        }
    }
}

impl InferenceService {
    pub(crate) fn infreq_op(self: &Arc<Self>, ctx: &Arc<Context>, op: InfreqOp) {
        if op.destroy {
            let value = match ctx.find_devnet(op.net_id) {
                None => EventValue::NoSuchNet,
                Some(devnet) => match devnet.take_infreq(op.infreq_id, DestroyReason::Host) {
                    Some(_) => return,
                    None => EventValue::NoSuchInfreq,
                },
            };
            ctx.report(
                EventReport::new(EventCode::DestroyInfreqFailed, value)
                    .object(op.infreq_id)
                    .object2(op.net_id),
            );
            return;
        }
        if let Err(e) = self.create_infreq(ctx, op) {
            ctx.report(
                EventReport::new(EventCode::CreateInfreqFailed, e.into())
                    .object(op.infreq_id)
                    .object2(op.net_id),
            );
        }
    }

    /// Errors are returned only while nothing is indexed yet
    fn create_infreq(self: &Arc<Self>, ctx: &Arc<Context>, op: InfreqOp) -> Result<()> {
        ctx.check_usable()?;
        let devnet = ctx
            .find_devnet(op.net_id)
            .filter(|n| n.is_created())
            .ok_or(Error::NoSuchNetwork)?;
        let infreq = Arc::new(InfReq {
            id: op.infreq_id,
            devnet: devnet.clone(),
            drv_handle: self.next_handle(),
            life: Lifecycle::new(),
            state: Mutex::new(InfReqState {
                status: InfreqStatus::PayloadStaged,
                rt_handle: 0,
                active: None,
            }),
        });
        devnet.insert_infreq(&infreq)?;

        if op.size == 0 {
            self.dispatch_infreq_create(&infreq, Vec::new());
            return Ok(());
        }
        let size = op.size as usize;
        let src = match self.host_chunk(ctx, op.host_addr, size) {
            Ok(src) => src,
            Err(e) => {
                self.rollback_infreq(&infreq, e.into());
                return Ok(());
            }
        };
        let lease = self.pool.acquire();
        let inf = infreq.clone();
        let staged = self.stage_in(lease, src, size, move |svc, lease, status| {
            svc.infreq_config_done(inf, lease, size, status)
        });
        if let Err(e) = staged {
            self.chunk_consumed(ctx, size);
            self.rollback_infreq(&infreq, e.into());
        }
        Ok(())
    }

    fn infreq_config_done(&self, infreq: Arc<InfReq>, lease: PageLease, size: usize, status: XferStatus) {
        self.chunk_consumed(infreq.ctx(), size);
        if !status.is_ok() {
            self.release_page(lease);
            self.rollback_infreq(&infreq, EventValue::DmaError);
            return;
        }
        if infreq.is_destroyed() {
            self.release_page(lease);
            return;
        }
        let config = self.pool.read_vec(lease.handle, size);
        self.release_page(lease);
        match config {
            Ok(config) => self.dispatch_infreq_create(&infreq, config),
            Err(e) => self.rollback_infreq(&infreq, e.into()),
        }
    }

    fn dispatch_infreq_create(&self, infreq: &Arc<InfReq>, config: Vec<u8>) {
        let req = CreateInfreqRequest {
            drv_handle: infreq.drv_handle,
            net_rt_handle: infreq.devnet.rt_handle(),
            infreq_id: infreq.id,
            config,
        };
        self.expect_reply(infreq.drv_handle, PendingReply::InfReq(infreq.clone()));
        let pushed = infreq
            .ctx()
            .cmdq()
            .push(RemoteOpcode::CreateInfreq.raw(), req.encode());
        if let Err(e) = pushed {
            self.take_reply(infreq.drv_handle);
            self.rollback_infreq(infreq, e.into());
        }
    }

    /// Unindex a request whose creation failed and report it unless the
    /// host destroyed it meanwhile
    pub(crate) fn rollback_infreq(&self, infreq: &Arc<InfReq>, value: EventValue) {
        let (was_live, taken) = infreq.devnet.unindex_failed_infreq(infreq);
        drop(taken);
        if was_live {
            infreq.report(EventCode::CreateInfreqFailed, value);
        }
    }

    /// Runtime answered an inference request create
    pub(crate) fn finish_infreq(&self, infreq: Arc<InfReq>, reply: CreateReply) {
        if !reply.status.is_ok() {
            self.rollback_infreq(&infreq, reply.status.infreq_value());
            return;
        }
        infreq.state.lock().rt_handle = reply.rt_handle;
        let live = infreq.devnet.finalize_infreq_if_live(&infreq.life, || {
            infreq.state.lock().status = InfreqStatus::Created;
        });
        if live {
            infreq.report(EventCode::CreateInfreqSuccess, EventValue::NoError);
        }
    }
}
