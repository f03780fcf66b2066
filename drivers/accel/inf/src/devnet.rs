//! # Device Networks
//!
//! A network is created empty and populated by edits. Each edit stages a
//! resource table from the host, resolves the ids to runtime handles and
//! hands the assembled table to the runtime. Only one edit (or reservation)
//! may be in flight:
//!
//! ```text
//!   Created ──edit──▶ EditStarted ──last chunk──▶ PayloadStaged ──reply──▶ Created
//!      ▲                   │                           │
//!      └──── failure: create edits roll the network back, add edits revert
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{
    DmaAddr, DriverHandle, Error, EventCode, EventReport, EventValue, ObjectId, Result, RuntimeHandle,
};
use cinder_dma::{PageLease, XferStatus};
use spin::Mutex;

use crate::context::Context;
use crate::devres::DevRes;
use crate::infreq::InfReq;
use crate::object::{DestroyReason, Indexed, Lifecycle, ObjectIndex};
use crate::protocol::{HostCommand, NetworkOp, NetworkProperty, PropertyOp, ReservationOp};
use crate::remote::{
    encode_handle, CreateNetworkRequest, CreateReply, RemoteOpcode, ReservationReply,
    ReservationRequest,
};
use crate::service::{InferenceService, PendingReply};
use crate::staging::TableCursor;

/// Edit progress of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStatus {
    /// Idle
    Created,
    /// Table chunks are arriving
    EditStarted,
    /// Waiting for the runtime
    PayloadStaged,
}

/// An edit being assembled
pub(crate) struct NetEdit {
    cursor: TableCursor,
    /// Legacy chain trailers in non-final chunks
    chained: bool,
    handles: Vec<RuntimeHandle>,
    /// Resources joining the network once the runtime accepts the edit
    pending: Vec<Arc<DevRes>>,
    config: Vec<u8>,
}

struct DevNetState {
    created: bool,
    edit_status: EditStatus,
    rt_handle: RuntimeHandle,
    members: Vec<Arc<DevRes>>,
    edit: Option<NetEdit>,
    serial: bool,
}

/// Outcome of one consumed chunk
enum Step {
    /// Whole table staged
    Done,
    /// Next legacy chunk
    Chain(DmaAddr, usize),
    /// Next chunk comes with another host command
    AwaitCommand,
}

/// A compute graph bound to device resources
pub struct DevNet {
    id: ObjectId,
    ctx: Arc<Context>,
    drv_handle: DriverHandle,
    life: Lifecycle,
    state: Mutex<DevNetState>,
    infreqs: Mutex<ObjectIndex<InfReq>>,
}

impl DevNet {
    fn new(id: ObjectId, ctx: Arc<Context>, drv_handle: DriverHandle) -> Self {
        Self {
            id,
            ctx,
            drv_handle,
            life: Lifecycle::new(),
            state: Mutex::new(DevNetState {
                created: false,
                edit_status: EditStatus::Created,
                rt_handle: 0,
                members: Vec::new(),
                edit: None,
                serial: false,
            }),
            infreqs: Mutex::new(ObjectIndex::default()),
        }
    }

    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Whether the runtime accepted the network
    pub fn is_created(&self) -> bool {
        self.state.lock().created
    }

    /// Edit progress
    pub fn edit_status(&self) -> EditStatus {
        self.state.lock().edit_status
    }

    /// Runtime handle, 0 until created
    pub fn rt_handle(&self) -> RuntimeHandle {
        self.state.lock().rt_handle
    }

    /// Number of member resources
    pub fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }

    /// Whether inference executions are serialized
    pub fn is_serial(&self) -> bool {
        self.state.lock().serial
    }

    /// Whether the network was destroyed or rolled back
    pub fn is_destroyed(&self) -> bool {
        self.life.is_destroyed()
    }

    /// Find an inference request
    pub fn find_infreq(&self, id: ObjectId) -> Option<Arc<InfReq>> {
        self.infreqs.lock().get(id)
    }

    pub(crate) fn insert_infreq(&self, infreq: &Arc<InfReq>) -> Result<()> {
        let mut index = self.infreqs.lock();
        if self.life.is_destroyed() {
            return Err(Error::NoSuchNetwork);
        }
        index.insert(infreq)
    }

    pub(crate) fn take_infreq(&self, id: ObjectId, reason: DestroyReason) -> Option<Arc<InfReq>> {
        self.infreqs.lock().take(id, reason)
    }

    /// Unindex a request whose creation failed; also tells whether it was
    /// still live
    pub(crate) fn unindex_failed_infreq(&self, infreq: &Arc<InfReq>) -> (bool, Option<Arc<InfReq>>) {
        let mut index = self.infreqs.lock();
        let live = !infreq.is_destroyed();
        (live, index.take_exact(infreq, DestroyReason::CreateFailed))
    }

    /// Run `f` under the request index lock unless `life` is destroyed
    pub(crate) fn finalize_infreq_if_live(&self, life: &Lifecycle, f: impl FnOnce()) -> bool {
        let _index = self.infreqs.lock();
        if life.is_destroyed() {
            return false;
        }
        f();
        true
    }

    /// Unindex every inference request
    pub(crate) fn drain_infreqs(&self, reason: DestroyReason) -> Vec<Arc<InfReq>> {
        self.infreqs.lock().drain(reason)
    }

    fn report(&self, code: EventCode, value: EventValue) {
        self.ctx.report(EventReport::new(code, value).object(self.id));
    }

    /// Open an edit
    fn begin_edit(&self, op: &NetworkOp, chained: bool) -> Result<()> {
        let mut st = self.state.lock();
        if op.create == st.created {
            return Err(if st.created {
                Error::AlreadyExists
            } else {
                Error::NoSuchNetwork
            });
        }
        if st.edit.is_some() || st.edit_status != EditStatus::Created {
            return Err(Error::EditBusy);
        }
        let cursor = TableCursor::new(op.num_res, op.config_size as usize);
        let mut handles = Vec::new();
        handles
            .try_reserve(op.num_res as usize)
            .map_err(|_| Error::OutOfMemory)?;
        st.edit = Some(NetEdit {
            cursor,
            chained,
            handles,
            pending: Vec::new(),
            config: Vec::new(),
        });
        st.edit_status = EditStatus::EditStarted;
        Ok(())
    }
}

impl Indexed for DevNet {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn life(&self) -> &Lifecycle {
        &self.life
    }
}

impl Drop for DevNet {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.rt_handle != 0 {
            if let Err(e) = self
                .ctx
                .cmdq()
                .push(RemoteOpcode::DestroyNetwork.raw(), encode_handle(st.rt_handle))
            {
                log::debug!("cinder: devnet {} runtime release dropped: {}", self.id, e);
            }
        }
        if self.life.host_destroyed() {
            self.ctx.report(
                EventReport::new(EventCode::DestroyDevnetSuccess, EventValue::NoError)
                    .object(self.id),
            );
        }
    }
}

// =============================================================================
// EDITS
// =============================================================================

impl InferenceService {
    pub(crate) fn network_op(self: &Arc<Self>, ctx: &Arc<Context>, op: NetworkOp) {
        if op.destroy {
            self.destroy_devnet(ctx, op.net_id);
            return;
        }
        let devnet = match self.open_network_chunk(ctx, &op) {
            Ok(devnet) => devnet,
            Err(e) => {
                log::debug!("cinder: ctx {} devnet {} chunk rejected: {}", ctx.id(), op.net_id, e);
                ctx.report(HostCommand::Network(op).rejection(e.into()));
                return;
            }
        };
        if op.size == 0 {
            match self.consume_network_chunk(&devnet, &[]) {
                Ok(Step::Done) => self.dispatch_network_edit(&devnet),
                Ok(_) => self.fail_network_edit(&devnet, EventValue::ProtocolError),
                Err(e) => self.fail_network_edit(&devnet, e.into()),
            }
            return;
        }
        let size = op.size as usize;
        let src = match self.host_chunk(ctx, op.host_addr, size) {
            Ok(src) => src,
            Err(e) => {
                self.fail_network_edit(&devnet, e.into());
                return;
            }
        };
        let lease = self.pool.acquire();
        let net = devnet.clone();
        let staged = self.stage_in(lease, src, size, move |svc, lease, status| {
            svc.network_chunk_done(net, lease, size, status)
        });
        if let Err(e) = staged {
            self.chunk_consumed(ctx, size);
            self.fail_network_edit(&devnet, e.into());
        }
    }

    fn destroy_devnet(&self, ctx: &Arc<Context>, net_id: ObjectId) {
        let taken = ctx.remove_children(|c| c.devnets.take(net_id, DestroyReason::Host));
        match taken {
            Some(devnet) => {
                let infreqs = devnet.drain_infreqs(DestroyReason::Teardown);
                drop(infreqs);
            }
            None => ctx.report(
                EventReport::new(EventCode::DestroyDevnetFailed, EventValue::NoSuchNet)
                    .object(net_id),
            ),
        }
    }

    /// Find or create the network a chunk belongs to and check it fits the
    /// open edit; errors need no rollback
    fn open_network_chunk(&self, ctx: &Arc<Context>, op: &NetworkOp) -> Result<Arc<DevNet>> {
        ctx.check_usable()?;
        let chained = op.chained && ctx.ring().is_none();
        if op.start_res_idx == 0 {
            if op.create {
                let devnet = Arc::new(DevNet::new(op.net_id, ctx.clone(), self.next_handle()));
                devnet.begin_edit(op, chained)?;
                ctx.with_children(|c| c.devnets.insert(&devnet))??;
                return Ok(devnet);
            }
            let devnet = ctx.find_devnet(op.net_id).ok_or(Error::NoSuchNetwork)?;
            devnet.begin_edit(op, chained)?;
            return Ok(devnet);
        }

        let devnet = ctx.find_devnet(op.net_id).ok_or(Error::NoSuchNetwork)?;
        let st = devnet.state.lock();
        match &st.edit {
            Some(edit) if st.edit_status == EditStatus::EditStarted => {
                if edit.cursor.consumed() != op.start_res_idx {
                    return Err(Error::MalformedCommand);
                }
            }
            _ => return Err(Error::EditError),
        }
        drop(st);
        Ok(devnet)
    }

    fn network_chunk_done(
        self: &Arc<Self>,
        devnet: Arc<DevNet>,
        lease: PageLease,
        size: usize,
        status: XferStatus,
    ) {
        self.chunk_consumed(devnet.ctx(), size);
        if !status.is_ok() {
            self.release_page(lease);
            self.fail_network_edit(&devnet, EventValue::DmaError);
            return;
        }
        if devnet.is_destroyed() {
            self.release_page(lease);
            devnet.state.lock().edit = None;
            return;
        }
        let step = self
            .pool
            .read_vec(lease.handle, size)
            .and_then(|bytes| self.consume_network_chunk(&devnet, &bytes));
        match step {
            Ok(Step::Done) => {
                self.release_page(lease);
                self.dispatch_network_edit(&devnet);
            }
            Ok(Step::AwaitCommand) => self.release_page(lease),
            Ok(Step::Chain(next, next_size)) => {
                let net = devnet.clone();
                let staged = self.stage_in(lease, next, next_size, move |svc, lease, status| {
                    svc.network_chunk_done(net, lease, next_size, status)
                });
                if let Err(e) = staged {
                    self.fail_network_edit(&devnet, e.into());
                }
            }
            Err(e) => {
                self.release_page(lease);
                self.fail_network_edit(&devnet, e.into());
            }
        }
    }

    fn consume_network_chunk(&self, devnet: &DevNet, bytes: &[u8]) -> Result<Step> {
        let chunk = {
            let mut st = devnet.state.lock();
            let edit = st.edit.as_mut().ok_or(Error::EditError)?;
            let chained = edit.chained;
            edit.cursor.parse(bytes, chained)?
        };
        let mut resolved = Vec::with_capacity(chunk.ids.len());
        for id in &chunk.ids {
            let devres = devnet
                .ctx
                .find_devres(*id)
                .filter(|d| d.is_usable())
                .ok_or(Error::NoSuchDevres)?;
            resolved.push(devres);
        }

        let mut st = devnet.state.lock();
        let edit = st.edit.as_mut().ok_or(Error::EditError)?;
        for devres in resolved {
            edit.handles.push(devres.rt_handle());
            edit.pending.push(devres);
        }
        if let Some(config) = chunk.config {
            edit.config = config;
            return Ok(Step::Done);
        }
        Ok(match chunk.next {
            Some((addr, size)) => Step::Chain(addr, size),
            None => Step::AwaitCommand,
        })
    }

    fn dispatch_network_edit(&self, devnet: &Arc<DevNet>) {
        let req = {
            let mut guard = devnet.state.lock();
            let st = &mut *guard;
            let Some(edit) = st.edit.as_ref() else {
                return;
            };
            st.edit_status = EditStatus::PayloadStaged;
            CreateNetworkRequest {
                drv_handle: devnet.drv_handle,
                rt_handle: st.rt_handle,
                net_id: devnet.id,
                resources: edit.handles.clone(),
                config: edit.config.clone(),
            }
        };
        let size = req.encoded_len();
        self.expect_reply(devnet.drv_handle, PendingReply::DevNet(devnet.clone()));
        let pushed = devnet.ctx.cmdq().push_with(
            RemoteOpcode::CreateNetwork.raw(),
            size,
            Box::new(move |offset, dst| req.read_at(offset, dst)),
        );
        if let Err(e) = pushed {
            self.take_reply(devnet.drv_handle);
            self.fail_network_edit(devnet, e.into());
        }
    }

    /// Abort the open edit
    ///
    /// A network that was never created is rolled back; an add-resources
    /// edit leaves the network with its previous members.
    pub(crate) fn fail_network_edit(&self, devnet: &Arc<DevNet>, value: EventValue) {
        let (edit, created) = {
            let mut st = devnet.state.lock();
            st.edit_status = EditStatus::Created;
            (st.edit.take(), st.created)
        };
        drop(edit);
        if created {
            if !devnet.is_destroyed() {
                devnet.report(EventCode::DevnetAddResFailed, value);
            }
            return;
        }
        let ctx = devnet.ctx();
        let (was_live, taken) = ctx.remove_children(|c| {
            let live = !devnet.is_destroyed();
            (live, c.devnets.take_exact(devnet, DestroyReason::CreateFailed))
        });
        drop(taken);
        if was_live {
            log::debug!("cinder: ctx {} devnet {} rolled back: {:?}", ctx.id(), devnet.id, value);
            devnet.report(EventCode::CreateDevnetFailed, value);
        }
    }

    /// Runtime answered a network create or edit
    pub(crate) fn finish_network_edit(&self, devnet: Arc<DevNet>, reply: CreateReply) {
        if !reply.status.is_ok() {
            self.fail_network_edit(&devnet, reply.status.network_value());
            return;
        }
        let creating = {
            let mut st = devnet.state.lock();
            let edit = st.edit.take();
            st.edit_status = EditStatus::Created;
            if let Some(edit) = edit {
                st.members.extend(edit.pending);
            }
            // Recorded even when destroyed so the runtime copy is released
            if !st.created {
                st.rt_handle = reply.rt_handle;
            }
            !st.created
        };
        let live = devnet.ctx().finalize_if_live(&devnet.life, || {
            if creating {
                devnet.state.lock().created = true;
            }
        });
        if live {
            let code = if creating {
                EventCode::CreateDevnetSuccess
            } else {
                EventCode::DevnetAddResSuccess
            };
            devnet.report(code, EventValue::NoError);
        }
    }

    // =========================================================================
    // Reservation and properties
    // =========================================================================

    pub(crate) fn reservation_op(&self, ctx: &Arc<Context>, op: ReservationOp) {
        if let Err(e) = self.start_reservation(ctx, op.net_id, op.reserve, op.timeout) {
            ctx.report(HostCommand::Reservation(op).rejection(e.into()));
        }
    }

    fn start_reservation(&self, ctx: &Arc<Context>, net_id: ObjectId, reserve: bool, timeout: u32) -> Result<()> {
        ctx.check_usable()?;
        let devnet = ctx.find_devnet(net_id).ok_or(Error::NoSuchNetwork)?;
        let rt_handle = {
            let mut st = devnet.state.lock();
            if !st.created {
                return Err(Error::NoSuchNetwork);
            }
            if st.edit.is_some() || st.edit_status != EditStatus::Created {
                return Err(Error::EditBusy);
            }
            st.edit_status = EditStatus::PayloadStaged;
            st.rt_handle
        };
        let req = ReservationRequest {
            drv_handle: devnet.drv_handle,
            net_rt_handle: rt_handle,
            reserve,
            timeout,
        };
        self.expect_reply(
            devnet.drv_handle,
            PendingReply::Reservation {
                devnet: devnet.clone(),
                reserve,
            },
        );
        let pushed = ctx
            .cmdq()
            .push(RemoteOpcode::NetworkReservation.raw(), req.encode());
        if let Err(e) = pushed {
            self.take_reply(devnet.drv_handle);
            devnet.state.lock().edit_status = EditStatus::Created;
            return Err(e);
        }
        Ok(())
    }

    /// Runtime answered a reservation
    pub fn handle_reservation_reply(&self, reply: ReservationReply) -> Result<()> {
        match self.take_reply(reply.drv_handle) {
            Some(PendingReply::Reservation { devnet, reserve }) => {
                self.finish_reservation(&devnet, reserve, reply.status.reservation_value());
                Ok(())
            }
            Some(other) => {
                self.expect_reply(reply.drv_handle, other);
                Err(Error::InvalidParameter)
            }
            None => Err(Error::NoSuchNetwork),
        }
    }

    pub(crate) fn finish_reservation(&self, devnet: &DevNet, reserve: bool, value: EventValue) {
        devnet.state.lock().edit_status = EditStatus::Created;
        if devnet.is_destroyed() {
            return;
        }
        let code = match (reserve, value.is_ok()) {
            (true, true) => EventCode::DevnetReserveSuccess,
            (true, false) => EventCode::DevnetReserveFailed,
            (false, true) => EventCode::DevnetReleaseSuccess,
            (false, false) => EventCode::DevnetReleaseFailed,
        };
        devnet.report(code, value);
    }

    pub(crate) fn property_op(&self, ctx: &Arc<Context>, op: PropertyOp) {
        let result = match NetworkProperty::from_raw(op.property) {
            Some(NetworkProperty::SerialInfExecution) => ctx
                .check_usable()
                .and_then(|_| ctx.find_devnet(op.net_id).ok_or(Error::NoSuchNetwork))
                .map(|devnet| {
                    devnet.state.lock().serial = op.value != 0;
                    ctx.report(
                        EventReport::new(EventCode::DevnetSetPropertySuccess, EventValue::NoError)
                            .object(op.net_id),
                    );
                }),
            // Reported by the reservation reply
            Some(NetworkProperty::ResourcesReservation) => {
                self.start_reservation(ctx, op.net_id, op.value != 0, op.timeout)
            }
            None => Err(Error::NotSupported),
        };
        if let Err(e) = result {
            let value = match e {
                Error::NotSupported => EventValue::NotSupported,
                e => e.into(),
            };
            ctx.report(HostCommand::Property(op).rejection(value));
        }
    }
}
