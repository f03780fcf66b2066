//! Service tests driving host commands end to end against a scripted DMA
//! engine, daemon and runtime.

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use cinder_cmdq::CommandQueue;
use cinder_core::{
    ContextId, DmaAddr, DriverHandle, Error, EventCode, EventReport, EventSink, EventValue,
    ObjectId, ServiceConfig, PAGE_SIZE,
};
use cinder_dma::{
    DmaPagePool, DmaTransport, HostRing, XferCompletion, XferDirection, XferHandle, XferRequest,
    XferStatus,
};
use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use crate::cmdlist::{CmdItem, CmdListStatus};
use crate::codec::ByteWriter;
use crate::context::ContextState;
use crate::devres::DevResStatus;
use crate::exec::{ExecBackend, ExecKind, ExecRequest, Rejected};
use crate::object::Indexed;
use crate::protocol::{
    CmdListOp, ContextOp, CopyOp, DevresOp, ErrorListOp, HostCommand, InfreqOp, NetworkOp,
    PropertyOp, ReservationOp, ScheduleCmdListOp, ScheduleCopyOp, ScheduleInfreqOp, SchedParams,
    SyncOp, UsageFlags,
};
use crate::remote::{
    decode_handle, AllocReply, AllocRequest, CreateContextRequest, CreateDevresRequest,
    CreateInfreqRequest, CreateNetworkRequest, CreateReply, ExecDoneReply, RemoteOpcode,
    ReservationReply, ReservationRequest, RuntimeNotice, RuntimeStatus, ScheduleInfreqRequest,
};
use crate::service::InferenceService;
use crate::staging::chain_trailer;

// =============================================================================
// SCRIPTED ENVIRONMENT
// =============================================================================

#[derive(Default)]
struct Recorder(Mutex<Vec<EventReport>>);

impl EventSink for Recorder {
    fn report(&self, event: EventReport) {
        self.0.lock().push(event);
    }
}

impl Recorder {
    fn take(&self) -> Vec<EventReport> {
        core::mem::take(&mut *self.0.lock())
    }

    fn codes(&self) -> Vec<EventCode> {
        self.take().iter().map(|e| e.code).collect()
    }
}

/// DMA engine that queues transfers until the test completes them
#[derive(Default)]
struct MockDma {
    pool: Mutex<Option<Arc<DmaPagePool>>>,
    host: Mutex<HashMap<u64, Vec<u8>>>,
    queued: Mutex<VecDeque<(usize, XferRequest, XferCompletion)>>,
    started: AtomicUsize,
    fail: Mutex<HashSet<usize>>,
    refuse: Mutex<HashSet<usize>>,
}

impl DmaTransport for MockDma {
    fn start_single_transfer(
        &self,
        xfer: XferRequest,
        done: XferCompletion,
    ) -> cinder_core::Result<XferHandle> {
        let n = self.started.fetch_add(1, Ordering::Relaxed);
        if self.refuse.lock().contains(&n) {
            return Err(Error::OutOfMemory);
        }
        self.queued.lock().push_back((n, xfer, done));
        Ok(XferHandle(n as u64))
    }
}

impl MockDma {
    fn put_host(&self, addr: DmaAddr, bytes: &[u8]) {
        self.host.lock().insert(addr.raw(), bytes.to_vec());
    }

    fn host(&self, addr: DmaAddr) -> Option<Vec<u8>> {
        self.host.lock().get(&addr.raw()).cloned()
    }

    /// Complete the transfer started `skip` transfers from now with an error
    fn fail_after(&self, skip: usize) {
        let n = self.started.load(Ordering::Relaxed) + skip;
        self.fail.lock().insert(n);
    }

    /// Refuse to start the transfer `skip` transfers from now
    fn refuse_after(&self, skip: usize) {
        let n = self.started.load(Ordering::Relaxed) + skip;
        self.refuse.lock().insert(n);
    }

    fn complete_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queued.lock().pop_front();
            let Some((n, xfer, done)) = next else {
                break;
            };
            self.finish(n, &xfer, done);
            ran += 1;
        }
        ran
    }

    /// Complete the queued transfers, most recently started first
    fn complete_newest_first(&self) -> usize {
        let queued: Vec<_> = self.queued.lock().drain(..).collect();
        let ran = queued.len();
        for (n, xfer, done) in queued.into_iter().rev() {
            self.finish(n, &xfer, done);
        }
        ran
    }

    fn finish(&self, n: usize, xfer: &XferRequest, done: XferCompletion) {
        let status = if self.fail.lock().contains(&n) {
            XferStatus::Failed
        } else {
            self.perform(xfer);
            XferStatus::Ok
        };
        done(status, 1);
    }

    fn perform(&self, xfer: &XferRequest) {
        let Some(pool) = self.pool.lock().clone() else {
            return;
        };
        let size = xfer.size as usize;
        match xfer.desc.direction {
            XferDirection::HostToCard => {
                let mut bytes = self.host(xfer.src).unwrap_or_default();
                bytes.resize(size, 0);
                // Device resources live outside the pool
                let _ = pool.dma_write(xfer.dst, &bytes);
            }
            XferDirection::CardToHost => {
                let mut buf = vec![0; size];
                if pool.dma_read(xfer.src, &mut buf).is_ok() {
                    self.put_host(xfer.dst, &buf);
                }
            }
        }
    }
}

/// Copy backend that holds requests until the test completes them
#[derive(Default)]
struct ScriptedBackend {
    calls: AtomicUsize,
    reject: Mutex<HashSet<usize>>,
    held: Mutex<Vec<ExecRequest>>,
}

impl ScriptedBackend {
    fn rejecting(calls: &[usize]) -> Arc<Self> {
        let backend = Self::default();
        backend.reject.lock().extend(calls.iter().copied());
        Arc::new(backend)
    }

    fn take(&self) -> Vec<ExecRequest> {
        core::mem::take(&mut *self.held.lock())
    }
}

impl ExecBackend for ScriptedBackend {
    fn schedule(&self, _svc: &Arc<InferenceService>, req: ExecRequest) -> Result<(), Rejected> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        if self.reject.lock().contains(&n) {
            return Err(Rejected {
                req,
                error: Error::OutOfMemory,
            });
        }
        self.held.lock().push(req);
        Ok(())
    }
}

/// Host ring handing out consecutive pages
struct MockRing {
    base: DmaAddr,
    next: Mutex<u64>,
    freed: AtomicUsize,
    avail: AtomicUsize,
}

impl MockRing {
    fn new(base: DmaAddr) -> Arc<Self> {
        Arc::new(Self {
            base,
            next: Mutex::new(0),
            freed: AtomicUsize::new(0),
            avail: AtomicUsize::new(0),
        })
    }
}

impl HostRing for MockRing {
    fn reserve(&self, size: usize) -> cinder_core::Result<(DmaAddr, usize)> {
        let mut next = self.next.lock();
        let addr = self.base + *next;
        *next += size as u64;
        Ok((addr, PAGE_SIZE))
    }

    fn advance_free(&self, size: usize) {
        self.freed.fetch_add(size, Ordering::Relaxed);
    }

    fn advance_avail(&self, size: usize) {
        self.avail.fetch_add(size, Ordering::Relaxed);
    }
}

fn pop(queue: &CommandQueue, op: RemoteOpcode) -> Vec<u8> {
    let cmd = queue.try_pop().unwrap();
    assert_eq!(cmd.opcode, op.raw());
    cmd.payload
}

fn devres_addr(id: ObjectId) -> DmaAddr {
    DmaAddr::new(0x8000_0000 + id as u64 * 0x10_0000)
}

const CTX: ContextId = 1;
const NET_CONFIG: [u8; 2] = [0xc0, 0xf1];

struct Harness {
    svc: Arc<InferenceService>,
    dma: Arc<MockDma>,
    events: Arc<Recorder>,
    daemon: Arc<CommandQueue>,
}

impl Harness {
    fn new() -> Self {
        Self::build(None)
    }

    fn with_backend(backend: Arc<dyn ExecBackend>) -> Self {
        Self::build(Some(backend))
    }

    fn build(backend: Option<Arc<dyn ExecBackend>>) -> Self {
        let dma = Arc::new(MockDma::default());
        let events = Arc::new(Recorder::default());
        let config = ServiceConfig::default();
        let svc = match backend {
            Some(b) => {
                InferenceService::with_copy_backend(config, dma.clone(), events.clone(), b)
            }
            None => InferenceService::new(config, dma.clone(), events.clone()),
        }
        .unwrap();
        *dma.pool.lock() = Some(svc.pool().clone());
        let daemon = svc.attach_daemon().unwrap();
        Self {
            svc,
            dma,
            events,
            daemon,
        }
    }

    /// Run work queues and DMA completions until nothing moves
    fn settle(&self) {
        loop {
            let ran = self.svc.run_pending();
            let done = self.dma.complete_all();
            if ran == 0 && done == 0 {
                break;
            }
        }
    }

    fn send(&self, cmd: HostCommand) {
        self.svc.submit(&cmd.encode()).unwrap();
        self.settle();
    }

    /// Run the command's work but leave its transfers in flight
    fn post(&self, cmd: HostCommand) {
        self.svc.submit(&cmd.encode()).unwrap();
        self.svc.run_pending();
    }

    fn create_context(&self, id: ContextId) -> (DriverHandle, Arc<CommandQueue>) {
        self.send(HostCommand::Context(ContextOp {
            ctx_id: id,
            destroy: false,
            recover: false,
            flags: 0,
        }));
        let req = CreateContextRequest::decode(&pop(&self.daemon, RemoteOpcode::CreateContext))
            .unwrap();
        assert_eq!(req.ctx_id, id);
        let rt = self.svc.attach_runtime(req.drv_handle).unwrap();
        let events = self.events.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, EventCode::CreateContextSuccess);
        assert_eq!(events[0].context, Some(id));
        (req.drv_handle, rt)
    }

    fn destroy_context(&self, id: ContextId) {
        self.send(HostCommand::Context(ContextOp {
            ctx_id: id,
            destroy: true,
            recover: false,
            flags: 0,
        }));
    }

    fn devres(&self, id: ObjectId, size: u64, destroy: bool) {
        self.send(HostCommand::Devres(DevresOp {
            ctx_id: CTX,
            devres_id: id,
            destroy,
            usage: UsageFlags::INPUT,
            size,
        }));
    }

    fn create_devres(&self, rt: &CommandQueue, id: ObjectId) {
        self.devres(id, 0x1000, false);
        let alloc = AllocRequest::decode(&pop(&self.daemon, RemoteOpcode::AllocResource)).unwrap();
        self.svc
            .handle_alloc_reply(AllocReply {
                drv_handle: alloc.drv_handle,
                status: RuntimeStatus::Ok,
                buf_handle: 0x100 + id as u64,
                dma_addr: devres_addr(id),
            })
            .unwrap();
        let create = CreateDevresRequest::decode(&pop(rt, RemoteOpcode::CreateDevres)).unwrap();
        assert_eq!(create.buf_handle, 0x100 + id as u64);
        self.svc
            .handle_create_reply(CreateReply {
                drv_handle: create.drv_handle,
                status: RuntimeStatus::Ok,
                rt_handle: 0x500 + id as u64,
            })
            .unwrap();
    }

    fn create_copy(&self, id: ObjectId, devres: ObjectId, host_pfn: u64, c2h: bool) {
        self.send(HostCommand::Copy(CopyOp {
            ctx_id: CTX,
            copy_id: id,
            devres_id: devres,
            destroy: false,
            c2h,
            d2d: false,
            host_addr: DmaAddr::from_pfn(host_pfn),
        }));
    }

    fn create_network(&self, rt: &CommandQueue, net_id: ObjectId, members: &[ObjectId]) {
        let req = self.start_network(rt, net_id, members);
        self.svc
            .handle_create_reply(CreateReply {
                drv_handle: req.drv_handle,
                status: RuntimeStatus::Ok,
                rt_handle: 0x900 + net_id as u64,
            })
            .unwrap();
    }

    /// Stage a network and return the request the runtime got
    fn start_network(
        &self,
        rt: &CommandQueue,
        net_id: ObjectId,
        members: &[ObjectId],
    ) -> CreateNetworkRequest {
        let mut w = ByteWriter::new();
        for id in members {
            w.u16(*id);
        }
        let payload = w.bytes(&NET_CONFIG).finish();
        let host = DmaAddr::from_pfn(0x600 + net_id as u64);
        self.dma.put_host(host, &payload);
        self.send(HostCommand::Network(NetworkOp {
            ctx_id: CTX,
            net_id,
            destroy: false,
            create: true,
            chained: false,
            num_res: members.len() as u32,
            size: payload.len() as u16,
            config_size: NET_CONFIG.len() as u16,
            start_res_idx: 0,
            host_addr: host,
        }));
        let req = CreateNetworkRequest::decode(&pop(rt, RemoteOpcode::CreateNetwork)).unwrap();
        assert_eq!(req.config, NET_CONFIG);
        req
    }

    fn destroy_network(&self, net_id: ObjectId) {
        self.send(HostCommand::Network(NetworkOp {
            ctx_id: CTX,
            net_id,
            destroy: true,
            create: false,
            chained: false,
            num_res: 0,
            size: 0,
            config_size: 0,
            start_res_idx: 0,
            host_addr: DmaAddr::null(),
        }));
    }

    fn create_infreq(&self, rt: &CommandQueue, net_id: ObjectId, id: ObjectId) {
        let req = self.start_infreq(rt, net_id, id);
        self.svc
            .handle_create_reply(CreateReply {
                drv_handle: req.drv_handle,
                status: RuntimeStatus::Ok,
                rt_handle: 0xa00 + id as u64,
            })
            .unwrap();
    }

    /// Ask for an inference request and return what the runtime got
    fn start_infreq(&self, rt: &CommandQueue, net_id: ObjectId, id: ObjectId) -> CreateInfreqRequest {
        self.infreq(net_id, id, false);
        let req = CreateInfreqRequest::decode(&pop(rt, RemoteOpcode::CreateInfreq)).unwrap();
        assert_eq!(req.net_rt_handle, 0x900 + net_id as u64);
        req
    }

    fn infreq(&self, net_id: ObjectId, id: ObjectId, destroy: bool) {
        self.send(HostCommand::Infreq(InfreqOp {
            ctx_id: CTX,
            net_id,
            infreq_id: id,
            destroy,
            size: 0,
            host_addr: DmaAddr::null(),
        }));
    }

    /// Build a command list from `payload` in one chunk
    fn create_cmdlist(&self, cmd_id: ObjectId, payload: &[u8]) {
        let host = DmaAddr::from_pfn(0x400 + cmd_id as u64);
        self.dma.put_host(host, payload);
        self.send(HostCommand::CmdList(CmdListOp {
            ctx_id: CTX,
            cmd_id,
            destroy: false,
            is_first: true,
            is_last: true,
            size: payload.len() as u16,
            host_addr: host,
        }));
    }

    fn schedule_cmdlist(&self, cmd_id: ObjectId, edits: Option<&[u8]>) {
        let (size, host_addr) = match edits {
            Some(bytes) => {
                let host = DmaAddr::from_pfn(0x500 + cmd_id as u64);
                self.dma.put_host(host, bytes);
                (bytes.len() as u16, host)
            }
            None => (0, DmaAddr::null()),
        };
        self.send(HostCommand::ScheduleCmdList(ScheduleCmdListOp {
            ctx_id: CTX,
            cmd_id,
            is_first: true,
            is_last: true,
            size,
            host_addr,
        }));
    }

    fn query_errors(&self, cmd_id: Option<ObjectId>, clear: bool, host_pfn: u64) {
        self.send(HostCommand::ErrorList(ErrorListOp {
            ctx_id: CTX,
            cmd_id,
            clear,
            host_addr: DmaAddr::from_pfn(host_pfn),
        }));
    }
}

/// Command list of single copies over `copies`
fn copy_items(copies: &[ObjectId]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.u32(copies.len() as u32);
    for (i, id) in copies.iter().enumerate() {
        w.u32(i as u32).u8(0).u16(*id).u8(0).u64(0x100);
    }
    w.finish()
}

/// Context with devres 1 and four host-to-card copies over it
fn copy_setup(h: &Harness) -> (DriverHandle, Arc<CommandQueue>) {
    let (drv, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    for id in 1..=4 {
        h.create_copy(id, 1, 0x300 + id as u64, false);
    }
    h.events.take();
    (drv, rt)
}

// =============================================================================
// CONTEXTS
// =============================================================================

#[test]
fn test_context_lifecycle() {
    let h = Harness::new();
    let (drv, rt) = h.create_context(CTX);

    h.create_devres(&rt, 5);
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateDevresSuccess);
    assert_eq!(events[0].context, Some(CTX));
    assert_eq!(events[0].object, Some(5));
    let ctx = h.svc.context(CTX).unwrap();
    assert_eq!(ctx.find_devres(5).unwrap().status(), DevResStatus::Created);
    drop(ctx);

    h.devres(5, 0, true);
    assert_eq!(h.events.codes(), [EventCode::DestroyDevresSuccess]);
    assert_eq!(decode_handle(&pop(&rt, RemoteOpcode::DestroyDevres)), Ok(0x505));

    // Released only once the daemon and the runtime let go
    h.destroy_context(CTX);
    assert!(h.svc.context(CTX).is_none());
    assert!(h.events.codes().is_empty());
    h.svc.detach_runtime(drv).unwrap();
    assert!(h.events.codes().is_empty());
    h.svc.handle_runtime_notice(drv, RuntimeNotice::Done).unwrap();
    assert_eq!(h.events.codes(), [EventCode::DestroyContextSuccess]);

    h.create_context(CTX);
}

#[test]
fn test_duplicate_context() {
    let h = Harness::new();
    h.create_context(CTX);
    h.send(HostCommand::Context(ContextOp {
        ctx_id: CTX,
        destroy: false,
        recover: false,
        flags: 0,
    }));
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateContextFailed);
    assert_eq!(events[0].value, EventValue::AlreadyExist);
}

#[test]
fn test_context_needs_daemon() {
    let h = Harness::new();
    h.svc.detach_daemon();
    h.send(HostCommand::Context(ContextOp {
        ctx_id: 3,
        destroy: false,
        recover: false,
        flags: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateContextFailed);
    assert_eq!(events[0].value, EventValue::NoDaemon);
    assert!(h.svc.context(3).is_none());
}

#[test]
fn test_daemon_detach_fails_unread_create() {
    let h = Harness::new();
    h.send(HostCommand::Context(ContextOp {
        ctx_id: 2,
        destroy: false,
        recover: false,
        flags: 0,
    }));
    h.svc.detach_daemon();
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateContextFailed);
    assert_eq!(events[0].value, EventValue::NoDaemon);
    assert_eq!(events[0].context, Some(2));
    assert!(h.svc.context(2).is_none());
    assert_eq!(h.svc.attach_daemon().map(|_| ()), Ok(()));
}

#[test]
fn test_runtime_launch_failure() {
    let h = Harness::new();
    h.send(HostCommand::Context(ContextOp {
        ctx_id: CTX,
        destroy: false,
        recover: false,
        flags: 0,
    }));
    let req = CreateContextRequest::decode(&pop(&h.daemon, RemoteOpcode::CreateContext)).unwrap();
    h.svc
        .handle_runtime_notice(req.drv_handle, RuntimeNotice::LaunchFailed)
        .unwrap();
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateContextFailed);
    assert_eq!(events[0].value, EventValue::RuntimeLaunchFailed);
    assert_eq!(h.svc.attach_runtime(req.drv_handle).map(|_| ()), Err(Error::NoSuchContext));
}

#[test]
fn test_command_for_unknown_context() {
    let h = Harness::new();
    h.send(HostCommand::Sync(SyncOp { ctx_id: 7, seq: 1 }));
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateSyncFailed);
    assert_eq!(events[0].value, EventValue::NoSuchContext);
    assert_eq!(events[0].context, Some(7));
}

#[test]
fn test_undecodable_command_dropped() {
    let h = Harness::new();
    assert_eq!(h.svc.submit(&[]), Err(Error::MalformedCommand));
    assert_eq!(h.svc.submit(&[0x3f]), Err(Error::UnknownOpcode(0x3f)));
    assert!(h.events.take().is_empty());
}

#[test]
fn test_context_work_runs_in_order() {
    let h = Harness::new();
    let (_, _rt) = h.create_context(CTX);
    for id in 1..=3u16 {
        let cmd = HostCommand::Devres(DevresOp {
            ctx_id: CTX,
            devres_id: id,
            destroy: false,
            usage: UsageFlags::OUTPUT,
            size: id as u64 * 0x1000,
        });
        h.svc.submit(&cmd.encode()).unwrap();
    }
    assert_eq!(h.svc.run_pending(), 3);
    let sizes: Vec<u64> = (0..3)
        .map(|_| {
            AllocRequest::decode(&pop(&h.daemon, RemoteOpcode::AllocResource))
                .unwrap()
                .size
        })
        .collect();
    assert_eq!(sizes, [0x1000, 0x2000, 0x3000]);
}

// =============================================================================
// DEVICE RESOURCES
// =============================================================================

#[test]
fn test_devres_failures() {
    let h = Harness::new();
    let (_, _rt) = h.create_context(CTX);

    h.devres(9, 0, true);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::DestroyDevresFailed);
    assert_eq!(events[0].value, EventValue::NoSuchDevres);

    h.devres(2, 0x1000, false);
    let alloc = AllocRequest::decode(&pop(&h.daemon, RemoteOpcode::AllocResource)).unwrap();
    h.svc
        .handle_alloc_reply(AllocReply {
            drv_handle: alloc.drv_handle,
            status: RuntimeStatus::AllocFailed,
            buf_handle: 0,
            dma_addr: DmaAddr::null(),
        })
        .unwrap();
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateDevresFailed);
    assert_eq!(events[0].value, EventValue::NoMemory);
    assert!(h.svc.context(CTX).unwrap().find_devres(2).is_none());
    assert_eq!(h.svc.pending_replies(), 0);
}

#[test]
fn test_devres_reply_after_context_destroy() {
    let h = Harness::new();
    let (drv, rt) = h.create_context(CTX);
    h.devres(5, 0x1000, false);
    let alloc = AllocRequest::decode(&pop(&h.daemon, RemoteOpcode::AllocResource)).unwrap();

    h.destroy_context(CTX);
    assert!(h.svc.context(CTX).is_none());

    h.svc
        .handle_alloc_reply(AllocReply {
            drv_handle: alloc.drv_handle,
            status: RuntimeStatus::Ok,
            buf_handle: 0x42,
            dma_addr: devres_addr(5),
        })
        .unwrap();
    assert!(h.events.codes().is_empty());
    assert_eq!(decode_handle(&pop(&h.daemon, RemoteOpcode::FreeResource)), Ok(0x42));
    assert!(rt.try_pop().is_err());
    assert_eq!(h.svc.pending_replies(), 0);

    h.svc.detach_runtime(drv).unwrap();
    h.svc.handle_runtime_notice(drv, RuntimeNotice::Done).unwrap();
    assert_eq!(h.events.codes(), [EventCode::DestroyContextSuccess]);
}

#[test]
fn test_devres_destroyed_while_registering() {
    for status in [RuntimeStatus::Ok, RuntimeStatus::Failed] {
        let h = Harness::new();
        let (_, rt) = h.create_context(CTX);
        h.devres(5, 0x1000, false);
        let alloc = AllocRequest::decode(&pop(&h.daemon, RemoteOpcode::AllocResource)).unwrap();
        h.svc
            .handle_alloc_reply(AllocReply {
                drv_handle: alloc.drv_handle,
                status: RuntimeStatus::Ok,
                buf_handle: 0x105,
                dma_addr: devres_addr(5),
            })
            .unwrap();
        let create = CreateDevresRequest::decode(&pop(&rt, RemoteOpcode::CreateDevres)).unwrap();

        h.devres(5, 0, true);
        assert!(h.events.codes().is_empty());
        assert!(h.svc.context(CTX).unwrap().find_devres(5).is_none());

        h.svc
            .handle_create_reply(CreateReply {
                drv_handle: create.drv_handle,
                status,
                rt_handle: 0x505,
            })
            .unwrap();
        assert_eq!(h.events.codes(), [EventCode::DestroyDevresSuccess]);
        assert_eq!(h.svc.pending_replies(), 0);
        if status.is_ok() {
            assert_eq!(decode_handle(&pop(&rt, RemoteOpcode::DestroyDevres)), Ok(0x505));
        } else {
            assert_eq!(decode_handle(&pop(&h.daemon, RemoteOpcode::FreeResource)), Ok(0x105));
            assert!(rt.try_pop().is_err());
        }
    }
}

#[test]
fn test_daemon_detach_fails_pending_alloc() {
    let h = Harness::new();
    let (_, _rt) = h.create_context(CTX);
    h.devres(4, 0x1000, false);
    h.svc.detach_daemon();
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateDevresFailed);
    assert_eq!(events[0].value, EventValue::NoDevice);
}

// =============================================================================
// NETWORKS AND INFERENCE
// =============================================================================

#[test]
fn test_network_and_infreq_create() {
    let h = Harness::new();
    let (_, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    h.create_devres(&rt, 2);
    h.events.take();

    h.create_network(&rt, 7, &[1, 2]);
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateDevnetSuccess);
    assert_eq!(events[0].object, Some(7));
    let devnet = h.svc.context(CTX).unwrap().find_devnet(7).unwrap();
    assert_eq!(devnet.member_count(), 2);
    assert_eq!(devnet.rt_handle(), 0x907);

    h.create_infreq(&rt, 7, 3);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateInfreqSuccess);
    assert_eq!(events[0].object, Some(3));
    assert_eq!(events[0].object2, Some(7));
    assert!(devnet.find_infreq(3).is_some());
}

#[test]
fn test_network_destroyed_while_creating() {
    for status in [RuntimeStatus::Ok, RuntimeStatus::InvalidNetworkBinary] {
        let h = Harness::new();
        let (_, rt) = h.create_context(CTX);
        h.create_devres(&rt, 1);
        h.events.take();

        let req = h.start_network(&rt, 7, &[1]);
        h.destroy_network(7);
        assert!(h.events.codes().is_empty());
        assert!(h.svc.context(CTX).unwrap().find_devnet(7).is_none());

        h.svc
            .handle_create_reply(CreateReply {
                drv_handle: req.drv_handle,
                status,
                rt_handle: 0x907,
            })
            .unwrap();
        assert_eq!(h.events.codes(), [EventCode::DestroyDevnetSuccess]);
        assert_eq!(h.svc.pending_replies(), 0);
        if status.is_ok() {
            assert_eq!(decode_handle(&pop(&rt, RemoteOpcode::DestroyNetwork)), Ok(0x907));
        }
        assert!(rt.try_pop().is_err());
    }
}

#[test]
fn test_infreq_destroyed_while_creating() {
    for status in [RuntimeStatus::Ok, RuntimeStatus::NoMemory] {
        let h = Harness::new();
        let (_, rt) = h.create_context(CTX);
        h.create_devres(&rt, 1);
        h.create_network(&rt, 7, &[1]);
        h.events.take();

        let req = h.start_infreq(&rt, 7, 3);
        h.infreq(7, 3, true);
        assert!(h.events.codes().is_empty());

        h.svc
            .handle_create_reply(CreateReply {
                drv_handle: req.drv_handle,
                status,
                rt_handle: 0xa03,
            })
            .unwrap();
        let events = h.events.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, EventCode::DestroyInfreqSuccess);
        assert_eq!(events[0].object, Some(3));
        assert_eq!(h.svc.pending_replies(), 0);
        if status.is_ok() {
            assert_eq!(decode_handle(&pop(&rt, RemoteOpcode::DestroyInfreq)), Ok(0xa03));
        }
        assert!(rt.try_pop().is_err());
        assert!(h.svc.context(CTX).unwrap().find_devnet(7).unwrap().find_infreq(3).is_none());
    }
}

#[test]
fn test_chained_network_dma_failure() {
    let h = Harness::new();
    let (_, rt) = h.create_context(CTX);
    for id in 1..=3 {
        h.create_devres(&rt, id);
    }
    h.events.take();

    let (a, b, c) = (
        DmaAddr::from_pfn(0x200),
        DmaAddr::from_pfn(0x201),
        DmaAddr::from_pfn(0x202),
    );
    let third = ByteWriter::new().u16(3).bytes(&NET_CONFIG).finish();
    let second = ByteWriter::new().u16(2).u64(chain_trailer(c, third.len())).finish();
    let first = ByteWriter::new().u16(1).u64(chain_trailer(b, second.len())).finish();
    h.dma.put_host(a, &first);
    h.dma.put_host(b, &second);
    h.dma.put_host(c, &third);
    h.dma.fail_after(1);
    let free = h.svc.pool().stats().free_pages;

    h.send(HostCommand::Network(NetworkOp {
        ctx_id: CTX,
        net_id: 9,
        destroy: false,
        create: true,
        chained: true,
        num_res: 3,
        size: first.len() as u16,
        config_size: NET_CONFIG.len() as u16,
        start_res_idx: 0,
        host_addr: a,
    }));

    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::CreateDevnetFailed);
    assert_eq!(events[0].value, EventValue::DmaError);
    assert_eq!(events[0].object, Some(9));
    assert!(h.svc.context(CTX).unwrap().find_devnet(9).is_none());
    assert!(rt.try_pop().is_err());
    assert_eq!(h.svc.pool().stats().free_pages, free);
}

#[test]
fn test_chained_network_create() {
    let h = Harness::new();
    let (_, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    h.create_devres(&rt, 2);
    h.events.take();

    let (a, b) = (DmaAddr::from_pfn(0x210), DmaAddr::from_pfn(0x211));
    let second = ByteWriter::new().u16(2).bytes(&NET_CONFIG).finish();
    let first = ByteWriter::new().u16(1).u64(chain_trailer(b, second.len())).finish();
    h.dma.put_host(a, &first);
    h.dma.put_host(b, &second);
    h.send(HostCommand::Network(NetworkOp {
        ctx_id: CTX,
        net_id: 8,
        destroy: false,
        create: true,
        chained: true,
        num_res: 2,
        size: first.len() as u16,
        config_size: NET_CONFIG.len() as u16,
        start_res_idx: 0,
        host_addr: a,
    }));
    let req = CreateNetworkRequest::decode(&pop(&rt, RemoteOpcode::CreateNetwork)).unwrap();
    assert_eq!(req.resources, [0x501, 0x502]);
    assert_eq!(req.rt_handle, 0);
}

#[test]
fn test_reservation_and_property() {
    let h = Harness::new();
    let (_, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    h.create_network(&rt, 7, &[1]);
    h.events.take();

    h.send(HostCommand::Reservation(ReservationOp {
        ctx_id: CTX,
        net_id: 7,
        reserve: true,
        timeout: 100,
    }));
    let req =
        ReservationRequest::decode(&pop(&rt, RemoteOpcode::NetworkReservation)).unwrap();
    assert!(req.reserve);
    assert_eq!(req.net_rt_handle, 0x907);

    // A second edit while the first is outstanding
    h.send(HostCommand::Reservation(ReservationOp {
        ctx_id: CTX,
        net_id: 7,
        reserve: false,
        timeout: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::DevnetReleaseFailed);
    assert_eq!(events[0].value, EventValue::DevnetEditBusy);

    h.svc
        .handle_reservation_reply(ReservationReply {
            drv_handle: req.drv_handle,
            status: RuntimeStatus::Ok,
        })
        .unwrap();
    assert_eq!(h.events.codes(), [EventCode::DevnetReserveSuccess]);

    h.send(HostCommand::Property(PropertyOp {
        ctx_id: CTX,
        net_id: 7,
        property: 0,
        value: 1,
        timeout: 0,
    }));
    assert_eq!(h.events.codes(), [EventCode::DevnetSetPropertySuccess]);
    assert!(h.svc.context(CTX).unwrap().find_devnet(7).unwrap().is_serial());

    h.send(HostCommand::Property(PropertyOp {
        ctx_id: CTX,
        net_id: 7,
        property: 9,
        value: 1,
        timeout: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::DevnetSetPropertyFailed);
    assert_eq!(events[0].value, EventValue::NotSupported);
}

/// Context with a created network 7 holding infreq 3
fn infer_setup(h: &Harness) -> (DriverHandle, Arc<CommandQueue>) {
    let (drv, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    h.create_network(&rt, 7, &[1]);
    h.create_infreq(&rt, 7, 3);
    h.events.take();
    (drv, rt)
}

fn schedule_infer(h: &Harness, rt: &CommandQueue) -> ScheduleInfreqRequest {
    h.send(HostCommand::ScheduleInfreq(ScheduleInfreqOp {
        ctx_id: CTX,
        net_id: 7,
        infreq_id: 3,
        params: Some(SchedParams {
            batch_size: 4,
            priority: 1,
            ..SchedParams::default()
        }),
    }));
    ScheduleInfreqRequest::decode(&pop(rt, RemoteOpcode::ScheduleInfreq)).unwrap()
}

#[test]
fn test_infer_exec_done() {
    let h = Harness::new();
    let (_, rt) = infer_setup(&h);
    let req = schedule_infer(&h, &rt);
    assert_eq!(req.infreq_rt_handle, 0xa03);
    assert_eq!(req.params.map(|p| p.batch_size), Some(4));
    assert_eq!(h.svc.inflight(), 1);

    h.svc
        .handle_exec_done(ExecDoneReply {
            seq: req.seq,
            status: RuntimeStatus::Ok,
            message: Vec::new(),
        })
        .unwrap();
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::ExecuteInfreqSuccess);
    assert_eq!(events[0].object, Some(3));
    assert_eq!(events[0].object2, Some(7));
    assert_eq!(h.svc.inflight(), 0);
    assert_eq!(
        h.svc.handle_exec_done(ExecDoneReply {
            seq: req.seq,
            status: RuntimeStatus::Ok,
            message: Vec::new(),
        }),
        Err(Error::InvalidParameter)
    );
}

#[test]
fn test_infer_failure_breaks_and_recovers() {
    let h = Harness::new();
    let (_, rt) = infer_setup(&h);
    let req = schedule_infer(&h, &rt);
    h.svc
        .handle_exec_done(ExecDoneReply {
            seq: req.seq,
            status: RuntimeStatus::Failed,
            message: b"boom".to_vec(),
        })
        .unwrap();
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteInfreqFailed);
    assert_eq!(events[0].value, EventValue::InferExecError);
    let ctx = h.svc.context(CTX).unwrap();
    assert_eq!(ctx.state(), ContextState::BrokenRecoverable);

    h.devres(9, 0x1000, false);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateDevresFailed);
    assert_eq!(events[0].value, EventValue::ContextBroken);

    // The record reaches the host in one packet
    h.query_errors(None, false, 0x700);
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::ErrorListReply);
    assert_eq!(events[0].object, Some(14));
    assert_eq!(events[0].object2, Some(14));
    let packet = h.dma.host(DmaAddr::from_pfn(0x700)).unwrap();
    assert_eq!(packet[0], ExecKind::Infer as u8);
    assert_eq!(packet[1], EventValue::InferExecError.raw());
    assert_eq!(&packet[10..], b"boom");

    h.send(HostCommand::Context(ContextOp {
        ctx_id: CTX,
        destroy: false,
        recover: true,
        flags: 0,
    }));
    assert_eq!(h.events.codes(), [EventCode::RecoverContextSuccess]);
    assert_eq!(ctx.state(), ContextState::Ok);
}

#[test]
fn test_runtime_death_fails_inflight() {
    let h = Harness::new();
    let (drv, rt) = infer_setup(&h);
    schedule_infer(&h, &rt);

    h.svc.detach_runtime(drv).unwrap();
    let events = h.events.take();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].code, EventCode::ErrorRuntimeDied);
    assert_eq!(events[0].value, EventValue::RuntimeDied);
    assert_eq!(events[1].code, EventCode::ExecuteInfreqFailed);
    assert_eq!(events[1].value, EventValue::RuntimeDied);
    assert_eq!(h.svc.inflight(), 0);

    let ctx = h.svc.context(CTX).unwrap();
    assert_eq!(ctx.state(), ContextState::BrokenNonRecoverable);
    h.send(HostCommand::Context(ContextOp {
        ctx_id: CTX,
        destroy: false,
        recover: true,
        flags: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::RecoverContextFailed);
    assert_eq!(events[0].value, EventValue::ContextBroken);
}

// =============================================================================
// COPIES
// =============================================================================

#[test]
fn test_copy_through_dma() {
    let h = Harness::new();
    let (_, rt) = h.create_context(CTX);
    h.create_devres(&rt, 1);
    h.create_copy(2, 1, 0x310, true);
    assert_eq!(h.events.codes()[1..], [EventCode::CreateCopySuccess]);

    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 2,
        priority: 0,
        size: 0x80,
    }));
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::ExecuteCopySuccess);
    assert_eq!(events[0].object, Some(2));

    h.dma.fail_after(0);
    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 2,
        priority: 0,
        size: 0x80,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCopyFailed);
    assert_eq!(events[0].value, EventValue::DmaError);

    h.dma.refuse_after(0);
    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 2,
        priority: 0,
        size: 0x80,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCopyFailed);
    assert_eq!(events[0].value, EventValue::NoMemory);
}

#[test]
fn test_copy_needs_usable_devres() {
    let h = Harness::new();
    let (_, _rt) = h.create_context(CTX);
    h.create_copy(2, 1, 0x310, false);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateCopyFailed);
    assert_eq!(events[0].value, EventValue::NoSuchDevres);

    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 2,
        priority: 0,
        size: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCopyFailed);
    assert_eq!(events[0].value, EventValue::NoSuchCopy);
}

#[test]
fn test_sync_point_waits_for_completions() {
    let backend = ScriptedBackend::rejecting(&[]);
    let h = Harness::with_backend(backend.clone());
    copy_setup(&h);

    h.send(HostCommand::Sync(SyncOp { ctx_id: CTX, seq: 1 }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::SyncPointReached);
    assert_eq!(events[0].object, Some(1));

    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 1,
        priority: 0,
        size: 0,
    }));
    h.send(HostCommand::Sync(SyncOp { ctx_id: CTX, seq: 2 }));
    assert!(h.events.codes().is_empty());

    for req in backend.take() {
        h.svc.complete_exec(req, EventValue::NoError, &[]);
    }
    assert_eq!(
        h.events.codes(),
        [EventCode::ExecuteCopySuccess, EventCode::SyncPointReached]
    );
}

// =============================================================================
// COMMAND LISTS
// =============================================================================

#[test]
fn test_cmdlist_item_rejected() {
    let backend = ScriptedBackend::rejecting(&[2]);
    let h = Harness::with_backend(backend.clone());
    copy_setup(&h);

    h.create_cmdlist(9, &copy_items(&[1, 2, 3, 4]));
    assert_eq!(h.events.codes(), [EventCode::CreateCmdSuccess]);

    h.schedule_cmdlist(9, None);
    assert!(h.events.codes().is_empty());
    let held = backend.take();
    let indices: Vec<Option<u32>> = held.iter().map(|r| r.item_index()).collect();
    assert_eq!(indices, [Some(0), Some(1), Some(3)]);

    let cmd = h.svc.context(CTX).unwrap().find_cmdlist(9).unwrap();
    assert!(cmd.is_busy());
    {
        let errors = cmd.errors().lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.entries()[0].value, EventValue::NoMemory);
        assert_eq!(errors.entries()[0].obj, 3);
    }

    for req in held {
        h.svc.complete_exec(req, EventValue::NoError, &[]);
    }
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::ExecuteCmdComplete);
    assert_eq!(events[0].value, EventValue::ExecErrors);
    assert_eq!(events[0].object, Some(9));
    assert!(!cmd.is_busy());

    // The list keeps its errors until the host clears them
    h.query_errors(Some(9), false, 0x710);
    assert_eq!(h.events.codes(), [EventCode::ErrorListReply]);
    h.query_errors(Some(9), true, 0);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ErrorListCleared);
    assert_eq!(events[0].object, Some(9));
    h.query_errors(Some(9), false, 0x710);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ErrorListFailed);
    assert_eq!(events[0].value, EventValue::NoExecErrors);
}

#[test]
fn test_cmdlist_busy() {
    let backend = ScriptedBackend::rejecting(&[]);
    let h = Harness::with_backend(backend.clone());
    copy_setup(&h);
    h.create_cmdlist(9, &copy_items(&[1, 2]));
    h.events.take();

    h.schedule_cmdlist(9, None);
    h.schedule_cmdlist(9, None);
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].value, EventValue::CmdListBusy);

    for req in backend.take() {
        h.svc.complete_exec(req, EventValue::NoError, &[]);
    }
    let events = h.events.take();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, EventCode::ExecuteCmdComplete);
    assert_eq!(events[0].value, EventValue::NoError);
}

#[test]
fn test_cmdlist_schedule_edits() {
    let backend = ScriptedBackend::rejecting(&[]);
    let h = Harness::with_backend(backend.clone());
    copy_setup(&h);

    // Item 0 is a copy, item 1 a copy list over copies 2 and 3
    let payload = ByteWriter::new()
        .u32(2)
        .u32(0)
        .u8(0)
        .u16(1)
        .u8(0)
        .u64(0x100)
        .u32(1)
        .u8(2)
        .u16(2)
        .u32(1)
        .u8(0)
        .u16(2)
        .u8(0)
        .u64(0x100)
        .u32(1)
        .u8(0)
        .u16(3)
        .u8(1)
        .u64(0x100)
        .finish();
    h.create_cmdlist(9, &payload);
    assert_eq!(h.events.codes(), [EventCode::CreateCmdSuccess]);

    let edits = ByteWriter::new()
        .u32(2)
        .u32(0)
        .u8(0)
        .u8(2)
        .u64(0x40)
        .u32(1)
        .u8(2)
        .u16(1)
        .u8(2)
        .u64(0x20)
        .finish();
    h.schedule_cmdlist(9, Some(&edits));
    let held = backend.take();
    assert_eq!(held.len(), 2);
    assert_eq!(held[0].kind(), ExecKind::Copy);
    assert_eq!(held[0].priority(), 2);
    assert_eq!(held[0].chain().map(|c| c.total()), Some(0x40));
    assert_eq!(held[1].kind(), ExecKind::CopyList);
    assert_eq!(held[1].priority(), 3);
    let lens: Vec<u64> = held[1]
        .chain()
        .map(|c| c.entries().iter().map(|s| s.len).collect())
        .unwrap_or_default();
    assert_eq!(lens, [0x100, 0x20]);

    // Edits apply to one round only
    for req in held {
        h.svc.complete_exec(req, EventValue::NoError, &[]);
    }
    h.events.take();
    h.schedule_cmdlist(9, None);
    let held = backend.take();
    assert_eq!(held[0].chain().map(|c| c.total()), Some(0x100));
    assert_eq!(held[1].priority(), 1);
}

#[test]
fn test_cmdlist_bad_edits() {
    let backend = ScriptedBackend::rejecting(&[]);
    let h = Harness::with_backend(backend.clone());
    copy_setup(&h);
    h.create_cmdlist(9, &copy_items(&[1, 2]));
    h.events.take();

    // Keys must strictly increase
    let edits = ByteWriter::new()
        .u32(2)
        .u32(1)
        .u8(0)
        .u8(0)
        .u64(0x10)
        .u32(0)
        .u8(0)
        .u8(0)
        .u64(0x10)
        .finish();
    h.schedule_cmdlist(9, Some(&edits));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCmdComplete);
    assert_eq!(events[0].value, EventValue::ProtocolError);
    assert!(backend.take().is_empty());

    let unknown = ByteWriter::new().u32(1).u32(0).u8(7).finish();
    h.schedule_cmdlist(9, Some(&unknown));
    let events = h.events.take();
    assert_eq!(events[0].value, EventValue::NotSupported);
}

#[test]
fn test_cmdlist_create_failures() {
    let h = Harness::with_backend(ScriptedBackend::rejecting(&[]));
    copy_setup(&h);

    let unknown = ByteWriter::new().u32(1).u32(0).u8(7).finish();
    h.create_cmdlist(9, &unknown);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateCmdFailed);
    assert_eq!(events[0].value, EventValue::NotSupported);
    assert!(h.svc.context(CTX).unwrap().find_cmdlist(9).is_none());

    h.create_cmdlist(9, &copy_items(&[1, 8]));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::CreateCmdFailed);
    assert_eq!(events[0].value, EventValue::NoSuchCopy);

    h.schedule_cmdlist(9, None);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCmdComplete);
    assert_eq!(events[0].value, EventValue::NoSuchCmd);
}

#[test]
fn test_cmdlist_in_two_chunks() {
    let h = Harness::with_backend(ScriptedBackend::rejecting(&[]));
    copy_setup(&h);

    let first = ByteWriter::new().u32(2).u32(0).u8(0).u16(1).u8(0).u64(0x10).finish();
    let second = ByteWriter::new().u32(1).u8(0).u16(2).u8(0).u64(0x10).finish();
    let (a, b) = (DmaAddr::from_pfn(0x420), DmaAddr::from_pfn(0x421));
    h.dma.put_host(a, &first);
    h.dma.put_host(b, &second);
    h.send(HostCommand::CmdList(CmdListOp {
        ctx_id: CTX,
        cmd_id: 4,
        destroy: false,
        is_first: true,
        is_last: false,
        size: first.len() as u16,
        host_addr: a,
    }));
    assert!(h.events.codes().is_empty());
    h.send(HostCommand::CmdList(CmdListOp {
        ctx_id: CTX,
        cmd_id: 4,
        destroy: false,
        is_first: false,
        is_last: true,
        size: second.len() as u16,
        host_addr: b,
    }));
    assert_eq!(h.events.codes(), [EventCode::CreateCmdSuccess]);
    let cmd = h.svc.context(CTX).unwrap().find_cmdlist(4).unwrap();
    assert_eq!(cmd.items().len(), 2);

    drop(cmd);
    h.send(HostCommand::CmdList(CmdListOp {
        ctx_id: CTX,
        cmd_id: 4,
        destroy: true,
        is_first: false,
        is_last: false,
        size: 0,
        host_addr: DmaAddr::null(),
    }));
    assert_eq!(h.events.codes(), [EventCode::DestroyCmdSuccess]);
}

#[test]
fn test_cmdlist_chunks_sent_back_to_back() {
    let h = Harness::with_backend(ScriptedBackend::rejecting(&[]));
    copy_setup(&h);

    let first = ByteWriter::new().u32(2).u32(0).u8(0).u16(1).u8(0).u64(0x10).finish();
    let second = ByteWriter::new().u32(1).u8(0).u16(2).u8(0).u64(0x10).finish();
    let (a, b) = (DmaAddr::from_pfn(0x430), DmaAddr::from_pfn(0x431));
    h.dma.put_host(a, &first);
    h.dma.put_host(b, &second);
    let chunk = |is_first: bool, bytes: &[u8], host_addr: DmaAddr| {
        HostCommand::CmdList(CmdListOp {
            ctx_id: CTX,
            cmd_id: 6,
            destroy: false,
            is_first,
            is_last: !is_first,
            size: bytes.len() as u16,
            host_addr,
        })
    };

    // Both chunks are in flight before either lands; the later one
    // finishes first
    h.post(chunk(true, &first, a));
    h.post(chunk(false, &second, b));
    assert!(h.events.codes().is_empty());
    assert_eq!(h.dma.complete_newest_first(), 2);
    h.settle();
    assert_eq!(h.events.codes(), [EventCode::CreateCmdSuccess]);

    let cmd = h.svc.context(CTX).unwrap().find_cmdlist(6).unwrap();
    let ids: Vec<ObjectId> = cmd
        .items()
        .iter()
        .map(|item| match item {
            CmdItem::Copy { copy, .. } => copy.id(),
            _ => panic!("expected copies"),
        })
        .collect();
    assert_eq!(ids, [1, 2]);

    h.send(chunk(false, &second, b));
    assert_eq!(h.events.codes(), [EventCode::CreateCmdFailed]);
    assert_eq!(cmd.status(), CmdListStatus::Created);
}

// =============================================================================
// CHANNEL CONTEXTS
// =============================================================================

#[test]
fn test_error_list_through_ring() {
    let backend = ScriptedBackend::rejecting(&[0]);
    let h = Harness::with_backend(backend);
    copy_setup(&h);
    let ring = MockRing::new(DmaAddr::from_pfn(0x800));
    h.svc.attach_host_ring(CTX, ring.clone()).unwrap();

    h.send(HostCommand::ScheduleCopy(ScheduleCopyOp {
        ctx_id: CTX,
        copy_id: 3,
        priority: 0,
        size: 0,
    }));
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ExecuteCopyFailed);
    assert_eq!(events[0].value, EventValue::NoMemory);

    h.query_errors(None, false, 0);
    let events = h.events.take();
    assert_eq!(events[0].code, EventCode::ErrorListReply);
    assert_eq!(ring.avail.load(Ordering::Relaxed), 10);
    let packet = h.dma.host(DmaAddr::from_pfn(0x800)).unwrap();
    assert_eq!(packet[0], ExecKind::Copy as u8);
    assert_eq!(packet[2], 3);

    // Host chunks of a channel context come from the ring
    let payload = copy_items(&[1]);
    h.dma.put_host(DmaAddr::from_pfn(0x801), &payload);
    h.create_cmdlist(9, &payload);
    assert_eq!(h.events.codes(), [EventCode::CreateCmdSuccess]);
    assert_eq!(ring.freed.load(Ordering::Relaxed), payload.len());
}
