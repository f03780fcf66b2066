//! # Command Lists
//!
//! A command list is built once from one or more staged chunks and can then
//! be scheduled any number of times.
//!
//! ## Body layout
//!
//! The first chunk starts with the item count (u32). Items follow, each
//! introduced by its index (u32) and a kind byte:
//!
//! | Kind | Body |
//! |---|---|
//! | 0 Copy | copy id u16, priority u8, size u64 (0 = whole resource) |
//! | 1 Infer | net id u16, infreq id u16, no-params u8, then unless set: batch u16, priority u8, debug u8, collect u8 |
//! | 2 CopyList | member count u16; the members follow as Copy records carrying the list's index |
//!
//! Items never straddle a chunk boundary. The host may send the next chunk
//! before the previous one finished staging; chunks are numbered when
//! accepted and reach the builder in that order whatever order their
//! transfers complete in.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{Error, EventCode, EventReport, EventValue, ObjectId, Result};
use cinder_dma::{PageLease, SgChain, XferStatus};
use spin::Mutex;

use crate::codec::ByteReader;
use crate::context::Context;
use crate::copy::CopyHandle;
use crate::errlist::ErrorList;
use crate::exec::ExecKind;
use crate::infreq::InfReq;
use crate::object::{DestroyReason, Indexed, Lifecycle};
use crate::protocol::{CmdListOp, SchedParams};
use crate::sched::EditBuilder;
use crate::service::InferenceService;

/// Copy item kind byte
pub const ITEM_COPY: u8 = 0;
/// Inference item kind byte
pub const ITEM_INFER: u8 = 1;
/// Copy-list item kind byte
pub const ITEM_COPY_LIST: u8 = 2;

// =============================================================================
// ITEMS
// =============================================================================

/// One member copy of a copy list
#[derive(Clone)]
pub struct CopyListMember {
    /// Copy handle
    pub copy: Arc<CopyHandle>,
    /// Priority given at build time
    pub priority: u8,
    /// Bytes, 0 for the whole resource
    pub size: u64,
}

/// Copies batched into one scatter-gather transfer
pub struct CopyListTemplate {
    members: Vec<CopyListMember>,
    /// Built on first schedule without overrides
    chain: Mutex<Option<Arc<SgChain>>>,
}

impl CopyListTemplate {
    fn new(members: Vec<CopyListMember>) -> Self {
        Self {
            members,
            chain: Mutex::new(None),
        }
    }

    /// Member copies in order
    pub fn members(&self) -> &[CopyListMember] {
        &self.members
    }

    /// OR of the member priorities
    pub fn priority(&self) -> u8 {
        self.members.iter().fold(0, |p, m| p | m.priority)
    }

    /// Chain over the members as built
    pub fn chain(&self) -> Arc<SgChain> {
        let mut slot = self.chain.lock();
        slot.get_or_insert_with(|| {
            Arc::new(SgChain::build(
                self.members.iter().map(|m| m.copy.segment(m.size)),
            ))
        })
        .clone()
    }

    /// Chain over the members with per-member sizes
    pub fn chain_with(&self, sizes: &[u64]) -> SgChain {
        SgChain::build(
            self.members
                .iter()
                .zip(sizes)
                .map(|(m, size)| m.copy.segment(*size)),
        )
    }

    /// Whether the lazy chain was built
    pub fn has_cached_chain(&self) -> bool {
        self.chain.lock().is_some()
    }
}

/// One item of a command list
#[derive(Clone)]
pub enum CmdItem {
    /// Single copy
    Copy {
        copy: Arc<CopyHandle>,
        priority: u8,
        size: u64,
    },
    /// Batched copies
    CopyList(Arc<CopyListTemplate>),
    /// Inference invocation
    Infer {
        infreq: Arc<InfReq>,
        params: Option<SchedParams>,
    },
}

impl CmdItem {
    /// Execution kind
    pub fn kind(&self) -> ExecKind {
        match self {
            Self::Copy { .. } => ExecKind::Copy,
            Self::CopyList(_) => ExecKind::CopyList,
            Self::Infer { .. } => ExecKind::Infer,
        }
    }
}

// =============================================================================
// BUILDER
// =============================================================================

struct OpenCopyList {
    index: u32,
    remaining: u16,
    members: Vec<CopyListMember>,
}

/// Decodes command list items across chunks
pub(crate) struct ListBuilder {
    expected: u32,
    items: Vec<CmdItem>,
    open: Option<OpenCopyList>,
}

impl ListBuilder {
    /// Read the item count at the start of the first chunk
    pub(crate) fn start(r: &mut ByteReader<'_>, max_items: usize) -> Result<Self> {
        let expected = r.u32()?;
        if expected == 0 {
            return Err(Error::NotSupported);
        }
        if expected as usize > max_items {
            return Err(Error::PayloadTooLarge);
        }
        let mut items = Vec::new();
        items
            .try_reserve(expected as usize)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            expected,
            items,
            open: None,
        })
    }

    /// Decode every item left in `r`
    pub(crate) fn feed(&mut self, ctx: &Context, r: &mut ByteReader<'_>) -> Result<()> {
        while !r.is_empty() {
            let index = r.u32()?;
            let kind = r.u8()?;

            if let Some(open) = self.open.as_mut() {
                if kind != ITEM_COPY || index != open.index {
                    return Err(Error::MalformedCommand);
                }
                open.members.push(read_copy(ctx, r)?);
                open.remaining -= 1;
                if open.remaining == 0 {
                    if let Some(done) = self.open.take() {
                        let template = CopyListTemplate::new(done.members);
                        self.items.push(CmdItem::CopyList(Arc::new(template)));
                    }
                }
                continue;
            }

            if index as usize != self.items.len() || index >= self.expected {
                return Err(Error::MalformedCommand);
            }
            match kind {
                ITEM_COPY => {
                    let m = read_copy(ctx, r)?;
                    self.items.push(CmdItem::Copy {
                        copy: m.copy,
                        priority: m.priority,
                        size: m.size,
                    });
                }
                ITEM_INFER => {
                    let net_id = r.u16()?;
                    let infreq_id = r.u16()?;
                    let params = read_params(r)?;
                    let infreq = ctx
                        .find_devnet(net_id)
                        .ok_or(Error::NoSuchNetwork)?
                        .find_infreq(infreq_id)
                        .filter(|i| i.is_usable())
                        .ok_or(Error::NoSuchInfreq)?;
                    self.items.push(CmdItem::Infer { infreq, params });
                }
                ITEM_COPY_LIST => {
                    let n = r.u16()?;
                    if n == 0 {
                        return Err(Error::MalformedCommand);
                    }
                    self.open = Some(OpenCopyList {
                        index,
                        remaining: n,
                        members: Vec::with_capacity(n as usize),
                    });
                }
                other => return Err(Error::UnknownItemKind(other)),
            }
        }
        Ok(())
    }

    /// Check that every announced item arrived
    pub(crate) fn finish(self) -> Result<Vec<CmdItem>> {
        if self.open.is_some() || self.items.len() != self.expected as usize {
            return Err(Error::MalformedCommand);
        }
        Ok(self.items)
    }
}

fn read_copy(ctx: &Context, r: &mut ByteReader<'_>) -> Result<CopyListMember> {
    let copy_id = r.u16()?;
    let priority = r.u8()?;
    let size = r.u64()?;
    let copy = ctx.find_copy(copy_id).ok_or(Error::NoSuchCopy)?;
    Ok(CopyListMember {
        copy,
        priority,
        size,
    })
}

/// Inference parameters: a no-params byte, then the fields unless it is set
pub(crate) fn read_params(r: &mut ByteReader<'_>) -> Result<Option<SchedParams>> {
    if r.u8()? != 0 {
        return Ok(None);
    }
    Ok(Some(SchedParams {
        batch_size: r.u16()?,
        priority: r.u8()?,
        debug_on: r.u8()? != 0,
        collect_info: r.u8()? != 0,
    }))
}

// =============================================================================
// COMMAND LIST
// =============================================================================

/// Build progress of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdListStatus {
    /// First chunk being staged
    CreateStarted,
    /// More chunks expected
    PayloadStaged,
    /// Schedulable
    Created,
}

/// Body chunk whose transfer finished
struct StagedChunk {
    bytes: Vec<u8>,
    last: bool,
}

pub(crate) struct CmdListState {
    pub(crate) status: CmdListStatus,
    pub(crate) items: Arc<Vec<CmdItem>>,
    builder: Option<ListBuilder>,
    /// Chunks accepted so far; the next one gets this sequence
    opened: u32,
    /// The last chunk was accepted
    closed: bool,
    /// Sequence of the next chunk the builder consumes
    next_feed: u32,
    /// Chunks whose transfer finished ahead of their turn
    arrived: BTreeMap<u32, StagedChunk>,
    /// Some completion is feeding chunks to the builder
    feeding: bool,
    /// Schedule-time edits being staged
    pub(crate) edits: Option<EditBuilder>,
}

/// A pre-built sequence of copies and inference invocations
pub struct CmdList {
    id: ObjectId,
    ctx: Arc<Context>,
    life: Lifecycle,
    pub(crate) state: Mutex<CmdListState>,
    /// Items of the current schedule not yet reported, plus one while
    /// items are being submitted
    pub(crate) pending: AtomicU32,
    /// Some item of the current schedule failed
    pub(crate) failed: AtomicBool,
    errors: Mutex<ErrorList>,
}

impl CmdList {
    fn new(id: ObjectId, ctx: Arc<Context>) -> Self {
        Self {
            id,
            ctx,
            life: Lifecycle::new(),
            state: Mutex::new(CmdListState {
                status: CmdListStatus::CreateStarted,
                items: Arc::new(Vec::new()),
                builder: None,
                opened: 0,
                closed: false,
                next_feed: 0,
                arrived: BTreeMap::new(),
                feeding: false,
                edits: None,
            }),
            pending: AtomicU32::new(0),
            failed: AtomicBool::new(false),
            errors: Mutex::new(ErrorList::new()),
        }
    }

    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Build progress
    pub fn status(&self) -> CmdListStatus {
        self.state.lock().status
    }

    /// Items, empty until created
    pub fn items(&self) -> Arc<Vec<CmdItem>> {
        self.state.lock().items.clone()
    }

    /// Whether a schedule is still running
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Whether the list was destroyed or rolled back
    pub fn is_destroyed(&self) -> bool {
        self.life.is_destroyed()
    }

    pub(crate) fn errors(&self) -> &Mutex<ErrorList> {
        &self.errors
    }

    pub(crate) fn report(&self, code: EventCode, value: EventValue) {
        self.ctx.report(EventReport::new(code, value).object(self.id));
    }
}

impl CmdListState {
    /// Sequence number for a new body chunk
    fn open_chunk(&mut self, last: bool) -> Result<u32> {
        if self.status == CmdListStatus::Created || self.closed {
            return Err(Error::MalformedCommand);
        }
        let seq = self.opened;
        self.opened += 1;
        self.closed = last;
        Ok(seq)
    }
}

impl Indexed for CmdList {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn life(&self) -> &Lifecycle {
        &self.life
    }
}

impl Drop for CmdList {
    fn drop(&mut self) {
        if self.life.host_destroyed() {
            self.report(EventCode::DestroyCmdSuccess, EventValue::NoError);
        }
    }
}

fn create_failure_value(e: Error) -> EventValue {
    match e {
        Error::NotSupported | Error::UnknownItemKind(_) => EventValue::NotSupported,
        e => e.into(),
    }
}

impl InferenceService {
    pub(crate) fn cmdlist_op(self: &Arc<Self>, ctx: &Arc<Context>, op: CmdListOp) {
        if op.destroy {
            let taken = ctx.remove_children(|c| c.cmdlists.take(op.cmd_id, DestroyReason::Host));
            if taken.is_none() {
                ctx.report(
                    EventReport::new(EventCode::DestroyCmdFailed, EventValue::NoSuchCmd)
                        .object(op.cmd_id),
                );
            }
            return;
        }
        let (cmd, seq) = match self.open_cmdlist_chunk(ctx, &op) {
            Ok(opened) => opened,
            Err(e) => {
                ctx.report(
                    EventReport::new(EventCode::CreateCmdFailed, create_failure_value(e))
                        .object(op.cmd_id),
                );
                return;
            }
        };
        if op.size == 0 {
            self.fail_cmdlist_create(&cmd, EventValue::ProtocolError);
            return;
        }
        let size = op.size as usize;
        let src = match self.host_chunk(ctx, op.host_addr, size) {
            Ok(src) => src,
            Err(e) => {
                self.fail_cmdlist_create(&cmd, e.into());
                return;
            }
        };
        let lease = self.pool.acquire();
        let list = cmd.clone();
        let last = op.is_last;
        let staged = self.stage_in(lease, src, size, move |svc, lease, status| {
            svc.cmdlist_chunk_done(list, lease, size, seq, last, status)
        });
        if let Err(e) = staged {
            self.chunk_consumed(ctx, size);
            self.fail_cmdlist_create(&cmd, e.into());
        }
    }

    /// Find or create the list a chunk belongs to and number the chunk
    ///
    /// Later chunks may be sent before earlier ones finished staging.
    fn open_cmdlist_chunk(
        &self,
        ctx: &Arc<Context>,
        op: &CmdListOp,
    ) -> Result<(Arc<CmdList>, u32)> {
        ctx.check_usable()?;
        let cmd = if op.is_first {
            let cmd = Arc::new(CmdList::new(op.cmd_id, ctx.clone()));
            ctx.with_children(|c| c.cmdlists.insert(&cmd))??;
            cmd
        } else {
            ctx.find_cmdlist(op.cmd_id).ok_or(Error::NoSuchCmdList)?
        };
        let seq = cmd.state.lock().open_chunk(op.is_last)?;
        Ok((cmd, seq))
    }

    #[allow(clippy::too_many_arguments)]
    fn cmdlist_chunk_done(
        &self,
        cmd: Arc<CmdList>,
        lease: PageLease,
        size: usize,
        seq: u32,
        last: bool,
        status: XferStatus,
    ) {
        self.chunk_consumed(cmd.ctx(), size);
        if !status.is_ok() {
            self.release_page(lease);
            self.fail_cmdlist_create(&cmd, EventValue::DmaError);
            return;
        }
        if cmd.is_destroyed() {
            self.release_page(lease);
            return;
        }
        let bytes = self.pool.read_vec(lease.handle, size);
        self.release_page(lease);
        let result = bytes.and_then(|bytes| self.consume_cmdlist_chunk(&cmd, seq, bytes, last));
        if let Err(e) = result {
            log::debug!("cinder: cmdlist {} chunk rejected: {}", cmd.id, e);
            self.fail_cmdlist_create(&cmd, create_failure_value(e));
        }
    }

    /// Queue a staged chunk and feed every chunk whose turn has come
    ///
    /// Only one completion feeds at a time; the others leave their chunk
    /// behind for it.
    fn consume_cmdlist_chunk(&self, cmd: &CmdList, seq: u32, bytes: Vec<u8>, last: bool) -> Result<()> {
        {
            let mut st = cmd.state.lock();
            st.arrived.insert(seq, StagedChunk { bytes, last });
            if st.feeding {
                return Ok(());
            }
            st.feeding = true;
        }
        loop {
            let (seq, chunk, held) = {
                let mut st = cmd.state.lock();
                let seq = st.next_feed;
                let Some(chunk) = st.arrived.remove(&seq) else {
                    st.feeding = false;
                    return Ok(());
                };
                st.next_feed += 1;
                (seq, chunk, st.builder.take())
            };
            self.feed_cmdlist_chunk(cmd, seq, &chunk, held)?;
        }
    }

    fn feed_cmdlist_chunk(
        &self,
        cmd: &CmdList,
        seq: u32,
        chunk: &StagedChunk,
        held: Option<ListBuilder>,
    ) -> Result<()> {
        let mut r = ByteReader::new(&chunk.bytes);
        let mut builder = match (held, seq) {
            (None, 0) => ListBuilder::start(&mut r, self.config.max_cmdlist_items)?,
            (Some(b), s) if s > 0 => b,
            _ => return Err(Error::MalformedCommand),
        };
        builder.feed(&cmd.ctx, &mut r)?;

        if !chunk.last {
            let mut st = cmd.state.lock();
            st.builder = Some(builder);
            st.status = CmdListStatus::PayloadStaged;
            return Ok(());
        }
        let items = builder.finish()?;
        let live = cmd.ctx.finalize_if_live(&cmd.life, || {
            let mut st = cmd.state.lock();
            st.items = Arc::new(items);
            st.status = CmdListStatus::Created;
        });
        if live {
            cmd.report(EventCode::CreateCmdSuccess, EventValue::NoError);
        }
        Ok(())
    }

    /// Unindex a list whose build failed and report it unless the host
    /// destroyed it meanwhile
    fn fail_cmdlist_create(&self, cmd: &Arc<CmdList>, value: EventValue) {
        {
            let mut st = cmd.state.lock();
            st.builder = None;
            st.arrived.clear();
            st.feeding = false;
        }
        let (was_live, taken) = cmd.ctx.remove_children(|c| {
            let live = !cmd.is_destroyed();
            (live, c.cmdlists.take_exact(cmd, DestroyReason::CreateFailed))
        });
        drop(taken);
        if was_live {
            cmd.report(EventCode::CreateCmdFailed, value);
        }
    }
}
