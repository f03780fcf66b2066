//! # Scheduling
//!
//! Standalone copies and inferences become one execution each. A command
//! list schedule clones every item into its own execution, applying the
//! schedule's edits to the clone only; the list itself never changes.
//!
//! ## Edit layout
//!
//! The first chunk starts with the edit count (u32). Each edit names its
//! item (u32) and a kind byte, sorted by item and member:
//!
//! | Kind | Body |
//! |---|---|
//! | 0 Copy | priority u8, size u64 |
//! | 1 Infer | no-params u8, then unless set: batch u16, priority u8, debug u8, collect u8 |
//! | 2 CopyListMember | member u16, priority u8, size u64 |
//!
//! ## Round accounting
//!
//! `pending` holds one guard while items are being submitted plus one per
//! submitted item. The round is reported when it drops to zero, so the
//! report never fires before every item was submitted.

use core::sync::atomic::Ordering;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{Error, EventCode, EventValue, Result};
use cinder_dma::{PageLease, SgChain, XferStatus};

use crate::cmdlist::{read_params, CmdItem, CmdList, CmdListStatus, CopyListTemplate};
use crate::codec::ByteReader;
use crate::context::Context;
use crate::exec::ExecWork;
use crate::object::Indexed;
use crate::protocol::{HostCommand, SchedParams, ScheduleCmdListOp, ScheduleCopyOp, ScheduleInfreqOp};
use crate::service::InferenceService;

/// Copy edit kind byte
pub const EDIT_COPY: u8 = 0;
/// Inference edit kind byte
pub const EDIT_INFER: u8 = 1;
/// Copy-list member edit kind byte
pub const EDIT_COPY_LIST_MEMBER: u8 = 2;

/// Override for one item of one schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    /// New priority and size of a copy
    Copy { priority: u8, size: u64 },
    /// New parameters of an inference
    Infer { params: Option<SchedParams> },
    /// New priority and size of one copy-list member
    CopyListMember { member: u16, priority: u8, size: u64 },
}

/// Edit bound to its item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemEdit {
    /// Item index
    pub index: u32,
    /// Override
    pub edit: Edit,
}

// =============================================================================
// EDIT DECODING
// =============================================================================

/// Decodes schedule edits across chunks
pub(crate) struct EditBuilder {
    expected: u32,
    edits: Vec<ItemEdit>,
    /// Sort key of the last edit
    last: Option<(u32, u16)>,
}

impl EditBuilder {
    pub(crate) fn start(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            expected: r.u32()?,
            edits: Vec::new(),
            last: None,
        })
    }

    /// Decode and validate every edit left in `r` against `items`
    pub(crate) fn feed(&mut self, items: &[CmdItem], r: &mut ByteReader<'_>) -> Result<()> {
        while !r.is_empty() {
            if self.edits.len() >= self.expected as usize {
                return Err(Error::MalformedCommand);
            }
            let index = r.u32()?;
            let kind = r.u8()?;
            let item = items.get(index as usize).ok_or(Error::MalformedCommand)?;
            let edit = match (kind, item) {
                (EDIT_COPY, CmdItem::Copy { .. }) => Edit::Copy {
                    priority: r.u8()?,
                    size: r.u64()?,
                },
                (EDIT_INFER, CmdItem::Infer { .. }) => Edit::Infer {
                    params: read_params(r)?,
                },
                (EDIT_COPY_LIST_MEMBER, CmdItem::CopyList(list)) => {
                    let member = r.u16()?;
                    if member as usize >= list.members().len() {
                        return Err(Error::MalformedCommand);
                    }
                    Edit::CopyListMember {
                        member,
                        priority: r.u8()?,
                        size: r.u64()?,
                    }
                }
                (k, _) if k > EDIT_COPY_LIST_MEMBER => return Err(Error::UnknownItemKind(k)),
                _ => return Err(Error::MalformedCommand),
            };
            let key = match edit {
                Edit::CopyListMember { member, .. } => (index, member),
                _ => (index, 0),
            };
            if self.last.is_some_and(|last| key <= last) {
                return Err(Error::MalformedCommand);
            }
            self.last = Some(key);
            self.edits.push(ItemEdit { index, edit });
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Vec<ItemEdit>> {
        if self.edits.len() != self.expected as usize {
            return Err(Error::MalformedCommand);
        }
        Ok(self.edits)
    }
}

// =============================================================================
// APPLYING EDITS
// =============================================================================

/// Build the execution of one item with its edits applied
fn build_work(item: &CmdItem, edits: &[ItemEdit]) -> (ExecWork, u8) {
    match item {
        CmdItem::Copy {
            copy,
            priority,
            size,
        } => {
            let (priority, size) = edits
                .iter()
                .rev()
                .find_map(|e| match e.edit {
                    Edit::Copy { priority, size } => Some((priority, size)),
                    _ => None,
                })
                .unwrap_or((*priority, *size));
            let chain = SgChain::build([copy.segment(size)]);
            let work = ExecWork::Copy {
                copy: copy.clone(),
                chain,
            };
            (work, priority)
        }
        CmdItem::CopyList(list) => copy_list_work(list, edits),
        CmdItem::Infer { infreq, params } => {
            let params = edits
                .iter()
                .rev()
                .find_map(|e| match e.edit {
                    Edit::Infer { params } => Some(params),
                    _ => None,
                })
                .unwrap_or(*params);
            let work = ExecWork::Infer {
                infreq: infreq.clone(),
                params,
            };
            (work, params.map_or(0, |p| p.priority))
        }
    }
}

/// Priority is the OR over every member of its build-time priority and
/// any override; the chain is rebuilt only when a size was overridden
fn copy_list_work(list: &Arc<CopyListTemplate>, edits: &[ItemEdit]) -> (ExecWork, u8) {
    let mut priority = list.priority();
    let mut sizes: Option<Vec<u64>> = None;
    for e in edits {
        if let Edit::CopyListMember {
            member,
            priority: p,
            size,
        } = e.edit
        {
            priority |= p;
            let sizes = sizes.get_or_insert_with(|| list.members().iter().map(|m| m.size).collect());
            if let Some(slot) = sizes.get_mut(member as usize) {
                *slot = size;
            }
        }
    }
    let chain = match sizes {
        Some(sizes) => Arc::new(list.chain_with(&sizes)),
        None => list.chain(),
    };
    let work = ExecWork::CopyList {
        list: list.clone(),
        chain,
    };
    (work, priority)
}

// =============================================================================
// SERVICE OPERATIONS
// =============================================================================

impl InferenceService {
    pub(crate) fn schedule_copy_op(self: &Arc<Self>, ctx: &Arc<Context>, op: ScheduleCopyOp) {
        let copy = ctx
            .check_usable()
            .and_then(|_| ctx.find_copy(op.copy_id).ok_or(Error::NoSuchCopy));
        match copy {
            Ok(copy) => {
                let chain = SgChain::build([copy.segment(op.size)]);
                let req = self.new_exec(ctx, ExecWork::Copy { copy, chain }, op.priority, None);
                self.start_exec(req);
            }
            Err(e) => ctx.report(HostCommand::ScheduleCopy(op).rejection(e.into())),
        }
    }

    pub(crate) fn schedule_infreq_op(self: &Arc<Self>, ctx: &Arc<Context>, op: ScheduleInfreqOp) {
        let infreq = ctx.check_usable().and_then(|_| {
            ctx.find_devnet(op.net_id)
                .ok_or(Error::NoSuchNetwork)?
                .find_infreq(op.infreq_id)
                .filter(|i| i.is_usable())
                .ok_or(Error::NoSuchInfreq)
        });
        match infreq {
            Ok(infreq) => {
                let priority = op.params.map_or(0, |p| p.priority);
                let work = ExecWork::Infer {
                    infreq,
                    params: op.params,
                };
                let req = self.new_exec(ctx, work, priority, None);
                self.start_exec(req);
            }
            Err(e) => ctx.report(HostCommand::ScheduleInfreq(op).rejection(e.into())),
        }
    }

    pub(crate) fn schedule_cmdlist_op(self: &Arc<Self>, ctx: &Arc<Context>, op: ScheduleCmdListOp) {
        let cmd = match ctx.find_cmdlist(op.cmd_id) {
            Some(cmd) if cmd.status() == CmdListStatus::Created => cmd,
            _ => {
                ctx.report(HostCommand::ScheduleCmdList(op).rejection(EventValue::NoSuchCmd));
                return;
            }
        };
        if op.size == 0 {
            if op.is_first && op.is_last {
                self.schedule_cmdlist(&cmd, &[]);
            } else {
                self.fail_schedule(&cmd, EventValue::ProtocolError);
            }
            return;
        }
        let size = op.size as usize;
        let src = match self.host_chunk(ctx, op.host_addr, size) {
            Ok(src) => src,
            Err(e) => {
                self.fail_schedule(&cmd, e.into());
                return;
            }
        };
        let lease = self.pool.acquire();
        let list = cmd.clone();
        let (first, last) = (op.is_first, op.is_last);
        let staged = self.stage_in(lease, src, size, move |svc, lease, status| {
            svc.edit_chunk_done(list, lease, size, first, last, status)
        });
        if let Err(e) = staged {
            self.chunk_consumed(ctx, size);
            self.fail_schedule(&cmd, e.into());
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_chunk_done(
        self: &Arc<Self>,
        cmd: Arc<CmdList>,
        lease: PageLease,
        size: usize,
        first: bool,
        last: bool,
        status: XferStatus,
    ) {
        self.chunk_consumed(cmd.ctx(), size);
        if !status.is_ok() {
            self.release_page(lease);
            self.fail_schedule(&cmd, EventValue::DmaError);
            return;
        }
        let bytes = self.pool.read_vec(lease.handle, size);
        self.release_page(lease);
        if cmd.is_destroyed() {
            return;
        }
        match bytes.and_then(|bytes| consume_edit_chunk(&cmd, &bytes, first, last)) {
            Ok(Some(edits)) => self.schedule_cmdlist(&cmd, &edits),
            Ok(None) => {}
            Err(e) => {
                log::debug!("cinder: schedule edits rejected: {}", e);
                let value = match e {
                    Error::UnknownItemKind(_) => EventValue::NotSupported,
                    e => e.into(),
                };
                self.fail_schedule(&cmd, value);
            }
        }
    }

    fn fail_schedule(&self, cmd: &CmdList, value: EventValue) {
        cmd.state.lock().edits = None;
        cmd.report(EventCode::ExecuteCmdComplete, value);
    }

    /// Run one round of `cmd` with `edits` applied
    pub(crate) fn schedule_cmdlist(self: &Arc<Self>, cmd: &Arc<CmdList>, edits: &[ItemEdit]) {
        let ctx = cmd.ctx();
        if let Err(e) = ctx.check_usable() {
            cmd.report(EventCode::ExecuteCmdComplete, e.into());
            return;
        }
        if cmd
            .pending
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            cmd.report(EventCode::ExecuteCmdComplete, EventValue::CmdListBusy);
            return;
        }
        cmd.failed.store(false, Ordering::Release);

        let items = cmd.items();
        let mut rest = edits;
        for (i, item) in items.iter().enumerate() {
            let n = rest.iter().take_while(|e| e.index as usize == i).count();
            let (mine, tail) = rest.split_at(n);
            rest = tail;

            let (work, priority) = build_work(item, mine);
            cmd.pending.fetch_add(1, Ordering::AcqRel);
            let req = self.new_exec(ctx, work, priority, Some((cmd.clone(), i as u32)));
            self.start_exec(req);
        }
        log::trace!("cinder: cmdlist {} submitted {} items", cmd.id(), items.len());
        self.cmdlist_round_step(cmd);
    }
}

/// Stash or finish the edits of one chunk; `Some` once the last chunk is in
fn consume_edit_chunk(cmd: &CmdList, bytes: &[u8], first: bool, last: bool) -> Result<Option<Vec<ItemEdit>>> {
    let items = cmd.items();
    let held = cmd.state.lock().edits.take();
    let mut r = ByteReader::new(bytes);
    let mut builder = match (held, first) {
        (None, true) => EditBuilder::start(&mut r)?,
        (Some(b), false) => b,
        _ => return Err(Error::MalformedCommand),
    };
    builder.feed(&items, &mut r)?;
    if !last {
        cmd.state.lock().edits = Some(builder);
        return Ok(None);
    }
    builder.finish().map(Some)
}
