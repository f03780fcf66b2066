//! # Contexts
//!
//! A context scopes every object one host client creates. It owns the
//! command queue its runtime reads, a serial work queue for its host
//! commands, and the id indices of its children.
//!
//! References to a context are held by the service's context table (the
//! owner), by every child object, by the daemon while it tracks the
//! runtime process, and by the runtime attachment. Host destroy drops the
//! owner reference and tears the children down; `DestroyContextSuccess` is
//! reported when the last reference goes.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_cmdq::CommandQueue;
use cinder_core::{
    ContextId, DriverHandle, Error, EventCode, EventReport, EventSink, EventValue, ObjectId,
    Result,
};
use cinder_dma::HostRing;
use spin::Mutex;

use crate::cmdlist::CmdList;
use crate::copy::CopyHandle;
use crate::devnet::DevNet;
use crate::devres::DevRes;
use crate::errlist::ErrorList;
use crate::object::{DestroyReason, Lifecycle, ObjectIndex};
use crate::workqueue::SerialQueue;

// =============================================================================
// STATE
// =============================================================================

/// Health of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Usable
    Ok,
    /// A device error happened; the host may recover
    BrokenRecoverable,
    /// The runtime died or the card was reset; destroy only
    BrokenNonRecoverable,
}

/// Runtime attachment of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Runtime not started yet
    Unattached,
    /// Runtime is reading the context queue
    Attached,
    /// Runtime went away
    Detached,
}

/// Child indices of a context
#[derive(Default)]
pub(crate) struct Children {
    pub(crate) devres: ObjectIndex<DevRes>,
    pub(crate) devnets: ObjectIndex<DevNet>,
    pub(crate) copies: ObjectIndex<CopyHandle>,
    pub(crate) cmdlists: ObjectIndex<CmdList>,
}

struct ContextInner {
    state: ContextState,
    attach: AttachState,
    children: Children,
}

/// Sync point bookkeeping
#[derive(Default)]
struct SyncTracker {
    submitted: u64,
    completed: u64,
    /// (sync seq, submitted count it waits for), in request order
    points: VecDeque<(u16, u64)>,
}

// =============================================================================
// CONTEXT
// =============================================================================

/// A host session
pub struct Context {
    id: ContextId,
    drv_handle: DriverHandle,
    flags: u8,
    life: Lifecycle,
    events: Arc<dyn EventSink>,
    cmdq: Arc<CommandQueue>,
    wq: Arc<SerialQueue>,
    ring: Mutex<Option<Arc<dyn HostRing>>>,
    inner: Mutex<ContextInner>,
    errors: Mutex<ErrorList>,
    sync: Mutex<SyncTracker>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        drv_handle: DriverHandle,
        flags: u8,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id,
            drv_handle,
            flags,
            life: Lifecycle::new(),
            events,
            cmdq: Arc::new(CommandQueue::new("context")),
            wq: Arc::new(SerialQueue::new("context")),
            ring: Mutex::new(None),
            inner: Mutex::new(ContextInner {
                state: ContextState::Ok,
                attach: AttachState::Unattached,
                children: Children::default(),
            }),
            errors: Mutex::new(ErrorList::new()),
            sync: Mutex::new(SyncTracker::default()),
        }
    }

    /// Host-visible id
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Handle the daemon and runtime use to name this context
    pub fn drv_handle(&self) -> DriverHandle {
        self.drv_handle
    }

    /// Creation flags
    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Queue the runtime reads
    pub fn cmdq(&self) -> &Arc<CommandQueue> {
        &self.cmdq
    }

    pub(crate) fn wq(&self) -> &Arc<SerialQueue> {
        &self.wq
    }

    pub(crate) fn life(&self) -> &Lifecycle {
        &self.life
    }

    /// Whether the host destroyed the context or its create was rolled back
    pub fn is_destroyed(&self) -> bool {
        self.life.is_destroyed()
    }

    /// Current health
    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    /// Current runtime attachment
    pub fn attach_state(&self) -> AttachState {
        self.inner.lock().attach
    }

    /// Host ring of a channel-based context
    pub fn ring(&self) -> Option<Arc<dyn HostRing>> {
        self.ring.lock().clone()
    }

    pub(crate) fn set_ring(&self, ring: Arc<dyn HostRing>) {
        *self.ring.lock() = Some(ring);
    }

    pub(crate) fn report(&self, event: EventReport) {
        self.events.report(event.context(self.id));
    }

    /// Fail unless new work may be started
    pub(crate) fn check_usable(&self) -> Result<()> {
        let inner = self.inner.lock();
        if self.life.is_destroyed() {
            return Err(Error::NoSuchContext);
        }
        match inner.state {
            ContextState::Ok => Ok(()),
            _ => Err(Error::ContextBroken),
        }
    }

    // =========================================================================
    // Children
    // =========================================================================

    /// Run `f` on the child indices under the context lock
    ///
    /// Fails with `NoSuchContext` once the context is destroyed so nothing
    /// can be indexed after teardown.
    pub(crate) fn with_children<R>(&self, f: impl FnOnce(&mut Children) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        if self.life.is_destroyed() {
            return Err(Error::NoSuchContext);
        }
        Ok(f(&mut inner.children))
    }

    /// Unindex children even after the context was destroyed
    pub(crate) fn remove_children<R>(&self, f: impl FnOnce(&mut Children) -> R) -> R {
        f(&mut self.inner.lock().children)
    }

    /// Run `f` under the index lock unless `life` is already destroyed
    ///
    /// Destroy flags children under the same lock, so a finalization done
    /// here can never interleave with a destroy.
    pub(crate) fn finalize_if_live(&self, life: &Lifecycle, f: impl FnOnce()) -> bool {
        let _inner = self.inner.lock();
        if life.is_destroyed() {
            return false;
        }
        f();
        true
    }

    /// Find a device resource
    pub fn find_devres(&self, id: ObjectId) -> Option<Arc<DevRes>> {
        self.inner.lock().children.devres.get(id)
    }

    /// Find a network
    pub fn find_devnet(&self, id: ObjectId) -> Option<Arc<DevNet>> {
        self.inner.lock().children.devnets.get(id)
    }

    /// Find a copy handle
    pub fn find_copy(&self, id: ObjectId) -> Option<Arc<CopyHandle>> {
        self.inner.lock().children.copies.get(id)
    }

    /// Find a command list
    pub fn find_cmdlist(&self, id: ObjectId) -> Option<Arc<CmdList>> {
        self.inner.lock().children.cmdlists.get(id)
    }

    /// Flag the context destroyed under its lock
    pub(crate) fn mark_destroyed(&self, reason: DestroyReason) -> bool {
        let _inner = self.inner.lock();
        self.life.mark(reason)
    }

    /// Unindex every child and hang up the runtime queue
    ///
    /// Children are released silently; the ones still referenced elsewhere
    /// go away when their last reference drops.
    pub(crate) fn teardown(&self) {
        let (devres, devnets, copies, cmdlists) = {
            let mut inner = self.inner.lock();
            let c = &mut inner.children;
            (
                c.devres.drain(DestroyReason::Teardown),
                c.devnets.drain(DestroyReason::Teardown),
                c.copies.drain(DestroyReason::Teardown),
                c.cmdlists.drain(DestroyReason::Teardown),
            )
        };
        log::debug!(
            "cinder: ctx {} teardown: {} devres, {} devnets, {} copies, {} cmdlists",
            self.id,
            devres.len(),
            devnets.len(),
            copies.len(),
            cmdlists.len()
        );
        let infreqs: Vec<_> = devnets
            .iter()
            .flat_map(|n| n.drain_infreqs(DestroyReason::Teardown))
            .collect();
        drop(cmdlists);
        drop(copies);
        drop(infreqs);
        drop(devnets);
        drop(devres);
        self.cmdq.hangup();
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Record a device error
    pub(crate) fn set_broken(&self, fatal: bool) {
        let mut inner = self.inner.lock();
        let next = if fatal {
            ContextState::BrokenNonRecoverable
        } else if inner.state == ContextState::Ok {
            ContextState::BrokenRecoverable
        } else {
            inner.state
        };
        if next != inner.state {
            log::warn!("cinder: ctx {} {:?} -> {:?}", self.id, inner.state, next);
            inner.state = next;
        }
    }

    /// Return a recoverable context to `Ok`
    pub(crate) fn recover(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.life.is_destroyed() {
            return Err(Error::NoSuchContext);
        }
        match inner.state {
            ContextState::BrokenNonRecoverable => Err(Error::ContextBroken),
            _ => {
                inner.state = ContextState::Ok;
                Ok(())
            }
        }
    }

    /// Clearing the context error list also recovers a recoverable context
    pub(crate) fn clear_errors(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == ContextState::BrokenNonRecoverable {
            return Err(Error::ContextBroken);
        }
        self.errors.lock().clear();
        inner.state = ContextState::Ok;
        Ok(())
    }

    /// Mark the runtime attached
    pub(crate) fn attach(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.life.is_destroyed() {
            return Err(Error::Destroyed);
        }
        if inner.attach != AttachState::Unattached {
            return Err(Error::Busy);
        }
        inner.attach = AttachState::Attached;
        Ok(())
    }

    /// Mark the runtime gone
    ///
    /// Returns `true` if the context was live, in which case it is now
    /// broken for good.
    pub(crate) fn detach(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.attach = AttachState::Detached;
        if self.life.is_destroyed() {
            return false;
        }
        inner.state = ContextState::BrokenNonRecoverable;
        true
    }

    // =========================================================================
    // Errors and sync points
    // =========================================================================

    pub(crate) fn errors(&self) -> &Mutex<ErrorList> {
        &self.errors
    }

    pub(crate) fn note_submitted(&self) {
        self.sync.lock().submitted += 1;
    }

    /// Count a completion; reports every sync point it satisfies
    pub(crate) fn note_completed(&self) {
        let reached: Vec<u16> = {
            let mut sync = self.sync.lock();
            sync.completed += 1;
            let mut out = Vec::new();
            while let Some(&(seq, target)) = sync.points.front() {
                if sync.completed < target {
                    break;
                }
                sync.points.pop_front();
                out.push(seq);
            }
            out
        };
        for seq in reached {
            self.report(EventReport::new(EventCode::SyncPointReached, EventValue::NoError).object(seq));
        }
    }

    /// Ask for a report once everything submitted so far has completed
    pub(crate) fn add_sync_point(&self, seq: u16) {
        let reached = {
            let mut sync = self.sync.lock();
            let target = sync.submitted;
            if sync.completed >= target && sync.points.is_empty() {
                true
            } else {
                sync.points.push_back((seq, target));
                false
            }
        };
        if reached {
            self.report(EventReport::new(EventCode::SyncPointReached, EventValue::NoError).object(seq));
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.cmdq.hangup();
        log::debug!("cinder: ctx {} released", self.id);
        if self.life.host_destroyed() {
            self.report(EventReport::new(
                EventCode::DestroyContextSuccess,
                EventValue::NoError,
            ));
        }
    }
}
