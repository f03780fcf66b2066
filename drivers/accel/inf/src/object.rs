//! # Object Lifecycle
//!
//! Every session object is shared through `Arc`. The parent index holds one
//! reference; in-flight work (pending remote replies, DMA continuations,
//! scheduled executions) holds others. Destroy removes the object from its
//! parent index and flags it under the parent lock; the release side effects
//! (runtime destroy request, host event) run from `Drop` when the last
//! reference goes, so at most one finalization ever happens.
//!
//! ```text
//!  LocalCreated ──dispatch──▶ AwaitingRemote ──reply ok──▶ Created
//!       │                          │   │                      │
//!       │ dispatch failed          │   └──reply failed──┐     │ destroy
//!       ▼                          ▼ destroy            ▼     ▼
//!   RolledBack ◀──────────────  (flagged)          RolledBack Destroyed
//!                                  └─ reply skips finalization ─┘
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{Error, ObjectId, Result};
use hashbrown::HashMap;

// =============================================================================
// DESTROY REASON
// =============================================================================

/// Why an object left its parent index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    /// Host destroy command; the final release reports success
    Host = 1,
    /// Creation rolled back; the failure was already reported
    CreateFailed = 2,
    /// Removed together with its parent; nothing is reported
    Teardown = 3,
}

impl DestroyReason {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Host),
            2 => Some(Self::CreateFailed),
            3 => Some(Self::Teardown),
            _ => None,
        }
    }
}

/// Destroyed flag shared by all session objects
#[derive(Debug, Default)]
pub struct Lifecycle {
    destroyed: AtomicU8,
}

impl Lifecycle {
    /// Live object
    pub const fn new() -> Self {
        Self {
            destroyed: AtomicU8::new(0),
        }
    }

    /// Flag the object destroyed
    ///
    /// Returns `false` if it already was; the first reason sticks.
    pub fn mark(&self, reason: DestroyReason) -> bool {
        self.destroyed
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the object was destroyed
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire) != 0
    }

    /// Reason recorded by [`Lifecycle::mark`]
    pub fn reason(&self) -> Option<DestroyReason> {
        DestroyReason::from_raw(self.destroyed.load(Ordering::Acquire))
    }

    /// Whether the final release should report to the host
    pub fn host_destroyed(&self) -> bool {
        self.reason() == Some(DestroyReason::Host)
    }
}

// =============================================================================
// CHILD INDEX
// =============================================================================

/// Object kept in a parent's id index
pub trait Indexed {
    /// Id unique within the parent while indexed
    fn id(&self) -> ObjectId;

    /// Destroyed flag
    fn life(&self) -> &Lifecycle;
}

/// Id index of one child kind
///
/// Always used under the parent's lock, which makes lookup-and-clone one
/// atomic step with respect to destroy.
pub struct ObjectIndex<T: Indexed> {
    map: HashMap<ObjectId, Arc<T>>,
}

impl<T: Indexed> Default for ObjectIndex<T> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<T: Indexed> ObjectIndex<T> {
    /// Index a new object
    pub fn insert(&mut self, obj: &Arc<T>) -> Result<()> {
        if self.map.contains_key(&obj.id()) {
            return Err(Error::AlreadyExists);
        }
        self.map
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;
        self.map.insert(obj.id(), obj.clone());
        Ok(())
    }

    /// Find and take a reference
    pub fn get(&self, id: ObjectId) -> Option<Arc<T>> {
        self.map.get(&id).cloned()
    }

    /// Unindex and flag destroyed
    pub fn take(&mut self, id: ObjectId, reason: DestroyReason) -> Option<Arc<T>> {
        let obj = self.map.remove(&id)?;
        obj.life().mark(reason);
        Some(obj)
    }

    /// Unindex `obj` only if it is still the indexed object for its id
    pub fn take_exact(&mut self, obj: &Arc<T>, reason: DestroyReason) -> Option<Arc<T>> {
        match self.map.get(&obj.id()) {
            Some(cur) if Arc::ptr_eq(cur, obj) => self.take(obj.id(), reason),
            _ => {
                obj.life().mark(reason);
                None
            }
        }
    }

    /// Unindex everything
    pub fn drain(&mut self, reason: DestroyReason) -> Vec<Arc<T>> {
        self.map
            .drain()
            .map(|(_, obj)| {
                obj.life().mark(reason);
                obj
            })
            .collect()
    }

    /// Indexed objects
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
