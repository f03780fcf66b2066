//! # Copy Handles
//!
//! A copy binds a device resource to a host buffer and a direction. It is a
//! purely local object: creation needs no remote round trip.

use alloc::sync::Arc;

use cinder_core::{DmaAddr, Error, EventCode, EventReport, EventValue, ObjectId, Result};
use cinder_dma::SgEntry;

use crate::context::Context;
use crate::devres::DevRes;
use crate::object::{DestroyReason, Indexed, Lifecycle};
use crate::protocol::CopyOp;
use crate::service::InferenceService;

/// Host buffer paired with a device resource
pub struct CopyHandle {
    id: ObjectId,
    ctx: Arc<Context>,
    devres: Arc<DevRes>,
    host_addr: DmaAddr,
    c2h: bool,
    d2d: bool,
    life: Lifecycle,
}

impl CopyHandle {
    /// Owning context
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Device side of the copy
    pub fn devres(&self) -> &Arc<DevRes> {
        &self.devres
    }

    /// Card to host direction
    pub fn is_c2h(&self) -> bool {
        self.c2h
    }

    /// Device to device copy
    pub fn is_d2d(&self) -> bool {
        self.d2d
    }

    /// Full transfer size
    pub fn size(&self) -> u64 {
        self.devres.size()
    }

    /// Segment moving `size` bytes (0 for the full resource)
    pub fn segment(&self, size: u64) -> SgEntry {
        let len = if size == 0 {
            self.size()
        } else {
            size.min(self.size())
        };
        let device = self.devres.dma_addr();
        let (src, dst) = if self.c2h {
            (device, self.host_addr)
        } else {
            (self.host_addr, device)
        };
        SgEntry { src, dst, len }
    }
}

impl Indexed for CopyHandle {
    fn id(&self) -> ObjectId {
        self.id
    }

    fn life(&self) -> &Lifecycle {
        &self.life
    }
}

impl Drop for CopyHandle {
    fn drop(&mut self) {
        if self.life.host_destroyed() {
            self.ctx.report(
                EventReport::new(EventCode::DestroyCopySuccess, EventValue::NoError)
                    .object(self.id),
            );
        }
    }
}

impl InferenceService {
    pub(crate) fn copy_op(&self, ctx: &Arc<Context>, op: CopyOp) {
        if op.destroy {
            let taken = ctx.remove_children(|c| c.copies.take(op.copy_id, DestroyReason::Host));
            if taken.is_none() {
                ctx.report(
                    EventReport::new(EventCode::DestroyCopyFailed, EventValue::NoSuchCopy)
                        .object(op.copy_id),
                );
            }
            return;
        }
        let (code, value) = match create_copy(ctx, op) {
            Ok(()) => (EventCode::CreateCopySuccess, EventValue::NoError),
            Err(e) => (EventCode::CreateCopyFailed, e.into()),
        };
        ctx.report(EventReport::new(code, value).object(op.copy_id));
    }
}

fn create_copy(ctx: &Arc<Context>, op: CopyOp) -> Result<()> {
    ctx.check_usable()?;
    let devres = ctx
        .find_devres(op.devres_id)
        .filter(|d| d.is_usable())
        .ok_or(Error::NoSuchDevres)?;
    let copy = Arc::new(CopyHandle {
        id: op.copy_id,
        ctx: ctx.clone(),
        devres,
        host_addr: op.host_addr,
        c2h: op.c2h,
        d2d: op.d2d,
        life: Lifecycle::new(),
    });
    ctx.with_children(|c| c.copies.insert(&copy))?
}
