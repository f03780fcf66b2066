//! # Staged Payloads
//!
//! Payloads larger than a wire command arrive through pool pages. A worker
//! leases a page, starts a host-to-card transfer and returns; the DMA
//! completion continuation decodes what arrived and either finishes the
//! logical command, re-issues a transfer into the same page, or waits for
//! the next host command carrying the following chunk.
//!
//! Continuations never block: they reuse the page they already hold and
//! hand it back to the pool once the payload is consumed.
//!
//! ## Network tables
//!
//! A network edit carries `num_res` little-endian u16 resource ids followed
//! by `config_size` config bytes. The final chunk holds exactly the ids left
//! plus the config. On the legacy transport a non-final chunk of a chained
//! edit ends with a trailer naming the next chunk:
//!
//! ```text
//!  63      58 57              45 44                          0
//! ┌──────────┬──────────────────┬─────────────────────────────┐
//! │ reserved │  next chunk size │         next host pfn       │
//! └──────────┴──────────────────┴─────────────────────────────┘
//! ```
//!
//! Channel contexts instead send one host command per chunk, each naming
//! the index of its first id.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cinder_core::{DmaAddr, Error, ObjectId, Result, PAGE_SIZE};
use cinder_dma::{DmaDescriptor, PageLease, XferRequest, XferStatus};

use crate::codec::ByteReader;
use crate::context::Context;
use crate::service::InferenceService;

/// Size of the legacy chain trailer
pub const CHAIN_TRAILER_SIZE: usize = 8;

/// Pack a legacy chain trailer
pub const fn chain_trailer(next: DmaAddr, size: usize) -> u64 {
    next.pfn() | (((size as u64) & 0x1fff) << 45)
}

/// Unpack a legacy chain trailer
pub const fn parse_chain_trailer(word: u64) -> (DmaAddr, usize) {
    (DmaAddr::from_pfn(word), ((word >> 45) & 0x1fff) as usize)
}

// =============================================================================
// TRANSFER ENGINE
// =============================================================================

impl InferenceService {
    /// Address of a host chunk
    ///
    /// Channel contexts take it from their ring; legacy contexts use the
    /// address carried by the command.
    pub(crate) fn host_chunk(&self, ctx: &Context, host_addr: DmaAddr, size: usize) -> Result<DmaAddr> {
        match ctx.ring() {
            Some(ring) => {
                let (addr, avail) = ring.reserve(size)?;
                if avail < size {
                    return Err(Error::MalformedCommand);
                }
                Ok(addr)
            }
            None => Ok(host_addr),
        }
    }

    /// Give a consumed host chunk back to a channel context's ring
    pub(crate) fn chunk_consumed(&self, ctx: &Context, size: usize) {
        if let Some(ring) = ctx.ring() {
            ring.advance_free(size);
        }
    }

    /// Return a page to the pool
    pub(crate) fn release_page(&self, lease: PageLease) {
        if let Err(e) = self.pool.release(lease.handle) {
            log::error!("cinder: releasing page {:?}: {}", lease.handle, e);
        }
    }

    /// Copy `size` host bytes at `src` into `lease`
    ///
    /// `then` runs from the DMA completion. If the transfer cannot be
    /// started the page goes back to the pool and the error is returned.
    pub(crate) fn stage_in<F>(self: &Arc<Self>, lease: PageLease, src: DmaAddr, size: usize, then: F) -> Result<()>
    where
        F: FnOnce(&Arc<Self>, PageLease, XferStatus) + Send + 'static,
    {
        let xfer = XferRequest {
            desc: DmaDescriptor::h2c(),
            src,
            dst: lease.addr,
            size: size as u32,
        };
        self.start_xfer(lease, xfer, then)
    }

    /// Copy the first `size` bytes of `lease` to host memory at `dst`
    pub(crate) fn stage_out<F>(self: &Arc<Self>, lease: PageLease, dst: DmaAddr, size: usize, then: F) -> Result<()>
    where
        F: FnOnce(&Arc<Self>, PageLease, XferStatus) + Send + 'static,
    {
        let xfer = XferRequest {
            desc: DmaDescriptor::c2h(),
            src: lease.addr,
            dst,
            size: size as u32,
        };
        self.start_xfer(lease, xfer, then)
    }

    fn start_xfer<F>(self: &Arc<Self>, lease: PageLease, xfer: XferRequest, then: F) -> Result<()>
    where
        F: FnOnce(&Arc<Self>, PageLease, XferStatus) + Send + 'static,
    {
        if xfer.size as usize > PAGE_SIZE {
            self.release_page(lease);
            return Err(Error::PayloadTooLarge);
        }
        let svc = self.clone();
        let done = alloc::boxed::Box::new(move |status: XferStatus, _elapsed_us: u32| {
            then(&svc, lease, status)
        });
        match self.dma.start_single_transfer(xfer, done) {
            Ok(handle) => {
                log::trace!("cinder: xfer {:?} {} bytes started", handle, xfer.size);
                Ok(())
            }
            Err(e) => {
                log::warn!("cinder: xfer start failed: {}", e);
                self.release_page(lease);
                Err(e)
            }
        }
    }
}

// =============================================================================
// NETWORK TABLE CURSOR
// =============================================================================

/// What one network table chunk carried
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableChunk {
    /// Resource ids in this chunk
    pub(crate) ids: Vec<ObjectId>,
    /// Config bytes, present on the final chunk only
    pub(crate) config: Option<Vec<u8>>,
    /// Next legacy chunk address and size
    pub(crate) next: Option<(DmaAddr, usize)>,
}

/// Progress through a network resource table
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableCursor {
    total: u32,
    consumed: u32,
    config_size: usize,
}

impl TableCursor {
    pub(crate) fn new(total: u32, config_size: usize) -> Self {
        Self {
            total,
            consumed: 0,
            config_size,
        }
    }

    /// Ids received so far
    pub(crate) fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Ids still expected
    pub(crate) fn remaining(&self) -> u32 {
        self.total - self.consumed
    }

    /// Bytes the whole payload occupies
    pub(crate) fn payload_len(&self) -> usize {
        self.total as usize * 2 + self.config_size
    }

    /// Decode one arrived chunk and advance
    pub(crate) fn parse(&mut self, bytes: &[u8], chained: bool) -> Result<TableChunk> {
        let remaining = self.remaining() as usize;
        let mut r = ByteReader::new(bytes);

        if bytes.len() == remaining * 2 + self.config_size {
            let ids = read_ids(&mut r, remaining)?;
            let config = r.bytes(self.config_size)?.to_vec();
            self.consumed = self.total;
            return Ok(TableChunk {
                ids,
                config: Some(config),
                next: None,
            });
        }

        let body = if chained {
            bytes
                .len()
                .checked_sub(CHAIN_TRAILER_SIZE)
                .ok_or(Error::MalformedCommand)?
        } else {
            bytes.len()
        };
        let n = body / 2;
        if body % 2 != 0 || n == 0 || n >= remaining {
            return Err(Error::MalformedCommand);
        }
        let ids = read_ids(&mut r, n)?;
        let next = if chained {
            let (addr, size) = parse_chain_trailer(r.u64()?);
            if size == 0 || size > PAGE_SIZE {
                return Err(Error::MalformedCommand);
            }
            Some((addr, size))
        } else {
            None
        };
        self.consumed += n as u32;
        Ok(TableChunk {
            ids,
            config: None,
            next,
        })
    }
}

fn read_ids(r: &mut ByteReader<'_>, n: usize) -> Result<Vec<ObjectId>> {
    let mut ids = Vec::new();
    ids.try_reserve(n).map_err(|_| Error::OutOfMemory)?;
    for _ in 0..n {
        ids.push(r.u16()?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteWriter;

    #[test]
    fn test_single_chunk_table() {
        let mut cursor = TableCursor::new(2, 3);
        let bytes = ByteWriter::new().u16(4).u16(5).bytes(&[9, 9, 9]).finish();
        let chunk = cursor.parse(&bytes, false).unwrap();
        assert_eq!(chunk.ids, [4, 5]);
        assert_eq!(chunk.config.as_deref(), Some(&[9u8, 9, 9][..]));
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_chained_chunks() {
        let mut cursor = TableCursor::new(3, 0);
        let next = DmaAddr::from_pfn(0x42);
        let first = ByteWriter::new()
            .u16(1)
            .u64(chain_trailer(next, 4))
            .finish();
        let chunk = cursor.parse(&first, true).unwrap();
        assert_eq!(chunk.ids, [1]);
        assert_eq!(chunk.next, Some((next, 4)));
        assert_eq!(cursor.consumed(), 1);

        let last = ByteWriter::new().u16(2).u16(3).finish();
        let chunk = cursor.parse(&last, true).unwrap();
        assert_eq!(chunk.ids, [2, 3]);
        assert!(chunk.config.is_some());
    }

    #[test]
    fn test_channel_chunks() {
        let mut cursor = TableCursor::new(3, 2);
        let chunk = cursor.parse(&ByteWriter::new().u16(7).finish(), false).unwrap();
        assert_eq!(chunk.ids, [7]);
        assert!(chunk.next.is_none() && chunk.config.is_none());
        assert_eq!(cursor.remaining(), 2);
    }

    #[test]
    fn test_malformed_chunks() {
        let mut cursor = TableCursor::new(2, 0);
        // odd size
        assert_eq!(cursor.parse(&[1, 2, 3], false), Err(Error::MalformedCommand));
        // more ids than remain
        assert_eq!(cursor.parse(&[0; 6], false), Err(Error::MalformedCommand));
        // trailer with a zero next size
        let bad = ByteWriter::new().u16(1).u64(chain_trailer(DmaAddr::null(), 0)).finish();
        assert_eq!(cursor.parse(&bad, true), Err(Error::MalformedCommand));
        assert_eq!(cursor.consumed(), 0);
    }
}
