//! # Scatter-Gather Chains
//!
//! Flattened list of contiguous segments a copy engine walks in one go.

use alloc::vec::Vec;

use cinder_core::DmaAddr;

/// One contiguous segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Source bus address
    pub src: DmaAddr,
    /// Destination bus address
    pub dst: DmaAddr,
    /// Bytes
    pub len: u64,
}

/// Immutable scatter-gather chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgChain {
    entries: Vec<SgEntry>,
    total: u64,
}

impl SgChain {
    /// Build a chain, skipping empty segments and merging adjacent ones
    pub fn build<I: IntoIterator<Item = SgEntry>>(segments: I) -> Self {
        let mut entries: Vec<SgEntry> = Vec::new();
        let mut total = 0;
        for seg in segments {
            if seg.len == 0 {
                continue;
            }
            total += seg.len;
            if let Some(last) = entries.last_mut() {
                if last.src + last.len == seg.src && last.dst + last.len == seg.dst {
                    last.len += seg.len;
                    continue;
                }
            }
            entries.push(seg);
        }
        Self { entries, total }
    }

    /// Segments in walk order
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Total bytes moved
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain moves nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
