//! # DMA Page Pool
//!
//! Fixed set of DMA-mapped pages shared by every staged transfer.
//!
//! A page is in exactly one of three states:
//!
//! ```text
//!            acquire                     lend (response refill)
//!   Free ──────────────▶ Full     Free ─────────────────────────▶ Sent
//!    ▲                    │        ▲                                │
//!    └──── release ───────┘        └── release ◀── Full ◀─ mark_full┘
//! ```
//!
//! Response mode lends free pages to the host so it can push replies
//! without a round trip. Whenever fewer than the low-water mark are still
//! lent out, a refill is requested; the owner runs it from deferred context
//! with [`DmaPagePool::process_refill`].

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use arrayvec::ArrayVec;
use cinder_core::config::MAX_RESPONSE_PAGES;
use cinder_core::{DmaAddr, Error, PageHandle, PoolConfig, Result, WaitQueue, PAGE_SIZE};
use spin::Mutex;

// =============================================================================
// PAGE STATE
// =============================================================================

/// State of one pool page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Available for acquire
    Free,
    /// Holding data for a local consumer
    Full,
    /// Lent to the host as a response page
    Sent,
}

/// A page handed out by [`DmaPagePool::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLease {
    /// Pool handle
    pub handle: PageHandle,
    /// Bus address of the page
    pub addr: DmaAddr,
}

/// One free page reported to the host in response mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseEntry {
    /// Bus address of the page
    pub addr: DmaAddr,
    /// Pool handle the host echoes back when the page is filled
    pub handle: PageHandle,
}

impl ResponseEntry {
    /// Pack as pfn in bits 0..45 and page handle in bits 56..64
    pub const fn encode(&self) -> u64 {
        self.addr.pfn() | ((self.handle.raw() as u64) << 56)
    }

    /// Unpack a wire entry
    pub const fn decode(word: u64) -> Self {
        Self {
            addr: DmaAddr::from_pfn(word),
            handle: PageHandle::new((word >> 56) as u8),
        }
    }
}

/// Callback informing the host about freshly lent response pages
pub type ResponseCallback = Arc<dyn Fn(&[ResponseEntry]) -> Result<()> + Send + Sync>;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Pages in `Free` state
    pub free_pages: u32,
    /// Pages in `Sent` state
    pub sent_pages: u32,
    /// Pages in `Full` state
    pub full_pages: u32,
    /// Free pages that stayed free since the last `deallocate_unused`
    pub unused_pages: u32,
    /// Free pages whose backing memory is currently released
    pub unmapped_pages: u32,
    /// Response callback failures
    pub cb_failures: u32,
    /// Successful acquires
    pub acquires: u64,
}

// =============================================================================
// POOL PAGE
// =============================================================================

struct PoolPage {
    /// Current state
    state: PageState,
    /// Backing memory; `None` after `deallocate_unused`
    data: Option<Box<[u8]>>,
    /// Stayed free since the last `deallocate_unused`
    unused: bool,
}

struct PoolInner {
    pages: Vec<PoolPage>,
    /// Free handles, oldest first
    free: VecDeque<u8>,
}

impl PoolInner {
    fn count(&self, state: PageState) -> usize {
        self.pages.iter().filter(|p| p.state == state).count()
    }

    fn page(&self, handle: PageHandle) -> Result<&PoolPage> {
        self.pages.get(handle.index()).ok_or(Error::InvalidPage)
    }

    fn page_mut(&mut self, handle: PageHandle) -> Result<&mut PoolPage> {
        self.pages.get_mut(handle.index()).ok_or(Error::InvalidPage)
    }
}

// =============================================================================
// DMA PAGE POOL
// =============================================================================

/// Fixed-size pool of DMA pages
pub struct DmaPagePool {
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    /// Signaled whenever a page becomes free
    free_wq: WaitQueue,
    response_cb: Mutex<Option<ResponseCallback>>,
    refill_pending: AtomicBool,
    cb_failures: AtomicU32,
    acquires: AtomicU64,
}

impl fmt::Debug for DmaPagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaPagePool")
            .field("name", &self.config.name)
            .field("capacity", &self.config.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DmaPagePool {
    /// Create a pool with every page mapped and free
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let mut pages = Vec::with_capacity(config.capacity);
        let mut free = VecDeque::with_capacity(config.capacity);
        for i in 0..config.capacity {
            pages.push(PoolPage {
                state: PageState::Free,
                data: Some(vec![0u8; PAGE_SIZE].into_boxed_slice()),
                unused: false,
            });
            free.push_back(i as u8);
        }

        log::debug!(
            "{}: {} pages at {}",
            config.name,
            config.capacity,
            config.base
        );

        Ok(Self {
            config,
            inner: Mutex::new(PoolInner { pages, free }),
            free_wq: WaitQueue::new(),
            response_cb: Mutex::new(None),
            refill_pending: AtomicBool::new(false),
            cb_failures: AtomicU32::new(0),
            acquires: AtomicU64::new(0),
        })
    }

    /// Number of pages
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Bus address of a page
    pub fn page_addr(&self, handle: PageHandle) -> Result<DmaAddr> {
        if handle.index() >= self.config.capacity {
            return Err(Error::InvalidPage);
        }
        Ok(self.config.base + (handle.index() * PAGE_SIZE) as u64)
    }

    // =========================================================================
    // Acquire / release
    // =========================================================================

    /// Take a free page without blocking
    ///
    /// The page comes back in `Full` state.
    pub fn acquire_nowait(&self) -> Result<PageLease> {
        let mut inner = self.inner.lock();
        let raw = inner.free.pop_front().ok_or(Error::ExhaustedPool)?;
        let handle = PageHandle::new(raw);
        let page = inner.page_mut(handle)?;
        if page.data.is_none() {
            page.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
        }
        page.state = PageState::Full;
        page.unused = false;
        drop(inner);

        self.acquires.fetch_add(1, Ordering::Relaxed);
        Ok(PageLease {
            handle,
            addr: self.page_addr(handle)?,
        })
    }

    /// Take a free page, blocking until one is released
    ///
    /// Never call this from a DMA completion continuation.
    pub fn acquire(&self) -> PageLease {
        loop {
            if let Ok(lease) = self.acquire_nowait() {
                return lease;
            }
            self.free_wq.wait_until(|| self.poll_free());
        }
    }

    /// Return a page to the free list and wake waiters
    pub fn release(&self, handle: PageHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let page = inner.page_mut(handle)?;
        if page.state == PageState::Free {
            log::warn!("{}: double release of {:?}", self.config.name, handle);
            return Err(Error::InvalidPage);
        }
        page.state = PageState::Free;
        page.unused = false;
        inner.free.push_back(handle.raw());
        let sent = inner.count(PageState::Sent);
        drop(inner);

        self.free_wq.wake_all();
        self.request_refill_if_low(sent);
        Ok(())
    }

    /// Whether a non-blocking acquire would succeed right now
    pub fn poll_free(&self) -> bool {
        !self.inner.lock().free.is_empty()
    }

    /// Wait queue signaled whenever a page becomes free
    pub fn free_wait_queue(&self) -> &WaitQueue {
        &self.free_wq
    }

    // =========================================================================
    // Page access
    // =========================================================================

    /// Copy out of a page
    pub fn read(&self, handle: PageHandle, offset: usize, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock();
        let data = inner.page(handle)?.data.as_ref().ok_or(Error::InvalidPage)?;
        let src = data
            .get(offset..offset + buf.len())
            .ok_or(Error::BufferTooSmall)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Copy the first `len` bytes of a page into a fresh buffer
    pub fn read_vec(&self, handle: PageHandle, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read(handle, 0, &mut out)?;
        Ok(out)
    }

    /// Copy into a page
    pub fn write(&self, handle: PageHandle, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let data = inner
            .page_mut(handle)?
            .data
            .as_mut()
            .ok_or(Error::InvalidPage)?;
        let dst = data
            .get_mut(offset..offset + bytes.len())
            .ok_or(Error::BufferTooSmall)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Resolve a bus address to a page and an offset inside it
    pub fn lookup(&self, addr: DmaAddr) -> Option<(PageHandle, usize)> {
        let rel = addr.raw().checked_sub(self.config.base.raw())?;
        let index = (rel / PAGE_SIZE as u64) as usize;
        if index >= self.config.capacity {
            return None;
        }
        Some((PageHandle::new(index as u8), (rel % PAGE_SIZE as u64) as usize))
    }

    /// Device-side write into a busy page, as performed by the DMA engine
    pub fn dma_write(&self, addr: DmaAddr, bytes: &[u8]) -> Result<()> {
        let (handle, offset) = self.dma_target(addr, bytes.len())?;
        self.write(handle, offset, bytes)
    }

    /// Device-side read from a busy page, as performed by the DMA engine
    pub fn dma_read(&self, addr: DmaAddr, buf: &mut [u8]) -> Result<()> {
        let (handle, offset) = self.dma_target(addr, buf.len())?;
        self.read(handle, offset, buf)
    }

    fn dma_target(&self, addr: DmaAddr, len: usize) -> Result<(PageHandle, usize)> {
        let (handle, offset) = self.lookup(addr).ok_or(Error::InvalidDmaAddress)?;
        if offset + len > PAGE_SIZE {
            return Err(Error::InvalidDmaAddress);
        }
        if self.inner.lock().page(handle)?.state == PageState::Free {
            return Err(Error::InvalidDmaAddress);
        }
        Ok((handle, offset))
    }

    // =========================================================================
    // Response mode
    // =========================================================================

    /// Enable, update or (with `None`) disable response mode
    ///
    /// Enabling runs the first refill synchronously.
    pub fn configure_response(&self, cb: Option<ResponseCallback>) {
        let enable = cb.is_some();
        *self.response_cb.lock() = cb;
        if enable {
            self.refill();
        } else {
            self.refill_pending.store(false, Ordering::Release);
            self.return_sent_pages();
        }
    }

    /// Host filled a lent page; it becomes `Full` for the local consumer
    pub fn mark_full(&self, handle: PageHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let page = inner.page_mut(handle)?;
        if page.state != PageState::Sent {
            return Err(Error::InvalidPage);
        }
        page.state = PageState::Full;
        let sent = inner.count(PageState::Sent);
        drop(inner);

        self.request_refill_if_low(sent);
        Ok(())
    }

    /// Take back every lent page, e.g. after a device reset
    pub fn reset_response_pages(&self) {
        self.return_sent_pages();
        if self.response_cb.lock().is_some() {
            self.refill_pending.store(true, Ordering::Release);
        }
    }

    /// Whether a refill is waiting for deferred context
    pub fn refill_needed(&self) -> bool {
        self.refill_pending.load(Ordering::Acquire)
    }

    /// Run a pending refill; returns whether one ran
    pub fn process_refill(&self) -> bool {
        if !self.refill_pending.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.refill();
        true
    }

    fn request_refill_if_low(&self, sent: usize) {
        if sent < self.config.response_low_water && self.response_cb.lock().is_some() {
            self.refill_pending.store(true, Ordering::Release);
        }
    }

    fn return_sent_pages(&self) {
        let mut inner = self.inner.lock();
        let mut returned = 0;
        for i in 0..inner.pages.len() {
            if inner.pages[i].state == PageState::Sent {
                inner.pages[i].state = PageState::Free;
                inner.pages[i].unused = false;
                inner.free.push_back(i as u8);
                returned += 1;
            }
        }
        drop(inner);
        if returned > 0 {
            self.free_wq.wake_all();
        }
    }

    /// Lend free pages until `response_max` are outstanding and tell the host
    fn refill(&self) {
        let Some(cb) = self.response_cb.lock().clone() else {
            return;
        };

        let mut lent: ArrayVec<ResponseEntry, MAX_RESPONSE_PAGES> = ArrayVec::new();
        {
            let mut inner = self.inner.lock();
            let sent = inner.count(PageState::Sent);
            let want = self
                .config
                .response_max
                .saturating_sub(sent)
                .min(MAX_RESPONSE_PAGES);
            while lent.len() < want {
                let Some(raw) = inner.free.pop_front() else {
                    break;
                };
                let page = &mut inner.pages[raw as usize];
                if page.data.is_none() {
                    page.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
                }
                page.state = PageState::Sent;
                page.unused = false;
                let handle = PageHandle::new(raw);
                lent.push(ResponseEntry {
                    addr: self.config.base + (handle.index() * PAGE_SIZE) as u64,
                    handle,
                });
            }
        }

        if lent.is_empty() {
            return;
        }

        if let Err(e) = cb(&lent) {
            log::warn!("{}: response callback failed: {}", self.config.name, e);
            self.cb_failures.fetch_add(1, Ordering::Relaxed);
            let mut inner = self.inner.lock();
            for entry in &lent {
                let index = entry.handle.index();
                inner.pages[index].state = PageState::Free;
                inner.free.push_back(entry.handle.raw());
            }
            drop(inner);
            self.free_wq.wake_all();
        }
    }

    // =========================================================================
    // Shrink and stats
    // =========================================================================

    /// Unmap every page that stayed free since the previous call
    ///
    /// Returns the number of pages released. Busy and lent pages are never
    /// touched; an unmapped page is mapped again on its next acquire.
    pub fn deallocate_unused(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut released = 0;
        for page in inner.pages.iter_mut() {
            if page.state != PageState::Free {
                continue;
            }
            if page.unused && page.data.is_some() {
                page.data = None;
                released += 1;
            }
            page.unused = true;
        }
        if released > 0 {
            log::debug!("{}: released {} unused pages", self.config.name, released);
        }
        released
    }

    /// Snapshot of page counts
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats {
            cb_failures: self.cb_failures.load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for page in &inner.pages {
            match page.state {
                PageState::Free => {
                    stats.free_pages += 1;
                    if page.unused {
                        stats.unused_pages += 1;
                    }
                    if page.data.is_none() {
                        stats.unmapped_pages += 1;
                    }
                }
                PageState::Full => stats.full_pages += 1,
                PageState::Sent => stats.sent_pages += 1,
            }
        }
        stats
    }

    /// State of one page
    pub fn page_state(&self, handle: PageHandle) -> Result<PageState> {
        Ok(self.inner.lock().page(handle)?.state)
    }
}
