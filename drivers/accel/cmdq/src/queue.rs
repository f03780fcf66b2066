//! # Command Queue
//!
//! FIFO of opcoded commands flowing from the card driver to the daemon or a
//! context's runtime.
//!
//! Readers see each command as a fixed [`CommandHeader`] followed by its
//! payload. A reader with a short buffer drains the payload over several
//! reads; the command leaves the queue only once fully read.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use cinder_core::{Error, Result, WaitQueue};
use spin::Mutex;
use static_assertions::const_assert_eq;

// =============================================================================
// HEADER
// =============================================================================

/// Bytes of the header preceding every payload
pub const HEADER_SIZE: usize = 8;

/// Header as seen by the reader: little-endian opcode then payload size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Command opcode
    pub opcode: u32,
    /// Payload bytes following the header
    pub size: u32,
}

const_assert_eq!(HEADER_SIZE, 2 * core::mem::size_of::<u32>());

impl CommandHeader {
    /// Serialize
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    /// Deserialize
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let opcode = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let size = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?);
        Some(Self { opcode, size })
    }
}

bitflags! {
    /// Readiness reported by [`CommandQueue::poll`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        /// A command can be read
        const READABLE = 1 << 0;
        /// The queue was hung up
        const HANGUP = 1 << 1;
    }
}

/// Fills payload bytes on demand: `(offset, dst)`
///
/// Runs with no queue lock held but inside the read of this queue, so it
/// may push to the queue and must not read from it.
pub type PayloadProducer = Box<dyn FnMut(usize, &mut [u8]) -> Result<()> + Send>;

enum Payload {
    Inline(Vec<u8>),
    Producer { size: usize, fill: PayloadProducer },
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Producer { size, .. } => *size,
        }
    }
}

struct QueuedCommand {
    opcode: u32,
    payload: Payload,
    header_sent: bool,
    read: usize,
}

/// A command taken off the queue in one piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    /// Opcode
    pub opcode: u32,
    /// Payload bytes
    pub payload: Vec<u8>,
}

struct QueueInner {
    cmds: VecDeque<QueuedCommand>,
    hung_up: bool,
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// Multi-producer command FIFO with blocking reads
pub struct CommandQueue {
    name: &'static str,
    inner: Mutex<QueueInner>,
    /// Serializes consumers; the command being read is off the list
    reading: Mutex<()>,
    readers: WaitQueue,
    pushed: AtomicU64,
    consumed: AtomicU64,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("hung_up", &self.is_hung_up())
            .finish()
    }
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(QueueInner {
                cmds: VecDeque::new(),
                hung_up: false,
            }),
            reading: Mutex::new(()),
            readers: WaitQueue::new(),
            pushed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// Queue name
    pub fn name(&self) -> &'static str {
        self.name
    }

    // =========================================================================
    // Producers
    // =========================================================================

    /// Append a command with an inline payload; never blocks
    pub fn push(&self, opcode: u32, payload: Vec<u8>) -> Result<()> {
        self.enqueue(opcode, Payload::Inline(payload))
    }

    /// Append a command whose payload is produced while it is read
    pub fn push_with(&self, opcode: u32, size: usize, fill: PayloadProducer) -> Result<()> {
        if size > u32::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        self.enqueue(opcode, Payload::Producer { size, fill })
    }

    fn enqueue(&self, opcode: u32, payload: Payload) -> Result<()> {
        if payload.len() > u32::MAX as usize {
            return Err(Error::PayloadTooLarge);
        }
        let mut inner = self.inner.lock();
        if inner.hung_up {
            return Err(Error::HangUp);
        }
        inner.cmds.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        inner.cmds.push_back(QueuedCommand {
            opcode,
            payload,
            header_sent: false,
            read: 0,
        });
        drop(inner);

        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.readers.wake_all();
        Ok(())
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Blocking read of the next header and/or payload bytes
    ///
    /// Returns the number of bytes written into `buf`. Fails with
    /// [`Error::HangUp`] once the queue is hung up.
    pub fn pop_into(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.try_pop_into(buf) {
                Err(Error::WouldBlock) => self.readers.wait_until(|| self.readable()),
                other => return other,
            }
        }
    }

    /// Non-blocking variant of [`pop_into`](Self::pop_into)
    ///
    /// The command being read is taken off the list until this returns, so
    /// a payload producer runs without the queue locked.
    pub fn try_pop_into(&self, buf: &mut [u8]) -> Result<usize> {
        let _reading = self.reading.lock();
        let mut cmd = {
            let mut inner = self.inner.lock();
            if inner.hung_up {
                return Err(Error::HangUp);
            }
            let front = inner.cmds.front().ok_or(Error::WouldBlock)?;
            if !front.header_sent && buf.len() < HEADER_SIZE {
                return Err(Error::BufferTooSmall);
            }
            inner.cmds.pop_front().ok_or(Error::WouldBlock)?
        };

        let result = self.read_some(&mut cmd, buf);
        if cmd.header_sent && cmd.read >= cmd.payload.len() {
            self.consumed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.lock().cmds.push_front(cmd);
        }
        result
    }

    /// Copy the header if not yet sent, then as much payload as fits
    ///
    /// A failing producer leaves the payload offset unchanged. Bytes already
    /// written for the header are still reported so the stream stays whole.
    fn read_some(&self, cmd: &mut QueuedCommand, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        if !cmd.header_sent {
            let header = CommandHeader {
                opcode: cmd.opcode,
                size: cmd.payload.len() as u32,
            };
            buf[..HEADER_SIZE].copy_from_slice(&header.encode());
            cmd.header_sent = true;
            written = HEADER_SIZE;
        }

        let n = (cmd.payload.len() - cmd.read).min(buf.len() - written);
        if n == 0 {
            return Ok(written);
        }
        let dst = &mut buf[written..written + n];
        let filled = match &mut cmd.payload {
            Payload::Inline(bytes) => {
                dst.copy_from_slice(&bytes[cmd.read..cmd.read + n]);
                Ok(())
            }
            Payload::Producer { fill, .. } => fill(cmd.read, dst),
        };
        match filled {
            Ok(()) => {
                cmd.read += n;
                Ok(written + n)
            }
            Err(e) if written == 0 => Err(e),
            Err(e) => {
                log::debug!("{}: payload producer failed after header: {}", self.name, e);
                Ok(written)
            }
        }
    }

    /// Take the next whole command without blocking
    pub fn try_pop(&self) -> Result<RawCommand> {
        let _reading = self.reading.lock();
        let mut inner = self.inner.lock();
        if inner.hung_up {
            return Err(Error::HangUp);
        }
        let cmd = inner.cmds.pop_front().ok_or(Error::WouldBlock)?;
        drop(inner);
        self.consumed.fetch_add(1, Ordering::Relaxed);
        Self::flatten(cmd)
    }

    /// Remove every queued command, hung up or not
    pub fn drain(&self) -> Vec<RawCommand> {
        let _reading = self.reading.lock();
        let cmds: Vec<QueuedCommand> = self.inner.lock().cmds.drain(..).collect();
        cmds.into_iter().filter_map(|c| Self::flatten(c).ok()).collect()
    }

    fn flatten(cmd: QueuedCommand) -> Result<RawCommand> {
        let payload = match cmd.payload {
            Payload::Inline(bytes) => bytes,
            Payload::Producer { size, mut fill } => {
                let mut bytes = vec![0u8; size];
                fill(0, &mut bytes)?;
                bytes
            }
        };
        Ok(RawCommand {
            opcode: cmd.opcode,
            payload,
        })
    }

    /// Run `f` on the inline payload of every queued command with `opcode`
    ///
    /// Runs with the queue locked; `f` must not touch this queue. A command
    /// a reader is partway through is not visited.
    pub fn execute_matching<F: FnMut(&[u8])>(&self, opcode: u32, mut f: F) -> usize {
        let inner = self.inner.lock();
        let mut matched = 0;
        for cmd in inner.cmds.iter().filter(|c| c.opcode == opcode) {
            match &cmd.payload {
                Payload::Inline(bytes) => f(bytes),
                Payload::Producer { .. } => f(&[]),
            }
            matched += 1;
        }
        matched
    }

    // =========================================================================
    // Lifecycle and readiness
    // =========================================================================

    /// Close the queue for good and wake every reader
    pub fn hangup(&self) {
        let mut inner = self.inner.lock();
        if inner.hung_up {
            return;
        }
        inner.hung_up = true;
        drop(inner);
        log::debug!("{}: hung up", self.name);
        self.readers.wake_all();
    }

    /// Whether [`hangup`](Self::hangup) was called
    pub fn is_hung_up(&self) -> bool {
        self.inner.lock().hung_up
    }

    /// Current readiness
    pub fn poll(&self) -> PollFlags {
        let inner = self.inner.lock();
        let mut flags = PollFlags::empty();
        if !inner.cmds.is_empty() {
            flags |= PollFlags::READABLE;
        }
        if inner.hung_up {
            flags |= PollFlags::READABLE | PollFlags::HANGUP;
        }
        flags
    }

    fn readable(&self) -> bool {
        self.poll().contains(PollFlags::READABLE)
    }

    /// Wait queue signaled on every push and on hangup
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.readers
    }

    /// Queued command count
    pub fn len(&self) -> usize {
        self.inner.lock().cmds.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands pushed and fully consumed so far
    pub fn counters(&self) -> (u64, u64) {
        (
            self.pushed.load(Ordering::Relaxed),
            self.consumed.load(Ordering::Relaxed),
        )
    }
}
