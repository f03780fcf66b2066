//! # Serial Work Queues
//!
//! Each context owns a queue whose items run one at a time and in arrival
//! order; context create and destroy run on one global queue. Queues with
//! pending work sit on the service's ready list until a worker drains them
//! with [`InferenceService::run_pending`].

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::service::InferenceService;

/// One deferred work item
pub type Work = Box<dyn FnOnce(&Arc<InferenceService>) + Send>;

/// FIFO of work items executed one at a time
pub struct SerialQueue {
    name: &'static str,
    items: Mutex<VecDeque<Work>>,
    /// On the ready list
    scheduled: AtomicBool,
    /// A worker is draining it
    running: AtomicBool,
}

impl SerialQueue {
    /// Empty queue
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            items: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Queue name for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a work item
    ///
    /// Returns `true` if the queue must be put on the ready list.
    pub(crate) fn push(&self, work: Work) -> bool {
        self.items.lock().push_back(work);
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    fn pop(&self) -> Option<Work> {
        self.items.lock().pop_front()
    }

    /// Pending items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InferenceService {
    /// Queue `work` on `queue`
    pub(crate) fn queue_work(&self, queue: &Arc<SerialQueue>, work: Work) {
        if queue.push(work) {
            self.ready.lock().push_back(queue.clone());
        }
    }

    /// Run queued work until no queue has pending items
    ///
    /// Also services a pending response-page refill. Returns the number of
    /// work items executed.
    pub fn run_pending(self: &Arc<Self>) -> usize {
        let mut ran = 0;
        loop {
            self.pool.process_refill();
            let Some(queue) = self.ready.lock().pop_front() else {
                break;
            };
            queue.scheduled.store(false, Ordering::Release);
            if queue.running.swap(true, Ordering::AcqRel) {
                // Another worker holds it and re-checks for work when done
                continue;
            }
            while let Some(work) = queue.pop() {
                work(self);
                ran += 1;
            }
            queue.running.store(false, Ordering::Release);
            if !queue.is_empty() && !queue.scheduled.swap(true, Ordering::AcqRel) {
                self.ready.lock().push_back(queue);
            }
        }
        if ran > 0 {
            log::trace!("cinder: ran {} work items", ran);
        }
        ran
    }
}
