// src/queue.rs
//
// Bounded FIFO between the dispatcher and the workers. Producers are
// never blocked: a full queue hands the task straight back as
// backpressure. Consumers block until work arrives or the queue closes.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

struct Inner<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

pub struct TaskQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Submit without blocking. On overflow (or after close) the task
    /// comes back to the caller, who re-arms readiness and retries on a
    /// later wakeup.
    pub fn push(&self, task: T) -> Result<(), T> {
        let mut inner = self.lock();
        if inner.closed || inner.tasks.len() >= self.capacity {
            return Err(task);
        }
        inner.tasks.push_back(task);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Blocking FIFO pop. Returns `None` once the queue is closed and
    /// drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Reject new work and wake every blocked consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
