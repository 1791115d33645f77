use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::dataset::data_buffer::DataBuffer;
use crate::error::RuntimeError;

/// Interval at which blocked queue operations re-check the stop token.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared cancellation flag of one task group.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_stopped() {
            return Err(RuntimeError::Interrupted.into());
        }
        Ok(())
    }
}

/// Bounded FIFO that blocks producers when full and consumers when empty.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    stop: StopToken,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, stop: StopToken) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            stop,
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, VecDeque<T>>> {
        self.items
            .lock()
            .map_err(|_| RuntimeError::unexpected("Queue mutex poisoned"))
    }

    pub fn push(&self, item: T) -> anyhow::Result<()> {
        let mut items = self.lock()?;
        while items.len() >= self.capacity {
            self.stop.check()?;
            items = self
                .not_full
                .wait_timeout(items, STOP_POLL_INTERVAL)
                .map_err(|_| RuntimeError::unexpected("Queue mutex poisoned"))?
                .0;
        }
        self.stop.check()?;
        items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> anyhow::Result<T> {
        let mut items = self.lock()?;
        loop {
            self.stop.check()?;
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            items = self
                .not_empty
                .wait_timeout(items, STOP_POLL_INTERVAL)
                .map_err(|_| RuntimeError::unexpected("Queue mutex poisoned"))?
                .0;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output edge of a dataset operator.
///
/// One queue per producer worker; the single consumer pops the queues
/// round-robin, so a pool fed round-robin keeps its emission order.
pub struct Connector {
    queues: Vec<BoundedQueue<DataBuffer>>,
    pop_from: AtomicUsize,
}

impl Connector {
    pub fn new(num_producers: usize, capacity: usize, stop: StopToken) -> Self {
        let queues = (0..num_producers.max(1))
            .map(|_| BoundedQueue::new(capacity, stop.clone()))
            .collect();
        Self { queues, pop_from: AtomicUsize::new(0) }
    }

    pub fn num_producers(&self) -> usize {
        self.queues.len()
    }

    pub fn push(&self, worker_id: usize, buffer: DataBuffer) -> anyhow::Result<()> {
        let queue = self.queues.get(worker_id).ok_or_else(|| {
            RuntimeError::unexpected(format!(
                "Worker {} pushes to a connector with {} producers",
                worker_id,
                self.queues.len()
            ))
        })?;
        queue.push(buffer)
    }

    pub fn pop(&self) -> anyhow::Result<DataBuffer> {
        let index = self.pop_from.load(Ordering::SeqCst);
        let buffer = self.queues[index].pop()?;
        self.pop_from.store((index + 1) % self.queues.len(), Ordering::SeqCst);
        Ok(buffer)
    }

    /// Buffers currently queued over all producers.
    pub fn size(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}
