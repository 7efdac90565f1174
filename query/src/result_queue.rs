use model::MultiTuple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    Result(MultiTuple),
    /// Nothing new, but the consumer should re-check its deadlines.
    WakeUp,
    /// No more results will follow.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// The queue was full and the result is lost.
    Dropped,
    Closed,
}

#[derive(Default)]
struct Inner {
    results: VecDeque<MultiTuple>,
    wake: bool,
    closed: bool,
}

/// Bounded single-consumer queue between the insert path and the page
/// streamer. Producers never wait.
pub struct ResultQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ResultQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// A closed queue holding exactly `results`.
    pub fn finished(results: Vec<MultiTuple>) -> Self {
        let queue = Self::new(results.len());
        {
            let mut inner = queue.lock();
            inner.results.extend(results);
            inner.closed = true;
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("No one should panic while holding this lock")
    }

    pub fn offer(&self, result: MultiTuple) -> Offer {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Offer::Closed;
            }
            if inner.results.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Offer::Dropped;
            }
            inner.results.push_back(result);
        }
        self.notify.notify_one();
        Offer::Accepted
    }

    /// Unblocks a waiting consumer. Only takes effect on an empty queue.
    pub fn wake(&self) {
        {
            let mut inner = self.lock();
            if inner.closed || !inner.results.is_empty() {
                return;
            }
            inner.wake = true;
        }
        self.notify.notify_one();
    }

    /// Results queued before closing are still delivered, then `Closed`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed and drained.
    pub fn is_exhausted(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn take(&self) -> QueueMessage {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(result) = inner.results.pop_front() {
                    return QueueMessage::Result(result);
                }
                if inner.closed {
                    return QueueMessage::Closed;
                }
                if inner.wake {
                    inner.wake = false;
                    return QueueMessage::WakeUp;
                }
            }
            notified.await;
        }
    }
}
