//! Bounded drop-oldest queue of peer addresses.
//!
//! Tracker bursts must not grow memory without bound, and under pressure a
//! fresh address beats a stale one: a full queue evicts its head.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
pub(crate) struct PeerQueue {
    inner: Mutex<VecDeque<SocketAddr>>,
    capacity: usize,
    notify: Notify,
}

impl PeerQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without blocking; a full queue drops its oldest entry
    pub(crate) fn push(&self, addr: SocketAddr) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() == self.capacity {
                let dropped = queue.pop_front();
                trace!("peer queue full, dropped {:?}", dropped);
            }
            queue.push_back(addr);
        }
        self.notify.notify_one();
    }

    /// Dequeue, waiting until an address is available
    pub(crate) async fn pop(&self) -> SocketAddr {
        loop {
            if let Some(addr) = self.inner.lock().unwrap().pop_front() {
                return addr;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
