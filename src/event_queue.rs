//! Cross-thread event queue: any thread can enqueue a callback to run on
//! the reactor's own thread, woken through a `mio::Waker` the same way a
//! self-pipe wakes an epoll loop.
//!
//! Two priority classes exist (HIGH before NORMAL) so a deferred close
//! posted from inside a callback — the same trick `hio_close_rudp` uses in
//! `hevent.c` to avoid freeing a handle from within its own read callback —
//! is serviced before ordinary application events queued in the same
//! batch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use mio::Waker;

use crate::config::Priority;
use crate::reactor::Reactor;

pub type PostedFn = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

#[derive(Default)]
struct Inner {
    high: VecDeque<PostedFn>,
    normal: VecDeque<PostedFn>,
}

/// Owned by the `Reactor`; drained once per loop iteration after the
/// demultiplexer wait returns.
pub struct EventQueue {
    inner: Arc<Mutex<Inner>>,
    waker: Arc<Waker>,
}

/// A cloneable, `Send`-able handle any thread can use to post work onto the
/// owning reactor, mirroring the multi-thread posting pattern the original
/// event loop uses for cross-thread wakeups.
#[derive(Clone)]
pub struct EventQueueHandle {
    inner: Arc<Mutex<Inner>>,
    waker: Arc<Waker>,
}

impl EventQueue {
    pub fn new(waker: Arc<Waker>) -> Self {
        Self { inner: Arc::new(Mutex::new(Inner::default())), waker }
    }

    pub fn handle(&self) -> EventQueueHandle {
        EventQueueHandle { inner: Arc::clone(&self.inner), waker: Arc::clone(&self.waker) }
    }

    /// Posts directly from the owning thread (used internally for
    /// same-reactor deferred close requests).
    pub fn post(&self, priority: Priority, callback: PostedFn) {
        post_into(&self.inner, priority, callback);
        let _ = self.waker.wake();
    }

    /// Takes every currently-queued callback, HIGH batch first, leaving the
    /// queue empty. Returning owned batches (rather than running them here
    /// against a borrowed `&mut Reactor`) lets the reactor drive the calls
    /// itself without aliasing its own `event_queue` field. Callbacks
    /// posted while a taken batch is running are left for the *next* take,
    /// so a storm of self-reposting work can't starve the loop's I/O pass.
    pub fn take_batch(&self) -> (Vec<PostedFn>, Vec<PostedFn>) {
        let mut inner = self.inner.lock().unwrap();
        (std::mem::take(&mut inner.high), std::mem::take(&mut inner.normal))
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.high.is_empty() && inner.normal.is_empty()
    }
}

impl EventQueueHandle {
    pub fn post(&self, priority: Priority, callback: PostedFn) {
        post_into(&self.inner, priority, callback);
        let _ = self.waker.wake();
    }
}

fn post_into(inner: &Mutex<Inner>, priority: Priority, callback: PostedFn) {
    let mut inner = inner.lock().unwrap();
    match priority {
        Priority::High => inner.high.push_back(callback),
        Priority::Normal => inner.normal.push_back(callback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Token;

    #[test]
    fn high_priority_drains_before_normal() {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let queue = EventQueue::new(waker);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        queue.post(Priority::Normal, Box::new(move |_r| o1.lock().unwrap().push("normal")));
        let o2 = Arc::clone(&order);
        queue.post(Priority::High, Box::new(move |_r| o2.lock().unwrap().push("high")));

        let mut reactor = Reactor::new(Default::default()).unwrap();
        let (high, normal) = queue.take_batch();
        for cb in high {
            cb(&mut reactor);
        }
        for cb in normal {
            cb(&mut reactor);
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "normal"]);
    }

    #[test]
    fn handle_clones_post_to_same_queue() {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let queue = EventQueue::new(waker);
        let handle = queue.handle();
        handle.post(Priority::Normal, Box::new(|_r| {}));
        assert!(!queue.is_empty());
    }
}
