//! The bounded, lossy-newest-wins ring buffer used both as the shared
//! ingress buffer and as each output's private buffer.
//!
//! Go's `rbuf.go` (unsynchronized read/write indices, a `defer
//! r.rmux.Lock()` that should have been `Unlock()`) is the design this
//! replaces, not a reference to follow: writes here are serialized by a
//! single mutex so the displace-then-enqueue sequence is atomic, and a
//! `Notify` wakes a blocked reader on every write and on close.

use bytes::Bytes;
use prometheus::IntCounter;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

struct State {
    queue: VecDeque<Bytes>,
    closed: bool,
}

/// A fixed-capacity FIFO of frames with non-blocking, displacing writes
/// and a blocking read that unblocks on close.
///
/// The same type backs both the shared ingress buffer (wired to
/// `input_recv_total`/`input_lost_total`) and each output's private
/// buffer (wired to `output_recv_total`/`output_lost_total`) — which pair
/// of counters it increments is just which handles the caller passes in.
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
    recv_total: IntCounter,
    lost_total: IntCounter,
}

impl RingBuffer {
    pub fn new(capacity: usize, recv_total: IntCounter, lost_total: IntCounter) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            capacity,
            state: Mutex::new(State { queue: VecDeque::with_capacity(capacity), closed: false }),
            notify: Notify::new(),
            recv_total,
            lost_total,
        }
    }

    /// Appends `frame`, evicting the oldest element first if the buffer is
    /// already at capacity. Never blocks.
    pub fn write(&self, frame: Bytes) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if state.queue.len() >= self.capacity {
            state.queue.pop_front();
            self.lost_total.inc();
        }
        state.queue.push_back(frame);
        self.recv_total.inc();
        drop(state);
        self.notify.notify_one();
    }

    /// Returns the next frame in FIFO order, or `None` once the buffer is
    /// closed and drained. Blocks while the buffer is empty and open.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(frame) = state.queue.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Idempotent. Unblocks any pending `read()` once the queue is drained.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{IntCounter, Opts};

    fn counter(name: &str) -> IntCounter {
        IntCounter::with_opts(Opts::new(name, name)).unwrap()
    }

    #[tokio::test]
    async fn overflow_displaces_oldest_and_counts_loss() {
        let recv = counter("recv_overflow");
        let lost = counter("lost_overflow");
        let buf = RingBuffer::new(4, recv.clone(), lost.clone());
        for i in 1..=6u8 {
            buf.write(Bytes::from(vec![i]));
        }
        assert_eq!(recv.get(), 6);
        assert_eq!(lost.get(), 2);

        let mut got = Vec::new();
        while let Some(frame) = buf.read().await {
            got.push(frame[0]);
            if got.len() == 4 {
                break;
            }
        }
        assert_eq!(got, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn read_blocks_until_write_then_unblocks() {
        let buf = std::sync::Arc::new(RingBuffer::new(2, counter("recv_block"), counter("lost_block")));
        let reader = buf.clone();
        let handle = tokio::spawn(async move { reader.read().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        buf.write(Bytes::from_static(b"hello"));

        let frame = handle.await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn close_drains_then_unblocks_with_none() {
        let buf = RingBuffer::new(2, counter("recv_close"), counter("lost_close"));
        buf.write(Bytes::from_static(b"a"));
        buf.close();

        assert_eq!(buf.read().await.as_deref(), Some(&b"a"[..]));
        assert_eq!(buf.read().await, None);
    }

    #[tokio::test]
    async fn recv_never_less_than_lost() {
        let recv = counter("recv_invariant");
        let lost = counter("lost_invariant");
        let buf = RingBuffer::new(1, recv.clone(), lost.clone());
        for i in 0..10u8 {
            buf.write(Bytes::from(vec![i]));
        }
        assert!(recv.get() >= lost.get());
    }
}
