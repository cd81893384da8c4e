//! Event plumbing between the coordinator, capture and encode tasks
//!
//! Each queue is a thin wrapper over a crossbeam channel pair plus a shared
//! running flag, giving the lossless FIFO semantics the tasks rely on:
//! values raised before `stop()` stay poppable until drained (drain then
//! close). The image fan-out is the one lossy queue in the system; it is
//! bounded and drops frames when a subscriber falls behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::capture::SharedImage;
use crate::types::{HdrInfo, Packet, TouchPorts};

/// How many captured frames a single subscriber may have in flight before
/// the fan-out starts dropping
pub const IMAGE_QUEUE_DEPTH: usize = 12;

/// A stoppable FIFO shared between tasks
pub struct EventQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    running: Arc<AtomicBool>,
    lossy: bool,
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            running: self.running.clone(),
            lossy: self.lossy,
        }
    }
}

impl<T> EventQueue<T> {
    /// Lossless unbounded queue
    pub fn unbounded() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            running: Arc::new(AtomicBool::new(true)),
            lossy: false,
        }
    }

    /// Bounded queue that drops raised values when full
    pub fn bounded_lossy(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            running: Arc::new(AtomicBool::new(true)),
            lossy: true,
        }
    }

    /// Bounded queue that blocks the producer when full
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            running: Arc::new(AtomicBool::new(true)),
            lossy: false,
        }
    }

    /// Push a value. Ignored once the queue has been stopped; a full lossy
    /// queue drops the value.
    pub fn raise(&self, value: T) {
        if !self.running() {
            return;
        }
        if self.lossy {
            if let Err(TrySendError::Full(_)) = self.tx.try_send(value) {
                tracing::trace!("subscriber queue full, dropping frame");
            }
        } else {
            let _ = self.tx.send(value);
        }
    }

    /// Is a value waiting?
    pub fn peek(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Non-blocking pop
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Pop, waiting up to `timeout` for a value
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Stop accepting new values. Already queued values remain poppable.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// A latched boolean signal (raise / peek / reset)
#[derive(Clone, Default)]
pub struct Signal {
    raised: Arc<AtomicBool>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn peek(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.raised.store(false, Ordering::SeqCst);
    }
}

/// Events scoped to a single display's capture/encode pair
pub struct SessionEvents {
    /// Client requested an IDR frame
    pub idr: EventQueue<bool>,
    /// Client requested capture of a different monitor
    pub switch_display: EventQueue<i32>,
    /// Client requested invalidation of a reference frame range
    pub invalidate_ref_frames: EventQueue<(i64, i64)>,
    /// Capture side is rebuilding the display; encode must wait
    pub reinit: Signal,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self {
            idr: EventQueue::unbounded(),
            switch_display: EventQueue::unbounded(),
            invalidate_ref_frames: EventQueue::unbounded(),
            reinit: Signal::new(),
        }
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-scoped event buses shared by every session in a stream
#[derive(Clone)]
pub struct StreamEvents {
    /// Cooperative shutdown of the whole stream
    pub shutdown: Signal,
    /// Client closed the window for one display
    pub close_window: EventQueue<i16>,
    /// Compressed packets bound for the transport layer
    pub packets: EventQueue<Packet>,
    /// Published whenever the touch port union changes
    pub touch_port: EventQueue<TouchPorts>,
    /// Display HDR state, published when an encode session starts
    pub hdr: EventQueue<HdrInfo>,
}

impl StreamEvents {
    pub fn new() -> Self {
        Self {
            shutdown: Signal::new(),
            close_window: EventQueue::unbounded(),
            packets: EventQueue::unbounded(),
            touch_port: EventQueue::unbounded(),
            hdr: EventQueue::unbounded(),
        }
    }
}

impl Default for StreamEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// New image fan-out queue for one subscriber
pub fn image_queue() -> EventQueue<SharedImage> {
    EventQueue::bounded_lossy(IMAGE_QUEUE_DEPTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = EventQueue::unbounded();
        q.raise(1);
        q.raise(2);
        q.raise(3);
        assert!(q.peek());
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
        assert!(!q.peek());
    }

    #[test]
    fn test_drain_then_close() {
        let q = EventQueue::unbounded();
        q.raise(10);
        q.stop();
        assert!(!q.running());
        // Queued values survive the stop
        assert_eq!(q.pop(), Some(10));
        // New values are refused
        q.raise(11);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_lossy_queue_drops_when_full() {
        let q = EventQueue::bounded_lossy(2);
        q.raise(1);
        q.raise(2);
        q.raise(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_pop_wait_times_out() {
        let q: EventQueue<i32> = EventQueue::unbounded();
        let start = std::time::Instant::now();
        assert_eq!(q.pop_wait(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_latch() {
        let s = Signal::new();
        assert!(!s.peek());
        s.raise();
        assert!(s.peek());
        assert!(s.peek());
        s.reset();
        assert!(!s.peek());
    }
}
