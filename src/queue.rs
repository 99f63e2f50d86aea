//! Bounded hand-off queues between stages.
//!
//! Every cross-stage payload travels through one of two queue kinds, each with
//! a fixed full-queue policy:
//! - `BlockingQueue`: the producer waits for space (raw segments, capture to
//!   finisher). The wait is sliced so a stopping producer can give up.
//! - `EvictingQueue`: the producer drops the oldest unread item to make room
//!   (finished segments, plate candidates, and the single-slot frame buffer).
//!   An optional eviction hook releases whatever the evicted item owns.
//!
//! Both are thin wrappers over `crossbeam_channel::bounded`, cloned into each
//! stage that needs an end of the channel.

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::signal::StopSignal;

const PRODUCER_WAIT_SLICE: Duration = Duration::from_millis(100);

type EvictHook<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Bounded FIFO that evicts its oldest entry when full. Never blocks the producer.
pub struct EvictingQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
    on_evict: Option<EvictHook<T>>,
}

impl<T> Clone for EvictingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            evicted: self.evicted.clone(),
            on_evict: self.on_evict.clone(),
        }
    }
}

impl<T> EvictingQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
            on_evict: None,
        }
    }

    /// Run `hook` on every item evicted to make room for a newer one.
    pub fn with_evict_hook(mut self, hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(hook));
        self
    }

    /// Enqueue `item`, evicting the oldest entries until it fits.
    ///
    /// Returns the number of items evicted by this call.
    pub fn push(&self, mut item: T) -> usize {
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    // A consumer may have drained the slot in between; retry either way.
                    if let Ok(oldest) = self.rx.try_recv() {
                        evicted += 1;
                        self.evicted.fetch_add(1, Ordering::Relaxed);
                        if let Some(hook) = &self.on_evict {
                            hook(oldest);
                        }
                    }
                }
                // Unreachable while `self` holds a receiver.
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Wait up to `timeout` for the next item.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Remove and return everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total evictions since creation, across all clones.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Single-slot, latest-wins buffer used for sampled frames.
pub type FrameSlot<T> = EvictingQueue<T>;

/// Create a single-slot buffer.
pub fn frame_slot<T>() -> FrameSlot<T> {
    EvictingQueue::new(1)
}

/// Bounded FIFO whose producer waits for space.
pub struct BlockingQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueue `item`, waiting while the queue is full.
    ///
    /// Gives the item back if `stop` is asserted before space frees up.
    pub fn push_blocking(&self, mut item: T, stop: &StopSignal) -> Result<(), T> {
        loop {
            match self.tx.send_timeout(item, PRODUCER_WAIT_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    if stop.is_stopped() {
                        return Err(back);
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(back)) => return Err(back),
            }
        }
    }

    /// Enqueue without waiting; gives the item back when full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        self.tx.try_send(item).map_err(|err| err.into_inner())
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn evicting_queue_drops_oldest_when_full() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = dropped.clone();
        let queue = EvictingQueue::new(3).with_evict_hook(move |item: u32| {
            sink.lock().unwrap().push(item);
        });

        for i in 0..5 {
            queue.push(i);
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.evicted(), 2);
        assert_eq!(*dropped.lock().unwrap(), vec![0, 1]);
        assert_eq!(queue.drain(), vec![2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn frame_slot_keeps_latest_under_fast_producer() {
        let slot = frame_slot::<u64>();
        let producer = slot.clone();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            for i in 0..10_000u64 {
                producer.push(i);
            }
            started.elapsed()
        });

        let mut seen = Vec::new();
        for _ in 0..5 {
            if let Some(frame) = slot.recv_timeout(Duration::from_millis(5)) {
                seen.push(frame);
            }
            assert!(slot.len() <= 1);
            std::thread::sleep(Duration::from_millis(2));
        }
        let producer_time = handle.join().unwrap();

        // The producer never waited on the slow consumer.
        assert!(producer_time < Duration::from_secs(2));
        assert!(slot.len() <= 1);
        let last = slot.try_recv().or(seen.last().copied());
        assert_eq!(last, Some(9_999));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn blocking_queue_waits_then_gives_back_on_stop() {
        let queue = BlockingQueue::new(1);
        let stop = StopSignal::new();
        queue.push_blocking(1u8, &stop).unwrap();
        assert_eq!(queue.try_push(2), Err(2));

        let producer = queue.clone();
        let producer_stop = stop.clone();
        let handle = std::thread::spawn(move || producer.push_blocking(3, &producer_stop));

        std::thread::sleep(Duration::from_millis(150));
        assert!(!handle.is_finished());
        assert_eq!(queue.len(), 1);

        stop.stop();
        assert_eq!(handle.join().unwrap(), Err(3));
        assert_eq!(queue.recv_timeout(Duration::from_millis(10)), Some(1));
    }

    #[test]
    fn blocking_queue_resumes_when_consumer_drains() {
        let queue = BlockingQueue::new(1);
        let stop = StopSignal::new();
        queue.push_blocking("a", &stop).unwrap();

        let producer = queue.clone();
        let producer_stop = stop.clone();
        let handle = std::thread::spawn(move || producer.push_blocking("b", &producer_stop));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.recv_timeout(Duration::from_millis(10)), Some("a"));
        assert_eq!(handle.join().unwrap(), Ok(()));
        assert_eq!(queue.recv_timeout(Duration::from_millis(200)), Some("b"));
    }
}
