// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample fan-out between an outlet and its subscribers.
//!
//! The [`SendBuffer`] is the multi-producer side: every pushed sample is
//! handed to all registered [`ConsumerQueue`]s. Each consumer queue is a
//! bounded ring with lossy backpressure - when a slow subscriber falls
//! `max_buffered` samples behind, the oldest queued sample is dropped so
//! the stream stays current rather than arbitrarily late.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::sample::Sample;

/// Fan-out point for one outlet's samples.
pub struct SendBuffer {
    consumers: Mutex<Vec<Weak<ConsumerQueue>>>,
}

impl SendBuffer {
    /// New send buffer with no consumers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            consumers: Mutex::new(Vec::new()),
        })
    }

    /// Register a new consumer with the given capacity.
    ///
    /// A non-positive capacity still yields a queue of capacity 1 so the
    /// wakeup ping can get through; sessions with `max_buffered <= 0` never
    /// reach the pump anyway.
    pub fn new_consumer(self: &Arc<Self>, max_buffered: i32) -> Arc<ConsumerQueue> {
        let capacity = if max_buffered > 0 {
            max_buffered as usize
        } else {
            1
        };
        let queue = Arc::new(ConsumerQueue {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            available: Condvar::new(),
            capacity,
        });
        self.consumers.lock().push(Arc::downgrade(&queue));
        queue
    }

    /// Deliver a sample to every live consumer, pruning dead ones.
    pub fn push_sample(&self, sample: &Arc<Sample>) {
        let mut consumers = self.consumers.lock();
        consumers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(Arc::clone(sample));
                true
            }
            None => false,
        });
    }

    /// Number of currently registered (live) consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().iter().filter(|w| w.strong_count() > 0).count()
    }
}

/// Bounded blocking queue feeding one transfer pump.
pub struct ConsumerQueue {
    ring: Mutex<VecDeque<Arc<Sample>>>,
    available: Condvar,
    capacity: usize,
}

impl ConsumerQueue {
    fn push(&self, sample: Arc<Sample>) {
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
            log::debug!("[buffer] consumer queue full, dropping oldest sample");
        }
        ring.push_back(sample);
        drop(ring);
        self.available.notify_one();
    }

    /// Blocking pop; parks the pump thread until a sample arrives.
    pub fn pop_sample(&self) -> Arc<Sample> {
        let mut ring = self.ring.lock();
        loop {
            if let Some(sample) = ring.pop_front() {
                return sample;
            }
            self.available.wait(&mut ring);
        }
    }

    /// Non-blocking pop, for tests and polling consumers.
    pub fn try_pop(&self) -> Option<Arc<Sample>> {
        self.ring.lock().pop_front()
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    /// True when no samples are queued.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn sample(v: f32) -> Arc<Sample> {
        Arc::new(Sample::from_f32(&[v], 1.0, false))
    }

    #[test]
    fn test_fanout_reaches_all_consumers() {
        let buffer = SendBuffer::new();
        let a = buffer.new_consumer(8);
        let b = buffer.new_consumer(8);
        buffer.push_sample(&sample(1.0));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_dead_consumers_are_pruned() {
        let buffer = SendBuffer::new();
        let a = buffer.new_consumer(8);
        {
            let _b = buffer.new_consumer(8);
        }
        buffer.push_sample(&sample(1.0));
        assert_eq!(buffer.consumer_count(), 1);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let buffer = SendBuffer::new();
        let q = buffer.new_consumer(2);
        for v in [1.0f32, 2.0, 3.0] {
            buffer.push_sample(&sample(v));
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_sample().as_f32().unwrap(), vec![2.0]);
        assert_eq!(q.pop_sample().as_f32().unwrap(), vec![3.0]);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let buffer = SendBuffer::new();
        let q = buffer.new_consumer(4);
        let handle = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop_sample())
        };
        thread::sleep(Duration::from_millis(50));
        buffer.push_sample(&sample(7.0));
        let got = handle.join().unwrap();
        assert_eq!(got.as_f32().unwrap(), vec![7.0]);
    }

    #[test]
    fn test_wakeup_ping_delivered() {
        let buffer = SendBuffer::new();
        let q = buffer.new_consumer(1);
        buffer.push_sample(&Arc::new(Sample::wakeup()));
        assert!(q.pop_sample().wakeup);
    }
}
