// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Multi-producer / single-consumer queue used to hand work to the owner thread.
//!
//! Producers (I/O workers, arbitrary application threads) call [`CrossThreadQueue::enqueue`]
//! concurrently. Exactly one consumer drains it with [`CrossThreadQueue::dequeue`], which
//! never blocks. Items pushed by the same producer come out in push order; items of
//! different producers interleave arbitrarily.

use std::fmt;
use std::thread::{self, ThreadId};

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;

pub struct CrossThreadQueue<T> {
    queue: SegQueue<T>,
    consumer: OnceCell<ThreadId>,
}

impl<T> CrossThreadQueue<T> {
    pub fn new() -> Self {
        CrossThreadQueue {
            queue: SegQueue::new(),
            consumer: OnceCell::new(),
        }
    }

    pub fn enqueue(&self, item: T) {
        self.queue.push(item);
    }

    /// Pops the oldest item, `None` when empty.
    ///
    /// In debug builds the first thread that dequeues becomes the consumer, later calls
    /// from any other thread panic.
    pub fn dequeue(&self) -> Option<T> {
        #[cfg(debug_assertions)]
        {
            let current = thread::current().id();
            assert!(
                *self.consumer.get_or_init(|| current) == current,
                "CrossThreadQueue drained from a second consumer thread"
            );
        }
        self.queue.pop()
    }

    /// True on the bound consumer thread, and on every thread while nothing was drained.
    /// Never binds.
    pub fn is_consumer_thread(&self) -> bool {
        self.consumer
            .get()
            .map_or(true, |consumer| *consumer == thread::current().id())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Default for CrossThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CrossThreadQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossThreadQueue")
            .field("len", &self.queue.len())
            .field("consumer", &self.consumer.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn empty_queue_returns_none() {
        let queue: CrossThreadQueue<u32> = CrossThreadQueue::new();
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_per_producer() {
        const PRODUCERS: usize = 8;
        const ITEMS: usize = 1000;
        let queue = Arc::new(CrossThreadQueue::new());

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for seq in 0..ITEMS {
                        queue.enqueue((producer, seq));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut next = [0usize; PRODUCERS];
        let mut total = 0;
        while let Some((producer, seq)) = queue.dequeue() {
            assert_eq!(next[producer], seq, "producer {} out of order", producer);
            next[producer] += 1;
            total += 1;
        }
        assert_eq!(total, PRODUCERS * ITEMS);
    }

    #[test]
    fn query_from_another_thread_does_not_bind() {
        let queue = Arc::new(CrossThreadQueue::<u8>::new());
        let other = queue.clone();
        let on_other_thread = thread::spawn(move || other.is_consumer_thread())
            .join()
            .unwrap();
        assert!(on_other_thread);

        queue.enqueue(1);
        assert_eq!(queue.dequeue(), Some(1));
        assert!(queue.is_consumer_thread());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn consumer_is_bound_on_first_dequeue() {
        let queue = Arc::new(CrossThreadQueue::<u8>::new());
        assert!(queue.dequeue().is_none());
        assert!(queue.is_consumer_thread());

        let other = queue.clone();
        let on_other_thread = thread::spawn(move || other.is_consumer_thread())
            .join()
            .unwrap();
        assert!(!on_other_thread);
    }
}
