use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use util::{Error, Result};

/// In-band element of a stage queue. `Eof` flows through every queue so
/// downstream stages see the end of input in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem<T> {
    Item(T),
    Eof,
}

/// Bounded stage queue connecting two pipeline threads. Producers block
/// while full, consumers while empty; every wait is bounded so shutdown
/// is observed within a second.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<QueueItem<T>>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(BoundedQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Non-blocking enqueue; `false` when the queue is full.
    pub fn try_push(&self, item: QueueItem<T>) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
        true
    }

    /// Blocking enqueue; fails `Signal` on shutdown.
    pub fn push(&self, item: QueueItem<T>) -> Result<()> {
        let mut queue = self.inner.lock();
        while queue.len() >= self.capacity {
            if util::shutdown::exit_requested() {
                return Err(Error::Signal);
            }
            self.not_full.wait_for(&mut queue, Duration::from_secs(1));
        }
        queue.push_back(item);
        drop(queue);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<QueueItem<T>> {
        let mut queue = self.inner.lock();
        let item = queue.pop_front();
        if item.is_some() {
            drop(queue);
            self.not_full.notify_one();
        }
        item
    }

    /// Blocking dequeue; fails `Signal` on shutdown.
    pub fn pop(&self) -> Result<QueueItem<T>> {
        let mut queue = self.inner.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                drop(queue);
                self.not_full.notify_one();
                return Ok(item);
            }
            if util::shutdown::exit_requested() {
                return Err(Error::Signal);
            }
            self.not_empty.wait_for(&mut queue, Duration::from_secs(1));
        }
    }
}

#[cfg(test)]
mod queue_test {
    use super::*;

    #[test]
    fn test_fifo_order_with_eof() {
        let queue = BoundedQueue::new(4);
        queue.push(QueueItem::Item(1)).unwrap();
        queue.push(QueueItem::Item(2)).unwrap();
        queue.push(QueueItem::Eof).unwrap();
        assert_eq!(queue.pop().unwrap(), QueueItem::Item(1));
        assert_eq!(queue.pop().unwrap(), QueueItem::Item(2));
        assert_eq!(queue.pop().unwrap(), QueueItem::Eof);
    }

    #[test]
    fn test_try_push_respects_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.try_push(QueueItem::Item(1)));
        assert!(queue.try_push(QueueItem::Item(2)));
        assert!(!queue.try_push(QueueItem::Item(3)));
        assert_eq!(queue.try_pop(), Some(QueueItem::Item(1)));
        assert!(queue.try_push(QueueItem::Item(3)));
    }

    #[test]
    fn test_blocked_producer_wakes_on_pop() {
        let queue = BoundedQueue::new(1);
        queue.push(QueueItem::Item(0)).unwrap();

        let producer_queue = queue.clone();
        let producer = std::thread::spawn(move || producer_queue.push(QueueItem::Item(1)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.pop().unwrap(), QueueItem::Item(0));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap(), QueueItem::Item(1));
    }

    #[test]
    fn test_blocked_consumer_wakes_on_push() {
        let queue: Arc<BoundedQueue<u32>> = BoundedQueue::new(2);
        let consumer_queue = queue.clone();
        let consumer = std::thread::spawn(move || consumer_queue.pop());
        std::thread::sleep(Duration::from_millis(30));
        queue.push(QueueItem::Item(7)).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap(), QueueItem::Item(7));
    }
}
