//! Priority Queue
//!
//! Four strict FIFO lanes, one per [`Priority`]. `pop` always drains higher
//! lanes first; lower lanes wait while higher lanes are non-empty. There is
//! no fairness across lanes.
//!
//! ## Usage
//!
//! ```
//! use tokio_service_router::bus::queue::PriorityQueue;
//! use tokio_service_router::Priority;
//!
//! let queue = PriorityQueue::with_capacity(16);
//! queue.push(Priority::Low, "report").ok();
//! queue.push(Priority::Critical, "page").ok();
//!
//! assert_eq!(queue.pop(), Some((Priority::Critical, "page")));
//! assert_eq!(queue.pop(), Some((Priority::Low, "report")));
//! ```

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::debug;

use super::message::Priority;
use crate::{metrics, RouterError};

/// Queue error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has reached its maximum capacity.
    #[error("queue full ({capacity} items)")]
    Full {
        /// Configured capacity.
        capacity: usize,
    },
}

impl From<QueueError> for RouterError {
    fn from(_: QueueError) -> Self {
        RouterError::QueueFull
    }
}

/// Queue statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    /// Items across all lanes.
    pub total: usize,
    /// Items per lane.
    pub by_priority: HashMap<Priority, usize>,
    /// Configured capacity.
    pub capacity: usize,
}

/// Bounded four-lane priority queue.
pub struct PriorityQueue<T> {
    lanes: Mutex<[VecDeque<T>; 4]>,
    capacity: usize,
    notify: Notify,
}

impl<T> std::fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> PriorityQueue<T> {
    /// Create priority queue with specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Default::default()),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append `item` to the tail of its lane.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] when every slot is taken.
    pub fn push(&self, priority: Priority, item: T) -> Result<(), QueueError> {
        let depth = {
            let mut lanes = self.lanes.lock();
            let total: usize = lanes.iter().map(VecDeque::len).sum();
            if total >= self.capacity {
                debug!(priority = %priority, capacity = self.capacity, "queue full");
                return Err(QueueError::Full {
                    capacity: self.capacity,
                });
            }
            let lane = &mut lanes[priority.lane()];
            lane.push_back(item);
            lane.len()
        };
        metrics::set_queue_depth(priority.as_str(), depth);
        self.notify.notify_one();
        Ok(())
    }

    /// Remove the head of the highest non-empty lane.
    pub fn pop(&self) -> Option<(Priority, T)> {
        let popped = {
            let mut lanes = self.lanes.lock();
            Priority::DRAIN_ORDER.iter().find_map(|p| {
                let lane = &mut lanes[p.lane()];
                lane.pop_front().map(|item| (*p, item, lane.len()))
            })
        };
        popped.map(|(priority, item, depth)| {
            metrics::set_queue_depth(priority.as_str(), depth);
            (priority, item)
        })
    }

    /// [`pop`](Self::pop), waiting up to `wait` for an item when empty.
    pub async fn pop_wait(&self, wait: Duration) -> Option<(Priority, T)> {
        if let Some(found) = self.pop() {
            return Some(found);
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Re-check after registering so a concurrent push is not missed.
        if let Some(found) = self.pop() {
            return Some(found);
        }
        let _ = tokio::time::timeout(wait, notified).await;
        self.pop()
    }

    /// Remove and return every item matching `pred`, lane order preserved.
    pub fn remove_where<F>(&self, mut pred: F) -> Vec<(Priority, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let mut lanes = self.lanes.lock();
        for priority in Priority::DRAIN_ORDER {
            let lane = &mut lanes[priority.lane()];
            let mut kept = VecDeque::with_capacity(lane.len());
            for item in lane.drain(..) {
                if pred(&item) {
                    removed.push((priority, item));
                } else {
                    kept.push_back(item);
                }
            }
            *lane = kept;
        }
        removed
    }

    /// Get current queue size
    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items waiting in one lane.
    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes.lock()[priority.lane()].len()
    }

    /// Get queue statistics by priority
    pub fn stats(&self) -> QueueStats {
        let lanes = self.lanes.lock();
        let by_priority: HashMap<Priority, usize> = Priority::DRAIN_ORDER
            .iter()
            .map(|p| (*p, lanes[p.lane()].len()))
            .collect();
        QueueStats {
            total: by_priority.values().sum(),
            by_priority,
            capacity: self.capacity,
        }
    }

    /// Drop every queued item.
    pub fn clear(&self) {
        self.lanes.lock().iter_mut().for_each(VecDeque::clear);
        debug!("priority queue cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_priority_ordering() {
        let queue = PriorityQueue::with_capacity(10);
        let order = [
            Priority::Low,
            Priority::Critical,
            Priority::Medium,
            Priority::Critical,
            Priority::High,
        ];
        for (i, p) in order.iter().enumerate() {
            assert!(queue.push(*p, i).is_ok());
        }
        let drained: Vec<Priority> = std::iter::from_fn(|| queue.pop()).map(|(p, _)| p).collect();
        assert_eq!(
            drained,
            vec![
                Priority::Critical,
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Low
            ]
        );
    }

    #[test]
    fn test_fifo_within_lane() {
        let queue = PriorityQueue::with_capacity(10);
        for i in 0..5 {
            let _ = queue.push(Priority::High, i);
        }
        let items: Vec<i32> = std::iter::from_fn(|| queue.pop()).map(|(_, i)| i).collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_queue_full() {
        let queue = PriorityQueue::with_capacity(2);
        assert!(queue.push(Priority::Low, 1).is_ok());
        assert!(queue.push(Priority::Low, 2).is_ok());
        assert_eq!(
            queue.push(Priority::Critical, 3),
            Err(QueueError::Full { capacity: 2 })
        );
        let err: RouterError = QueueError::Full { capacity: 2 }.into();
        assert!(matches!(err, RouterError::QueueFull));
    }

    #[test]
    fn test_stats_and_remove_where() {
        let queue = PriorityQueue::with_capacity(10);
        let _ = queue.push(Priority::Low, 1);
        let _ = queue.push(Priority::Low, 2);
        let _ = queue.push(Priority::High, 3);
        let stats = queue.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority.get(&Priority::Low), Some(&2));

        let removed = queue.remove_where(|i| i % 2 == 1);
        assert_eq!(removed, vec![(Priority::High, 3), (Priority::Low, 1)]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.lane_len(Priority::Low), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_wait_times_out_when_empty() {
        let queue: PriorityQueue<u8> = PriorityQueue::with_capacity(1);
        assert_eq!(queue.pop_wait(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let queue = Arc::new(PriorityQueue::with_capacity(4));
        let q = Arc::clone(&queue);
        let waiter = tokio::spawn(async move { q.pop_wait(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        let _ = queue.push(Priority::Medium, 7u8);
        let got = waiter.await.ok().flatten();
        assert_eq!(got, Some((Priority::Medium, 7)));
    }
}
