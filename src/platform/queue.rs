//! Message Queue - FIFO or priority-ordered message buffer

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

use super::types::Message;

/// Dequeue ordering policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrdering {
    /// Strict enqueue order; `priority` is metadata only
    #[default]
    Fifo,
    /// Highest `priority` first, enqueue order among equals
    Priority,
}

/// Wraps a message with its ordering key
#[derive(Debug)]
struct QueuedMessage {
    message: Message,
    rank: i32,
    sequence: u64, // FIFO tie-break within the same rank
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher rank first, then lower sequence
        match self.rank.cmp(&other.rank) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ord => ord,
        }
    }
}

/// Message buffer owned by the router
pub struct MessageQueue {
    heap: BinaryHeap<QueuedMessage>,
    ordering: QueueOrdering,
    sequence_counter: u64,
    enqueued_count: u64,
    dequeued_count: u64,
    dropped_count: u64,
}

impl MessageQueue {
    pub fn new(ordering: QueueOrdering) -> Self {
        Self {
            heap: BinaryHeap::new(),
            ordering,
            sequence_counter: 0,
            enqueued_count: 0,
            dequeued_count: 0,
            dropped_count: 0,
        }
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.ordering
    }

    pub fn enqueue(&mut self, message: Message) {
        let rank = match self.ordering {
            QueueOrdering::Fifo => 0,
            QueueOrdering::Priority => message.priority,
        };
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;

        debug!(
            id = %message.id,
            kind = %message.message_type,
            sender = %message.sender,
            recipient = %message.recipient,
            "enqueuing message"
        );

        self.heap.push(QueuedMessage {
            message,
            rank,
            sequence,
        });
        self.enqueued_count += 1;
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        let queued = self.heap.pop()?;
        self.dequeued_count += 1;
        Some(queued.message)
    }

    pub fn peek(&self) -> Option<&Message> {
        self.heap.peek().map(|q| &q.message)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Discard every queued message, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.heap.len();
        self.heap.clear();
        self.dropped_count += dropped as u64;
        dropped
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            current_size: self.heap.len(),
            enqueued_total: self.enqueued_count,
            dequeued_total: self.dequeued_count,
            dropped_total: self.dropped_count,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub dropped_total: u64,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Queue[size={}, enq={}, deq={}, dropped={}]",
            self.current_size, self.enqueued_total, self.dequeued_total, self.dropped_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::types::{MessageType, Payload};

    fn msg(id: &str, priority: i32) -> Message {
        Message::new(MessageType::Data, "a", "b", Payload::new())
            .with_id(id)
            .with_priority(priority)
    }

    #[test]
    fn test_fifo_ignores_priority() {
        let mut queue = MessageQueue::new(QueueOrdering::Fifo);
        queue.enqueue(msg("low", 1));
        queue.enqueue(msg("high", 10));
        queue.enqueue(msg("mid", 5));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue().map(|m| m.id)).collect();
        assert_eq!(order, vec!["low", "high", "mid"]);
    }

    #[test]
    fn test_priority_ordering_with_fifo_ties() {
        let mut queue = MessageQueue::new(QueueOrdering::Priority);
        queue.enqueue(msg("low", 1));
        queue.enqueue(msg("high-1", 10));
        queue.enqueue(msg("mid", 5));
        queue.enqueue(msg("high-2", 10));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue().map(|m| m.id)).collect();
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
    }

    #[test]
    fn test_clear_counts_dropped() {
        let mut queue = MessageQueue::new(QueueOrdering::Fifo);
        queue.enqueue(msg("1", 0));
        queue.enqueue(msg("2", 0));
        queue.enqueue(msg("3", 0));
        assert!(queue.dequeue().is_some());

        assert_eq!(queue.clear(), 2);
        let stats = queue.stats();
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.enqueued_total, 3);
        assert_eq!(stats.dequeued_total, 1);
        assert_eq!(stats.dropped_total, 2);
    }
}
