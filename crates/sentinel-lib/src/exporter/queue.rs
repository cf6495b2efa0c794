//! Bounded in-memory queue of captured requests awaiting export
//!
//! Insertion order is send order. When the queue is at capacity the oldest
//! entries are evicted first, so memory stays bounded during long outages.

use crate::models::CapturedRequest;
use std::collections::VecDeque;
use tokio::time::Instant;

/// Default maximum queue length
pub const DEFAULT_MAX_QUEUE_LEN: usize = 10_000;

#[derive(Debug, Clone)]
struct QueuedRequest {
    request: CapturedRequest,
    enqueued_at: Instant,
}

/// Ring buffer of sanitized requests
#[derive(Debug)]
pub struct EventQueue {
    buffer: VecDeque<QueuedRequest>,
    max_len: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            buffer: VecDeque::with_capacity(max_len.min(1_024)),
            max_len,
            dropped: 0,
        }
    }

    /// Append a request, evicting the oldest entries if at capacity.
    /// Returns how many entries were evicted.
    pub fn push(&mut self, request: CapturedRequest) -> usize {
        let mut evicted = 0;
        while self.buffer.len() >= self.max_len {
            self.buffer.pop_front();
            evicted += 1;
        }
        self.dropped += evicted as u64;

        self.buffer.push_back(QueuedRequest {
            request,
            enqueued_at: Instant::now(),
        });
        evicted
    }

    /// Remove up to `limit` of the oldest entries, keeping their enqueue
    /// times so a failed batch can be put back unchanged
    pub fn drain_batch(&mut self, limit: usize) -> Vec<(CapturedRequest, Instant)> {
        let count = limit.min(self.buffer.len());
        self.buffer
            .drain(..count)
            .map(|q| (q.request, q.enqueued_at))
            .collect()
    }

    /// Put a failed batch back at the front, preserving its order. Returns
    /// how many of the oldest entries were evicted to respect the cap.
    pub fn requeue_front(&mut self, batch: Vec<(CapturedRequest, Instant)>) -> usize {
        for (request, enqueued_at) in batch.into_iter().rev() {
            self.buffer.push_front(QueuedRequest {
                request,
                enqueued_at,
            });
        }

        let mut evicted = 0;
        while self.buffer.len() > self.max_len {
            self.buffer.pop_front();
            evicted += 1;
        }
        self.dropped += evicted as u64;
        evicted
    }

    /// Count entries lost after they left the queue
    pub fn record_dropped(&mut self, count: usize) {
        self.dropped += count as u64;
    }

    /// Enqueue time of the oldest unflushed entry
    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.buffer.front().map(|q| q.enqueued_at)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.buffer.len(),
            capacity: self.max_len,
            dropped: self.dropped,
        }
    }
}

/// Exporter queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries waiting to be sent
    pub queued: usize,
    pub capacity: usize,
    /// Entries lost since start, whether evicted by the cap, refused by the
    /// collector or abandoned at shutdown
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request(path: &str) -> CapturedRequest {
        CapturedRequest {
            timestamp_ms: 0,
            method: "GET".to_string(),
            path: path.to_string(),
            status_code: 200,
            latency_ms: 3,
            headers: BTreeMap::new(),
            query_params: BTreeMap::new(),
            ip: None,
            user_agent: None,
            country_code: None,
        }
    }

    fn paths(queue: &mut EventQueue) -> Vec<String> {
        queue
            .drain_batch(usize::MAX)
            .into_iter()
            .map(|(r, _)| r.path)
            .collect()
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut queue = EventQueue::new(3);
        for p in ["/1", "/2", "/3"] {
            assert_eq!(queue.push(request(p)), 0);
        }
        assert_eq!(queue.push(request("/4")), 1);

        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(paths(&mut queue), vec!["/2", "/3", "/4"]);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let mut queue = EventQueue::new(10);
        for p in ["/1", "/2", "/3"] {
            queue.push(request(p));
        }
        let batch = queue.drain_batch(2);
        queue.push(request("/4"));

        assert_eq!(queue.requeue_front(batch), 0);
        assert_eq!(paths(&mut queue), vec!["/1", "/2", "/3", "/4"]);
    }

    #[test]
    fn test_requeue_respects_cap() {
        let mut queue = EventQueue::new(3);
        for p in ["/1", "/2"] {
            queue.push(request(p));
        }
        let batch = queue.drain_batch(2);
        queue.push(request("/3"));
        queue.push(request("/4"));

        // Oldest entries go first, even when they were just requeued
        assert_eq!(queue.requeue_front(batch), 1);
        assert_eq!(paths(&mut queue), vec!["/2", "/3", "/4"]);
    }

    #[test]
    fn test_oldest_enqueued_at_tracks_front() {
        let mut queue = EventQueue::new(10);
        assert!(queue.oldest_enqueued_at().is_none());
        queue.push(request("/1"));
        let first = queue.oldest_enqueued_at().unwrap();
        queue.push(request("/2"));
        assert_eq!(queue.oldest_enqueued_at(), Some(first));
    }
}
