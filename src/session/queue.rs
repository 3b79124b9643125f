//! Bounded per-session work queue with drop-oldest backpressure.
//!
//! `enqueue` never waits: when the queue is full the oldest chunk is evicted
//! and the new one admitted. `dequeue` waits until a chunk arrives or the
//! queue is closed; after `close()` the remaining chunks are still handed out,
//! then `dequeue` returns `None`.

use crate::audio::AudioChunk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

#[derive(Debug, PartialEq)]
pub enum EnqueueOutcome {
    Accepted,
    /// The queue was full; this chunk was evicted to make room
    DroppedOldest(AudioChunk),
    /// The queue is closed; the offered chunk is handed back
    Closed(AudioChunk),
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<AudioChunk>,
    closed: bool,
}

#[derive(Debug)]
pub struct WorkQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, chunk: AudioChunk) -> EnqueueOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return EnqueueOutcome::Closed(chunk);
            }

            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(chunk);

            match evicted {
                Some(old) => EnqueueOutcome::DroppedOldest(old),
                None => EnqueueOutcome::Accepted,
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next chunk. `None` means closed and fully drained.
    pub async fn dequeue(&self) -> Option<AudioChunk> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(chunk) = state.items.pop_front() {
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            // A permit stored by notify_one covers a push that raced this wait
            self.notify.notified().await;
        }
    }

    /// Stop accepting chunks and wake the consumer. Acts as the end-of-stream marker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

}
