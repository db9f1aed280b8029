//! Event Bus (§4.D).
//!
//! Generalizes the teacher's single crate-wide `broadcast::Sender` (see
//! `ResourceEvents`/`EventBus` in the Petri-net engine) to one channel per
//! `job_id`, because the spec requires independent per-subscriber bounded
//! buffers and FIFO-per-subscription delivery that a single shared channel
//! cannot give without one slow subscriber's backlog affecting another
//! job's subscribers. `dashmap` replaces the teacher's bare struct field
//! because many jobs' channels are created and torn down concurrently.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::models::{Event, JobId};

/// A subscription to one job's event stream. Wraps the broadcast receiver
/// and exposes the drop counter the spec requires at `subscriber.dropped`.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Receive the next event, or `None` once the job's channel has closed
    /// (all publishers gone) and nothing remains buffered.
    ///
    /// A `Lagged(n)` error means the per-subscriber buffer overflowed: the
    /// oldest `n` events for this subscriber were dropped. We count them and
    /// keep reading rather than surface the error to the caller (§4.D:
    /// "the publisher is never blocked by a slow subscriber").
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Count of events dropped for this subscriber so far (§4.D
    /// `subscriber.dropped(count)`).
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct JobChannel {
    sender: broadcast::Sender<Event>,
}

/// Per-process dispatcher keyed by `job_id` (§4.D).
pub struct EventBus {
    channels: DashMap<JobId, JobChannel>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            channels: DashMap::new(),
            buffer_size,
        }
    }

    /// Publish an event. Creates the job's channel lazily on first use so a
    /// scheduler doesn't need to pre-register before emitting `RUN.QUEUED`.
    pub fn publish(&self, event: Event) {
        let job_id = event.job_id;
        let channel = self
            .channels
            .entry(job_id)
            .or_insert_with(|| JobChannel {
                sender: broadcast::channel(self.buffer_size).0,
            });
        // No receivers yet is not an error — publishing is fire-and-forget.
        let _ = channel.sender.send(event);
    }

    /// Subscribe to a job's event stream. Events published before this call
    /// are not replayed here — replay-for-late-joiners is the Stream
    /// Gateway's responsibility via its own ring buffer (§4.H).
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let channel = self
            .channels
            .entry(job_id)
            .or_insert_with(|| JobChannel {
                sender: broadcast::channel(self.buffer_size).0,
            });
        Subscription {
            receiver: channel.sender.subscribe(),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tear down a job's channel once it reaches a terminal status and its
    /// subscribers have drained (§4.D lifecycle).
    pub fn close(&self, job_id: &JobId) {
        self.channels.remove(job_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
