//! Stream Gateway (§4.H).
//!
//! Grounded on the teacher's `api::agents::websocket_handlers::{ConnectionManager,
//! ws_handler, handle_socket}`: a registry plus a background forwarding task
//! that bridges a broadcast stream to subscribers. This module reuses that
//! shape for two responsibilities layered on top of the Event Bus: a bounded
//! per-job ring buffer so a late joiner can replay recent history before
//! tailing live, and a per-agent status view folded from the same stream
//! under a single lock per update (no torn reads).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::models::{AgentId, Event, EventType, JobId, StepId};

use super::events::{EventBus, Subscription};

/// idle/busy/error plus execution counters for one agent, folded from
/// `NODE.START`/`NODE.OUTPUT`/`NODE.ERROR` events across every job (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusSnapshot {
    pub agent_id: AgentId,
    pub state: AgentState,
    pub total_executions: u64,
    pub total_duration_ms: u64,
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl AgentStatusSnapshot {
    fn idle(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            state: AgentState::Idle,
            total_executions: 0,
            total_duration_ms: 0,
            last_execution_at: None,
        }
    }

    /// `None` until the agent's first execution completes.
    pub fn average_duration_ms(&self) -> Option<u64> {
        if self.total_executions == 0 {
            None
        } else {
            Some(self.total_duration_ms / self.total_executions)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Error,
}

/// Handed back by `StreamGateway::subscribe`: the replayed backlog plus a
/// live tail (§4.H "replay the most recent N events ... then live-tail").
pub struct StreamSession {
    pub replay: Vec<Event>,
    subscription: Subscription,
}

impl StreamSession {
    pub async fn recv(&mut self) -> Option<Event> {
        self.subscription.recv().await
    }

    /// Events dropped on the live tail since this session subscribed.
    pub fn missed(&self) -> u64 {
        self.subscription.dropped()
    }
}

struct JobRing {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl JobRing {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, event: Event) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    fn snapshot(&self) -> Vec<Event> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }
}

type StepAgentKey = (JobId, StepId);

/// The Stream Gateway (§4.H). One instance per process, shared behind an
/// `Arc` by the HTTP/WS control surface.
pub struct StreamGateway {
    event_bus: Arc<EventBus>,
    ring_capacity: usize,
    rings: DashMap<JobId, Arc<JobRing>>,
    watched: DashMap<JobId, ()>,
    step_agents: DashMap<StepAgentKey, (AgentId, DateTime<Utc>)>,
    agent_status: DashMap<AgentId, Mutex<AgentStatusSnapshot>>,
}

impl StreamGateway {
    pub fn new(event_bus: Arc<EventBus>, ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            event_bus,
            ring_capacity,
            rings: DashMap::new(),
            watched: DashMap::new(),
            step_agents: DashMap::new(),
            agent_status: DashMap::new(),
        })
    }

    /// Start folding `job_id`'s event stream into the ring buffer and the
    /// agent status view. Idempotent: called once per job by whoever creates
    /// it (§4.G `create`); a second call is a no-op. A subscriber arriving
    /// before anyone has called this still gets a live tail via `subscribe`,
    /// just no replay backlog.
    pub fn watch_job(self: &Arc<Self>, job_id: JobId) {
        if self.watched.insert(job_id, ()).is_some() {
            return;
        }
        let gateway = self.clone();
        let mut subscription = self.event_bus.subscribe(job_id);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                gateway.ingest(job_id, event);
            }
        });
    }

    fn ingest(&self, job_id: JobId, event: Event) {
        self.fold_agent_status(job_id, &event);
        let ring = self
            .rings
            .entry(job_id)
            .or_insert_with(|| Arc::new(JobRing::new(self.ring_capacity)))
            .clone();
        ring.push(event);
    }

    fn fold_agent_status(&self, job_id: JobId, event: &Event) {
        let Some(step_id) = event.step_id.clone() else {
            if event.event_type == EventType::RunFailed {
                self.mark_in_flight_as_errored(job_id);
            }
            return;
        };
        match event.event_type {
            EventType::NodeStart => {
                let Some(agent_id) = event
                    .payload
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .map(AgentId::from)
                else {
                    return;
                };
                self.step_agents
                    .insert((job_id, step_id), (agent_id.clone(), event.timestamp));
                self.touch(&agent_id, |snapshot| snapshot.state = AgentState::Busy);
            }
            EventType::NodeOutput => {
                if let Some((_, (agent_id, started_at))) = self.step_agents.remove(&(job_id, step_id)) {
                    let duration_ms = (event.timestamp - started_at).num_milliseconds().max(0) as u64;
                    self.touch(&agent_id, |snapshot| {
                        snapshot.state = AgentState::Idle;
                        snapshot.total_executions += 1;
                        snapshot.total_duration_ms += duration_ms;
                        snapshot.last_execution_at = Some(event.timestamp);
                    });
                }
            }
            EventType::NodeError => {
                let transient = event
                    .payload
                    .get("transient")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                // Transient errors still retry within `dispatch_step`; the
                // agent only flips to `Error` once the step has no further
                // chance to recover (signaled indirectly by `RunFailed`,
                // since the scheduler never publishes a non-transient
                // `NODE.ERROR`).
                if transient {
                    return;
                }
                if let Some((_, (agent_id, _))) = self.step_agents.remove(&(job_id, step_id)) {
                    self.touch(&agent_id, |snapshot| snapshot.state = AgentState::Error);
                }
            }
            _ => {}
        }
    }

    fn mark_in_flight_as_errored(&self, job_id: JobId) {
        let stranded: Vec<StepAgentKey> = self
            .step_agents
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|(job, _)| *job == job_id)
            .collect();
        for key in stranded {
            if let Some((_, (agent_id, _))) = self.step_agents.remove(&key) {
                self.touch(&agent_id, |snapshot| snapshot.state = AgentState::Error);
            }
        }
    }

    fn touch(&self, agent_id: &AgentId, update: impl FnOnce(&mut AgentStatusSnapshot)) {
        let entry = self
            .agent_status
            .entry(agent_id.clone())
            .or_insert_with(|| Mutex::new(AgentStatusSnapshot::idle(agent_id.clone())));
        update(&mut entry.lock().unwrap());
    }

    /// Replay the ring buffer, then hand back a live tail (§4.H).
    pub fn subscribe(self: &Arc<Self>, job_id: JobId) -> StreamSession {
        self.watch_job(job_id);
        let replay = self
            .rings
            .get(&job_id)
            .map(|ring| ring.snapshot())
            .unwrap_or_default();
        StreamSession {
            replay,
            subscription: self.event_bus.subscribe(job_id),
        }
    }

    pub fn agent_status(&self, agent_id: &AgentId) -> Option<AgentStatusSnapshot> {
        self.agent_status.get(agent_id).map(|entry| entry.lock().unwrap().clone())
    }

    pub fn all_agent_statuses(&self) -> Vec<AgentStatusSnapshot> {
        self.agent_status.iter().map(|entry| entry.lock().unwrap().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_start(job_id: JobId, step_id: &str, agent_id: &str) -> Event {
        Event::new(
            EventType::NodeStart,
            job_id,
            Some(StepId::from(step_id)),
            serde_json::json!({"agent_id": agent_id}),
        )
    }

    fn node_output(job_id: JobId, step_id: &str) -> Event {
        Event::new(EventType::NodeOutput, job_id, Some(StepId::from(step_id)), serde_json::json!({}))
    }

    #[tokio::test]
    async fn late_joiner_replays_then_tails_live() {
        let bus = Arc::new(EventBus::new(16));
        let gateway = StreamGateway::new(bus.clone(), 8);
        let job_id = JobId::new();
        gateway.watch_job(job_id);
        bus.publish(node_start(job_id, "A", "writer"));
        bus.publish(node_output(job_id, "A"));
        // Give the ingest task a chance to drain what was just published.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut session = gateway.subscribe(job_id);
        assert_eq!(session.replay.len(), 2);

        bus.publish(node_start(job_id, "B", "writer"));
        let live = session.recv().await.unwrap();
        assert_eq!(live.event_type, EventType::NodeStart);
    }

    #[tokio::test]
    async fn agent_status_tracks_busy_then_idle_with_duration() {
        let bus = Arc::new(EventBus::new(16));
        let gateway = StreamGateway::new(bus.clone(), 8);
        let job_id = JobId::new();
        gateway.watch_job(job_id);

        bus.publish(node_start(job_id, "A", "writer"));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(
            gateway.agent_status(&AgentId::from("writer")).unwrap().state,
            AgentState::Busy
        );

        bus.publish(node_output(job_id, "A"));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let status = gateway.agent_status(&AgentId::from("writer")).unwrap();
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.total_executions, 1);
    }

    #[tokio::test]
    async fn run_failed_errors_any_agent_still_in_flight() {
        let bus = Arc::new(EventBus::new(16));
        let gateway = StreamGateway::new(bus.clone(), 8);
        let job_id = JobId::new();
        gateway.watch_job(job_id);

        bus.publish(node_start(job_id, "A", "writer"));
        bus.publish(Event::new(EventType::RunFailed, job_id, None, serde_json::json!({})));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(
            gateway.agent_status(&AgentId::from("writer")).unwrap().state,
            AgentState::Error
        );
    }
}
