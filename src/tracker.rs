//! Request tracking for queue visibility (`/queue/status`, `/stats`).
//!
//! Holds the full lifecycle of every in-flight and recently-completed
//! request behind a single async mutex. Eviction runs on the same
//! `tokio::select!` interval/shutdown shape as the rest of the workspace's
//! background workers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::info;

const RECENT_COMPLETED_WINDOW: Duration = Duration::from_secs(60);
const LIST_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    InFlight,
    Completed,
    Failed,
}

/// A single tracked request in the queue.
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub request_id: String,
    pub source: String,
    pub model: String,
    pub path: String,
    pub submitted_at: Instant,
    /// Wall-clock mirror of `submitted_at`, surfaced in `/queue/status` as
    /// an ISO-8601 string; `Instant` itself isn't meaningful off-process.
    pub submitted_at_utc: DateTime<Utc>,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub backend: Option<String>,
    pub status: Status,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub client_command: Option<String>,
    pub request_summary: Option<String>,
    pub response_summary: Option<String>,
    pub backend_time_ms: Option<f64>,
    pub agent_pre_ms: Option<f64>,
    pub agent_post_ms: Option<f64>,
    pub turn_number: Option<u64>,
}

impl TrackedRequest {
    fn to_json(&self, now: Instant) -> serde_json::Value {
        let started = self.started_at.unwrap_or(self.submitted_at);
        let mut obj = serde_json::json!({
            "request_id": self.request_id,
            "source": self.source,
            "model": self.model,
            "status": status_str(self.status),
            "backend": self.backend,
            "wait_time_ms": round2(started.saturating_duration_since(self.submitted_at).as_secs_f64() * 1000.0),
            "submitted_at": self.submitted_at_utc.to_rfc3339(),
        });
        let map = obj.as_object_mut().unwrap();
        if self.started_at.is_some() && self.status == Status::InFlight {
            map.insert(
                "processing_time_ms".to_string(),
                round2(now.saturating_duration_since(started).as_secs_f64() * 1000.0).into(),
            );
        }
        if let Some(completed_at) = self.completed_at {
            map.insert(
                "total_time_ms".to_string(),
                round2(completed_at.saturating_duration_since(self.submitted_at).as_secs_f64() * 1000.0).into(),
            );
        }
        if let Some(sid) = &self.session_id {
            map.insert("session_id".to_string(), sid.clone().into());
            map.insert("episode_id".to_string(), sid.clone().into());
        }
        if let Some(tid) = &self.task_id {
            map.insert("task_id".to_string(), tid.clone().into());
            map.insert("instruction_id".to_string(), tid.clone().into());
        }
        obj
    }
}

fn status_str(s: Status) -> &'static str {
    match s {
        Status::Pending => "pending",
        Status::InFlight => "in_flight",
        Status::Completed => "completed",
        Status::Failed => "failed",
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fields supplied when registering a new request.
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub source: String,
    pub model: String,
    pub path: String,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
    pub client_id: Option<String>,
    pub client_command: Option<String>,
}

struct Inner {
    requests: HashMap<String, TrackedRequest>,
    session_turn_counters: HashMap<String, u64>,
}

pub struct RequestTracker {
    inner: Mutex<Inner>,
    max_history: usize,
    cleanup_interval: Duration,
    stale_timeout: Duration,
}

impl RequestTracker {
    pub fn new(max_history: usize, cleanup_interval: Duration, stale_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                session_turn_counters: HashMap::new(),
            }),
            max_history,
            cleanup_interval,
            stale_timeout,
        }
    }

    pub async fn submit(&self, request_id: String, args: SubmitArgs) {
        let mut inner = self.inner.lock().await;

        let turn_number = args.session_id.as_ref().map(|sid| {
            let counter = inner.session_turn_counters.entry(sid.clone()).or_insert(0);
            *counter += 1;
            *counter
        });

        inner.requests.insert(
            request_id.clone(),
            TrackedRequest {
                request_id,
                source: args.source,
                model: args.model,
                path: args.path,
                submitted_at: Instant::now(),
                submitted_at_utc: Utc::now(),
                started_at: None,
                completed_at: None,
                backend: None,
                status: Status::Pending,
                session_id: args.session_id,
                task_id: args.task_id,
                client_id: args.client_id,
                client_command: args.client_command,
                request_summary: None,
                response_summary: None,
                backend_time_ms: None,
                agent_pre_ms: None,
                agent_post_ms: None,
                turn_number,
            },
        );
    }

    pub async fn start_processing(&self, request_id: &str, backend: String) {
        let mut inner = self.inner.lock().await;
        if let Some(req) = inner.requests.get_mut(request_id) {
            req.started_at = Some(Instant::now());
            req.backend = Some(backend);
            req.status = Status::InFlight;
        }
    }

    /// Attach annotations collected from request/response bodies and timing
    /// headers. Called once the proxy has the information available, before
    /// `complete`.
    pub async fn annotate(
        &self,
        request_id: &str,
        request_summary: Option<String>,
        response_summary: Option<String>,
        backend_time_ms: Option<f64>,
        agent_pre_ms: Option<f64>,
        agent_post_ms: Option<f64>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(req) = inner.requests.get_mut(request_id) {
            if request_summary.is_some() {
                req.request_summary = request_summary;
            }
            if response_summary.is_some() {
                req.response_summary = response_summary;
            }
            if backend_time_ms.is_some() {
                req.backend_time_ms = backend_time_ms;
            }
            if agent_pre_ms.is_some() {
                req.agent_pre_ms = agent_pre_ms;
            }
            if agent_post_ms.is_some() {
                req.agent_post_ms = agent_post_ms;
            }
        }
    }

    pub async fn complete(&self, request_id: &str, success: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(req) = inner.requests.get_mut(request_id) {
            req.completed_at = Some(Instant::now());
            req.status = if success { Status::Completed } else { Status::Failed };
        }
    }

    async fn cleanup_once(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let to_remove: Vec<String> = inner
            .requests
            .iter()
            .filter(|(_, req)| match req.status {
                Status::Completed | Status::Failed => req
                    .completed_at
                    .map(|c| now.saturating_duration_since(c) > self.cleanup_interval)
                    .unwrap_or(false),
                Status::Pending | Status::InFlight => {
                    now.saturating_duration_since(req.submitted_at) > self.stale_timeout
                }
            })
            .map(|(rid, _)| rid.clone())
            .collect();

        let removed = to_remove.len();
        for rid in &to_remove {
            inner.requests.remove(rid);
        }

        if inner.requests.len() > self.max_history {
            let mut completed: Vec<(String, Instant)> = inner
                .requests
                .iter()
                .filter(|(_, req)| matches!(req.status, Status::Completed | Status::Failed))
                .map(|(rid, req)| (rid.clone(), req.completed_at.unwrap_or(req.submitted_at)))
                .collect();
            completed.sort_by_key(|(_, t)| *t);
            let excess = inner.requests.len() - self.max_history;
            for (rid, _) in completed.into_iter().take(excess) {
                inner.requests.remove(&rid);
            }
        }

        if removed > 0 {
            info!(removed, remaining = inner.requests.len(), "tracker eviction pass");
        }
    }

    /// Background eviction loop. Cancellable via `shutdown`, same
    /// interval/select shape used by every other worker in this crate.
    pub async fn run_cleanup_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.cleanup_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn get_status(&self) -> QueueStatus {
        let inner = self.inner.lock().await;
        let now = Instant::now();

        let mut pending: Vec<&TrackedRequest> = inner
            .requests
            .values()
            .filter(|r| r.status == Status::Pending)
            .collect();
        let mut in_flight: Vec<&TrackedRequest> = inner
            .requests
            .values()
            .filter(|r| r.status == Status::InFlight)
            .collect();
        let recent_completed = inner
            .requests
            .values()
            .filter(|r| {
                matches!(r.status, Status::Completed | Status::Failed)
                    && r.completed_at
                        .map(|c| now.saturating_duration_since(c) < RECENT_COMPLETED_WINDOW)
                        .unwrap_or(false)
            })
            .count();

        pending.sort_by_key(|r| r.submitted_at);
        in_flight.sort_by_key(|r| r.submitted_at);

        let mut sessions: HashMap<String, SessionSummary> = HashMap::new();
        for req in inner.requests.values() {
            let Some(sid) = &req.session_id else { continue };
            let entry = sessions.entry(sid.clone()).or_insert_with(|| SessionSummary {
                session_id: sid.clone(),
                task_id: req.task_id.clone().unwrap_or_default(),
                model: req.model.clone(),
                source: req.source.clone(),
                total_requests: 0,
                completed_requests: 0,
                pending_requests: 0,
                in_flight_requests: 0,
                failed_requests: 0,
                completed_turns: Vec::new(),
                total_turns: inner.session_turn_counters.get(sid).copied().unwrap_or(0),
            });
            entry.total_requests += 1;
            match req.status {
                Status::Completed => {
                    entry.completed_requests += 1;
                    if let (Some(completed_at), Some(started_at)) = (req.completed_at, req.started_at) {
                        entry.completed_turns.push(CompletedTurn {
                            request_id: req.request_id.clone(),
                            backend: req.backend.clone(),
                            request_summary: req.request_summary.clone(),
                            response_summary: req.response_summary.clone(),
                            submitted_at: req.submitted_at,
                            total_time_ms: round2(
                                completed_at.saturating_duration_since(req.submitted_at).as_secs_f64() * 1000.0,
                            ),
                            wait_time_ms: round2(
                                started_at.saturating_duration_since(req.submitted_at).as_secs_f64() * 1000.0,
                            ),
                            processing_time_ms: round2(
                                completed_at.saturating_duration_since(started_at).as_secs_f64() * 1000.0,
                            ),
                            turn_number: req.turn_number,
                            backend_time_ms: req.backend_time_ms.map(round2),
                            agent_pre_ms: req.agent_pre_ms,
                            agent_post_ms: req.agent_post_ms,
                            agent_obs_ms: req.agent_pre_ms,
                            agent_act_ms: req.agent_post_ms,
                        });
                    }
                }
                Status::Pending => entry.pending_requests += 1,
                Status::InFlight => entry.in_flight_requests += 1,
                Status::Failed => entry.failed_requests += 1,
            }
        }
        for sess in sessions.values_mut() {
            sess.completed_turns.sort_by_key(|t| t.submitted_at);
        }

        let mut clients: HashMap<String, ClientSummary> = HashMap::new();
        let mut session_to_client: HashMap<String, String> = HashMap::new();
        for req in inner.requests.values() {
            let (Some(cid), Some(sid)) = (&req.client_id, &req.session_id) else { continue };
            let entry = clients.entry(cid.clone()).or_insert_with(|| ClientSummary {
                client_id: cid.clone(),
                client_command: req.client_command.clone().unwrap_or_default(),
                session_ids: Vec::new(),
            });
            if !entry.session_ids.contains(sid) {
                entry.session_ids.push(sid.clone());
            }
            session_to_client.insert(sid.clone(), cid.clone());
        }

        let client_views: Vec<ClientView> = clients
            .values()
            .map(|c| {
                let sessions: Vec<SessionSummary> = c
                    .session_ids
                    .iter()
                    .filter_map(|sid| sessions.get(sid).cloned())
                    .collect();
                ClientView {
                    client_id: c.client_id.clone(),
                    process_id: c.client_id.clone(),
                    client_command: c.client_command.clone(),
                    process_command: c.client_command.clone(),
                    episodes: sessions.clone(),
                    sessions,
                }
            })
            .collect();

        let orphan_sessions: Vec<SessionSummary> = sessions
            .values()
            .filter(|s| !session_to_client.contains_key(&s.session_id))
            .cloned()
            .collect();

        QueueStatus {
            summary: QueueSummary {
                pending: pending.len(),
                in_flight: in_flight.len(),
                completed_last_minute: recent_completed,
                total_tracked: inner.requests.len(),
            },
            pending: pending.iter().take(LIST_LIMIT).map(|r| r.to_json(now)).collect(),
            in_flight: in_flight.iter().take(LIST_LIMIT).map(|r| r.to_json(now)).collect(),
            episodes: sessions.values().cloned().collect(),
            sessions: sessions.into_values().collect(),
            orphan_episodes: orphan_sessions.clone(),
            orphan_sessions,
            processes: client_views.clone(),
            clients: client_views,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedTurn {
    pub request_id: String,
    pub backend: Option<String>,
    pub request_summary: Option<String>,
    pub response_summary: Option<String>,
    #[serde(skip)]
    pub submitted_at: Instant,
    pub total_time_ms: f64,
    pub wait_time_ms: f64,
    pub processing_time_ms: f64,
    pub turn_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_pre_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_post_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_obs_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_act_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub task_id: String,
    pub model: String,
    pub source: String,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub pending_requests: u64,
    pub in_flight_requests: u64,
    pub failed_requests: u64,
    pub completed_turns: Vec<CompletedTurn>,
    pub total_turns: u64,
}

struct ClientSummary {
    client_id: String,
    client_command: String,
    session_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientView {
    pub client_id: String,
    pub process_id: String,
    pub client_command: String,
    pub process_command: String,
    pub sessions: Vec<SessionSummary>,
    pub episodes: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    pub pending: usize,
    pub in_flight: usize,
    pub completed_last_minute: usize,
    pub total_tracked: usize,
}

/// Full `/queue/status` payload. Legacy `episode_id`/`process_id`-style
/// aliases are populated alongside the canonical fields at construction
/// time, never hand-duplicated at each call site.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub summary: QueueSummary,
    pub pending: Vec<serde_json::Value>,
    pub in_flight: Vec<serde_json::Value>,
    pub sessions: Vec<SessionSummary>,
    pub episodes: Vec<SessionSummary>,
    pub clients: Vec<ClientView>,
    pub processes: Vec<ClientView>,
    pub orphan_sessions: Vec<SessionSummary>,
    pub orphan_episodes: Vec<SessionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(session: Option<&str>) -> SubmitArgs {
        SubmitArgs {
            source: "127.0.0.1".to_string(),
            model: "llama".to_string(),
            path: "/v1/chat/completions".to_string(),
            session_id: session.map(str::to_string),
            task_id: None,
            client_id: None,
            client_command: None,
        }
    }

    #[tokio::test]
    async fn submit_assigns_sequential_turn_numbers_per_session() {
        let tracker = RequestTracker::new(1000, Duration::from_secs(60), Duration::from_secs(600));
        tracker.submit("r1".to_string(), args(Some("s1"))).await;
        tracker.submit("r2".to_string(), args(Some("s1"))).await;
        tracker.submit("r3".to_string(), args(Some("s2"))).await;

        let status = tracker.get_status().await;
        let s1 = status.sessions.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(s1.total_turns, 2);
    }

    #[tokio::test]
    async fn turn_counter_survives_request_eviction() {
        let tracker = RequestTracker::new(1000, Duration::from_secs(60), Duration::from_secs(600));
        tracker.submit("r1".to_string(), args(Some("s1"))).await;
        tracker.complete("r1", true).await;

        {
            let mut inner = tracker.inner.lock().await;
            inner.requests.clear();
        }

        tracker.submit("r2".to_string(), args(Some("s1"))).await;
        let status = tracker.get_status().await;
        let s1 = status.sessions.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(s1.total_turns, 2);
    }

    #[tokio::test]
    async fn pending_and_in_flight_counted_in_summary() {
        let tracker = RequestTracker::new(1000, Duration::from_secs(60), Duration::from_secs(600));
        tracker.submit("r1".to_string(), args(None)).await;
        tracker.start_processing("r1", "http://h:1".to_string()).await;
        tracker.submit("r2".to_string(), args(None)).await;

        let status = tracker.get_status().await;
        assert_eq!(status.summary.pending, 1);
        assert_eq!(status.summary.in_flight, 1);
        assert_eq!(status.summary.total_tracked, 2);
    }

    #[tokio::test]
    async fn orphan_sessions_have_no_client() {
        let tracker = RequestTracker::new(1000, Duration::from_secs(60), Duration::from_secs(600));
        tracker.submit("r1".to_string(), args(Some("s1"))).await;

        let status = tracker.get_status().await;
        assert_eq!(status.orphan_sessions.len(), 1);
        assert!(status.clients.is_empty());
    }

    #[tokio::test]
    async fn stale_pending_request_is_force_evicted() {
        let tracker = RequestTracker::new(1000, Duration::from_secs(60), Duration::from_millis(1));
        tracker.submit("r1".to_string(), args(None)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        tracker.cleanup_once().await;

        let status = tracker.get_status().await;
        assert_eq!(status.summary.total_tracked, 0);
    }
}
