//! `/health` endpoint.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::SessionStatus;

/// When the bridge came up, on both the monotonic and the wall clock.
#[derive(Clone, Copy, Debug)]
pub struct Uptime {
    started: Instant,
    started_at: DateTime<Utc>,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub peer_connected: bool,
    pub process_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_pid: Option<u32>,
    pub authenticated: bool,
    pub pending_requests: usize,
}

/// Report the bridge as up along with the latest session status. Liveness
/// only: a missing agent process is not a failure.
pub fn health_check(uptime: &Uptime, session: &SessionStatus) -> HealthResponse {
    let SessionStatus {
        peer_connected,
        process_running,
        process_pid,
        authenticated,
        pending_requests,
    } = *session;
    HealthResponse {
        status: "ok",
        uptime_secs: uptime.secs(),
        started_at: uptime.started_at,
        peer_connected,
        process_running,
        process_pid,
        authenticated,
        pending_requests,
    }
}
