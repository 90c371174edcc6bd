use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::Role;

/// Wall clock in unix milliseconds that never goes backwards within a process.
pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub id: Uuid,
    pub status: WorkerStatus,
    pub stats: WorkerStats,
}

/// Read-only view of a coordinator session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub worker_count: usize,
    pub idle_workers: usize,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub rate_limited: bool,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub server_url: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

impl ConnectionStatus {
    pub fn disconnected(server_url: impl Into<String>, role: Role) -> Self {
        Self {
            connected: false,
            server_url: server_url.into(),
            role,
            worker_id: None,
            session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_ms_is_monotonic() {
        let a = now_unix_ms();
        let b = now_unix_ms();
        assert!(b >= a);
    }

    #[test]
    fn server_stats_uses_camel_case_keys() {
        let stats = ServerStats {
            worker_count: 1,
            idle_workers: 1,
            workers: vec![WorkerSummary {
                id: Uuid::nil(),
                status: WorkerStatus::Idle,
                stats: WorkerStats::default(),
            }],
            ..ServerStats::default()
        };
        let v = serde_json::to_value(&stats).unwrap();
        assert_eq!(v["workerCount"], 1);
        assert_eq!(v["idleWorkers"], 1);
        assert_eq!(v["workers"][0]["status"], "idle");
        assert_eq!(v["workers"][0]["stats"]["totalBytes"], 0);
    }
}
