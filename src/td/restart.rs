//! Auto-restart policy. Pure functions over a definition and its persisted record.

use crate::td::definition::TaskConfig;
use crate::td::store::{TaskRuntimeRecord, TaskStatus};
use chrono::{DateTime, Local};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart,
    /// Eligible, but the configured restart delay has not elapsed yet.
    Wait(Duration),
    /// Would be eligible except that `retry_num` reached `max_retry_num`.
    LimitReached,
    Idle,
}

/// `auto_start && stopped && !stopped_by_operator && (max_retry == 0 || retries < max_retry)`
pub fn eligible(cfg: &TaskConfig, rec: &TaskRuntimeRecord) -> bool {
    cfg.auto_start
        && rec.status == TaskStatus::Stopped
        && !rec.stopped_by_operator
        && (cfg.max_retry == 0 || rec.retry_count < cfg.max_retry)
}

fn limit_reached(cfg: &TaskConfig, rec: &TaskRuntimeRecord) -> bool {
    cfg.auto_start
        && rec.status == TaskStatus::Stopped
        && !rec.stopped_by_operator
        && cfg.max_retry > 0
        && rec.retry_count >= cfg.max_retry
}

pub fn decide(cfg: &TaskConfig, rec: &TaskRuntimeRecord, now: DateTime<Local>) -> RestartDecision {
    if limit_reached(cfg, rec) {
        return RestartDecision::LimitReached;
    }
    if !eligible(cfg, rec) {
        return RestartDecision::Idle;
    }
    if let (Some(delay), Some(ended)) = (cfg.restart_delay, rec.end_time) {
        let elapsed = (now - ended).to_std().unwrap_or_default();
        if elapsed < delay {
            return RestartDecision::Wait(delay - elapsed);
        }
    }
    RestartDecision::Restart
}

/// Whether this task gives the monitor daemon something to do: it is running, or it is an
/// auto-start task that could still be (re)started. A missing record counts as never started.
pub fn needs_monitoring(cfg: &TaskConfig, rec: Option<&TaskRuntimeRecord>) -> bool {
    match rec {
        Some(r) if r.claims_running() => true,
        Some(r) => eligible(cfg, r),
        None => cfg.auto_start,
    }
}
