//! Order-ingestion run for one store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::order::TimeRange;
use super::state::{InvalidTransition, ParseEnumError, StateMachine, advance};
use crate::util::now_millis;

/// Sync job lifecycle
///
/// PENDING -> RUNNING -> {COMPLETED, FAILED}; FAILED -> PENDING (retry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SyncJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Holds the per-store run slot
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl StateMachine for SyncJobStatus {
    const ENTITY: &'static str = "sync job";
    const ALL: &'static [Self] = &[Self::Pending, Self::Running, Self::Completed, Self::Failed];

    fn can_transition_to(&self, target: Self) -> bool {
        use SyncJobStatus::*;
        matches!(
            (self, target),
            (Pending, Running) | (Running, Completed) | (Running, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("sync job status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
    Webhook,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Manual => "MANUAL",
            Self::Webhook => "WEBHOOK",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTrigger {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(Self::Scheduled),
            "MANUAL" => Ok(Self::Manual),
            "WEBHOOK" => Ok(Self::Webhook),
            _ => Err(ParseEnumError::new("sync trigger", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub tenant_id: String,
    pub store_id: Uuid,
    pub trigger: SyncTrigger,
    pub status: SyncJobStatus,
    /// Inclusive start of the fetched range (epoch millis)
    pub sync_start_time: i64,
    /// Exclusive end of the fetched range (epoch millis)
    pub sync_end_time: i64,
    pub total_fetched: i32,
    pub created_count: i32,
    pub updated_count: i32,
    pub failed_count: i32,
    /// Failed runs so far, counted against the retry budget
    pub attempt_count: i32,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Cleared on cancel; the retry scheduler skips inactive jobs
    pub active: bool,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SyncJob {
    pub fn new(tenant_id: &str, store_id: Uuid, range: TimeRange, trigger: SyncTrigger) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            store_id,
            trigger,
            status: SyncJobStatus::Pending,
            sync_start_time: range.start,
            sync_end_time: range.end,
            total_fetched: 0,
            created_count: 0,
            updated_count: 0,
            failed_count: 0,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            active: true,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.sync_start_time,
            end: self.sync_end_time,
        }
    }

    /// Move to `target`, stamping run timestamps
    pub fn transition(&mut self, target: SyncJobStatus, now: i64) -> Result<(), InvalidTransition> {
        advance(&mut self.status, target)?;
        match target {
            SyncJobStatus::Pending => {
                self.total_fetched = 0;
                self.created_count = 0;
                self.updated_count = 0;
                self.failed_count = 0;
                self.next_retry_at = None;
                self.finished_at = None;
            }
            SyncJobStatus::Running => self.started_at = Some(now),
            SyncJobStatus::Completed => {
                self.finished_at = Some(now);
                self.last_error = None;
            }
            SyncJobStatus::Failed => {
                self.finished_at = Some(now);
                self.attempt_count += 1;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_retry_due(&self, now: i64) -> bool {
        self.active
            && self.status == SyncJobStatus::Failed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::assert_table_conformance;

    fn job() -> SyncJob {
        SyncJob::new(
            "t1",
            Uuid::new_v4(),
            TimeRange::new(0, 1_000).unwrap(),
            SyncTrigger::Manual,
        )
    }

    #[test]
    fn test_sync_job_table_conformance() {
        assert_table_conformance::<SyncJobStatus>();
    }

    #[test]
    fn test_completed_is_terminal() {
        assert!(SyncJobStatus::Completed.is_terminal());
        assert!(!SyncJobStatus::Failed.is_terminal());
        assert_eq!(
            SyncJobStatus::Failed.valid_transitions(),
            vec![SyncJobStatus::Pending]
        );
    }

    #[test]
    fn test_running_cannot_go_back_to_pending() {
        let mut job = job();
        job.transition(SyncJobStatus::Running, 10).unwrap();
        let err = job.transition(SyncJobStatus::Pending, 20).unwrap_err();
        assert_eq!(err.from, "RUNNING");
        assert_eq!(job.status, SyncJobStatus::Running);
        assert_eq!(job.updated_at, 10);
    }

    #[test]
    fn test_failure_counts_attempt_and_retry_resets_counters() {
        let mut job = job();
        job.transition(SyncJobStatus::Running, 10).unwrap();
        job.total_fetched = 5;
        job.created_count = 3;
        job.transition(SyncJobStatus::Failed, 20).unwrap();
        job.next_retry_at = Some(50);
        assert_eq!(job.attempt_count, 1);
        assert!(!job.is_retry_due(49));
        assert!(job.is_retry_due(50));

        job.transition(SyncJobStatus::Pending, 60).unwrap();
        assert_eq!(job.total_fetched, 0);
        assert_eq!(job.created_count, 0);
        assert_eq!(job.next_retry_at, None);
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn test_inactive_job_is_never_due() {
        let mut job = job();
        job.transition(SyncJobStatus::Running, 10).unwrap();
        job.transition(SyncJobStatus::Failed, 20).unwrap();
        job.next_retry_at = Some(0);
        job.active = false;
        assert!(!job.is_retry_due(100));
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in SyncJobStatus::ALL {
            assert_eq!(status.as_str().parse::<SyncJobStatus>().unwrap(), *status);
        }
        assert!("DONE".parse::<SyncJobStatus>().is_err());
    }
}
