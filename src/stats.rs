//! Process-wide aggregate counters.
//!
//! All counters are monotonic except the two `active_*` gauges. Updates take
//! the stats lock briefly; readers copy a snapshot out.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::proto::JobState;

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub started_at: SystemTime,
    pub total_clients: u32,
    pub active_clients: u32,
    pub total_jobs: u32,
    pub active_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    pub cancelled_jobs: u32,
    pub timeout_jobs: u32,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub compile_seconds: f64,
    pub execute_seconds: f64,
}

impl StatsSnapshot {
    /// Mean wall-clock seconds spent per finished job, compile and run
    /// combined.
    pub fn avg_job_seconds(&self) -> f64 {
        let finished =
            self.completed_jobs + self.failed_jobs + self.cancelled_jobs + self.timeout_jobs;
        if finished == 0 {
            return 0.0;
        }
        (self.compile_seconds + self.execute_seconds) / f64::from(finished)
    }
}

#[derive(Debug)]
pub struct ServiceStats {
    inner: Mutex<StatsSnapshot>,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsSnapshot {
                started_at: SystemTime::now(),
                total_clients: 0,
                active_clients: 0,
                total_jobs: 0,
                active_jobs: 0,
                completed_jobs: 0,
                failed_jobs: 0,
                cancelled_jobs: 0,
                timeout_jobs: 0,
                total_bytes_received: 0,
                total_bytes_sent: 0,
                compile_seconds: 0.0,
                execute_seconds: 0.0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsSnapshot> {
        self.inner.lock().expect("stats lock poisoned")
    }

    pub fn client_connected(&self) {
        let mut stats = self.lock();
        stats.total_clients += 1;
        stats.active_clients += 1;
    }

    pub fn client_disconnected(&self) {
        let mut stats = self.lock();
        stats.active_clients = stats.active_clients.saturating_sub(1);
    }

    pub fn job_submitted(&self) {
        let mut stats = self.lock();
        stats.total_jobs += 1;
        stats.active_jobs += 1;
    }

    pub fn job_finished(&self, state: JobState, compile: Duration, execute: Duration) {
        let mut stats = self.lock();
        stats.active_jobs = stats.active_jobs.saturating_sub(1);
        match state {
            JobState::Completed => stats.completed_jobs += 1,
            JobState::Failed => stats.failed_jobs += 1,
            JobState::Cancelled => stats.cancelled_jobs += 1,
            JobState::Timeout => stats.timeout_jobs += 1,
            JobState::Queued | JobState::Running => {
                debug_assert!(false, "job finished in non-terminal state {state:?}");
            }
        }
        stats.compile_seconds += compile.as_secs_f64();
        stats.execute_seconds += execute.as_secs_f64();
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.lock().total_bytes_received += n;
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.lock().total_bytes_sent += n;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_gauges() {
        let stats = ServiceStats::new();
        stats.client_connected();
        stats.client_connected();
        stats.client_disconnected();

        let snap = stats.snapshot();
        assert_eq!(snap.total_clients, 2);
        assert_eq!(snap.active_clients, 1);
    }

    #[test]
    fn job_counters_partition_by_terminal_state() {
        let stats = ServiceStats::new();
        for _ in 0..4 {
            stats.job_submitted();
        }
        stats.job_finished(JobState::Completed, Duration::from_secs(1), Duration::ZERO);
        stats.job_finished(JobState::Failed, Duration::from_secs(1), Duration::ZERO);
        stats.job_finished(JobState::Timeout, Duration::ZERO, Duration::from_secs(2));

        let snap = stats.snapshot();
        assert_eq!(snap.total_jobs, 4);
        assert_eq!(snap.active_jobs, 1);
        assert_eq!(snap.completed_jobs, 1);
        assert_eq!(snap.failed_jobs, 1);
        assert_eq!(snap.timeout_jobs, 1);
        assert!(
            snap.completed_jobs + snap.failed_jobs + snap.cancelled_jobs + snap.timeout_jobs
                <= snap.total_jobs
        );
        assert!((snap.avg_job_seconds() - 4.0 / 3.0).abs() < 1e-9);
    }
}
