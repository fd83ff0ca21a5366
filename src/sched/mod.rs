//! In-memory job scheduler.
//!
//! One table owns every job from submission through retirement. Sessions and
//! the control plane only ever hold job ids; lookups hand out snapshot
//! copies taken under a short lock hold.

mod job;
mod worker;

pub use job::{JobSnapshot, JobSpec, RunnableJob};
pub use worker::{run_worker, WorkerContext};

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, info};

use crate::exec;
use crate::proto::JobState;
use crate::stats::ServiceStats;

use job::JobEntry;

pub const PRIORITY_LOW: u8 = 1;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_HIGH: u8 = 10;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("job {0} not found")]
    NotFound(u32),
    #[error("job queue is full ({0} queued)")]
    QueueFull(usize),
    #[error("invalid priority {0}, expected 1..=10")]
    InvalidPriority(u8),
}

/// Queue counts by state, for the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
}

/// Terminal outcome of one executed job, reported by the worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionReport {
    pub exit_code: i32,
    pub stdout_size: u64,
    pub stderr_size: u64,
    pub timed_out: bool,
    pub compile_time: Duration,
    pub execute_time: Duration,
}

struct SchedState {
    jobs: HashMap<u32, JobEntry>,
    /// Queued job ids ordered (priority desc, submission seq asc).
    queue: Vec<u32>,
    next_id: u32,
    next_seq: u64,
}

pub struct Scheduler {
    /// Shared with short-lived escalation threads, which need to re-check a
    /// cancelled job after the grace window without holding the scheduler.
    state: Arc<Mutex<SchedState>>,
    max_queued: usize,
    stats: Arc<ServiceStats>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl Scheduler {
    pub fn new(max_queued: usize, stats: Arc<ServiceStats>) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        Self {
            state: Arc::new(Mutex::new(SchedState {
                jobs: HashMap::new(),
                queue: Vec::new(),
                next_id: 1,
                next_seq: 0,
            })),
            max_queued,
            stats,
            wake_tx,
            wake_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler lock poisoned")
    }

    /// Channel the worker blocks on while the queue is empty.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    /// Queue a job. The id is assigned here, atomically with the insert, so
    /// the job is visible to `find` before `submit` returns.
    pub fn submit(&self, spec: JobSpec) -> Result<u32, SchedError> {
        if !(PRIORITY_LOW..=PRIORITY_HIGH).contains(&spec.priority) {
            return Err(SchedError::InvalidPriority(spec.priority));
        }

        let id = {
            let mut state = self.lock();
            if state.queue.len() >= self.max_queued {
                return Err(SchedError::QueueFull(state.queue.len()));
            }
            let id = allocate_id(&mut state);
            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = JobEntry::new(id, seq, spec);
            state.jobs.insert(id, entry);
            state.queue.push(id);
            sort_queue(&mut state);
            id
        };

        self.stats.job_submitted();
        let _ = self.wake_tx.send(());
        debug!(job_id = id, "job queued");
        Ok(id)
    }

    /// Pop the next job and mark it `Running`. Called only by the worker.
    pub fn take_next(&self) -> Option<RunnableJob> {
        let mut state = self.lock();
        let id = if state.queue.is_empty() {
            return None;
        } else {
            state.queue.remove(0)
        };
        let entry = state.jobs.get_mut(&id)?;
        entry.state = JobState::Running;
        entry.started_at = Some(SystemTime::now());
        Some(entry.runnable())
    }

    pub fn set_pid(&self, id: u32, pid: u32) {
        if let Some(entry) = self.lock().jobs.get_mut(&id) {
            entry.pid = Some(pid);
        }
    }

    pub fn set_sandbox(&self, id: u32, dir: PathBuf) {
        if let Some(entry) = self.lock().jobs.get_mut(&id) {
            entry.sandbox = Some(dir);
        }
    }

    /// Raise or lower a queued job's priority; running and terminal jobs are
    /// never re-ordered.
    pub fn set_priority(&self, id: u32, priority: u8) -> Result<(), SchedError> {
        if !(PRIORITY_LOW..=PRIORITY_HIGH).contains(&priority) {
            return Err(SchedError::InvalidPriority(priority));
        }
        let mut state = self.lock();
        let entry = state.jobs.get_mut(&id).ok_or(SchedError::NotFound(id))?;
        if entry.state == JobState::Queued {
            entry.priority = priority;
            sort_queue(&mut state);
        }
        Ok(())
    }

    /// Cancel a job. Queued jobs drop out of the queue immediately; running
    /// jobs are signalled and become visible as `Cancelled` before the child
    /// has died; terminal jobs are a no-op.
    pub fn cancel(&self, id: u32, force: bool) -> Result<JobState, SchedError> {
        let was_queued;
        let signal = {
            let mut state = self.lock();
            let entry = state.jobs.get_mut(&id).ok_or(SchedError::NotFound(id))?;
            let pid = match entry.state {
                state if state.is_terminal() => return Ok(state),
                JobState::Queued => {
                    entry.state = JobState::Cancelled;
                    entry.ended_at = Some(SystemTime::now());
                    was_queued = true;
                    None
                }
                _ => {
                    entry.state = JobState::Cancelled;
                    entry.cancel_requested = true;
                    was_queued = false;
                    entry.pid
                }
            };
            if was_queued {
                state.queue.retain(|&queued| queued != id);
            }
            pid
        };

        match (was_queued, signal) {
            (true, _) => {
                // Left the queue without ever running.
                self.stats
                    .job_finished(JobState::Cancelled, Duration::ZERO, Duration::ZERO);
                info!(job_id = id, "cancelled queued job");
            }
            (false, Some(pid)) => {
                info!(job_id = id, pid, force, "cancelling running job");
                if force {
                    let _ = exec::kill_pid(pid);
                } else {
                    let _ = exec::terminate_pid(pid);
                    let state = Arc::clone(&self.state);
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_secs(1));
                        escalate_kill(&state, id, pid);
                    });
                }
            }
            // Marked cancelled between dequeue and the pid being recorded;
            // the worker's completion path observes cancel_requested.
            (false, None) => {}
        }
        Ok(JobState::Cancelled)
    }

    /// Cancel every non-terminal job owned by a client.
    pub fn cancel_client_jobs(&self, client_id: u32) {
        let ids: Vec<u32> = {
            let state = self.lock();
            state
                .jobs
                .values()
                .filter(|entry| entry.client_id == client_id && !entry.state.is_terminal())
                .map(|entry| entry.id)
                .collect()
        };
        for id in ids {
            let _ = self.cancel(id, false);
        }
    }

    /// Record a finished run. A cancel that arrived mid-run wins over the
    /// observed exit.
    pub fn complete(&self, id: u32, report: CompletionReport) -> Option<JobState> {
        let final_state = {
            let mut state = self.lock();
            let entry = state.jobs.get_mut(&id)?;
            if entry.ended_at.is_some() {
                return Some(entry.state);
            }
            let final_state = if entry.cancel_requested {
                JobState::Cancelled
            } else if report.timed_out {
                JobState::Timeout
            } else if report.exit_code == 0 {
                JobState::Completed
            } else {
                JobState::Failed
            };
            entry.state = final_state;
            entry.exit_code = Some(report.exit_code);
            entry.stdout_size = report.stdout_size;
            entry.stderr_size = report.stderr_size;
            entry.ended_at = Some(SystemTime::now());
            final_state
        };
        self.stats
            .job_finished(final_state, report.compile_time, report.execute_time);
        info!(job_id = id, state = %final_state, exit_code = report.exit_code, "job finished");
        Some(final_state)
    }

    /// Mark a job `Failed` after an infrastructure error (sandbox, launch).
    pub fn fail(&self, id: u32) -> Option<JobState> {
        self.complete(
            id,
            CompletionReport {
                exit_code: -1,
                ..CompletionReport::default()
            },
        )
    }

    pub fn find(&self, id: u32) -> Option<JobSnapshot> {
        self.lock().jobs.get(&id).map(JobEntry::snapshot)
    }

    /// Snapshot of every non-retired job, in submission order.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let state = self.lock();
        let mut entries: Vec<&JobEntry> = state.jobs.values().collect();
        entries.sort_by_key(|entry| entry.submit_seq);
        entries.iter().map(|entry| entry.snapshot()).collect()
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats::default();
        for entry in state.jobs.values() {
            match entry.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
                JobState::Timeout => stats.timeout += 1,
            }
        }
        stats
    }

    /// Drop terminal jobs older than the retention window and return their
    /// sandbox directories for removal.
    pub fn sweep_retired(&self, retention: Duration) -> Vec<PathBuf> {
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut state = self.lock();
        let retired: Vec<u32> = state
            .jobs
            .values()
            .filter(|entry| {
                entry.state.is_terminal()
                    && entry.ended_at.map(|ended| ended <= cutoff).unwrap_or(false)
            })
            .map(|entry| entry.id)
            .collect();

        let mut sandboxes = Vec::new();
        for id in retired {
            if let Some(entry) = state.jobs.remove(&id) {
                debug!(job_id = id, "retired job");
                if let Some(dir) = entry.sandbox {
                    sandboxes.push(dir);
                }
            }
        }
        sandboxes
    }

    /// Cancel everything still queued or running, for forced shutdown.
    pub fn cancel_all(&self, force: bool) {
        let ids: Vec<u32> = {
            let state = self.lock();
            state
                .jobs
                .values()
                .filter(|entry| !entry.state.is_terminal())
                .map(|entry| entry.id)
                .collect()
        };
        for id in ids {
            let _ = self.cancel(id, force);
        }
    }
}

/// Ids start at 1 and wrap by skipping zero; an id is never reused while a
/// job holding it is still in the table.
fn allocate_id(state: &mut SchedState) -> u32 {
    loop {
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        if id != 0 && !state.jobs.contains_key(&id) {
            return id;
        }
    }
}

/// Force-kill a cancelled job's child if it survived the grace window. The
/// pid check guards against reuse after the worker has already reaped it.
fn escalate_kill(state: &Mutex<SchedState>, id: u32, pid: u32) {
    let still_running = state
        .lock()
        .expect("scheduler lock poisoned")
        .jobs
        .get(&id)
        .map(|entry| entry.pid == Some(pid) && entry.ended_at.is_none())
        .unwrap_or(false);
    if still_running {
        info!(job_id = id, pid, "escalating to forced kill");
        let _ = exec::kill_pid(pid);
    }
}

fn sort_queue(state: &mut SchedState) {
    let SchedState { jobs, queue, .. } = state;
    queue.sort_by_key(|id| {
        jobs.get(id)
            .map(|entry| (Reverse(entry.priority), entry.submit_seq))
            .unwrap_or((Reverse(0), u64::MAX))
    });
}
