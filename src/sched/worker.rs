//! The single job-consuming worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use tracing::{error, info_span, warn};

use crate::config::Tunables;
use crate::exec::{ExecError, Sandbox, Step, StepOutcome};
use crate::lang::Registry;
use crate::paths::ServiceRoot;

use super::{CompletionReport, RunnableJob, Scheduler};

const IDLE_POLL: Duration = Duration::from_millis(200);

pub struct WorkerContext {
    pub sched: Arc<Scheduler>,
    pub registry: Arc<Registry>,
    pub tunables: Arc<Tunables>,
    pub root: ServiceRoot,
    pub shutdown: Arc<AtomicBool>,
    pub shutdown_rx: Receiver<()>,
}

/// Consume jobs serially until shutdown. Blocks on the scheduler's wake
/// channel while the queue is empty.
pub fn run_worker(ctx: WorkerContext) {
    let wake_rx = ctx.sched.wake_receiver();
    loop {
        if ctx.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match ctx.sched.take_next() {
            Some(job) => process_job(&ctx, job),
            None => {
                crossbeam::select! {
                    recv(wake_rx) -> _ => {}
                    recv(ctx.shutdown_rx) -> _ => break,
                    default(IDLE_POLL) => {}
                }
            }
        }
    }
}

fn process_job(ctx: &WorkerContext, job: RunnableJob) {
    let span = info_span!("job", id = job.id);
    let _guard = span.enter();

    let sandbox = match Sandbox::create(&ctx.root.processing(), job.id, job.submitted_at_unix) {
        Ok(sandbox) => sandbox,
        Err(err) => {
            error!("sandbox creation failed: {err}");
            ctx.sched.fail(job.id);
            return;
        }
    };
    ctx.sched.set_sandbox(job.id, sandbox.path().to_path_buf());

    if let Err(err) = sandbox.place_source(
        &job.spec.filename,
        &job.spec.source,
        ctx.tunables.max_file_size(),
    ) {
        error!("source placement failed: {err}");
        ctx.sched.fail(job.id);
        return;
    }

    let plan = match ctx.registry.plan(
        job.spec.language,
        job.spec.mode,
        &job.spec.filename,
        &job.spec.compiler_args,
        &job.spec.execution_args,
    ) {
        Ok(plan) => plan,
        Err(err) => {
            warn!("no execution plan: {err}");
            ctx.sched.fail(job.id);
            return;
        }
    };

    let cap = ctx.tunables.max_output_size();
    let mut report = CompletionReport::default();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    if let Some(command) = &plan.compile {
        match run_step(
            ctx,
            job.id,
            sandbox.path(),
            command,
            ctx.tunables.compile_timeout(),
            cap,
        ) {
            Ok(outcome) => {
                report.compile_time = outcome.elapsed;
                report.exit_code = outcome.exit_code;
                report.timed_out = outcome.timed_out;
                stdout.extend_from_slice(&outcome.stdout);
                stderr.extend_from_slice(&outcome.stderr);
            }
            Err(err) => {
                error!("compile step failed to run: {err}");
                finish(ctx, &sandbox, &job, report, &stdout, &stderr, true);
                return;
            }
        }
        // A failed or timed-out compile short-circuits the run step.
        if report.exit_code != 0 || report.timed_out {
            finish(ctx, &sandbox, &job, report, &stdout, &stderr, false);
            return;
        }
    }

    if let Some(command) = &plan.run {
        match run_step(
            ctx,
            job.id,
            sandbox.path(),
            command,
            ctx.tunables.execution_timeout(),
            cap,
        ) {
            Ok(outcome) => {
                report.execute_time = outcome.elapsed;
                report.exit_code = outcome.exit_code;
                report.timed_out = outcome.timed_out;
                stdout.extend_from_slice(&outcome.stdout);
                stderr.extend_from_slice(&outcome.stderr);
            }
            Err(err) => {
                error!("run step failed to launch: {err}");
                finish(ctx, &sandbox, &job, report, &stdout, &stderr, true);
                return;
            }
        }
    }

    finish(ctx, &sandbox, &job, report, &stdout, &stderr, false);
}

fn run_step(
    ctx: &WorkerContext,
    job_id: u32,
    dir: &std::path::Path,
    command: &str,
    timeout: Duration,
    cap: usize,
) -> Result<StepOutcome, ExecError> {
    let step = Step::spawn(dir, command, cap)?;
    ctx.sched.set_pid(job_id, step.pid());
    step.wait(timeout)
}

fn finish(
    ctx: &WorkerContext,
    sandbox: &Sandbox,
    job: &RunnableJob,
    mut report: CompletionReport,
    stdout: &[u8],
    stderr: &[u8],
    infra_failure: bool,
) {
    let stem = job
        .spec
        .filename
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(job.spec.filename.as_str());
    sandbox.write_capture(&format!("{stem}_output.txt"), stdout);
    sandbox.write_capture(&format!("{stem}_error.txt"), stderr);

    report.stdout_size = stdout.len() as u64;
    report.stderr_size = stderr.len() as u64;

    if infra_failure {
        ctx.sched.fail(job.id);
    } else {
        ctx.sched.complete(job.id, report);
    }
}
