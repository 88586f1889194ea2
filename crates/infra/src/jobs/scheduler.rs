//! Job scheduler: one runner thread per registered job.
//!
//! Every trigger (scheduled tick, manual, startup) goes through the same
//! path: take the job's lease in the store, then hand the started `JobRun`
//! to the job's runner thread. A trigger that finds the lease taken is
//! dropped and recorded as an `OverlapSkip`.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use fitpulse_core::{
    INTERRUPTED, INTERRUPTED_BY_RESTART, JobName, JobRun, JobRunId, OverlapSkip, RunTrigger,
};

use super::error::{JobError, ScheduleError};
use super::types::{JobSpec, RejectReason, RetryPolicy, TriggerOutcome};
use crate::store::{JobRunStore, LeaseOutcome, StoreResult};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECENT_SKIPS: usize = 10;
/// Most skip records written for the ticks missed during one run.
const MAX_MISSED_TICK_SKIPS: u32 = 100;

/// Cooperative shutdown flag shared by the scheduler and running actions.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, waking early on shutdown. Returns whether the
    /// signal is raised.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |raised| !*raised)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// What an action sees of the run it executes.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: JobName,
    pub run_id: JobRunId,
    pub trigger: RunTrigger,
    /// 1-indexed attempt within this run.
    pub attempt: u32,
    shutdown: ShutdownSignal,
}

impl JobContext {
    pub fn new(job: JobName, run_id: JobRunId, trigger: RunTrigger, shutdown: ShutdownSignal) -> Self {
        Self {
            job,
            run_id,
            trigger,
            attempt: 1,
            shutdown,
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_raised()
    }

    /// `Err(Interrupted)` once shutdown has been requested. Actions call this
    /// between units of work so nothing partial is committed after it.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.shutdown_requested() {
            Err(JobError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Work performed by one job.
pub trait JobAction: Send + Sync + 'static {
    fn run(&self, ctx: &JobContext) -> Result<(), JobError>;
}

impl<F> JobAction for F
where
    F: Fn(&JobContext) -> Result<(), JobError> + Send + Sync + 'static,
{
    fn run(&self, ctx: &JobContext) -> Result<(), JobError> {
        self(ctx)
    }
}

/// Status of one job as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job: JobName,
    pub cadence: String,
    pub running: bool,
    pub latest_run: Option<JobRun>,
    pub recent_skips: Vec<OverlapSkip>,
}

struct Registered {
    spec: JobSpec,
    action: Arc<dyn JobAction>,
}

/// Builder for the scheduler. Register jobs, then `start`.
pub struct JobScheduler<S: ?Sized> {
    store: Arc<S>,
    jobs: BTreeMap<JobName, Registered>,
    poll_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<S> JobScheduler<S>
where
    S: JobRunStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            jobs: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Upper bound on how long a runner sleeps between checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Register (or replace) the action for `spec.name`.
    pub fn register(&mut self, spec: JobSpec, action: Arc<dyn JobAction>) -> &mut Self {
        debug!(job = %spec.name, cadence = %spec.cadence, "job registered");
        self.jobs.insert(spec.name, Registered { spec, action });
        self
    }

    pub fn specs(&self) -> Vec<JobSpec> {
        self.jobs.values().map(|r| r.spec.clone()).collect()
    }

    /// Fail every run still marked running, releasing its lease. Such runs
    /// belong to a previous process.
    pub fn reconcile_stale_runs(&self) -> StoreResult<Vec<JobRun>> {
        let reconciled = self
            .store
            .reconcile_running(Utc::now(), INTERRUPTED_BY_RESTART)?;
        for run in &reconciled {
            warn!(
                job = %run.job_name,
                run_id = %run.id,
                started_at = %run.started_at,
                "stale running job marked failed"
            );
        }
        Ok(reconciled)
    }

    /// Reconcile stale runs and spawn one runner thread per job.
    pub fn start(self) -> Result<JobSchedulerHandle<S>, ScheduleError> {
        self.reconcile_stale_runs()?;

        let specs: BTreeMap<_, _> = self
            .jobs
            .iter()
            .map(|(name, r)| (*name, r.spec.clone()))
            .collect();
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for (name, registered) in self.jobs {
            let (tx, rx) = mpsc::channel::<JobRun>();
            senders.insert(name, tx);
            receivers.push((registered, rx));
        }

        let dispatcher = Arc::new(Dispatcher {
            store: self.store,
            senders,
            shutdown: self.shutdown.clone(),
        });

        let mut joins = Vec::with_capacity(receivers.len());
        for (registered, rx) in receivers {
            let job = registered.spec.name;
            let runner = Runner {
                spec: registered.spec,
                action: registered.action,
                dispatcher: Arc::clone(&dispatcher),
                poll_interval: self.poll_interval,
            };
            let spawned = thread::Builder::new()
                .name(format!("job-{job}"))
                .spawn(move || runner.run_loop(rx));
            match spawned {
                Ok(join) => joins.push(join),
                Err(e) => {
                    self.shutdown.raise();
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(ScheduleError::Spawn {
                        job,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(jobs = joins.len(), "job scheduler started");
        Ok(JobSchedulerHandle {
            dispatcher,
            specs,
            joins: Mutex::new(joins),
            shutdown: self.shutdown,
        })
    }
}

struct Dispatcher<S: ?Sized> {
    store: Arc<S>,
    senders: HashMap<JobName, Sender<JobRun>>,
    shutdown: ShutdownSignal,
}

impl<S> Dispatcher<S>
where
    S: JobRunStore + ?Sized,
{
    fn dispatch(&self, job: JobName, trigger: RunTrigger) -> Result<TriggerOutcome, ScheduleError> {
        if self.shutdown.is_raised() {
            return Err(ScheduleError::ShuttingDown);
        }
        let sender = self
            .senders
            .get(&job)
            .ok_or(ScheduleError::UnknownJob(job))?;

        let now = Utc::now();
        match self.store.try_start_run(job, trigger, now)? {
            LeaseOutcome::Acquired(run) => {
                let run_id = run.id;
                if let Err(mpsc::SendError(mut undelivered)) = sender.send(run) {
                    undelivered.fail(Utc::now(), INTERRUPTED);
                    self.store.update_run(&undelivered)?;
                    return Err(ScheduleError::ShuttingDown);
                }
                info!(job = %job, run_id = %run_id, trigger = trigger.as_str(), "job run dispatched");
                Ok(TriggerOutcome::Accepted { run_id })
            }
            LeaseOutcome::Busy(running) => {
                self.record_skip(&OverlapSkip {
                    job_name: job,
                    trigger,
                    skipped_at: now,
                    running_run_id: running.id,
                });
                Ok(TriggerOutcome::Rejected {
                    reason: RejectReason::AlreadyRunning {
                        running_run_id: running.id,
                    },
                })
            }
        }
    }

    fn record_skip(&self, skip: &OverlapSkip) {
        if let Err(e) = self.store.record_skip(skip) {
            warn!(job = %skip.job_name, error = %e, "failed to record overlap skip");
        }
        info!(
            job = %skip.job_name,
            trigger = skip.trigger.as_str(),
            running_run_id = %skip.running_run_id,
            "trigger skipped: job already running"
        );
    }
}

struct Runner<S: ?Sized> {
    spec: JobSpec,
    action: Arc<dyn JobAction>,
    dispatcher: Arc<Dispatcher<S>>,
    poll_interval: Duration,
}

impl<S> Runner<S>
where
    S: JobRunStore + ?Sized,
{
    fn run_loop(self, rx: Receiver<JobRun>) {
        let job = self.spec.name;
        let shutdown = &self.dispatcher.shutdown;
        let mut next_fire = self.spec.cadence.next_after(Utc::now());
        info!(job = %job, cadence = %self.spec.cadence, next_fire = %next_fire, "job runner started");

        loop {
            if shutdown.is_raised() {
                break;
            }

            let now = Utc::now();
            if now >= next_fire {
                next_fire = self.spec.cadence.next_after(now);
                if let Err(e) = self.dispatcher.dispatch(job, RunTrigger::Scheduled) {
                    warn!(job = %job, error = %e, "scheduled trigger failed");
                }
                debug!(job = %job, next_fire = %next_fire, "next scheduled trigger");
                continue;
            }

            let wait = (next_fire - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval);
            match rx.recv_timeout(wait) {
                Ok(run) => {
                    let run_id = run.id;
                    self.execute(run);
                    next_fire = self.skip_missed_ticks(run_id, next_fire);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Runs accepted but never started.
        while let Ok(mut run) = rx.try_recv() {
            run.fail(Utc::now(), INTERRUPTED);
            self.finish(&run);
        }
        info!(job = %job, "job runner stopped");
    }

    /// Ticks that came due while `running_run_id` held the lease are recorded
    /// as skips and not fired late. Returns the first tick still ahead.
    fn skip_missed_ticks(&self, running_run_id: JobRunId, mut next_fire: DateTime<Utc>) -> DateTime<Utc> {
        let job = self.spec.name;
        let now = Utc::now();
        let mut missed = 0;
        while next_fire <= now {
            if missed == MAX_MISSED_TICK_SKIPS {
                next_fire = self.spec.cadence.next_after(now);
                break;
            }
            self.dispatcher.record_skip(&OverlapSkip {
                job_name: job,
                trigger: RunTrigger::Scheduled,
                skipped_at: next_fire,
                running_run_id,
            });
            missed += 1;
            next_fire = self.spec.cadence.next_after(next_fire);
        }
        if missed > 0 {
            debug!(job = %job, missed, next_fire = %next_fire, "scheduled ticks missed during run");
        }
        next_fire
    }

    fn execute(&self, mut run: JobRun) {
        let started = Instant::now();
        let shutdown = &self.dispatcher.shutdown;
        let retry = &self.spec.retry;
        let mut ctx = JobContext::new(run.job_name, run.id, run.trigger, shutdown.clone());

        info!(job = %run.job_name, run_id = %run.id, trigger = run.trigger.as_str(), "job run started");

        let outcome = loop {
            run.attempts += 1;
            ctx.attempt = run.attempts;
            if let Err(e) = self.dispatcher.store.update_run(&run) {
                warn!(job = %run.job_name, run_id = %run.id, error = %e, "failed to record attempt");
            }

            let result = if shutdown.is_raised() {
                Err(JobError::Interrupted)
            } else {
                panic::catch_unwind(AssertUnwindSafe(|| self.action.run(&ctx)))
                    .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload))))
            };

            match result {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && retry.should_retry(run.attempts - 1) => {
                    let delay = retry.delay_for_retry(run.attempts);
                    warn!(
                        job = %run.job_name,
                        run_id = %run.id,
                        attempt = run.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "job attempt failed; retrying"
                    );
                    if shutdown.wait_timeout(delay) {
                        break Err(JobError::Interrupted);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        let finished_at = Utc::now();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                run.succeed(finished_at);
                info!(
                    job = %run.job_name,
                    run_id = %run.id,
                    attempts = run.attempts,
                    elapsed_ms,
                    "job run succeeded"
                );
            }
            Err(JobError::Interrupted) => {
                run.fail(finished_at, INTERRUPTED);
                warn!(job = %run.job_name, run_id = %run.id, elapsed_ms, "job run interrupted");
            }
            Err(e) => {
                run.fail(finished_at, e.to_string());
                error!(
                    job = %run.job_name,
                    run_id = %run.id,
                    attempts = run.attempts,
                    elapsed_ms,
                    error = %e,
                    "job run failed"
                );
            }
        }

        self.finish(&run);
    }

    /// Persist the terminal state, releasing the lease. Retried with the
    /// job's policy; a run that still cannot be written is reconciled at the
    /// next start. Shutdown cuts the backoff short but not the retries.
    fn finish(&self, run: &JobRun) {
        let store = &self.dispatcher.store;
        let shutdown = &self.dispatcher.shutdown;
        let retry: &RetryPolicy = &self.spec.retry;
        let mut retries = 0;
        loop {
            match store.update_run(run) {
                Ok(()) => return,
                Err(e) if e.is_transient() && retry.should_retry(retries) => {
                    retries += 1;
                    warn!(job = %run.job_name, run_id = %run.id, error = %e, "failed to persist run result; retrying");
                    if shutdown.wait_timeout(retry.delay_for_retry(retries)) {
                        debug!(job = %run.job_name, run_id = %run.id, "shutdown raised; retrying without backoff");
                    }
                }
                Err(e) => {
                    error!(
                        job = %run.job_name,
                        run_id = %run.id,
                        error = %e,
                        "failed to persist run result; lease held until restart"
                    );
                    return;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle to a running scheduler.
///
/// Dropping the handle shuts the scheduler down.
pub struct JobSchedulerHandle<S: ?Sized> {
    dispatcher: Arc<Dispatcher<S>>,
    specs: BTreeMap<JobName, JobSpec>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownSignal,
}

impl<S> JobSchedulerHandle<S>
where
    S: JobRunStore + ?Sized,
{
    /// Manually trigger `job`.
    pub fn trigger(&self, job: JobName) -> Result<TriggerOutcome, ScheduleError> {
        self.trigger_with(job, RunTrigger::Manual)
    }

    pub fn trigger_with(&self, job: JobName, trigger: RunTrigger) -> Result<TriggerOutcome, ScheduleError> {
        self.dispatcher.dispatch(job, trigger)
    }

    /// Registered jobs, in name order.
    pub fn jobs(&self) -> Vec<JobSpec> {
        self.specs.values().cloned().collect()
    }

    /// Latest run and recent overlap skips of `job`.
    pub fn status(&self, job: JobName) -> Result<JobStatusView, ScheduleError> {
        let spec = self.specs.get(&job).ok_or(ScheduleError::UnknownJob(job))?;
        let store = &self.dispatcher.store;
        let latest_run = store.latest_run(job)?;
        Ok(JobStatusView {
            job,
            cadence: spec.cadence.to_string(),
            running: latest_run.as_ref().is_some_and(JobRun::is_running),
            latest_run,
            recent_skips: store.list_skips(Some(job), RECENT_SKIPS)?,
        })
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_raised()
    }

    /// Signal every runner and wait for in-flight runs to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.raise();
        let joins = {
            let mut guard = self.joins.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        if joins.is_empty() {
            return;
        }
        info!("job scheduler shutting down");
        for join in joins {
            if join.join().is_err() {
                error!("job runner thread panicked");
            }
        }
        info!("job scheduler stopped");
    }
}

impl<S: ?Sized> Drop for JobSchedulerHandle<S> {
    fn drop(&mut self) {
        self.shutdown.raise();
        let joins = std::mem::take(self.joins.get_mut().unwrap_or_else(PoisonError::into_inner));
        for join in joins {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::Cadence;
    use crate::store::{InMemoryAnalyticsStore, PurgeCounts, StoreError};
    use fitpulse_core::JobRunStatus;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Far-future cadence so only explicit triggers fire.
    const IDLE: Cadence = Cadence::Every { secs: 86_400 };

    fn spec(job: JobName) -> JobSpec {
        JobSpec::new(job, IDLE).with_retry(RetryPolicy::fixed(2, Duration::from_millis(5)))
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn finished(store: &InMemoryAnalyticsStore, id: JobRunId) -> JobRun {
        assert!(
            wait_until(Duration::from_secs(5), || store
                .get_run(id)
                .unwrap()
                .is_some_and(|r| !r.is_running())),
            "run {id} did not finish"
        );
        store.get_run(id).unwrap().unwrap()
    }

    /// Gate an action can block on until the test opens it.
    #[derive(Clone, Default)]
    struct Gate(ShutdownSignal);

    impl Gate {
        fn open(&self) {
            self.0.raise();
        }

        fn wait(&self, ctx: &JobContext) -> Result<(), JobError> {
            while !self.0.wait_timeout(Duration::from_millis(5)) {
                ctx.checkpoint()?;
            }
            Ok(())
        }
    }

    /// Rejects the first `failures` writes of a finished run.
    struct FlakyFinishStore {
        inner: InMemoryAnalyticsStore,
        failures: AtomicU32,
        rejected: AtomicU32,
    }

    impl FlakyFinishStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryAnalyticsStore::new(),
                failures: AtomicU32::new(failures),
                rejected: AtomicU32::new(0),
            }
        }
    }

    impl JobRunStore for FlakyFinishStore {
        fn try_start_run(
            &self,
            job: JobName,
            trigger: RunTrigger,
            at: DateTime<Utc>,
        ) -> StoreResult<LeaseOutcome> {
            self.inner.try_start_run(job, trigger, at)
        }

        fn update_run(&self, run: &JobRun) -> StoreResult<()> {
            let take = |n: u32| n.checked_sub(1);
            if !run.is_running() && self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, take).is_ok() {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.update_run(run)
        }

        fn get_run(&self, id: JobRunId) -> StoreResult<Option<JobRun>> {
            self.inner.get_run(id)
        }

        fn latest_run(&self, job: JobName) -> StoreResult<Option<JobRun>> {
            self.inner.latest_run(job)
        }

        fn list_runs(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<JobRun>> {
            self.inner.list_runs(job, limit)
        }

        fn running_runs(&self) -> StoreResult<Vec<JobRun>> {
            self.inner.running_runs()
        }

        fn reconcile_running(&self, at: DateTime<Utc>, detail: &str) -> StoreResult<Vec<JobRun>> {
            self.inner.reconcile_running(at, detail)
        }

        fn record_skip(&self, skip: &OverlapSkip) -> StoreResult<()> {
            self.inner.record_skip(skip)
        }

        fn list_skips(&self, job: Option<JobName>, limit: usize) -> StoreResult<Vec<OverlapSkip>> {
            self.inner.list_skips(job, limit)
        }

        fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> StoreResult<PurgeCounts> {
            self.inner.purge_finished_before(cutoff)
        }
    }

    #[test]
    fn manual_trigger_runs_to_success() {
        let store = InMemoryAnalyticsStore::arc();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::LogCleanup),
            Arc::new(move |_ctx: &JobContext| -> Result<(), JobError> {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::LogCleanup).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Succeeded);
        assert_eq!(run.trigger, RunTrigger::Manual);
        assert_eq!(run.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }

    #[test]
    fn trigger_while_running_is_rejected_and_recorded() {
        let store = InMemoryAnalyticsStore::arc();
        let gate = Gate::default();
        let action_gate = gate.clone();

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::ForecastGenerate),
            Arc::new(move |ctx: &JobContext| action_gate.wait(ctx)),
        );
        let handle = scheduler.start().unwrap();

        let first = handle.trigger(JobName::ForecastGenerate).unwrap();
        let first_id = first.run_id().unwrap();
        let second = handle
            .trigger_with(JobName::ForecastGenerate, RunTrigger::Scheduled)
            .unwrap();
        assert_eq!(
            second,
            TriggerOutcome::Rejected {
                reason: RejectReason::AlreadyRunning {
                    running_run_id: first_id
                }
            }
        );

        let status = handle.status(JobName::ForecastGenerate).unwrap();
        assert!(status.running);
        assert_eq!(status.recent_skips.len(), 1);
        assert_eq!(status.recent_skips[0].trigger, RunTrigger::Scheduled);
        assert_eq!(status.recent_skips[0].running_run_id, first_id);

        gate.open();
        assert_eq!(finished(&store, first_id).status, JobRunStatus::Succeeded);

        // Lease released: the next trigger is accepted.
        let third = handle.trigger(JobName::ForecastGenerate).unwrap();
        assert!(third.is_accepted());
        finished(&store, third.run_id().unwrap());
        handle.shutdown();
    }

    #[test]
    fn concurrent_triggers_start_at_most_one_run() {
        let store = InMemoryAnalyticsStore::arc();
        let gate = Gate::default();
        let action_gate = gate.clone();

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::SentimentSweep),
            Arc::new(move |ctx: &JobContext| action_gate.wait(ctx)),
        );
        let handle = Arc::new(scheduler.start().unwrap());

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || handle.trigger(JobName::SentimentSweep).unwrap())
            })
            .collect();
        let outcomes: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        let accepted: Vec<_> = outcomes.iter().filter_map(TriggerOutcome::run_id).collect();
        assert_eq!(accepted.len(), 1);
        assert_eq!(store.running_runs().unwrap().len(), 1);
        assert_eq!(
            store.list_skips(Some(JobName::SentimentSweep), 100).unwrap().len(),
            15
        );

        gate.open();
        finished(&store, accepted[0]);
        handle.shutdown();
    }

    #[test]
    fn persistence_failures_are_retried_within_the_run() {
        let store = InMemoryAnalyticsStore::arc();
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::ForecastRefresh),
            Arc::new(move |ctx: &JobContext| -> Result<(), JobError> {
                seen.store(ctx.attempt, Ordering::SeqCst);
                if ctx.attempt < 3 {
                    Err(StoreError::Unavailable("connection reset".into()).into())
                } else {
                    Ok(())
                }
            }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::ForecastRefresh).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Succeeded);
        assert_eq!(run.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        handle.shutdown();
    }

    #[test]
    fn exhausted_retries_fail_the_run() {
        let store = InMemoryAnalyticsStore::arc();
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::ForecastRefresh),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> {
                Err(StoreError::Unavailable("down".into()).into())
            }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::ForecastRefresh).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Failed);
        // First attempt plus two retries.
        assert_eq!(run.attempts, 3);
        assert!(run.error_detail.unwrap().contains("down"));
        handle.shutdown();
    }

    #[test]
    fn analysis_errors_are_not_retried() {
        let store = InMemoryAnalyticsStore::arc();
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::ForecastGenerate),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> {
                Err(fitpulse_ai::AiError::InsufficientHistory {
                    required: 6,
                    available: 2,
                }
                .into())
            }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::ForecastGenerate).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.attempts, 1);
        assert!(run.error_detail.unwrap().contains("insufficient history"));
        handle.shutdown();
    }

    #[test]
    fn permanent_store_errors_are_not_retried() {
        let store = InMemoryAnalyticsStore::arc();
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::SentimentSweep),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> {
                Err(StoreError::Conflict("feedback already exists".into()).into())
            }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::SentimentSweep).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.attempts, 1);
        assert!(run.error_detail.unwrap().contains("conflicting write"));
        handle.shutdown();
    }

    #[test]
    fn result_write_is_retried_until_it_lands() {
        let store = Arc::new(FlakyFinishStore::new(2));
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::LogCleanup),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> { Ok(()) }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::LogCleanup).unwrap().run_id().unwrap();
        assert!(wait_until(Duration::from_secs(5), || store
            .get_run(run_id)
            .unwrap()
            .is_some_and(|r| r.status == JobRunStatus::Succeeded)));
        assert_eq!(store.rejected.load(Ordering::SeqCst), 2);
        handle.shutdown();
    }

    #[test]
    fn shutdown_cuts_result_write_backoff_short() {
        let store = Arc::new(FlakyFinishStore::new(1));
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            JobSpec::new(JobName::LogCleanup, IDLE).with_retry(RetryPolicy::fixed(3, Duration::from_secs(30))),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> { Ok(()) }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::LogCleanup).unwrap().run_id().unwrap();
        // The first result write failed; the runner is now in a 30s backoff.
        assert!(wait_until(Duration::from_secs(5), || store.rejected.load(Ordering::SeqCst) == 1));

        let started = Instant::now();
        handle.shutdown();
        assert!(started.elapsed() < Duration::from_secs(5), "shutdown waited out the backoff");
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Succeeded);
        assert!(store.running_runs().unwrap().is_empty());
    }

    #[test]
    fn panicking_action_fails_run_and_releases_lease() {
        let store = InMemoryAnalyticsStore::arc();
        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::LogCleanup),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> { panic!("boom") }),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::LogCleanup).unwrap().run_id().unwrap();
        let run = finished(&store, run_id);
        assert_eq!(run.status, JobRunStatus::Failed);
        assert!(run.error_detail.unwrap().contains("boom"));
        assert!(handle.trigger(JobName::LogCleanup).unwrap().is_accepted());
        handle.shutdown();
    }

    #[test]
    fn shutdown_interrupts_running_action() {
        let store = InMemoryAnalyticsStore::arc();
        let gate = Gate::default();
        let action_gate = gate.clone();

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(
            spec(JobName::SentimentSweep),
            Arc::new(move |ctx: &JobContext| action_gate.wait(ctx)),
        );
        let handle = scheduler.start().unwrap();

        let run_id = handle.trigger(JobName::SentimentSweep).unwrap().run_id().unwrap();
        assert!(wait_until(Duration::from_secs(2), || store
            .get_run(run_id)
            .unwrap()
            .is_some_and(|r| r.attempts == 1)));

        handle.shutdown();
        let run = store.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, JobRunStatus::Failed);
        assert_eq!(run.error_detail.as_deref(), Some(INTERRUPTED));
        assert!(store.running_runs().unwrap().is_empty());

        // Idempotent, and later triggers are refused.
        handle.shutdown();
        assert!(matches!(
            handle.trigger(JobName::SentimentSweep),
            Err(ScheduleError::ShuttingDown)
        ));
    }

    #[test]
    fn start_reconciles_runs_left_by_a_previous_process() {
        let store = InMemoryAnalyticsStore::arc();
        let stale = match store
            .try_start_run(JobName::ForecastGenerate, RunTrigger::Scheduled, Utc::now())
            .unwrap()
        {
            LeaseOutcome::Acquired(run) => run,
            other => panic!("expected lease, got {other:?}"),
        };

        let mut scheduler = JobScheduler::new(Arc::clone(&store));
        scheduler.register(spec(JobName::ForecastGenerate), Arc::new(|_ctx: &JobContext| -> Result<(), JobError> { Ok(()) }));
        let handle = scheduler.start().unwrap();

        let reconciled = store.get_run(stale.id).unwrap().unwrap();
        assert_eq!(reconciled.status, JobRunStatus::Failed);
        assert_eq!(reconciled.error_detail.as_deref(), Some(INTERRUPTED_BY_RESTART));
        assert!(handle.trigger(JobName::ForecastGenerate).unwrap().is_accepted());
        handle.shutdown();
    }

    #[test]
    fn scheduled_cadence_fires_without_a_trigger() {
        let store = InMemoryAnalyticsStore::arc();
        let mut scheduler =
            JobScheduler::new(Arc::clone(&store)).with_poll_interval(Duration::from_millis(10));
        scheduler.register(
            JobSpec::new(JobName::LogCleanup, Cadence::Every { secs: 1 }),
            Arc::new(|_ctx: &JobContext| -> Result<(), JobError> { Ok(()) }),
        );
        let handle = scheduler.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            store
                .latest_run(JobName::LogCleanup)
                .unwrap()
                .is_some_and(|r| r.trigger == RunTrigger::Scheduled && r.status == JobRunStatus::Succeeded)
        }));
        handle.shutdown();
    }

    #[test]
    fn ticks_due_during_a_run_are_skipped_not_fired_late() {
        let store = InMemoryAnalyticsStore::arc();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut scheduler =
            JobScheduler::new(Arc::clone(&store)).with_poll_interval(Duration::from_millis(10));
        scheduler.register(
            JobSpec::new(JobName::LogCleanup, Cadence::Every { secs: 1 }),
            Arc::new(move |ctx: &JobContext| -> Result<(), JobError> {
                // Only the first run outlasts the cadence.
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    let until = Instant::now() + Duration::from_millis(2500);
                    while Instant::now() < until {
                        ctx.checkpoint()?;
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                Ok(())
            }),
        );
        let handle = scheduler.start().unwrap();

        assert!(wait_until(Duration::from_secs(3), || store
            .latest_run(JobName::LogCleanup)
            .unwrap()
            .is_some()));
        let first = store.latest_run(JobName::LogCleanup).unwrap().unwrap();
        let first = finished(&store, first.id);
        assert_eq!(first.status, JobRunStatus::Succeeded);
        assert_eq!(first.trigger, RunTrigger::Scheduled);

        // Ticks at +1s and +2s fell inside the 2.5s run.
        assert!(wait_until(Duration::from_secs(2), || store
            .list_skips(Some(JobName::LogCleanup), 10)
            .unwrap()
            .len()
            >= 2));
        let skips = store.list_skips(Some(JobName::LogCleanup), 10).unwrap();
        for skip in &skips {
            assert_eq!(skip.trigger, RunTrigger::Scheduled);
            assert_eq!(skip.running_run_id, first.id);
            assert!(skip.skipped_at > first.started_at);
        }
        handle.shutdown();
    }

    #[test]
    fn unknown_job_is_an_error() {
        let store = InMemoryAnalyticsStore::arc();
        let handle = JobScheduler::new(store).start().unwrap();
        assert!(matches!(
            handle.trigger(JobName::LogCleanup),
            Err(ScheduleError::UnknownJob(JobName::LogCleanup))
        ));
        // No runners: shutdown has nothing to join.
        handle.shutdown();
    }
}
