//! Saga coordinator: drives instances through their steps and compensations.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Clock, IdGenerator, MultiError, SagaId, SystemClock, UuidGenerator};
use futures_util::FutureExt;
use lock::Locker;
use saga_store::{DataMap, Instance, Status, Store};
use tokio_util::sync::CancellationToken;

use crate::definition::{Definition, StepFn};
use crate::error::{CompensationError, Result, SagaError, StepError};
use crate::execution::Execution;
use crate::hooks::{NoopHooks, SagaHooks};
use crate::lease::Lease;
use crate::retry_factory::{CompensationRetryFactory, RetryFactory, StepRetryFactory};

/// Coordinator configuration.
#[derive(Clone)]
pub struct CoordinatorConfig {
    /// Lease TTL per run. Zero holds the lease without expiry and disables
    /// the keepalive.
    pub lock_ttl: Duration,
    /// Overall budget for one compensation walk. `None` is unbounded.
    pub max_compensation_time: Option<Duration>,
    pub hooks: Arc<dyn SagaHooks>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub retry_factory: Arc<dyn RetryFactory>,
    pub compensation_retry_factory: Arc<dyn RetryFactory>,
}

impl CoordinatorConfig {
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_max_compensation_time(mut self, limit: Duration) -> Self {
        self.max_compensation_time = Some(limit).filter(|d| !d.is_zero());
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SagaHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_retry_factory(mut self, factory: impl RetryFactory + 'static) -> Self {
        self.retry_factory = Arc::new(factory);
        self
    }

    pub fn with_compensation_retry_factory(mut self, factory: impl RetryFactory + 'static) -> Self {
        self.compensation_retry_factory = Arc::new(factory);
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            max_compensation_time: None,
            hooks: Arc::new(NoopHooks),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            retry_factory: Arc::new(StepRetryFactory::new()),
            compensation_retry_factory: Arc::new(CompensationRetryFactory::new()),
        }
    }
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("lock_ttl", &self.lock_ttl)
            .field("max_compensation_time", &self.max_compensation_time)
            .finish_non_exhaustive()
    }
}

/// Why the step loop stopped early.
enum Abort {
    /// A step gave up; compensation follows.
    StepFailed(SagaError),
    /// The run cannot continue safely; the instance is left as persisted.
    Fatal(SagaError),
}

/// Mutable state shared by the attempts of one step.
struct Attempts<'r> {
    inst: &'r mut Instance,
    lease: &'r mut Lease,
    fatal: Option<SagaError>,
}

impl Attempts<'_> {
    /// Records a fatal error and stops the retry loop.
    fn abort(&mut self, err: SagaError, attempts: &CancellationToken) -> StepError {
        let message = err.to_string();
        self.fatal = Some(err);
        attempts.cancel();
        StepError::Fatal(message)
    }
}

/// Orchestrates saga instances of one [`Definition`].
///
/// Every [`run`](Coordinator::run) takes an exclusive lease on the saga, so
/// any number of coordinators (in one process or many) can share a store and
/// a locker. A run that cannot take the lease fails with
/// [`SagaError::Locked`]; callers retry later instead of blocking.
#[derive(Clone)]
pub struct Coordinator {
    definition: Arc<Definition>,
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        definition: Definition,
        store: Arc<dyn Store>,
        locker: Arc<dyn Locker>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            definition: Arc::new(definition),
            store,
            locker,
            config,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Creates and persists a new pending instance with a generated ID.
    #[tracing::instrument(skip(self, input, metadata), fields(saga = %self.definition.name))]
    pub async fn start(&self, input: DataMap, metadata: BTreeMap<String, String>) -> Result<SagaId> {
        self.start_with_id(self.config.ids.next_id(), input, metadata)
            .await
    }

    /// Creates and persists a new pending instance under a caller-chosen ID.
    pub async fn start_with_id(
        &self,
        saga_id: SagaId,
        input: DataMap,
        metadata: BTreeMap<String, String>,
    ) -> Result<SagaId> {
        if saga_id.is_empty() {
            return Err(SagaError::EmptySagaId);
        }

        let inst = Instance::new(
            saga_id.clone(),
            &self.definition.name,
            self.definition.step_names(),
            input,
            metadata,
            self.now(),
        );
        self.store.create(&inst).await?;
        self.config.hooks.on_saga_started(&inst);
        tracing::info!(%saga_id, steps = inst.steps.len(), "saga started");
        Ok(saga_id)
    }

    /// Loads the current state of a saga.
    pub async fn load(&self, saga_id: &SagaId) -> Result<Instance> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Advances a saga as far as it can go.
    ///
    /// Runs the remaining steps in order, each inside its own retrier. If a
    /// step gives up, the completed steps are compensated in reverse order
    /// and `Ok` is returned when every compensation succeeded. Running a
    /// terminal saga is a no-op.
    ///
    /// `cancel` interrupts retry waits and is visible to step actions; a step
    /// that gives up because of it is handled like any other failure.
    /// Losing the lease or failing to persist aborts the run without
    /// compensating, leaving the saga resumable by a later run.
    #[tracing::instrument(skip(self, cancel), fields(saga = %self.definition.name))]
    pub async fn run(&self, saga_id: &SagaId, cancel: &CancellationToken) -> Result<()> {
        if saga_id.is_empty() {
            return Err(SagaError::EmptySagaId);
        }
        metrics::counter!("saga_runs_total").increment(1);
        let started = std::time::Instant::now();

        let mut lease = Lease::acquire(&self.locker, saga_id, self.config.lock_ttl).await?;
        let result = self.run_leased(saga_id, &mut lease, cancel).await;
        lease.release().await;

        metrics::histogram!("saga_run_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    /// Cancels a non-terminal saga and compensates its completed steps.
    #[tracing::instrument(skip(self), fields(saga = %self.definition.name))]
    pub async fn cancel(&self, saga_id: &SagaId) -> Result<()> {
        if saga_id.is_empty() {
            return Err(SagaError::EmptySagaId);
        }

        let lease = Lease::acquire(&self.locker, saga_id, self.config.lock_ttl).await?;
        let result = self.cancel_leased(saga_id).await;
        lease.release().await;
        result
    }

    async fn run_leased(&self, saga_id: &SagaId, lease: &mut Lease, cancel: &CancellationToken) -> Result<()> {
        let mut inst = self.store.load(saga_id).await?;
        if inst.is_terminal() {
            tracing::debug!(status = %inst.status, "saga already terminal");
            return Ok(());
        }
        self.check_shape(&inst)?;

        match inst.status {
            Status::Pending => {
                self.set_status(&mut inst, Status::Running).await?;
                tracing::info!("saga running");
            }
            Status::Compensating => {
                tracing::info!("resuming interrupted compensation");
                return self.compensate(&mut inst).await;
            }
            _ => {}
        }

        match self.run_steps(&mut inst, lease, cancel).await {
            Ok(()) => {
                self.set_status(&mut inst, Status::Completed).await?;
                self.config.hooks.on_saga_completed(&inst);
                metrics::counter!("saga_completed_total").increment(1);
                tracing::info!("saga completed");
                Ok(())
            }
            Err(Abort::Fatal(err)) => {
                tracing::warn!(error = %err, "saga run aborted");
                Err(err)
            }
            Err(Abort::StepFailed(err)) => {
                inst.status = Status::Failed;
                self.config.hooks.on_saga_failed(&inst, &err);
                metrics::counter!("saga_failed_total").increment(1);
                tracing::warn!(error = %err, "saga failed, compensating");
                self.compensate(&mut inst).await
            }
        }
    }

    async fn cancel_leased(&self, saga_id: &SagaId) -> Result<()> {
        let mut inst = self.store.load(saga_id).await?;
        if inst.is_terminal() {
            return Err(SagaError::AlreadyTerminal(saga_id.clone()));
        }
        self.check_shape(&inst)?;

        inst.status = Status::Cancelled;
        tracing::info!("saga cancelled, compensating");
        self.compensate(&mut inst).await
    }

    async fn run_steps(
        &self,
        inst: &mut Instance,
        lease: &mut Lease,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        while inst.current < inst.steps.len() {
            let index = inst.current;
            if inst.steps[index].status == Status::Completed {
                tracing::debug!(step = %inst.steps[index].name, "step already completed");
                inst.current += 1;
                continue;
            }
            self.run_step(inst, index, lease, cancel).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        inst: &mut Instance,
        index: usize,
        lease: &mut Lease,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Abort> {
        let step = &self.definition.steps[index];
        let retrier = self.config.retry_factory.build(step);
        let attempts_token = cancel.child_token();
        let attempts = tokio::sync::Mutex::new(Attempts {
            inst: &mut *inst,
            lease: &mut *lease,
            fatal: None,
        });

        let outcome = {
            let attempts = &attempts;
            let token = &attempts_token;
            retrier
                .run(token, move |_| async move {
                    let mut attempts = attempts.lock().await;
                    self.attempt_step(&mut attempts, index, token).await
                })
                .await
        };

        if let Some(err) = attempts.into_inner().fatal {
            return Err(Abort::Fatal(err));
        }
        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let now = self.now();
        let state = &mut inst.steps[index];
        state.status = Status::Failed;
        state.error_msg = err.last_error().to_string();
        state.finished_at = Some(now);
        inst.updated_at = now;

        metrics::counter!("saga_step_failures_total", "step" => step.name.clone()).increment(1);
        tracing::warn!(
            step = %step.name,
            attempts = err.attempts(),
            cause = %err.cause(),
            error = %err.last_error(),
            "saga step gave up"
        );
        self.config
            .hooks
            .on_step_failure(inst, &inst.steps[index], err.last_error());
        self.store
            .save(inst)
            .await
            .map_err(|e| Abort::Fatal(e.into()))?;

        Err(Abort::StepFailed(SagaError::StepFailed {
            step: step.name.clone(),
            source: err,
        }))
    }

    async fn attempt_step(
        &self,
        run: &mut Attempts<'_>,
        index: usize,
        token: &CancellationToken,
    ) -> std::result::Result<(), StepError> {
        if run.lease.is_lost() {
            let err = SagaError::LeaseLost(run.inst.id.clone());
            return Err(run.abort(err, token));
        }

        let step = &self.definition.steps[index];
        let now = self.now();
        let state = &mut run.inst.steps[index];
        state.status = Status::Running;
        state.attempt = state.attempt.saturating_add(1);
        state.started_at = Some(now);
        state.finished_at = None;
        let attempt = state.attempt;
        run.inst.updated_at = now;

        if let Err(e) = self.store.save(run.inst).await {
            return Err(run.abort(e.into(), token));
        }
        self.config
            .hooks
            .on_step_start(run.inst, &run.inst.steps[index]);
        tracing::debug!(step = %step.name, attempt, "step attempt started");

        let mut ex = Execution::new(
            Arc::clone(&self.definition),
            Arc::new(run.inst.clone()),
            index,
            attempt,
            run.inst.steps[index].data.clone(),
            Arc::clone(&self.store),
            token.child_token(),
            false,
        );

        match invoke(&step.action, &mut ex, &step.name, step.timeout).await {
            Ok(()) => {
                let now = self.now();
                let state = &mut run.inst.steps[index];
                state.status = Status::Completed;
                state.finished_at = Some(now);
                state.error_msg.clear();
                state.data = ex.into_data();
                run.inst.current = index + 1;
                run.inst.updated_at = now;

                if let Err(e) = self.store.save(run.inst).await {
                    return Err(run.abort(e.into(), token));
                }
                self.config
                    .hooks
                    .on_step_success(run.inst, &run.inst.steps[index]);
                tracing::info!(step = %step.name, attempt, "saga step completed");
                Ok(())
            }
            Err(err) => {
                run.inst.steps[index].error_msg = err.to_string();
                tracing::warn!(step = %step.name, attempt, error = %err, "saga step attempt failed");
                Err(err)
            }
        }
    }

    /// Walks back from the last entered step, undoing completed steps.
    ///
    /// Compensations run under their own cancellation token: a cancelled run
    /// still gets its completed steps undone. The walk is bounded by the
    /// compensation retriers and by `max_compensation_time`.
    async fn compensate(&self, inst: &mut Instance) -> Result<()> {
        let from = inst.current.saturating_sub(1);
        self.config.hooks.on_saga_compensating(inst, from);
        self.set_status(inst, Status::Compensating).await?;
        tracing::info!(from, "saga compensation started");

        let cancel = CancellationToken::new();
        let deadline = self.config.max_compensation_time.map(|limit| {
            let at = tokio::time::Instant::now() + limit;
            let timer = cancel.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                timer.cancel();
            });
            (at, limit, handle)
        });

        let mut failures = MultiError::new();
        for index in (0..inst.steps.len().min(from + 1)).rev() {
            let step = &self.definition.steps[index];
            if !step.is_compensable() || !needs_compensation(inst.steps[index].status) {
                continue;
            }
            if let Some((at, limit, _)) = &deadline
                && tokio::time::Instant::now() >= *at
            {
                tracing::warn!(step = %step.name, ?limit, "compensation deadline exceeded");
                failures.push(CompensationError::DeadlineExceeded {
                    step: step.name.clone(),
                    limit: *limit,
                });
                break;
            }
            if let Some(err) = self.compensate_step(inst, index, &cancel).await? {
                failures.push(err);
            }
        }
        if let Some((_, _, timer)) = deadline {
            timer.abort();
        }

        self.config.hooks.on_saga_compensating_finished(inst);
        let status = if failures.is_empty() {
            Status::Completed
        } else {
            Status::Failed
        };
        self.set_status(inst, status).await?;

        if failures.is_empty() {
            tracing::info!("saga compensation finished");
        } else {
            tracing::warn!(failures = failures.len(), "saga compensation incomplete");
        }
        failures.into_result().map_err(SagaError::Compensation)
    }

    /// Compensates one step. The outer error is fatal, the inner one is the
    /// step's compensation failure.
    async fn compensate_step(
        &self,
        inst: &mut Instance,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<CompensationError>> {
        let step = &self.definition.steps[index];
        let Some(compensate) = &step.compensate else {
            return Ok(None);
        };

        let now = self.now();
        let state = &mut inst.steps[index];
        state.status = Status::Compensating;
        state.started_at = Some(now);
        state.finished_at = None;
        inst.updated_at = now;
        self.store.save(inst).await?;

        let retrier = self.config.compensation_retry_factory.build(step);
        let snapshot = Arc::new(inst.clone());
        let seed = &inst.steps[index].data;
        let outcome = retrier
            .run(cancel, move |attempt| {
                let mut ex = Execution::new(
                    Arc::clone(&self.definition),
                    Arc::clone(&snapshot),
                    index,
                    attempt.saturating_add(1),
                    seed.clone(),
                    Arc::clone(&self.store),
                    cancel.child_token(),
                    true,
                );
                async move {
                    let result = invoke(compensate, &mut ex, &step.name, step.timeout).await;
                    result.map(|()| ex.into_data())
                }
            })
            .await;

        let now = self.now();
        match outcome {
            Ok(data) => {
                let state = &mut inst.steps[index];
                state.status = Status::CompensateSuccess;
                state.error_msg.clear();
                state.data = data;
                state.finished_at = Some(now);
                inst.updated_at = now;
                self.store.save(inst).await?;

                self.config
                    .hooks
                    .on_step_compensation_ok(inst, &inst.steps[index]);
                metrics::counter!("saga_compensations_total", "outcome" => "success").increment(1);
                tracing::info!(step = %step.name, "step compensated");
                Ok(None)
            }
            Err(err) => {
                let state = &mut inst.steps[index];
                state.status = Status::CompensateFailed;
                state.error_msg = format!("compensation: {}", err.last_error());
                state.finished_at = Some(now);
                inst.updated_at = now;
                self.store.save(inst).await?;

                self.config
                    .hooks
                    .on_step_compensation_ko(inst, &inst.steps[index], err.last_error());
                metrics::counter!("saga_compensations_total", "outcome" => "failure").increment(1);
                tracing::warn!(
                    step = %step.name,
                    attempts = err.attempts(),
                    error = %err.last_error(),
                    "step compensation failed"
                );
                Ok(Some(CompensationError::Step {
                    step: step.name.clone(),
                    source: err,
                }))
            }
        }
    }

    async fn set_status(&self, inst: &mut Instance, status: Status) -> Result<()> {
        inst.status = status;
        inst.updated_at = self.now();
        self.store.save(inst).await?;
        Ok(())
    }

    fn check_shape(&self, inst: &Instance) -> Result<()> {
        if inst.steps.len() == self.definition.len() {
            return Ok(());
        }
        Err(SagaError::DefinitionMismatch {
            id: inst.id.clone(),
            definition: self.definition.name.clone(),
            expected: self.definition.len(),
            persisted: inst.steps.len(),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        self.config.clock.now()
    }
}

/// A step left mid-compensation by a crashed run is compensated again.
fn needs_compensation(status: Status) -> bool {
    matches!(status, Status::Completed | Status::Compensating)
}

/// Runs one action or compensation, converting panics and timeouts into
/// step failures.
///
/// On timeout the execution's token is cancelled and the call is awaited to
/// completion; an action that still succeeds is not reported as failed.
async fn invoke(
    f: &StepFn,
    ex: &mut Execution,
    step: &str,
    timeout: Option<Duration>,
) -> std::result::Result<(), StepError> {
    let token = ex.cancellation().clone();
    let call = AssertUnwindSafe(f.call(ex)).catch_unwind();

    let outcome = match timeout {
        None => call.await,
        Some(limit) => {
            tokio::pin!(call);
            tokio::select! {
                outcome = &mut call => outcome,
                _ = tokio::time::sleep(limit) => {
                    token.cancel();
                    match call.await {
                        Ok(Err(_)) => {
                            return Err(StepError::TimedOut {
                                step: step.to_string(),
                                timeout: limit,
                            });
                        }
                        other => other,
                    }
                }
            }
        }
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StepError::Action(e)),
        Err(panic) => Err(StepError::Panicked {
            step: step.to_string(),
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Step;
    use saga_store::InMemoryStore;

    fn execution(step: Step) -> Execution {
        let def = Definition::new("t").step(step);
        let inst = Instance::new(
            SagaId::from("saga-1"),
            "t",
            def.step_names(),
            DataMap::new(),
            BTreeMap::new(),
            Utc::now(),
        );
        Execution::new(
            Arc::new(def),
            Arc::new(inst),
            0,
            1,
            DataMap::new(),
            Arc::new(InMemoryStore::new()),
            CancellationToken::new(),
            false,
        )
    }

    #[tokio::test]
    async fn invoke_recovers_panics() {
        let step = Step::new("boom", |_ex| Box::pin(async { panic!("kaboom") }));
        let action = step.action.clone();
        let mut ex = execution(step);

        let err = invoke(&action, &mut ex, "boom", None).await.unwrap_err();
        match err {
            StepError::Panicked { step, message } => {
                assert_eq!(step, "boom");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_times_out_and_cancels_the_action() {
        let step = Step::new("slow", |ex| {
            Box::pin(async move {
                ex.cancellation().cancelled().await;
                Err("interrupted".into())
            })
        });
        let action = step.action.clone();
        let mut ex = execution(step);

        let err = invoke(&action, &mut ex, "slow", Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::TimedOut { timeout, .. } if timeout == Duration::from_secs(1)));
        assert!(ex.cancellation().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_keeps_late_success() {
        let step = Step::new("late", |ex| {
            Box::pin(async move {
                ex.cancellation().cancelled().await;
                ex.set("done", true);
                Ok(())
            })
        });
        let action = step.action.clone();
        let mut ex = execution(step);

        invoke(&action, &mut ex, "late", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(ex.get("done"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn panic_message_handles_payload_types() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }

    #[test]
    fn compensation_targets() {
        assert!(needs_compensation(Status::Completed));
        assert!(needs_compensation(Status::Compensating));
        assert!(!needs_compensation(Status::Failed));
        assert!(!needs_compensation(Status::CompensateSuccess));
        assert!(!needs_compensation(Status::Pending));
    }
}
