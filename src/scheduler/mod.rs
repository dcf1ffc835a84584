//! Tick-driven task scheduler.
//!
//! Tasks and their execution records are entities in the store. The
//! scheduler itself holds only policy; each `tick(now)` scans due tasks and
//! runs them one at a time through the codex executor.

pub mod driver;
pub mod policy;
pub mod task;

pub use driver::{TickDriver, spawn_tick_driver};
pub use policy::RetryPolicy;
pub use task::{
    EXECUTIONS_RELATION, Execution, PayloadRef, Task, TaskPage, TaskRun, TaskSpec, TaskStatus,
    TaskSummary, TickReport,
};

use crate::access::{Action, Caller, SYSTEM_CALLER_ID};
use crate::codex::{CodexExecutor, CodexOutput};
use crate::core::kinds::{TASK_EXECUTION_KIND, TASK_KIND};
use crate::core::{Entity, EntityRef, ExecutionOutcome, KernelError, Result};
use crate::hooks::{Codex, HookRegistry};
use crate::storage::{EntityStore, Filter};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{Level, event, info_span};

#[derive(Debug, Clone, Default)]
pub struct TaskScheduler {
    retry: RetryPolicy,
}

impl TaskScheduler {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// `next_run_at = now + delay_seconds`.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule(
        &self,
        store: &mut EntityStore,
        hooks: &HookRegistry,
        executor: &CodexExecutor,
        caller: &Caller,
        payload: PayloadRef,
        interval_seconds: u64,
        delay_seconds: u64,
    ) -> Result<EntityRef> {
        let spec = TaskSpec::new(payload)
            .interval_seconds(interval_seconds)
            .delay_seconds(delay_seconds);
        self.schedule_spec(store, hooks, executor, caller, spec)
    }

    pub fn schedule_spec(
        &self,
        store: &mut EntityStore,
        hooks: &HookRegistry,
        executor: &CodexExecutor,
        caller: &Caller,
        spec: TaskSpec,
    ) -> Result<EntityRef> {
        let name = match &spec.payload {
            PayloadRef::Codex { codex_id } => {
                hooks.codex(codex_id)?;
                spec.name.clone().unwrap_or_else(|| codex_id.clone())
            }
            PayloadRef::Script { source, .. } => {
                executor.compile(source)?;
                spec.name.clone().unwrap_or_else(|| "script".to_string())
            }
        };
        // Every run is authorized under `Execute` on the target.
        if let Some(target) = &spec.target {
            let entity = store.get(target)?;
            store.guard().check(caller, &entity, Action::Execute)?;
        }

        let now = store.clock().now();
        offset(now, spec.interval_seconds)?;
        let task = Task {
            id: EntityRef::new(),
            name,
            interval_seconds: spec.interval_seconds,
            delay_seconds: spec.delay_seconds,
            status: TaskStatus::Scheduled,
            next_run_at: offset(now, spec.delay_seconds)?,
            last_run_at: None,
            payload: spec.payload,
            target: spec.target,
            args: spec.args,
            run_as: caller.clone(),
            consecutive_failures: 0,
            execution_count: 0,
        };

        let id = store.create(TASK_KIND, task.to_attributes()?, owner_of(caller))?;
        event!(
            Level::INFO,
            task_id = %id,
            name = %task.name,
            interval_seconds = task.interval_seconds,
            next_run_at = %task.next_run_at,
            "task scheduled"
        );
        Ok(id)
    }

    /// Runs every scheduled task with `next_run_at <= now`, oldest first.
    ///
    /// A failing task is recorded and rescheduled; it never stops the tick.
    /// A run that cannot be recorded takes its task out of rotation as
    /// `failed`.
    pub fn tick(
        &self,
        store: &mut EntityStore,
        hooks: &HookRegistry,
        executor: &CodexExecutor,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let span = info_span!("scheduler_tick", now = %now);
        let _enter = span.enter();

        let mut due: Vec<Task> = Vec::new();
        for entity in store.query(TASK_KIND, Filter::eq("status", TaskStatus::Scheduled.as_str())) {
            match Task::from_entity(&entity) {
                Ok(task) if task.next_run_at <= now => due.push(task),
                Ok(_) => {}
                Err(err) => event!(Level::ERROR, task_id = %entity.id, error = %err, "skipping malformed task"),
            }
        }
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then_with(|| a.id.cmp(&b.id)));

        let mut runs = Vec::with_capacity(due.len());
        for candidate in due {
            match self.run_due(store, hooks, executor, &candidate.id, now) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(err) => {
                    event!(Level::ERROR, task_id = %candidate.id, error = %err, "task run could not be recorded");
                    runs.extend(abandon(store, &candidate.id, now));
                }
            }
        }

        if !runs.is_empty() {
            event!(Level::DEBUG, executed = runs.len(), "tick finished");
        }
        Ok(TickReport { now, runs })
    }

    fn run_due(
        &self,
        store: &mut EntityStore,
        hooks: &HookRegistry,
        executor: &CodexExecutor,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskRun>> {
        // An earlier run in this tick may have changed it.
        let mut task = Task::from_entity(&store.get(id)?)?;
        if task.status != TaskStatus::Scheduled {
            return Ok(None);
        }

        task.status = TaskStatus::Running;
        write_task(store, &task)?;

        let result = self.run_payload(store, hooks, executor, &task);
        self.finish_run(store, task, result, now).map(Some)
    }

    fn run_payload(
        &self,
        store: &mut EntityStore,
        hooks: &HookRegistry,
        executor: &CodexExecutor,
        task: &Task,
    ) -> Result<CodexOutput> {
        let codex: Arc<Codex> = match &task.payload {
            PayloadRef::Codex { codex_id } => hooks.codex(codex_id)?,
            PayloadRef::Script { source, permissions } => Arc::new(Codex::compile_with_limit(
                format!("task:{}", task.id),
                source.clone(),
                permissions.clone(),
                executor.budget().max_nesting,
            )?),
        };
        let entity = match &task.target {
            Some(target) => Some(store.get(target)?),
            None => None,
        };
        executor.run_in_store(
            store,
            &task.run_as,
            Action::Execute,
            &codex,
            entity.as_ref(),
            &task.args,
        )
    }

    /// Appends the execution record and moves the task to its next state.
    fn finish_run(
        &self,
        store: &mut EntityStore,
        mut task: Task,
        result: Result<CodexOutput>,
        now: DateTime<Utc>,
    ) -> Result<TaskRun> {
        let sequence = task.execution_count + 1;
        let execution = match &result {
            Ok(output) => Execution {
                id: EntityRef::new(),
                task_id: task.id.clone(),
                sequence,
                timestamp: now,
                outcome: ExecutionOutcome::Success,
                output: Some(output.value.clone()),
                error_message: None,
                steps: output.steps,
            },
            Err(err) => Execution {
                id: EntityRef::new(),
                task_id: task.id.clone(),
                sequence,
                timestamp: now,
                outcome: ExecutionOutcome::Failure,
                output: None,
                error_message: Some(err.to_string()),
                steps: 0,
            },
        };

        let system = Caller::system();
        let owner = task.run_as.id().to_string();
        let execution_id = store.create(
            TASK_EXECUTION_KIND,
            execution.to_attributes()?,
            (owner != SYSTEM_CALLER_ID).then_some(owner.as_str()),
        )?;
        store.link(&task.id, EXECUTIONS_RELATION, &execution_id, &system)?;

        // Stop may have landed while the payload ran.
        let cancelled = store
            .get(&task.id)
            .and_then(|entity| Task::from_entity(&entity))
            .map(|current| current.status == TaskStatus::Cancelled)
            .unwrap_or(false);

        task.execution_count = sequence;
        task.last_run_at = Some(now);
        match &result {
            Ok(_) => {
                task.consecutive_failures = 0;
                if task.is_one_shot() {
                    task.status = TaskStatus::Completed;
                } else {
                    task.status = TaskStatus::Scheduled;
                    task.next_run_at = offset(now, task.interval_seconds)?;
                }
            }
            Err(err) => {
                task.consecutive_failures = task.consecutive_failures.saturating_add(1);
                event!(
                    Level::WARN,
                    task_id = %task.id,
                    sequence,
                    consecutive_failures = task.consecutive_failures,
                    error = %err,
                    "task run failed"
                );
                let retry_in = match self.retry.retry_delay_seconds {
                    Some(delay) => Some(delay),
                    None if task.is_one_shot() => None,
                    None => Some(task.interval_seconds),
                };
                match retry_in {
                    Some(seconds) if !self.retry.is_exhausted(task.consecutive_failures) => {
                        task.status = TaskStatus::Scheduled;
                        task.next_run_at = offset(now, seconds)?;
                    }
                    _ => task.status = TaskStatus::Failed,
                }
            }
        }
        if cancelled {
            task.status = TaskStatus::Cancelled;
        }
        write_task(store, &task)?;

        Ok(TaskRun {
            task_id: task.id,
            sequence,
            outcome: execution.outcome,
            status_after: task.status,
        })
    }

    pub fn get_task(&self, store: &EntityStore, caller: &Caller, id_or_prefix: &str) -> Result<Task> {
        let id = resolve_task_id(store, caller, id_or_prefix)?;
        let entity = store.get_as(&id, caller)?;
        Task::from_entity(&entity)
    }

    /// Tasks the caller may read, oldest first. `page_num` is 1-based; 0 is
    /// read as 1.
    pub fn list(
        &self,
        store: &EntityStore,
        caller: &Caller,
        page_num: usize,
        page_size: usize,
    ) -> Result<TaskPage> {
        if page_size == 0 {
            return Err(KernelError::InvalidArgument(
                "page_size must be at least 1".to_string(),
            ));
        }
        let page_num = page_num.max(1);

        let guard = store.guard();
        let mut visible: Vec<_> = store
            .query(TASK_KIND, Filter::All)
            .filter(|entity| guard.authorize(caller, entity, Action::Read).is_allowed())
            .collect();
        visible.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let total = visible.len();
        let tasks = visible
            .iter()
            .skip((page_num - 1).saturating_mul(page_size))
            .take(page_size)
            .map(|entity| Task::from_entity(entity).map(|task| task.summary()))
            .collect::<Result<Vec<_>>>()?;

        Ok(TaskPage {
            tasks,
            page_num,
            page_size,
            total,
            total_pages: total.div_ceil(page_size),
        })
    }

    /// Cancels a task. A task that already finished keeps its status.
    pub fn stop(&self, store: &mut EntityStore, caller: &Caller, id_or_prefix: &str) -> Result<Task> {
        let id = resolve_task_id(store, caller, id_or_prefix)?;
        let entity = store.get(&id)?;
        store.guard().check(caller, &entity, Action::Update)?;

        let mut task = Task::from_entity(&entity)?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        task.status = TaskStatus::Cancelled;
        write_task(store, &task)?;
        event!(Level::INFO, task_id = %id, caller = %caller.id(), "task cancelled");
        Ok(task)
    }

    /// Most recent first, at most `limit`.
    pub fn logs(
        &self,
        store: &EntityStore,
        caller: &Caller,
        id_or_prefix: &str,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let id = resolve_task_id(store, caller, id_or_prefix)?;
        store.get_as(&id, caller)?;

        let mut executions = store
            .related(&id, EXECUTIONS_RELATION)?
            .iter()
            .map(Execution::from_entity)
            .collect::<Result<Vec<_>>>()?;
        executions.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        executions.truncate(limit);
        Ok(executions)
    }

    /// Returns tasks left `running` (e.g. by a snapshot taken mid-run) to
    /// `scheduled`.
    pub fn reset_running(&self, store: &mut EntityStore) -> Result<usize> {
        let stuck: Vec<Task> = store
            .query(TASK_KIND, Filter::eq("status", TaskStatus::Running.as_str()))
            .map(|entity| Task::from_entity(&entity))
            .collect::<Result<_>>()?;
        for mut task in stuck.iter().cloned() {
            task.status = TaskStatus::Scheduled;
            write_task(store, &task)?;
        }
        if !stuck.is_empty() {
            event!(Level::WARN, tasks = stuck.len(), "reset tasks left running");
        }
        Ok(stuck.len())
    }
}

/// Exact id first, then a unique prefix. Only tasks the caller may read
/// take part, so a prefix means the same thing as in the caller's `list`.
pub fn resolve_task_id(store: &EntityStore, caller: &Caller, id_or_prefix: &str) -> Result<EntityRef> {
    if id_or_prefix.trim().is_empty() {
        return Err(KernelError::InvalidArgument(
            "task id or prefix must not be empty".to_string(),
        ));
    }
    let guard = store.guard();
    let readable = |entity: &Entity| guard.authorize(caller, entity, Action::Read).is_allowed();

    if let Ok(entity) = store.get(id_or_prefix)
        && entity.kind == TASK_KIND
        && readable(&entity)
    {
        return Ok(entity.id);
    }

    let mut matches: Vec<EntityRef> = store
        .query(TASK_KIND, Filter::All)
        .filter(|entity| entity.id.starts_with(id_or_prefix) && readable(entity))
        .map(|entity| entity.id)
        .collect();
    match matches.len() {
        0 => Err(KernelError::NotFound(format!("task '{}'", id_or_prefix))),
        1 => Ok(matches.remove(0)),
        n => Err(KernelError::AmbiguousPrefix {
            prefix: id_or_prefix.to_string(),
            matches: n,
        }),
    }
}

/// Marks a task whose run broke down `failed` so it neither stays `running`
/// nor comes due again. A task stopped in the meantime keeps its status.
fn abandon(store: &mut EntityStore, id: &str, now: DateTime<Utc>) -> Option<TaskRun> {
    let mut task = store.get(id).and_then(|entity| Task::from_entity(&entity)).ok()?;
    if task.status.is_terminal() {
        return None;
    }
    task.status = TaskStatus::Failed;
    task.last_run_at = Some(now);
    if let Err(err) = write_task(store, &task) {
        event!(Level::ERROR, task_id = %id, error = %err, "could not mark task failed");
        return None;
    }
    Some(TaskRun {
        task_id: task.id,
        sequence: task.execution_count,
        outcome: ExecutionOutcome::Failure,
        status_after: TaskStatus::Failed,
    })
}

fn write_task(store: &mut EntityStore, task: &Task) -> Result<()> {
    store.update(&task.id, &task.to_attributes()?, &Caller::system())?;
    Ok(())
}

fn owner_of(caller: &Caller) -> Option<&str> {
    (caller.id() != SYSTEM_CALLER_ID).then(|| caller.id())
}

fn offset(now: DateTime<Utc>, seconds: u64) -> Result<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| KernelError::InvalidArgument(format!("{} seconds is out of range", seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Clock, KindRegistry, ManualClock};
    use chrono::TimeZone;
    use serde_json::json;

    struct Fixture {
        store: EntityStore,
        hooks: HookRegistry,
        executor: CodexExecutor,
        clock: ManualClock,
        scheduler: TaskScheduler,
    }

    fn fixture(retry: RetryPolicy) -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let store = EntityStore::new(Arc::new(KindRegistry::governance_defaults()))
            .with_clock(Arc::new(clock.clone()));
        Fixture {
            store,
            hooks: HookRegistry::new(),
            executor: CodexExecutor::default(),
            clock,
            scheduler: TaskScheduler::new(retry),
        }
    }

    impl Fixture {
        fn schedule(&mut self, spec: TaskSpec) -> EntityRef {
            self.scheduler
                .schedule_spec(&mut self.store, &self.hooks, &self.executor, &Caller::system(), spec)
                .unwrap()
        }

        fn tick(&mut self) -> TickReport {
            let now = self.clock.now();
            self.scheduler
                .tick(&mut self.store, &self.hooks, &self.executor, now)
                .unwrap()
        }

        fn task(&self, id: &str) -> Task {
            self.scheduler.get_task(&self.store, &Caller::system(), id).unwrap()
        }
    }

    #[test]
    fn test_failing_recurring_task_stays_scheduled() {
        let mut f = fixture(RetryPolicy::default());
        let id = f.schedule(TaskSpec::script("fail 'boom'").interval_seconds(30));

        let report = f.tick();
        assert_eq!(report.failures(), 1);
        let task = f.task(&id);
        assert_eq!(task.status, TaskStatus::Scheduled);
        assert_eq!(task.consecutive_failures, 1);
        assert_eq!(task.next_run_at, f.clock.now() + Duration::seconds(30));

        let logs = f.scheduler.logs(&f.store, &Caller::system(), &id, 10).unwrap();
        assert!(logs[0].error_message.as_deref().unwrap_or("").contains("boom"));
    }

    #[test]
    fn test_one_shot_completes_or_fails() {
        let mut f = fixture(RetryPolicy::default());
        let ok = f.schedule(TaskSpec::script("return 1"));
        let bad = f.schedule(TaskSpec::script("fail 'x'"));
        f.tick();
        assert_eq!(f.task(&ok).status, TaskStatus::Completed);
        assert_eq!(f.task(&bad).status, TaskStatus::Failed);
        assert_eq!(f.tick().executed(), 0);
    }

    #[test]
    fn test_retry_policy_limits_failures() {
        let mut f = fixture(RetryPolicy::default().max_consecutive_failures(2).retry_delay_seconds(5));
        let id = f.schedule(TaskSpec::script("fail 'x'").interval_seconds(60));

        f.tick();
        assert_eq!(f.task(&id).next_run_at, f.clock.now() + Duration::seconds(5));
        f.clock.advance_seconds(5);
        f.tick();
        assert_eq!(f.task(&id).status, TaskStatus::Failed);
    }

    #[test]
    fn test_stop_before_tick_prevents_run() {
        let mut f = fixture(RetryPolicy::default());
        let id = f.schedule(TaskSpec::script("return 1").interval_seconds(10));
        let stopped = f.scheduler.stop(&mut f.store, &Caller::system(), &id).unwrap();
        assert_eq!(stopped.status, TaskStatus::Cancelled);
        assert_eq!(f.tick().executed(), 0);
        // Stopping again is a no-op.
        assert_eq!(
            f.scheduler.stop(&mut f.store, &Caller::system(), &id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_missing_codex_rejected_at_schedule() {
        let mut f = fixture(RetryPolicy::default());
        let err = f
            .scheduler
            .schedule_spec(&mut f.store, &f.hooks, &f.executor, &Caller::system(), TaskSpec::codex("ghost"))
            .unwrap_err();
        assert!(err.is_not_found());
        let err = f
            .scheduler
            .schedule_spec(&mut f.store, &f.hooks, &f.executor, &Caller::system(), TaskSpec::script("emit ("))
            .unwrap_err();
        assert!(matches!(err, KernelError::ParseError(_)));
    }

    #[test]
    fn test_reset_running() {
        let mut f = fixture(RetryPolicy::default());
        let id = f.schedule(TaskSpec::script("return 1").args(json!({"a": 1})));
        let mut task = f.task(&id);
        task.status = TaskStatus::Running;
        write_task(&mut f.store, &task).unwrap();

        assert_eq!(f.scheduler.reset_running(&mut f.store).unwrap(), 1);
        assert_eq!(f.task(&id).status, TaskStatus::Scheduled);
    }

    #[test]
    fn test_unrecordable_run_does_not_stall_tick() {
        let mut f = fixture(RetryPolicy::default().retry_delay_seconds(u64::MAX));
        let bad = f.schedule(TaskSpec::script("fail 'x'").interval_seconds(60));
        let good = f.schedule(TaskSpec::script("return 1").interval_seconds(60));

        let report = f.tick();
        assert_eq!(report.executed(), 2);
        assert_eq!(f.task(&bad).status, TaskStatus::Failed);
        assert_eq!(f.task(&good).status, TaskStatus::Scheduled);
        assert_eq!(f.scheduler.logs(&f.store, &Caller::system(), &good, 10).unwrap().len(), 1);

        f.clock.advance_seconds(60);
        let report = f.tick();
        assert_eq!(report.executed(), 1);
        assert_eq!(report.runs[0].task_id, good);
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let f = fixture(RetryPolicy::default());
        assert!(matches!(
            resolve_task_id(&f.store, &Caller::system(), ""),
            Err(KernelError::InvalidArgument(_))
        ));
        assert!(resolve_task_id(&f.store, &Caller::system(), "zzz").unwrap_err().is_not_found());
    }
}
