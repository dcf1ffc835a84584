//! The kernel facade: one handle wiring the store, access guard, hook
//! registry, codex executor and scheduler together.
//!
//! Every entity mutation made through [`Kernel`] goes through the same
//! pipeline: authorize, run the `pre` hook, mutate, run the `post` hook.
//! Hooks are best-effort unless their binding is mandatory.

pub mod journal;

pub use journal::{HookExecution, HookJournal};

use crate::access::{Action, Caller, SYSTEM_CALLER_ID};
use crate::codex::{CodexExecutor, ScopedStore};
use crate::config::KernelConfig;
use crate::core::{
    Attributes, Clock, Entity, EntityRef, ExecutionOutcome, IdAllocator, KernelError, KindRegistry,
    Result, Value,
};
use crate::hooks::{
    CodexPermission, CodexStatus, DefaultHookHandler, HookEvent, HookManifest, HookPhase,
    HookRegistry, HookResolution, InstallReport, hook_name, validate_hook_name,
};
use crate::scheduler::{
    Execution, PayloadRef, Task, TaskPage, TaskScheduler, TaskSpec, TickReport,
};
use crate::storage::store::validate_relation_name;
use crate::storage::{EntityStore, Filter, SnapshotFormat, SnapshotManager, StoreCheckpoint};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// The mutation a hook point belongs to.
struct HookCall<'a> {
    caller: &'a Caller,
    action: Action,
    kind: &'a str,
    event: HookEvent,
}

pub struct Kernel {
    store: EntityStore,
    hooks: HookRegistry,
    executor: CodexExecutor,
    scheduler: TaskScheduler,
    journal: HookJournal,
    config: KernelConfig,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let store = EntityStore::new(Arc::new(config.kinds.clone()));
        Self {
            store,
            hooks: HookRegistry::new().with_max_nesting(config.budget.max_nesting),
            executor: CodexExecutor::new(config.budget.clone()),
            scheduler: TaskScheduler::new(config.retry.clone()),
            journal: HookJournal::new(config.hook_journal_capacity),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.store = self.store.with_clock(clock);
        self
    }

    pub fn with_id_allocator(mut self, ids: Box<dyn IdAllocator>) -> Self {
        self.store = self.store.with_id_allocator(ids);
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hook_journal(&self) -> &HookJournal {
        &self.journal
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.store.clock().now()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Creates an entity owned by `caller` (system-owned for the system
    /// caller), running the `{kind}_register_*` hooks around it.
    pub fn create(&mut self, caller: &Caller, kind: &str, attributes: Attributes) -> Result<EntityRef> {
        if KindRegistry::is_reserved(kind) {
            return Err(KernelError::InvalidArgument(format!(
                "kind '{}' is managed by the scheduler",
                kind
            )));
        }
        self.store.guard().kinds().validate(kind)?;
        self.store.guard().check_create(caller, kind)?;

        let span = info_span!("entity_create", kind = %kind, caller = %caller.id());
        let _enter = span.enter();

        let call = HookCall { caller, action: Action::Create, kind, event: HookEvent::Register };
        let checkpoint = self.store.checkpoint();
        let args = json!({ "attributes": Value::Object(attributes.clone()) });
        self.dispatch(&call, HookPhase::Pre, None, &args, &checkpoint)?;

        let created = self
            .store
            .create(kind, attributes, owner_of(caller))
            .and_then(|id| self.store.get(&id));
        let entity = self.restore_on_err(&checkpoint, created)?;
        self.dispatch(&call, HookPhase::Post, Some(&entity), &json!({}), &checkpoint)?;

        event!(Level::INFO, entity_id = %entity.id, "entity created");
        Ok(entity.id)
    }

    pub fn get(&self, caller: &Caller, id: &str) -> Result<Entity> {
        self.store.get_as(id, caller)
    }

    /// Shallow JSON rendering of an entity the caller may read.
    pub fn to_dict(&self, caller: &Caller, id: &str) -> Result<Value> {
        Ok(self.store.get_as(id, caller)?.to_dict())
    }

    pub fn update(&mut self, caller: &Caller, id: &str, patch: Attributes) -> Result<Entity> {
        let entity = self.writable(caller, id, Action::Update)?;

        let span = info_span!("entity_update", entity_id = %id, caller = %caller.id());
        let _enter = span.enter();

        let call = HookCall { caller, action: Action::Update, kind: &entity.kind, event: HookEvent::Update };
        let checkpoint = self.store.checkpoint();
        let args = json!({ "patch": Value::Object(patch.clone()) });
        self.dispatch(&call, HookPhase::Pre, Some(&entity), &args, &checkpoint)?;

        let updated = self.store.update(id, &patch, caller);
        let updated = self.restore_on_err(&checkpoint, updated)?;
        self.dispatch(&call, HookPhase::Post, Some(&updated), &args, &checkpoint)?;
        Ok(updated)
    }

    /// Returns the deleted entity. Its `post` hook sees that final snapshot.
    pub fn delete(&mut self, caller: &Caller, id: &str) -> Result<Entity> {
        let entity = self.writable(caller, id, Action::Delete)?;

        let span = info_span!("entity_delete", entity_id = %id, caller = %caller.id());
        let _enter = span.enter();

        let call = HookCall { caller, action: Action::Delete, kind: &entity.kind, event: HookEvent::Delete };
        let checkpoint = self.store.checkpoint();
        self.dispatch(&call, HookPhase::Pre, Some(&entity), &json!({}), &checkpoint)?;

        let deleted = self.store.delete(id, caller);
        let deleted = self.restore_on_err(&checkpoint, deleted)?;
        self.dispatch(&call, HookPhase::Post, Some(&deleted), &json!({}), &checkpoint)?;

        event!(Level::INFO, entity_id = %id, "entity deleted");
        Ok(deleted)
    }

    /// Hooks only run when the edge set actually changes.
    pub fn link(&mut self, caller: &Caller, id: &str, relation: &str, target: &str) -> Result<bool> {
        validate_relation_name(relation)?;
        let entity = self.writable(caller, id, Action::Link)?;
        if entity.is_linked(relation, target) {
            return Ok(false);
        }
        if !self.store.contains(target) {
            return Err(KernelError::InvariantViolation(format!(
                "relation target '{}' of {}.{} does not exist",
                target, id, relation
            )));
        }

        let span = info_span!("entity_link", entity_id = %id, relation = %relation, target = %target);
        let _enter = span.enter();

        let call = HookCall { caller, action: Action::Link, kind: &entity.kind, event: HookEvent::Link };
        let checkpoint = self.store.checkpoint();
        let args = json!({ "relation": relation, "target": target });
        self.dispatch(&call, HookPhase::Pre, Some(&entity), &args, &checkpoint)?;

        let linked = self
            .store
            .link(id, relation, target, caller)
            .and_then(|changed| Ok((changed, self.store.get(id)?)));
        let (changed, linked) = self.restore_on_err(&checkpoint, linked)?;
        self.dispatch(&call, HookPhase::Post, Some(&linked), &args, &checkpoint)?;
        Ok(changed)
    }

    pub fn unlink(&mut self, caller: &Caller, id: &str, relation: &str, target: &str) -> Result<bool> {
        validate_relation_name(relation)?;
        let entity = self.writable(caller, id, Action::Link)?;
        if !entity.is_linked(relation, target) {
            return Ok(false);
        }

        let span = info_span!("entity_unlink", entity_id = %id, relation = %relation, target = %target);
        let _enter = span.enter();

        let call = HookCall { caller, action: Action::Link, kind: &entity.kind, event: HookEvent::Unlink };
        let checkpoint = self.store.checkpoint();
        let args = json!({ "relation": relation, "target": target });
        self.dispatch(&call, HookPhase::Pre, Some(&entity), &args, &checkpoint)?;

        let unlinked = self
            .store
            .unlink(id, relation, target, caller)
            .and_then(|changed| Ok((changed, self.store.get(id)?)));
        let (changed, unlinked) = self.restore_on_err(&checkpoint, unlinked)?;
        self.dispatch(&call, HookPhase::Post, Some(&unlinked), &args, &checkpoint)?;
        Ok(changed)
    }

    /// Lazy scan over the entities of `kind` the caller may read.
    pub fn query<'a>(
        &'a self,
        caller: &'a Caller,
        kind: &str,
        filter: Filter,
    ) -> impl Iterator<Item = Entity> + 'a {
        let guard = self.store.guard();
        self.store
            .query(kind, filter)
            .filter(move |entity| guard.authorize(caller, entity, Action::Read).is_allowed())
    }

    /// Readable targets of one of the entity's relations.
    pub fn related(&self, caller: &Caller, id: &str, relation: &str) -> Result<Vec<Entity>> {
        self.store.get_as(id, caller)?;
        let guard = self.store.guard();
        Ok(self
            .store
            .related(id, relation)?
            .into_iter()
            .filter(|entity| guard.authorize(caller, entity, Action::Read).is_allowed())
            .collect())
    }

    /// Runs a hook point on demand, under `Execute`. Unlike lifecycle hooks,
    /// every failure is returned to the caller.
    pub fn invoke_hook(&mut self, caller: &Caller, id: &str, hook_name: &str, args: Value) -> Result<Value> {
        let entity = self.store.get(id)?;
        validate_hook_name(&entity.kind, hook_name)?;
        self.store.guard().check(caller, &entity, Action::Execute)?;

        let span = info_span!("hook_invoke", entity_id = %id, hook = %hook_name, caller = %caller.id());
        let _enter = span.enter();

        match self.hooks.resolve(&entity.kind, hook_name) {
            HookResolution::Default(None) => Err(KernelError::NotFound(format!(
                "hook '{}' for kind '{}'",
                hook_name, entity.kind
            ))),
            HookResolution::Default(Some(handler)) => {
                let checkpoint = self.store.checkpoint();
                let result = self.run_default(&handler, caller, hook_name, Some(&entity), &args);
                if result.is_err() {
                    self.store.restore(checkpoint);
                }
                result
            }
            HookResolution::Codex(codex_ref) => {
                let result = self.executor.run_in_store(
                    &mut self.store,
                    caller,
                    Action::Execute,
                    &codex_ref.codex,
                    Some(&entity),
                    &args,
                );
                self.journal_run(
                    caller,
                    &entity.kind,
                    hook_name,
                    Some(entity.id.as_str()),
                    codex_ref.mandatory,
                    &codex_ref.codex.id,
                    &result,
                );
                result.map(|output| output.value)
            }
        }
    }

    /// Hook executions recorded for an entity, most recent first.
    ///
    /// Records of a deleted entity are visible to admins only.
    pub fn hook_logs(&self, caller: &Caller, entity_id: &str, limit: usize) -> Result<Vec<HookExecution>> {
        if self.store.contains(entity_id) {
            self.store.get_as(entity_id, caller)?;
        } else if !caller.is_admin() {
            return Err(KernelError::NotFound(format!("entity '{}'", entity_id)));
        }
        Ok(self.journal.for_entity(entity_id, self.log_limit(limit)))
    }

    /// Loads store access for a mutation of an entity that is not a
    /// scheduler record.
    fn writable(&self, caller: &Caller, id: &str, action: Action) -> Result<Entity> {
        let entity = self.store.get(id)?;
        self.store.guard().check(caller, &entity, action)?;
        if KindRegistry::is_reserved(&entity.kind) {
            return Err(KernelError::Denied(format!(
                "{} '{}' is managed by the scheduler",
                entity.kind, id
            )));
        }
        Ok(entity)
    }

    /// Undoes the prehook's writes when the mutation itself fails.
    fn restore_on_err<T>(&mut self, checkpoint: &StoreCheckpoint, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.store.restore(checkpoint.clone());
            event!(Level::WARN, error = %err, "mutation failed, prehook writes rolled back");
        }
        result
    }

    // ------------------------------------------------------------------
    // Hook dispatch
    // ------------------------------------------------------------------

    fn dispatch(
        &mut self,
        call: &HookCall<'_>,
        phase: HookPhase,
        entity: Option<&Entity>,
        args: &Value,
        checkpoint: &StoreCheckpoint,
    ) -> Result<()> {
        let name = hook_name(call.kind, call.event, phase);
        match self.hooks.resolve(call.kind, &name) {
            HookResolution::Default(None) => Ok(()),
            HookResolution::Default(Some(handler)) => {
                let result = self.run_default(&handler, call.caller, &name, entity, args);
                if let Err(err) = result {
                    self.store.restore(checkpoint.clone());
                    event!(Level::WARN, hook = %name, error = %err, "default hook failed, mutation rolled back");
                    return Err(err);
                }
                Ok(())
            }
            HookResolution::Codex(codex_ref) => {
                let result = self.executor.run_in_store(
                    &mut self.store,
                    call.caller,
                    call.action,
                    &codex_ref.codex,
                    entity,
                    args,
                );
                let entity_id = entity.map(|entity| entity.id.as_str());
                self.journal_run(
                    call.caller,
                    call.kind,
                    &name,
                    entity_id,
                    codex_ref.mandatory,
                    &codex_ref.codex.id,
                    &result,
                );

                match result {
                    Ok(_) => Ok(()),
                    Err(err) if codex_ref.mandatory => {
                        self.store.restore(checkpoint.clone());
                        event!(
                            Level::WARN,
                            hook = %name,
                            codex_id = %codex_ref.codex.id,
                            error = %err,
                            "mandatory hook failed, mutation rolled back"
                        );
                        Err(err)
                    }
                    Err(err) => {
                        event!(
                            Level::WARN,
                            hook = %name,
                            codex_id = %codex_ref.codex.id,
                            error = %err,
                            "hook failed"
                        );
                        Ok(())
                    }
                }
            }
        }
    }

    /// Built-in handlers get every store capability, still bounded by the
    /// access guard for the caller.
    fn run_default(
        &mut self,
        handler: &DefaultHookHandler,
        caller: &Caller,
        hook: &str,
        entity: Option<&Entity>,
        args: &Value,
    ) -> Result<Value> {
        let mut scope = ScopedStore::new(&mut self.store, caller, CodexPermission::all());
        catch_unwind(AssertUnwindSafe(|| handler(&mut scope, entity, args))).unwrap_or_else(|_| {
            Err(KernelError::ExecutionError(format!(
                "default handler for '{}' panicked",
                hook
            )))
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn journal_run(
        &mut self,
        caller: &Caller,
        kind: &str,
        hook: &str,
        entity_id: Option<&str>,
        mandatory: bool,
        codex_id: &str,
        result: &Result<crate::codex::CodexOutput>,
    ) {
        let (outcome, output, error_message) = match result {
            Ok(output) => (ExecutionOutcome::Success, Some(output.value.clone()), None),
            Err(err) => (ExecutionOutcome::Failure, None, Some(err.to_string())),
        };
        self.journal.record(HookExecution {
            sequence: 0,
            timestamp: self.store.clock().now(),
            codex_id: codex_id.to_string(),
            entity_kind: kind.to_string(),
            hook_name: hook.to_string(),
            entity_id: entity_id.map(str::to_string),
            caller: caller.id().to_string(),
            mandatory,
            outcome,
            output,
            error_message,
        });
    }

    // ------------------------------------------------------------------
    // Hook administration
    // ------------------------------------------------------------------

    pub fn install_manifest(&mut self, manifest: HookManifest) -> Result<InstallReport> {
        self.hooks.install(manifest)
    }

    pub fn install_manifest_json(&mut self, json: &str) -> Result<InstallReport> {
        self.hooks.install(HookManifest::from_json_str(json)?)
    }

    pub fn register_default_hook(
        &mut self,
        entity_kind: &str,
        hook_name: &str,
        handler: DefaultHookHandler,
    ) -> Result<()> {
        self.hooks.register_default(entity_kind, hook_name, handler)
    }

    pub fn set_codex_status(&mut self, codex_id: &str, status: CodexStatus) -> Result<()> {
        self.hooks.set_status(codex_id, status)
    }

    pub fn unbind_hook(&mut self, entity_kind: &str, hook_name: &str) -> bool {
        self.hooks.unbind(entity_kind, hook_name).is_some()
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    pub fn schedule(
        &mut self,
        caller: &Caller,
        payload: PayloadRef,
        interval_seconds: u64,
        delay_seconds: u64,
    ) -> Result<EntityRef> {
        self.scheduler.schedule(
            &mut self.store,
            &self.hooks,
            &self.executor,
            caller,
            payload,
            interval_seconds,
            delay_seconds,
        )
    }

    pub fn schedule_spec(&mut self, caller: &Caller, spec: TaskSpec) -> Result<EntityRef> {
        self.scheduler
            .schedule_spec(&mut self.store, &self.hooks, &self.executor, caller, spec)
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        self.scheduler
            .tick(&mut self.store, &self.hooks, &self.executor, now)
    }

    /// Ticks at the store clock's current time.
    pub fn tick_now(&mut self) -> Result<TickReport> {
        let now = self.now();
        self.tick(now)
    }

    /// A `page_size` of 0 uses the configured default; larger sizes are
    /// capped at the configured maximum.
    pub fn list_tasks(&self, caller: &Caller, page_num: usize, page_size: usize) -> Result<TaskPage> {
        let page_size = if page_size == 0 {
            self.config.default_page_size
        } else {
            page_size.min(self.config.max_page_size)
        };
        self.scheduler.list(&self.store, caller, page_num, page_size)
    }

    pub fn get_task(&self, caller: &Caller, id_or_prefix: &str) -> Result<Task> {
        self.scheduler.get_task(&self.store, caller, id_or_prefix)
    }

    pub fn stop_task(&mut self, caller: &Caller, id_or_prefix: &str) -> Result<Task> {
        self.scheduler.stop(&mut self.store, caller, id_or_prefix)
    }

    /// A `limit` of 0 uses the configured default.
    pub fn task_logs(&self, caller: &Caller, id_or_prefix: &str, limit: usize) -> Result<Vec<Execution>> {
        self.scheduler
            .logs(&self.store, caller, id_or_prefix, self.log_limit(limit))
    }

    fn log_limit(&self, limit: usize) -> usize {
        if limit == 0 { self.config.default_log_limit } else { limit }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Writes the store atomically. Codexes are not included.
    pub fn save_snapshot(&self, path: impl AsRef<Path>, format: SnapshotFormat) -> Result<()> {
        let snapshot = self.store.snapshot();
        SnapshotManager::new(path, format).save(&snapshot)?;
        event!(Level::INFO, entities = snapshot.entities.len(), "snapshot saved");
        Ok(())
    }

    /// Replaces the store with a saved snapshot. Returns `false` when no
    /// snapshot file exists. Tasks caught mid-run are rescheduled.
    pub fn load_snapshot(&mut self, path: impl AsRef<Path>, format: SnapshotFormat) -> Result<bool> {
        let Some(snapshot) = SnapshotManager::new(path, format).load()? else {
            return Ok(false);
        };
        let entities = snapshot.entities.len();
        self.store.load_snapshot(snapshot)?;
        let reset = self.scheduler.reset_running(&mut self.store)?;
        event!(Level::INFO, entities, reset_tasks = reset, "snapshot loaded");
        Ok(true)
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

fn owner_of(caller: &Caller) -> Option<&str> {
    (caller.id() != SYSTEM_CALLER_ID).then(|| caller.id())
}
