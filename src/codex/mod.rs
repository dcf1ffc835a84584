//! The codex language and its executor.
//!
//! Codex source is compiled once at install time into a [`CodexProgram`];
//! running it needs a [`CodexHost`] that supplies every capability the
//! script can reach.

pub mod ast;
pub(crate) mod builtins;
mod interpreter;
pub mod lexer;
pub mod parser;
pub mod scope;

pub use ast::CodexProgram;
pub use parser::{DEFAULT_MAX_NESTING, compile, compile_with_limit};
pub use scope::{CodexHost, ScopedStore};

use crate::access::{Action, Caller};
use crate::core::{Entity, KernelError, Result, Value};
use crate::hooks::Codex;
use crate::storage::EntityStore;
use interpreter::Interpreter;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{Level, event, info_span};

/// Resource limits for one codex run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionBudget {
    pub max_steps: u64,
    pub max_duration_ms: u64,
    pub max_string_len: usize,
    pub max_collection_len: usize,
    /// Applied when compiling.
    pub max_nesting: usize,
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_duration_ms: 250,
            max_string_len: 65_536,
            max_collection_len: 4_096,
            max_nesting: DEFAULT_MAX_NESTING,
        }
    }
}

impl ExecutionBudget {
    pub fn max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn max_duration_ms(mut self, max_duration_ms: u64) -> Self {
        self.max_duration_ms = max_duration_ms;
        self
    }

    pub fn max_string_len(mut self, max_string_len: usize) -> Self {
        self.max_string_len = max_string_len;
        self
    }

    pub fn max_collection_len(mut self, max_collection_len: usize) -> Self {
        self.max_collection_len = max_collection_len;
        self
    }

    pub fn max_nesting(mut self, max_nesting: usize) -> Self {
        self.max_nesting = max_nesting;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodexOutput {
    /// The returned value, else the emitted list, else null.
    pub value: Value,
    pub emitted: Vec<Value>,
    pub steps: u64,
}

/// What a codex sees as `entity`: the attributes plus the reserved
/// `id`, `kind`, `owner` and `relations` fields.
pub(crate) fn entity_value(entity: &Entity) -> Value {
    let mut view = entity.attributes.clone();
    let relations: Map<String, Value> = entity
        .relations
        .iter()
        .map(|(name, targets)| {
            (
                name.clone(),
                Value::Array(targets.iter().cloned().map(Value::String).collect()),
            )
        })
        .collect();
    view.insert("id".to_string(), Value::String(entity.id.clone()));
    view.insert("kind".to_string(), Value::String(entity.kind.clone()));
    view.insert(
        "owner".to_string(),
        entity.owner.clone().map(Value::String).unwrap_or(Value::Null),
    );
    view.insert("relations".to_string(), Value::Object(relations));
    Value::Object(view)
}

/// Runs codexes inside their budget. Owns no state beyond the budget.
#[derive(Debug, Clone, Default)]
pub struct CodexExecutor {
    budget: ExecutionBudget,
}

impl CodexExecutor {
    pub fn new(budget: ExecutionBudget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    /// Compiles source under this executor's nesting limit.
    pub fn compile(&self, source: &str) -> Result<CodexProgram> {
        compile_with_limit(source, self.budget.max_nesting)
    }

    /// Runs a codex against an arbitrary host.
    ///
    /// Every failure, including a panic inside the interpreter, comes back
    /// as `ExecutionError`.
    pub fn run(
        &self,
        codex: &Codex,
        entity: Option<&Entity>,
        args: &Value,
        host: &mut dyn CodexHost,
    ) -> Result<CodexOutput> {
        if !codex.is_active() {
            return Err(KernelError::ExecutionError(format!(
                "codex '{}' is disabled",
                codex.id
            )));
        }

        let span = info_span!("codex_run", codex_id = %codex.id);
        let _enter = span.enter();

        let entity = entity.map(entity_value).unwrap_or(Value::Null);
        let program = &codex.program;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            Interpreter::new(&codex.id, host, &self.budget, entity, args.clone()).run(program)
        }));

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(KernelError::ExecutionError(format!(
                "codex '{}' panicked",
                codex.id
            ))),
        };

        match &result {
            Ok(output) => event!(Level::DEBUG, steps = output.steps, "codex finished"),
            Err(err) => event!(Level::DEBUG, error = %err, "codex failed"),
        }
        result
    }

    /// Runs a codex against the store on behalf of `caller`.
    ///
    /// The caller must be allowed `action` on the bound entity. Writes are
    /// all-or-nothing: a failed run leaves the store as it found it.
    pub fn run_in_store(
        &self,
        store: &mut EntityStore,
        caller: &Caller,
        action: Action,
        codex: &Codex,
        entity: Option<&Entity>,
        args: &Value,
    ) -> Result<CodexOutput> {
        if let Some(entity) = entity {
            store.guard().check(caller, entity, action)?;
        }

        let checkpoint = store.checkpoint();
        let result = {
            let mut scope = ScopedStore::new(store, caller, codex.permissions.clone());
            self.run(codex, entity, args, &mut scope)
        };
        if result.is_err() {
            store.restore(checkpoint);
        }
        result
    }
}
