// ============================================================================
// GGG Kernel Library
// ============================================================================

pub mod access;
pub mod codex;
pub mod config;
pub mod core;
pub mod hooks;
pub mod kernel;
pub mod prelude;
pub mod scheduler;
pub mod storage;

// Re-export main types for convenience
pub use access::{AccessDecision, AccessGuard, Action, Caller};
pub use codex::{CodexExecutor, CodexOutput, ExecutionBudget};
pub use config::KernelConfig;
pub use core::{
    Attributes, Clock, Entity, EntityRef, KernelError, KindRegistry, KindSpec, ManualClock, Result,
    SystemClock, Value,
};
pub use hooks::{CodexPermission, CodexSource, HookBinding, HookManifest, HookRegistry};
pub use kernel::{HookExecution, Kernel};
pub use scheduler::{PayloadRef, RetryPolicy, TaskScheduler, TaskSpec, TaskStatus, spawn_tick_driver};
pub use storage::{EntityStore, Filter, SnapshotFormat};
