//! Everything a host application usually needs, in one import.
//!
//! ```
//! use ggg_kernel::prelude::*;
//!
//! let mut kernel = Kernel::default();
//! let alice = Caller::new("alice");
//! let id = kernel.create(&alice, "proposal", Attributes::new()).unwrap();
//! assert_eq!(kernel.get(&alice, &id).unwrap().kind, "proposal");
//! ```

pub use crate::access::{Action, Caller};
pub use crate::config::KernelConfig;
pub use crate::core::{Attributes, Entity, EntityRef, KernelError, Result, Value};
pub use crate::hooks::{CodexPermission, CodexSource, CodexStatus, HookBinding, HookManifest};
pub use crate::kernel::Kernel;
pub use crate::scheduler::{PayloadRef, RetryPolicy, TaskSpec, TaskStatus};
pub use crate::storage::{Filter, SnapshotFormat};
