//! Lifecycle hook points and their bindings to codexes.

pub mod codex;
pub mod manifest;
pub mod registry;

pub use codex::{Codex, CodexPermission, CodexStatus};
pub use manifest::{CodexSource, HookBinding, HookManifest};
pub use registry::{CodexRef, DefaultHookHandler, HookRegistry, HookResolution, InstallReport};

use crate::core::{KernelError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref HOOK_NAME: Regex = Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid hook name regex");
}

/// Entity lifecycle event that has a hook point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Entity creation
    Register,
    Update,
    Delete,
    Link,
    Unlink,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
            Self::Unlink => "unlink",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// `user` + `Register` + `Post` gives `user_register_posthook`.
pub fn hook_name(kind: &str, event: HookEvent, phase: HookPhase) -> String {
    format!("{}_{}_{}hook", kind, event.as_str(), phase.as_str())
}

/// Hook names are lowercase identifiers prefixed with the kind they belong to.
pub fn validate_hook_name(entity_kind: &str, name: &str) -> Result<()> {
    if entity_kind.trim().is_empty() {
        return Err(KernelError::InvalidArgument(
            "hook entity kind must not be empty".to_string(),
        ));
    }
    if !HOOK_NAME.is_match(name) {
        return Err(KernelError::InvalidArgument(format!(
            "invalid hook name '{}'",
            name
        )));
    }
    let prefix = format!("{}_", entity_kind);
    if !name.starts_with(&prefix) || name.len() == prefix.len() {
        return Err(KernelError::InvalidArgument(format!(
            "hook '{}' must start with '{}'",
            name, prefix
        )));
    }
    Ok(())
}
