use crate::codex::{CodexProgram, DEFAULT_MAX_NESTING, compile_with_limit};
use crate::core::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Store capability a codex may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexPermission {
    Read,
    Create,
    Update,
    Delete,
    Link,
}

impl CodexPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
        }
    }

    pub fn all() -> BTreeSet<CodexPermission> {
        [Self::Read, Self::Create, Self::Update, Self::Delete, Self::Link]
            .into_iter()
            .collect()
    }
}

impl fmt::Display for CodexPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodexStatus {
    #[default]
    Active,
    Disabled,
}

/// Installed override script.
///
/// Records are shared as `Arc<Codex>` and replaced wholesale on redeploy, so
/// a run in progress keeps the version it started with.
#[derive(Debug, Clone)]
pub struct Codex {
    pub id: String,
    pub source: String,
    pub permissions: BTreeSet<CodexPermission>,
    pub status: CodexStatus,
    /// Set while the codex is bound to a hook point.
    pub entity_kind: Option<String>,
    pub hook_name: Option<String>,
    pub(crate) program: Arc<CodexProgram>,
}

impl Codex {
    /// Compiles `source`; the error names the codex and the offending line.
    pub fn compile(
        id: impl Into<String>,
        source: impl Into<String>,
        permissions: BTreeSet<CodexPermission>,
    ) -> Result<Self> {
        Self::compile_with_limit(id, source, permissions, DEFAULT_MAX_NESTING)
    }

    pub fn compile_with_limit(
        id: impl Into<String>,
        source: impl Into<String>,
        permissions: BTreeSet<CodexPermission>,
        max_nesting: usize,
    ) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "codex id must not be empty".to_string(),
            ));
        }
        let source = source.into();
        let program = compile_with_limit(&source, max_nesting).map_err(|err| match err {
            KernelError::ParseError(message) => {
                KernelError::ParseError(format!("codex '{}': {}", id, message))
            }
            other => other,
        })?;
        Ok(Self {
            id,
            source,
            permissions,
            status: CodexStatus::Active,
            entity_kind: None,
            hook_name: None,
            program: Arc::new(program),
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == CodexStatus::Active
    }

    pub fn allows(&self, permission: CodexPermission) -> bool {
        self.permissions.contains(&permission)
    }

    pub(crate) fn with_status(mut self, status: CodexStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_binding(mut self, binding: Option<(String, String)>) -> Self {
        match binding {
            Some((kind, hook)) => {
                self.entity_kind = Some(kind);
                self.hook_name = Some(hook);
            }
            None => {
                self.entity_kind = None;
                self.hook_name = None;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_reports_codex_id() {
        let err = Codex::compile("greeter", "emit (", BTreeSet::new()).unwrap_err();
        match err {
            KernelError::ParseError(message) => {
                assert!(message.starts_with("codex 'greeter': Line 1:"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_permissions() {
        let codex = Codex::compile("c", "return 1", [CodexPermission::Read].into()).unwrap();
        assert!(codex.is_active());
        assert!(codex.allows(CodexPermission::Read));
        assert!(!codex.allows(CodexPermission::Delete));
        assert!(Codex::compile(" ", "return 1", BTreeSet::new()).is_err());
    }
}
