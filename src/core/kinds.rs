//! Registry of known entity kinds.
//!
//! Kind-specific *behavior* lives in the hook registry; this only carries
//! the structural facts the store and the access guard need.

use crate::core::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const TASK_KIND: &str = "task";
pub const TASK_EXECUTION_KIND: &str = "task_execution";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSpec {
    /// Any caller may read entities of this kind.
    #[serde(default)]
    pub publicly_readable: bool,
    /// Only admins may create entities of this kind.
    #[serde(default)]
    pub admin_only_create: bool,
    /// Relations that hold at most one target; linking replaces.
    #[serde(default)]
    pub single_valued_relations: BTreeSet<String>,
}

impl KindSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publicly_readable(mut self) -> Self {
        self.publicly_readable = true;
        self
    }

    pub fn admin_only_create(mut self) -> Self {
        self.admin_only_create = true;
        self
    }

    pub fn single_valued(mut self, relation: impl Into<String>) -> Self {
        self.single_valued_relations.insert(relation.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindRegistry {
    #[serde(default)]
    kinds: BTreeMap<String, KindSpec>,
    /// Reject kinds that were never registered.
    #[serde(default)]
    strict: bool,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the governance kinds pre-declared.
    pub fn governance_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("user", KindSpec::new().publicly_readable());
        registry.register("organization", KindSpec::new().publicly_readable());
        registry.register("proposal", KindSpec::new().publicly_readable());
        registry.register("mandate", KindSpec::new().single_valued("owner"));
        registry.register("trade", KindSpec::new());
        registry.register("instrument", KindSpec::new().publicly_readable());
        registry.register("certificate", KindSpec::new().single_valued("holder"));
        registry.register("dispute", KindSpec::new());
        registry.register("contract", KindSpec::new());
        registry.register(TASK_KIND, KindSpec::new());
        registry.register(TASK_EXECUTION_KIND, KindSpec::new());
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, spec: KindSpec) -> &mut Self {
        self.kinds.insert(kind.into(), spec);
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>, spec: KindSpec) -> Self {
        self.register(kind, spec);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    pub fn is_publicly_readable(&self, kind: &str) -> bool {
        self.get(kind).map(|spec| spec.publicly_readable).unwrap_or(false)
    }

    pub fn is_admin_only_create(&self, kind: &str) -> bool {
        self.get(kind).map(|spec| spec.admin_only_create).unwrap_or(false)
    }

    pub fn is_single_valued(&self, kind: &str, relation: &str) -> bool {
        self.get(kind)
            .map(|spec| spec.single_valued_relations.contains(relation))
            .unwrap_or(false)
    }

    pub fn is_reserved(kind: &str) -> bool {
        kind == TASK_KIND || kind == TASK_EXECUTION_KIND
    }

    /// Checks a kind tag is well-formed and, in strict mode, registered.
    pub fn validate(&self, kind: &str) -> Result<()> {
        if kind.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "entity kind must not be empty".to_string(),
            ));
        }
        if self.strict && !self.kinds.contains_key(kind) && !Self::is_reserved(kind) {
            return Err(KernelError::InvalidArgument(format!(
                "unknown entity kind '{}'",
                kind
            )));
        }
        Ok(())
    }
}
