use crate::access::{Action, Caller, SYSTEM_CALLER_ID};
use crate::core::{Attributes, Entity, EntityRef, KernelError, KindRegistry, Result};
use crate::hooks::CodexPermission;
use crate::storage::{EntityStore, Filter};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Capabilities a running codex (or a built-in hook handler) can reach.
///
/// This is the whole surface: there is no path from a codex to files,
/// processes or the network.
pub trait CodexHost {
    fn now(&self) -> DateTime<Utc>;
    fn get(&mut self, id: &str) -> Result<Entity>;
    fn exists(&mut self, id: &str) -> Result<bool>;
    fn find(&mut self, kind: &str, filter: Filter, limit: usize) -> Result<Vec<Entity>>;
    fn create(&mut self, kind: &str, attributes: Attributes) -> Result<EntityRef>;
    fn update(&mut self, id: &str, patch: &Attributes) -> Result<Entity>;
    fn delete(&mut self, id: &str) -> Result<()>;
    fn link(&mut self, id: &str, relation: &str, target: &str) -> Result<bool>;
    fn unlink(&mut self, id: &str, relation: &str, target: &str) -> Result<bool>;
}

/// Store access limited by the codex's declared permissions and, below
/// that, by the access guard for the effective caller.
///
/// Writes made here do not fire hooks.
pub struct ScopedStore<'a> {
    store: &'a mut EntityStore,
    caller: &'a Caller,
    permissions: BTreeSet<CodexPermission>,
    now: DateTime<Utc>,
}

impl<'a> ScopedStore<'a> {
    pub fn new(
        store: &'a mut EntityStore,
        caller: &'a Caller,
        permissions: BTreeSet<CodexPermission>,
    ) -> Self {
        let now = store.clock().now();
        Self { store, caller, permissions, now }
    }

    pub fn caller(&self) -> &Caller {
        self.caller
    }

    /// Task and execution records are written by the scheduler only.
    fn ensure_writable(&self, id: &str) -> Result<()> {
        let entity = self.store.get(id)?;
        if KindRegistry::is_reserved(&entity.kind) {
            return Err(KernelError::Denied(format!(
                "{} '{}' is managed by the scheduler",
                entity.kind, id
            )));
        }
        Ok(())
    }

    fn require(&self, permission: CodexPermission) -> Result<()> {
        if self.permissions.contains(&permission) {
            Ok(())
        } else {
            Err(KernelError::Denied(format!(
                "codex lacks '{}' permission",
                permission
            )))
        }
    }
}

impl CodexHost for ScopedStore<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn get(&mut self, id: &str) -> Result<Entity> {
        self.require(CodexPermission::Read)?;
        self.store.get_as(id, self.caller)
    }

    fn exists(&mut self, id: &str) -> Result<bool> {
        self.require(CodexPermission::Read)?;
        Ok(self.store.contains(id))
    }

    fn find(&mut self, kind: &str, filter: Filter, limit: usize) -> Result<Vec<Entity>> {
        self.require(CodexPermission::Read)?;
        let guard = self.store.guard();
        Ok(self
            .store
            .query(kind, filter)
            .filter(|entity| guard.authorize(self.caller, entity, Action::Read).is_allowed())
            .take(limit)
            .collect())
    }

    fn create(&mut self, kind: &str, attributes: Attributes) -> Result<EntityRef> {
        self.require(CodexPermission::Create)?;
        if KindRegistry::is_reserved(kind) {
            return Err(KernelError::Denied(format!(
                "kind '{}' is managed by the scheduler",
                kind
            )));
        }
        self.store.guard().check_create(self.caller, kind)?;
        let owner = (self.caller.id() != SYSTEM_CALLER_ID).then(|| self.caller.id());
        self.store.create(kind, attributes, owner)
    }

    fn update(&mut self, id: &str, patch: &Attributes) -> Result<Entity> {
        self.require(CodexPermission::Update)?;
        self.ensure_writable(id)?;
        self.store.update(id, patch, self.caller)
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.require(CodexPermission::Delete)?;
        self.ensure_writable(id)?;
        self.store.delete(id, self.caller).map(|_| ())
    }

    fn link(&mut self, id: &str, relation: &str, target: &str) -> Result<bool> {
        self.require(CodexPermission::Link)?;
        self.ensure_writable(id)?;
        self.store.link(id, relation, target, self.caller)
    }

    fn unlink(&mut self, id: &str, relation: &str, target: &str) -> Result<bool> {
        self.require(CodexPermission::Link)?;
        self.ensure_writable(id)?;
        self.store.unlink(id, relation, target, self.caller)
    }
}
