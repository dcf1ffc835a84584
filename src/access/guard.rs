use crate::core::{Entity, KernelError, KindRegistry, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub const ADMIN_PROFILE: &str = "admin";
pub const SYSTEM_CALLER_ID: &str = "system";

/// Operation a caller wants to perform on an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
    Link,
    /// Run a named hook against the entity
    Execute,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity on whose behalf an operation runs.
///
/// The kernel does not authenticate; the id and profiles are whatever the
/// host resolved for the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    id: String,
    #[serde(default)]
    profiles: BTreeSet<String>,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profiles: BTreeSet::new(),
        }
    }

    /// Internal identity with the admin profile.
    pub fn system() -> Self {
        Self::new(SYSTEM_CALLER_ID).with_profile(ADMIN_PROFILE)
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id).with_profile(ADMIN_PROFILE)
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profiles.insert(profile.into());
        self
    }

    pub fn with_profiles<I, S>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles.extend(profiles.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn profiles(&self) -> &BTreeSet<String> {
        &self.profiles
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.profiles.contains(profile)
    }

    #[inline]
    pub fn is_admin(&self) -> bool {
        self.has_profile(ADMIN_PROFILE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied,
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Authorizes callers against entities.
///
/// Policy: admins may do anything, owners may do anything to what they
/// own, and anyone may read a publicly readable kind. Everything else is
/// denied.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    kinds: Arc<KindRegistry>,
}

impl AccessGuard {
    pub fn new(kinds: Arc<KindRegistry>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    pub fn authorize(&self, caller: &Caller, entity: &Entity, action: Action) -> AccessDecision {
        if caller.is_admin() {
            return AccessDecision::Allowed;
        }
        if entity.owner.as_deref() == Some(caller.id()) {
            return AccessDecision::Allowed;
        }
        if action == Action::Read && self.kinds.is_publicly_readable(&entity.kind) {
            return AccessDecision::Allowed;
        }
        AccessDecision::Denied
    }

    /// Same as [`authorize`](Self::authorize) but as a `Result`, for `?` chains.
    pub fn check(&self, caller: &Caller, entity: &Entity, action: Action) -> Result<()> {
        match self.authorize(caller, entity, action) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied => Err(KernelError::Denied(format!(
                "caller '{}' may not {} {} '{}'",
                caller.id(),
                action,
                entity.kind,
                entity.id
            ))),
        }
    }

    /// Creation has no target entity yet; it is open unless the kind is
    /// marked admin-only.
    pub fn authorize_create(&self, caller: &Caller, kind: &str) -> AccessDecision {
        if self.kinds.is_admin_only_create(kind) && !caller.is_admin() {
            AccessDecision::Denied
        } else {
            AccessDecision::Allowed
        }
    }

    pub fn check_create(&self, caller: &Caller, kind: &str) -> Result<()> {
        match self.authorize_create(caller, kind) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied => Err(KernelError::Denied(format!(
                "caller '{}' may not create {} entities",
                caller.id(),
                kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Attributes, KindSpec};
    use chrono::Utc;

    fn guard() -> AccessGuard {
        let kinds = KindRegistry::new()
            .with_kind("user", KindSpec::new().publicly_readable())
            .with_kind("charter", KindSpec::new().admin_only_create());
        AccessGuard::new(Arc::new(kinds))
    }

    fn entity(kind: &str, owner: Option<&str>) -> Entity {
        Entity::new(
            "e1".into(),
            kind,
            Attributes::new(),
            owner.map(str::to_string),
            Utc::now(),
        )
    }

    #[test]
    fn test_owner_allowed() {
        let trade = entity("trade", Some("alice"));
        let decision = guard().authorize(&Caller::new("alice"), &trade, Action::Update);
        assert_eq!(decision, AccessDecision::Allowed);
    }

    #[test]
    fn test_admin_profile_overrides() {
        let trade = entity("trade", Some("alice"));
        let admin = Caller::new("root").with_profile("admin");
        for action in [Action::Read, Action::Update, Action::Delete, Action::Link, Action::Execute] {
            assert!(guard().authorize(&admin, &trade, action).is_allowed());
        }
    }

    #[test]
    fn test_stranger_denied_except_public_read() {
        let g = guard();
        let bob = Caller::new("bob").with_profile("member");
        let user = entity("user", Some("alice"));
        let trade = entity("trade", Some("alice"));

        assert!(g.authorize(&bob, &user, Action::Read).is_allowed());
        assert!(!g.authorize(&bob, &user, Action::Update).is_allowed());
        assert!(!g.authorize(&bob, &trade, Action::Read).is_allowed());
    }

    #[test]
    fn test_system_owned_entity_requires_admin() {
        let g = guard();
        let orphan = entity("trade", None);
        assert!(!g.authorize(&Caller::new("alice"), &orphan, Action::Update).is_allowed());
        assert!(g.authorize(&Caller::system(), &orphan, Action::Update).is_allowed());
    }

    #[test]
    fn test_check_reports_denied() {
        let trade = entity("trade", Some("alice"));
        let err = guard().check(&Caller::new("bob"), &trade, Action::Delete).unwrap_err();
        assert!(err.is_denied());
        assert!(err.to_string().contains("may not delete"));
    }

    #[test]
    fn test_admin_only_create() {
        let g = guard();
        assert!(g.check_create(&Caller::new("alice"), "user").is_ok());
        assert!(g.check_create(&Caller::new("alice"), "charter").is_err());
        assert!(g.check_create(&Caller::admin("root"), "charter").is_ok());
    }
}
