use super::codex::{CodexPermission, CodexStatus};
use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Codex record as shipped in a deployment manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodexSource {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub permissions: BTreeSet<CodexPermission>,
    #[serde(default)]
    pub status: CodexStatus,
}

impl CodexSource {
    pub fn new(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            permissions: BTreeSet::new(),
            status: CodexStatus::Active,
        }
    }

    pub fn with_permission(mut self, permission: CodexPermission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = CodexPermission>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.status = CodexStatus::Disabled;
        self
    }
}

/// `(entity_kind, hook_name) -> codex_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookBinding {
    pub entity_kind: String,
    pub hook_name: String,
    pub codex_id: String,
    /// A failing mandatory hook fails the triggering mutation.
    #[serde(default)]
    pub mandatory: bool,
}

impl HookBinding {
    pub fn new(
        entity_kind: impl Into<String>,
        hook_name: impl Into<String>,
        codex_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            hook_name: hook_name.into(),
            codex_id: codex_id.into(),
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookManifest {
    #[serde(default)]
    pub codexes: Vec<CodexSource>,
    #[serde(default)]
    pub bindings: Vec<HookBinding>,
}

impl HookManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codex(mut self, codex: CodexSource) -> Self {
        self.codexes.push(codex);
        self
    }

    pub fn with_binding(mut self, binding: HookBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_from_json() {
        let manifest = HookManifest::from_json_str(
            r#"{
                "codexes": [
                    {"id": "welcome", "source": "emit 1", "permissions": ["read", "update"]}
                ],
                "bindings": [
                    {"entity_kind": "user", "hook_name": "user_register_posthook", "codex_id": "welcome"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.codexes[0].status, CodexStatus::Active);
        assert!(manifest.codexes[0].permissions.contains(&CodexPermission::Update));
        assert!(!manifest.bindings[0].mandatory);
        assert!(HookManifest::from_json_str("{\"codexes\": 3}").is_err());
    }
}
