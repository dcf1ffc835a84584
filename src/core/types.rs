use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

/// Entity identifiers are opaque strings handed out by the store.
pub type EntityRef = String;

pub type Attributes = Map<String, Value>;

pub type Relations = BTreeMap<String, BTreeSet<EntityRef>>;

/// A uniformly represented domain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityRef,
    pub kind: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub relations: Relations,
    #[serde(default)]
    pub owner: Option<EntityRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub(crate) fn new(
        id: EntityRef,
        kind: impl Into<String>,
        attributes: Attributes,
        owner: Option<EntityRef>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind: kind.into(),
            attributes,
            relations: Relations::new(),
            owner,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Target ids of a relation, in id order. Empty if the relation is unset.
    pub fn targets(&self, relation: &str) -> Vec<EntityRef> {
        self.relations
            .get(relation)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_linked(&self, relation: &str, target: &str) -> bool {
        self.relations
            .get(relation)
            .map(|targets| targets.contains(target))
            .unwrap_or(false)
    }

    /// Shallow rendering: attributes plus relation id lists.
    ///
    /// Related entities are never expanded, so output size is bounded by
    /// this entity alone and cycles in the relation graph are harmless.
    pub fn to_dict(&self) -> Value {
        let relations: Map<String, Value> = self
            .relations
            .iter()
            .map(|(name, targets)| {
                (
                    name.clone(),
                    Value::Array(targets.iter().cloned().map(Value::String).collect()),
                )
            })
            .collect();

        json!({
            "id": self.id,
            "kind": self.kind,
            "owner": self.owner,
            "attributes": Value::Object(self.attributes.clone()),
            "relations": Value::Object(relations),
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}

/// Outcome of one codex run, shared by task executions and hook journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
}

impl ExecutionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entity {
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), json!("alice"));
        let mut entity = Entity::new("u1".into(), "user", attributes, Some("u1".into()), Utc::now());
        entity
            .relations
            .entry("friends".into())
            .or_default()
            .insert("u2".into());
        entity
    }

    #[test]
    fn test_to_dict_lists_relation_ids() {
        let dict = sample().to_dict();
        assert_eq!(dict["id"], "u1");
        assert_eq!(dict["attributes"]["name"], "alice");
        assert_eq!(dict["relations"]["friends"], json!(["u2"]));
    }

    #[test]
    fn test_targets_and_is_linked() {
        let entity = sample();
        assert_eq!(entity.targets("friends"), vec!["u2".to_string()]);
        assert!(entity.targets("missing").is_empty());
        assert!(entity.is_linked("friends", "u2"));
        assert!(!entity.is_linked("friends", "u3"));
    }
}
