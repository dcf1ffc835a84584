use crate::core::value::{compare, values_equal};
use crate::core::{Entity, EntityRef, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Predicate over an entity's attributes, owner and relations.
///
/// Comparisons between incompatible types simply do not match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    #[default]
    All,
    Eq { attr: String, value: Value },
    Ne { attr: String, value: Value },
    Gt { attr: String, value: Value },
    Ge { attr: String, value: Value },
    Lt { attr: String, value: Value },
    Le { attr: String, value: Value },
    Exists { attr: String },
    /// Substring for strings, membership for arrays.
    Contains { attr: String, value: Value },
    Owner { owner: Option<EntityRef> },
    /// Relation is non-empty, or holds `target` when given.
    HasRelation {
        relation: String,
        #[serde(default)]
        target: Option<EntityRef>,
    },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
    Not { filter: Box<Filter> },
}

impl Filter {
    pub fn eq(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq { attr: attr.into(), value: value.into() }
    }

    pub fn ne(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne { attr: attr.into(), value: value.into() }
    }

    pub fn gt(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt { attr: attr.into(), value: value.into() }
    }

    pub fn ge(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ge { attr: attr.into(), value: value.into() }
    }

    pub fn lt(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt { attr: attr.into(), value: value.into() }
    }

    pub fn le(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Le { attr: attr.into(), value: value.into() }
    }

    pub fn exists(attr: impl Into<String>) -> Self {
        Self::Exists { attr: attr.into() }
    }

    pub fn contains(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains { attr: attr.into(), value: value.into() }
    }

    pub fn owned_by(owner: impl Into<EntityRef>) -> Self {
        Self::Owner { owner: Some(owner.into()) }
    }

    pub fn linked(relation: impl Into<String>, target: impl Into<EntityRef>) -> Self {
        Self::HasRelation {
            relation: relation.into(),
            target: Some(target.into()),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Self::All => other,
            Self::And { mut filters } => {
                filters.push(other);
                Self::And { filters }
            }
            first => Self::And { filters: vec![first, other] },
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Self::Or { mut filters } => {
                filters.push(other);
                Self::Or { filters }
            }
            first => Self::Or { filters: vec![first, other] },
        }
    }

    pub fn negate(self) -> Self {
        Self::Not { filter: Box::new(self) }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::All => true,
            Self::Eq { attr, value } => entity
                .attribute(attr)
                .map(|actual| values_equal(actual, value))
                .unwrap_or(false),
            Self::Ne { attr, value } => entity
                .attribute(attr)
                .map(|actual| !values_equal(actual, value))
                .unwrap_or(true),
            Self::Gt { attr, value } => ordered(entity, attr, value, |o| o == Ordering::Greater),
            Self::Ge { attr, value } => ordered(entity, attr, value, |o| o != Ordering::Less),
            Self::Lt { attr, value } => ordered(entity, attr, value, |o| o == Ordering::Less),
            Self::Le { attr, value } => ordered(entity, attr, value, |o| o != Ordering::Greater),
            Self::Exists { attr } => entity.attribute(attr).is_some(),
            Self::Contains { attr, value } => match (entity.attribute(attr), value) {
                (Some(Value::String(hay)), Value::String(needle)) => hay.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => {
                    items.iter().any(|item| values_equal(item, needle))
                }
                _ => false,
            },
            Self::Owner { owner } => entity.owner == *owner,
            Self::HasRelation { relation, target } => match target {
                Some(target) => entity.is_linked(relation, target),
                None => entity
                    .relations
                    .get(relation)
                    .map(|targets| !targets.is_empty())
                    .unwrap_or(false),
            },
            Self::And { filters } => filters.iter().all(|f| f.matches(entity)),
            Self::Or { filters } => filters.iter().any(|f| f.matches(entity)),
            Self::Not { filter } => !filter.matches(entity),
        }
    }
}

fn ordered(entity: &Entity, attr: &str, value: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match entity.attribute(attr) {
        // NULL attributes never satisfy a range predicate.
        Some(Value::Null) | None => false,
        Some(actual) => compare(actual, value).map(accept).unwrap_or(false),
    }
}

/// Lazy scan over the store, yielding independent snapshots.
///
/// A query is finite and not resumable: to observe later writes, start a
/// new one.
pub struct EntityQuery<'a> {
    source: Box<dyn Iterator<Item = &'a Entity> + 'a>,
    kind: Option<String>,
    filter: Filter,
}

impl<'a> EntityQuery<'a> {
    pub(crate) fn new(
        source: Box<dyn Iterator<Item = &'a Entity> + 'a>,
        kind: Option<String>,
        filter: Filter,
    ) -> Self {
        Self { source, kind, filter }
    }

    pub fn ids(self) -> Vec<EntityRef> {
        self.map(|entity| entity.id).collect()
    }
}

impl Iterator for EntityQuery<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Self::Item> {
        for candidate in self.source.by_ref() {
            if let Some(kind) = &self.kind
                && candidate.kind != *kind
            {
                continue;
            }
            if self.filter.matches(candidate) {
                return Some(candidate.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Attributes;
    use chrono::Utc;
    use serde_json::json;

    fn proposal(votes: i64, title: &str) -> Entity {
        let mut attributes = Attributes::new();
        attributes.insert("votes".into(), json!(votes));
        attributes.insert("title".into(), json!(title));
        attributes.insert("tags".into(), json!(["budget", "q3"]));
        let mut entity = Entity::new("p1".into(), "proposal", attributes, Some("alice".into()), Utc::now());
        entity.relations.entry("sponsors".into()).or_default().insert("u9".into());
        entity
    }

    #[test]
    fn test_comparison_filters() {
        let p = proposal(10, "Fund the park");
        assert!(Filter::eq("votes", 10).matches(&p));
        assert!(Filter::eq("votes", 10.0).matches(&p));
        assert!(Filter::gt("votes", 5).matches(&p));
        assert!(!Filter::lt("votes", 5).matches(&p));
        assert!(Filter::le("votes", 10).matches(&p));
        assert!(!Filter::gt("title", 5).matches(&p));
        assert!(Filter::ne("missing", 1).matches(&p));
    }

    #[test]
    fn test_contains_and_relations() {
        let p = proposal(1, "Fund the park");
        assert!(Filter::contains("title", "park").matches(&p));
        assert!(Filter::contains("tags", "q3").matches(&p));
        assert!(!Filter::contains("tags", "q4").matches(&p));
        assert!(Filter::linked("sponsors", "u9").matches(&p));
        assert!(
            Filter::HasRelation { relation: "sponsors".into(), target: None }.matches(&p)
        );
        assert!(Filter::owned_by("alice").matches(&p));
    }

    #[test]
    fn test_combinators() {
        let p = proposal(3, "x");
        let f = Filter::All.and(Filter::exists("votes")).and(Filter::lt("votes", 5));
        assert!(f.matches(&p));
        assert!(!f.clone().negate().matches(&p));
        assert!(Filter::eq("votes", 99).or(Filter::eq("title", "x")).matches(&p));
    }

    #[test]
    fn test_filter_deserializes_from_json() {
        let f: Filter = serde_json::from_value(json!({
            "op": "and",
            "filters": [
                {"op": "gt", "attr": "votes", "value": 1},
                {"op": "exists", "attr": "title"}
            ]
        }))
        .unwrap();
        assert!(f.matches(&proposal(2, "t")));
    }
}
