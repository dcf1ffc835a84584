use super::persistence::{STORE_SNAPSHOT_VERSION, StoreSnapshot};
use super::query::{EntityQuery, Filter};
use crate::access::{AccessGuard, Action, Caller};
use crate::core::{
    Attributes, Clock, Entity, EntityRef, IdAllocator, KernelError, KindRegistry, Result,
    SystemClock, UuidAllocator,
};
use im::OrdMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{Level, event};

const MAX_ID_ATTEMPTS: usize = 16;

/// Frozen copy of the entity map, used to undo a group of writes.
///
/// Cloning the persistent map is O(1).
#[derive(Clone)]
pub struct StoreCheckpoint {
    entities: OrdMap<EntityRef, Entity>,
}

/// Owns every entity and relation edge.
///
/// Reads hand out clones; nothing outside the store ever holds a reference
/// into its state across an operation boundary.
pub struct EntityStore {
    entities: OrdMap<EntityRef, Entity>,
    /// Every id ever handed out, including deleted and rolled-back ones.
    issued: HashSet<EntityRef>,
    guard: AccessGuard,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdAllocator>,
}

impl EntityStore {
    pub fn new(kinds: Arc<KindRegistry>) -> Self {
        Self {
            entities: OrdMap::new(),
            issued: HashSet::new(),
            guard: AccessGuard::new(kinds),
            clock: Arc::new(SystemClock),
            ids: Box::new(UuidAllocator),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_allocator(mut self, ids: Box<dyn IdAllocator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Creates an entity and returns its freshly allocated id.
    pub fn create(
        &mut self,
        kind: &str,
        attributes: Attributes,
        owner: Option<&str>,
    ) -> Result<EntityRef> {
        self.guard.kinds().validate(kind)?;

        let id = self.allocate_id(kind)?;
        let now = self.clock.now();
        let entity = Entity::new(id.clone(), kind, attributes, owner.map(str::to_string), now);

        self.issued.insert(id.clone());
        self.entities.insert(id.clone(), entity);
        event!(Level::DEBUG, entity_id = %id, kind = %kind, "entity created");
        Ok(id)
    }

    fn allocate_id(&mut self, kind: &str) -> Result<EntityRef> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = self.ids.allocate(kind);
            if candidate.trim().is_empty() || self.issued.contains(&candidate) {
                event!(Level::WARN, candidate = %candidate, "id allocator proposed a used id");
                continue;
            }
            return Ok(candidate);
        }
        Err(KernelError::InvariantViolation(format!(
            "could not allocate a fresh id for kind '{}' after {} attempts",
            kind, MAX_ID_ATTEMPTS
        )))
    }

    pub fn get(&self, id: &str) -> Result<Entity> {
        self.entities
            .get(id)
            .cloned()
            .ok_or_else(|| KernelError::NotFound(format!("entity '{}'", id)))
    }

    pub fn get_as(&self, id: &str, caller: &Caller) -> Result<Entity> {
        let entity = self.get(id)?;
        self.guard.check(caller, &entity, Action::Read)?;
        Ok(entity)
    }

    /// Applies a top-level merge patch; a `null` value removes the attribute.
    ///
    /// A denied caller leaves the entity untouched.
    pub fn update(&mut self, id: &str, patch: &Attributes, caller: &Caller) -> Result<Entity> {
        let mut entity = self.get(id)?;
        self.guard.check(caller, &entity, Action::Update)?;

        let mut changed = false;
        for (name, value) in patch {
            if value.is_null() {
                changed |= entity.attributes.remove(name).is_some();
            } else if entity.attributes.get(name) != Some(value) {
                entity.attributes.insert(name.clone(), value.clone());
                changed = true;
            }
        }

        if changed {
            entity.updated_at = self.clock.now();
            self.entities.insert(entity.id.clone(), entity.clone());
            event!(Level::DEBUG, entity_id = %id, "entity updated");
        }
        Ok(entity)
    }

    /// Removes the entity and its outgoing edges. Edges pointing at it from
    /// other entities are left in place.
    pub fn delete(&mut self, id: &str, caller: &Caller) -> Result<Entity> {
        let entity = self.get(id)?;
        self.guard.check(caller, &entity, Action::Delete)?;
        self.entities.remove(id);
        event!(Level::DEBUG, entity_id = %id, "entity deleted");
        Ok(entity)
    }

    /// Adds `id --relation--> target`. Returns whether the edge set changed.
    ///
    /// Linking an existing pair is a successful no-op. On a single-valued
    /// relation the previous target is replaced.
    pub fn link(&mut self, id: &str, relation: &str, target: &str, caller: &Caller) -> Result<bool> {
        validate_relation_name(relation)?;
        let mut entity = self.get(id)?;
        self.guard.check(caller, &entity, Action::Link)?;

        if !self.contains(target) {
            return Err(KernelError::InvariantViolation(format!(
                "relation target '{}' of {}.{} does not exist",
                target, id, relation
            )));
        }
        if entity.is_linked(relation, target) {
            return Ok(false);
        }

        let single = self.guard.kinds().is_single_valued(&entity.kind, relation);
        let targets = entity.relations.entry(relation.to_string()).or_default();
        if single {
            targets.clear();
        }
        targets.insert(target.to_string());
        entity.updated_at = self.clock.now();
        self.entities.insert(entity.id.clone(), entity);
        event!(Level::DEBUG, entity_id = %id, relation = %relation, target = %target, "entity linked");
        Ok(true)
    }

    /// Removes an edge. The target need not exist any more.
    pub fn unlink(&mut self, id: &str, relation: &str, target: &str, caller: &Caller) -> Result<bool> {
        validate_relation_name(relation)?;
        let mut entity = self.get(id)?;
        self.guard.check(caller, &entity, Action::Link)?;

        let removed = match entity.relations.get_mut(relation) {
            Some(targets) => targets.remove(target),
            None => false,
        };
        if !removed {
            return Ok(false);
        }
        if entity.relations.get(relation).map(|t| t.is_empty()).unwrap_or(false) {
            entity.relations.remove(relation);
        }
        entity.updated_at = self.clock.now();
        self.entities.insert(entity.id.clone(), entity);
        event!(Level::DEBUG, entity_id = %id, relation = %relation, target = %target, "entity unlinked");
        Ok(true)
    }

    pub fn query(&self, kind: &str, filter: Filter) -> EntityQuery<'_> {
        EntityQuery::new(
            Box::new(self.entities.iter().map(|(_, entity)| entity)),
            Some(kind.to_string()),
            filter,
        )
    }

    /// Query across every kind.
    pub fn query_all(&self, filter: Filter) -> EntityQuery<'_> {
        EntityQuery::new(Box::new(self.entities.iter().map(|(_, entity)| entity)), None, filter)
    }

    /// Snapshots of the existing targets of a relation.
    pub fn related(&self, id: &str, relation: &str) -> Result<Vec<Entity>> {
        let entity = self.entities.get(id).ok_or_else(|| KernelError::NotFound(format!("entity '{}'", id)))?;
        Ok(entity
            .relations
            .get(relation)
            .map(|targets| {
                targets
                    .iter()
                    .filter_map(|target| self.entities.get(target).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// `(source, relation)` pairs of every edge that points at `id`.
    pub fn incoming(&self, id: &str) -> Vec<(EntityRef, String)> {
        let mut edges = Vec::new();
        for (source_id, source) in self.entities.iter() {
            for (relation, targets) in &source.relations {
                if targets.contains(id) {
                    edges.push((source_id.clone(), relation.clone()));
                }
            }
        }
        edges
    }

    pub(crate) fn checkpoint(&self) -> StoreCheckpoint {
        StoreCheckpoint {
            entities: self.entities.clone(),
        }
    }

    /// Rolls entity state back. Issued ids stay issued.
    pub(crate) fn restore(&mut self, checkpoint: StoreCheckpoint) {
        self.entities = checkpoint.entities;
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let mut issued_ids: Vec<EntityRef> = self.issued.iter().cloned().collect();
        issued_ids.sort();
        StoreSnapshot {
            format_version: STORE_SNAPSHOT_VERSION,
            created_at: self.clock.now(),
            entities: self.entities.iter().map(|(_, entity)| entity.clone()).collect(),
            issued_ids,
        }
    }

    /// Replaces the whole store content with a snapshot.
    pub fn load_snapshot(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        if snapshot.format_version != STORE_SNAPSHOT_VERSION {
            return Err(KernelError::SerializationError(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.format_version, STORE_SNAPSHOT_VERSION
            )));
        }

        let mut entities = OrdMap::new();
        let mut issued: HashSet<EntityRef> = snapshot.issued_ids.into_iter().collect();
        for entity in snapshot.entities {
            if entities.contains_key(&entity.id) {
                return Err(KernelError::InvariantViolation(format!(
                    "snapshot contains duplicate entity id '{}'",
                    entity.id
                )));
            }
            issued.insert(entity.id.clone());
            entities.insert(entity.id.clone(), entity);
        }

        self.entities = entities;
        self.issued = issued;
        event!(Level::INFO, entities = self.entities.len(), "store snapshot loaded");
        Ok(())
    }
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entities", &self.entities.len())
            .field("issued", &self.issued.len())
            .finish()
    }
}

pub(crate) fn validate_relation_name(relation: &str) -> Result<()> {
    if relation.trim().is_empty() {
        return Err(KernelError::InvalidArgument(
            "relation name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{KindSpec, SequentialAllocator};
    use serde_json::json;

    struct Repeating;

    impl IdAllocator for Repeating {
        fn allocate(&mut self, _kind: &str) -> String {
            "same".to_string()
        }
    }

    fn store() -> EntityStore {
        let kinds = KindRegistry::new().with_kind("mandate", KindSpec::new().single_valued("holder"));
        EntityStore::new(Arc::new(kinds)).with_id_allocator(Box::new(SequentialAllocator::new("e")))
    }

    fn attrs(value: serde_json::Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_create_and_get() {
        let mut s = store();
        let id = s.create("user", attrs(json!({"name": "alice"})), Some("alice")).unwrap();
        let user = s.get(&id).unwrap();
        assert_eq!(user.kind, "user");
        assert_eq!(user.owner.as_deref(), Some("alice"));
        assert_eq!(user.attributes["name"], "alice");
        assert!(matches!(s.get("nope"), Err(KernelError::NotFound(_))));
    }

    #[test]
    fn test_ids_never_reused_after_delete() {
        let mut s = store();
        let first = s.create("user", Attributes::new(), None).unwrap();
        s.delete(&first, &Caller::system()).unwrap();
        let second = s.create("user", Attributes::new(), None).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_exhausted_allocator_is_invariant_violation() {
        let mut s = EntityStore::new(Arc::new(KindRegistry::new())).with_id_allocator(Box::new(Repeating));
        s.create("user", Attributes::new(), None).unwrap();
        let err = s.create("user", Attributes::new(), None).unwrap_err();
        assert!(matches!(err, KernelError::InvariantViolation(_)));
    }

    #[test]
    fn test_update_merge_patch_and_null_removal() {
        let mut s = store();
        let owner = Caller::new("alice");
        let id = s.create("user", attrs(json!({"a": 1, "b": 2})), Some("alice")).unwrap();
        let updated = s.update(&id, &attrs(json!({"a": 5, "b": null, "c": "x"})), &owner).unwrap();
        assert_eq!(updated.attributes, attrs(json!({"a": 5, "c": "x"})));
    }

    #[test]
    fn test_update_denied_leaves_entity_untouched() {
        let mut s = store();
        let id = s.create("user", attrs(json!({"a": 1})), Some("alice")).unwrap();
        let before = s.get(&id).unwrap();
        let err = s.update(&id, &attrs(json!({"a": 2})), &Caller::new("mallory")).unwrap_err();
        assert!(err.is_denied());
        assert_eq!(s.get(&id).unwrap(), before);
    }

    #[test]
    fn test_link_requires_existing_target() {
        let mut s = store();
        let a = s.create("user", Attributes::new(), None).unwrap();
        let err = s.link(&a, "friends", "ghost", &Caller::system()).unwrap_err();
        assert!(matches!(err, KernelError::InvariantViolation(_)));
        assert!(s.get(&a).unwrap().relations.is_empty());
    }

    #[test]
    fn test_link_idempotent_and_unlink() {
        let mut s = store();
        let sys = Caller::system();
        let a = s.create("org", Attributes::new(), None).unwrap();
        let b = s.create("user", Attributes::new(), None).unwrap();

        assert!(s.link(&a, "members", &b, &sys).unwrap());
        let once = s.get(&a).unwrap().relations;
        assert!(!s.link(&a, "members", &b, &sys).unwrap());
        assert_eq!(s.get(&a).unwrap().relations, once);

        assert!(s.unlink(&a, "members", &b, &sys).unwrap());
        assert!(!s.unlink(&a, "members", &b, &sys).unwrap());
        assert!(s.get(&a).unwrap().relations.is_empty());
    }

    #[test]
    fn test_single_valued_relation_replaces() {
        let mut s = store();
        let sys = Caller::system();
        let m = s.create("mandate", Attributes::new(), None).unwrap();
        let u1 = s.create("user", Attributes::new(), None).unwrap();
        let u2 = s.create("user", Attributes::new(), None).unwrap();

        s.link(&m, "holder", &u1, &sys).unwrap();
        s.link(&m, "holder", &u2, &sys).unwrap();
        assert_eq!(s.get(&m).unwrap().targets("holder"), vec![u2]);
    }

    #[test]
    fn test_delete_leaves_dangling_incoming_edge() {
        let mut s = store();
        let sys = Caller::system();
        let a = s.create("org", Attributes::new(), None).unwrap();
        let b = s.create("user", Attributes::new(), None).unwrap();
        s.link(&a, "members", &b, &sys).unwrap();
        assert_eq!(s.incoming(&b), vec![(a.clone(), "members".to_string())]);

        s.delete(&b, &sys).unwrap();
        assert!(s.get(&a).unwrap().is_linked("members", &b));
        assert!(s.related(&a, "members").unwrap().is_empty());
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut s = store();
        let a = s.create("user", Attributes::new(), None).unwrap();
        let checkpoint = s.checkpoint();
        s.create("user", Attributes::new(), None).unwrap();
        s.delete(&a, &Caller::system()).unwrap();

        s.restore(checkpoint);
        assert_eq!(s.len(), 1);
        assert!(s.contains(&a));
    }

    #[test]
    fn test_query_is_restartable() {
        let mut s = store();
        s.create("user", attrs(json!({"age": 30})), None).unwrap();
        s.create("user", attrs(json!({"age": 12})), None).unwrap();
        s.create("org", attrs(json!({"age": 40})), None).unwrap();

        let adults = s.query("user", Filter::ge("age", 18)).count();
        assert_eq!(adults, 1);

        s.create("user", attrs(json!({"age": 50})), None).unwrap();
        assert_eq!(s.query("user", Filter::ge("age", 18)).count(), 2);
        assert_eq!(s.query_all(Filter::ge("age", 18)).count(), 3);
    }
}
