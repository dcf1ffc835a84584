use crate::core::{EntityRef, ExecutionOutcome, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One codex run triggered through a hook point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookExecution {
    /// Monotonically increasing, never reused even after eviction.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub codex_id: String,
    pub entity_kind: String,
    pub hook_name: String,
    /// `None` for pre-create hooks.
    pub entity_id: Option<EntityRef>,
    pub caller: String,
    pub mandatory: bool,
    pub outcome: ExecutionOutcome,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl HookExecution {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }
}

/// Bounded in-memory log of hook executions; the oldest entries are
/// evicted first.
#[derive(Debug, Clone)]
pub struct HookJournal {
    records: VecDeque<HookExecution>,
    capacity: usize,
    next_seq: u64,
}

impl HookJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    /// Assigns the sequence number and appends.
    pub(crate) fn record(&mut self, mut execution: HookExecution) -> u64 {
        execution.sequence = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return execution.sequence;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        let sequence = execution.sequence;
        self.records.push_back(execution);
        sequence
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<HookExecution> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    /// Most recent first, for one entity.
    pub fn for_entity(&self, entity_id: &str, limit: usize) -> Vec<HookExecution> {
        self.records
            .iter()
            .rev()
            .filter(|execution| execution.entity_id.as_deref() == Some(entity_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn for_codex(&self, codex_id: &str, limit: usize) -> Vec<HookExecution> {
        self.records
            .iter()
            .rev()
            .filter(|execution| execution.codex_id == codex_id)
            .take(limit)
            .cloned()
            .collect()
    }
}
