//! Rule lookup structures: value cache, source index and rule store
//!
//! Each structure owns its lock and exposes only guarded accessors. None of
//! them calls into another while holding its lock.

use crate::types::{PointValue, Rule, SharedSourceInfo};
use dashmap::DashMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

// ============================================================================
// Value cache
// ============================================================================

/// Latest observed value per point key
#[derive(Debug, Default)]
pub struct ValueCache {
    values: DashMap<String, PointValue>,
}

impl ValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, value: &PointValue) {
        self.values.insert(value.key(), value.clone());
    }

    pub fn get(&self, key: &str) -> Option<PointValue> {
        self.values.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Source index
// ============================================================================

/// Point key -> IDs of rules consuming it, in indexing order
#[derive(Debug, Default)]
pub struct SourceIndex {
    entries: RwLock<FxHashMap<String, Vec<String>>>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a rule under each of its sources
    pub fn add_rule(&self, rule: &Rule) {
        let mut entries = self.entries.write();
        for source in rule.effective_sources() {
            let ids = entries.entry(source.key()).or_default();
            if !ids.iter().any(|id| id == &rule.id) {
                ids.push(rule.id.clone());
            }
        }
    }

    /// Remove a rule from every key, dropping keys left empty
    pub fn remove_rule(&self, rule_id: &str) {
        let mut entries = self.entries.write();
        entries.retain(|_, ids| {
            ids.retain(|id| id != rule_id);
            !ids.is_empty()
        });
    }

    pub fn rebuild<'a>(&self, rules: impl IntoIterator<Item = &'a Rule>) {
        let mut fresh: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for rule in rules {
            for source in rule.effective_sources() {
                let ids = fresh.entry(source.key()).or_default();
                if !ids.iter().any(|id| id == &rule.id) {
                    ids.push(rule.id.clone());
                }
            }
        }
        *self.entries.write() = fresh;
    }

    /// Exact-key lookup
    pub fn lookup(&self, key: &str) -> Vec<String> {
        self.entries.read().get(key).cloned().unwrap_or_default()
    }

    /// Number of indexed point keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Keys consumed by more than one rule, sorted by key
    pub fn shared_sources(&self) -> Vec<SharedSourceInfo> {
        let entries = self.entries.read();
        let mut shared: Vec<SharedSourceInfo> = entries
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(key, ids)| SharedSourceInfo {
                source_id: key.clone(),
                subscribers: ids.clone(),
                subscriber_count: ids.len(),
            })
            .collect();
        shared.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        shared
    }
}

// ============================================================================
// Rule store
// ============================================================================

/// Rule ID -> definition
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<FxHashMap<String, Arc<Rule>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a batch of rules; existing IDs are replaced, others kept
    pub fn extend(&self, rules: Vec<Rule>) -> usize {
        let mut store = self.rules.write();
        let count = rules.len();
        for rule in rules {
            store.insert(rule.id.clone(), Arc::new(rule));
        }
        count
    }

    /// Insert or replace, returning the previous definition
    pub fn upsert(&self, rule: Rule) -> Option<Arc<Rule>> {
        self.rules.write().insert(rule.id.clone(), Arc::new(rule))
    }

    pub fn remove(&self, rule_id: &str) -> Option<Arc<Rule>> {
        self.rules.write().remove(rule_id)
    }

    pub fn get(&self, rule_id: &str) -> Option<Arc<Rule>> {
        self.rules.read().get(rule_id).cloned()
    }

    /// Resolve IDs in order, skipping unknown ones
    pub fn get_many(&self, rule_ids: &[String]) -> Vec<Arc<Rule>> {
        let rules = self.rules.read();
        rule_ids.iter().filter_map(|id| rules.get(id).cloned()).collect()
    }

    /// All rules sorted by ID
    pub fn all(&self) -> Vec<Arc<Rule>> {
        let mut all: Vec<Arc<Rule>> = self.rules.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
