//! Variable store scoped to one plan execution.

use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value};

/// Top-level key under which step results are namespaced (`result.<step>`).
pub const RESULT_NAMESPACE: &str = "result";

/// Name-to-value bindings for a run.
///
/// Workers read concurrently; the scheduler thread is the only writer.
#[derive(Debug, Default)]
pub struct VariableStore {
    vars: RwLock<Map<String, Value>>,
}

impl VariableStore {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self {
            vars: RwLock::new(initial),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.read(|vars| vars.get(name).cloned())
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
        vars.insert(name.into(), value);
    }

    /// Run `f` against the bindings under the read lock.
    pub fn read<T>(&self, f: impl FnOnce(&Map<String, Value>) -> T) -> T {
        let vars = self.vars.read().unwrap_or_else(PoisonError::into_inner);
        f(&vars)
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.read(Clone::clone)
    }

    /// Publish a completed step: `result.<id>` gets `meta` plus `fields`, and each
    /// field is mirrored as the legacy key `<id>_<field>`.
    pub fn record_step(&self, step_id: &str, meta: Map<String, Value>, fields: Map<String, Value>) {
        let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
        for (name, value) in &fields {
            vars.insert(format!("{step_id}_{name}"), value.clone());
        }
        let mut entry = meta;
        entry.extend(fields);
        let results = vars
            .entry(RESULT_NAMESPACE)
            .or_insert_with(|| Value::Object(Map::new()));
        if !results.is_object() {
            *results = Value::Object(Map::new());
        }
        if let Value::Object(results) = results {
            results.insert(step_id.to_string(), Value::Object(entry));
        }
    }

    /// Set one field of `result.<step_id>` (and its legacy key), keeping the rest.
    pub fn record_field(&self, step_id: &str, name: &str, value: Value) {
        let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
        vars.insert(format!("{step_id}_{name}"), value.clone());
        let results = vars
            .entry(RESULT_NAMESPACE)
            .or_insert_with(|| Value::Object(Map::new()));
        if !results.is_object() {
            *results = Value::Object(Map::new());
        }
        if let Value::Object(results) = results {
            let entry = results
                .entry(step_id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(entry) = entry {
                entry.insert(name.to_string(), value);
            }
        }
    }

    pub fn step_result(&self, step_id: &str) -> Option<Value> {
        self.read(|vars| {
            vars.get(RESULT_NAMESPACE)
                .and_then(|results| results.get(step_id))
                .cloned()
        })
    }

    /// Child store for one loop iteration: a copy of the current bindings plus `extra`.
    pub fn child(&self, extra: Map<String, Value>) -> VariableStore {
        let mut vars = self.snapshot();
        vars.extend(extra);
        VariableStore::new(vars)
    }
}
