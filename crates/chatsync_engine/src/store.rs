//! Persistence collaborator interface.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Table holding message rows.
pub const MESSAGES_TABLE: &str = "messages";

/// A single column constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals the given value.
    Eq(String, Value),
    /// Column is null.
    IsNull(String),
}

/// Conjunction of column constraints applied to a table.
///
/// Equality and is-null are all the delivery-state queries need; the
/// engine owns no schema beyond that.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Predicate {
    filters: Vec<Filter>,
}

impl Predicate {
    /// Creates an empty predicate that matches every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality constraint.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.into(), value.into()));
        self
    }

    /// Adds an is-null constraint.
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.filters.push(Filter::IsNull(column.into()));
        self
    }

    /// Returns the constraints in order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns true if the row object satisfies every constraint.
    ///
    /// A missing column counts as null, matching SQL `IS NULL` semantics
    /// over sparse rows.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(obj) = row.as_object() else {
            return false;
        };
        self.filters.iter().all(|filter| match filter {
            Filter::Eq(column, value) => obj.get(column) == Some(value),
            Filter::IsNull(column) => obj.get(column).is_none_or(Value::is_null),
        })
    }

    /// Normalized JSON rendering, used to derive request cache keys.
    pub fn to_params(&self) -> Value {
        let mut params = Map::new();
        for filter in &self.filters {
            match filter {
                Filter::Eq(column, value) => {
                    params.insert(column.clone(), json!({ "eq": value }));
                }
                Filter::IsNull(column) => {
                    params.insert(column.clone(), json!({ "is": Value::Null }));
                }
            }
        }
        Value::Object(params)
    }
}

/// The persistence collaborator.
///
/// Implementations wrap whatever hosted backend stores the message rows.
/// The engine issues only these three operations, always through the
/// request coordinator.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts a row and returns the stored row.
    async fn insert(&self, table: &str, row: Value) -> SyncResult<Value>;

    /// Updates every row matching the predicate. Returns the affected count.
    async fn update(&self, table: &str, predicate: &Predicate, patch: Value) -> SyncResult<u64>;

    /// Selects every row matching the predicate.
    async fn select(&self, table: &str, predicate: &Predicate) -> SyncResult<Vec<Value>>;
}

/// In-memory store for tests.
///
/// Counts calls per operation so tests can assert idempotence and
/// deduplication, and can be told to fail writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    insert_calls: AtomicU64,
    update_calls: AtomicU64,
    select_calls: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `insert` calls so far.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of `update` calls so far.
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `select` calls so far.
    pub fn select_calls(&self) -> u64 {
        self.select_calls.load(Ordering::SeqCst)
    }

    /// Makes subsequent inserts and updates fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Inserts a row without counting the call (test fixture setup).
    pub fn seed(&self, table: &str, row: Value) {
        self.tables.lock().entry(table.to_owned()).or_default().push(row);
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, table: &str, row: Value) -> SyncResult<Value> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store("write refused".into()));
        }
        self.tables
            .lock()
            .entry(table.to_owned())
            .or_default()
            .push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, predicate: &Predicate, patch: Value) -> SyncResult<u64> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Store("write refused".into()));
        }
        let Some(patch) = patch.as_object().cloned() else {
            return Err(SyncError::Store("patch must be an object".into()));
        };

        let mut tables = self.tables.lock();
        let mut affected = 0;
        if let Some(rows) = tables.get_mut(table) {
            for row in rows.iter_mut().filter(|row| predicate.matches(row)) {
                if let Some(obj) = row.as_object_mut() {
                    for (column, value) in &patch {
                        obj.insert(column.clone(), value.clone());
                    }
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn select(&self, table: &str, predicate: &Predicate) -> SyncResult<Vec<Value>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| predicate.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
