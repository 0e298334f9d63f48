//! Named function registry.
//!
//! Map, reduce, validation, and changes-filter functions are plain Rust
//! closures registered under a name. The registry is never persisted; an
//! application re-registers its functions at startup. Callbacks must be
//! synchronous and must not call back into the store.

use crate::revision::{Body, Revision};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collects the key/value pairs emitted by one map invocation.
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    pub(crate) fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Emits one index row.
    pub fn emit(&mut self, key: Value, value: Value) {
        self.rows.push((key, value));
    }

    pub(crate) fn into_rows(self) -> Vec<(Value, Value)> {
        self.rows
    }
}

/// A view's map function: called once per (current, non-deleted) revision
/// body; emits zero or more index rows.
pub type MapFunction = Arc<dyn Fn(&Body, &mut Emitter) + Send + Sync>;

/// A view's reduce function.
///
/// Called with `rereduce = false` over raw emitted keys/values, and with
/// `rereduce = true` when combining previously reduced partial results
/// (`keys` is empty in that case). Implementations must tolerate both.
pub type ReduceFunction = Arc<dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync>;

/// A document validation function: inspects the incoming revision and the
/// revision it replaces; an `Err` message rejects the write as forbidden.
pub type ValidateFunction =
    Arc<dyn Fn(&Revision, Option<&Revision>) -> Result<(), String> + Send + Sync>;

/// A changes-feed filter predicate.
pub type ChangesFilter = Arc<dyn Fn(&Revision) -> bool + Send + Sync>;

/// Name-keyed registry of user functions.
///
/// Validations iterate in name order so that rejection behavior is
/// deterministic.
pub struct FunctionRegistry {
    validations: RwLock<BTreeMap<String, ValidateFunction>>,
    filters: RwLock<BTreeMap<String, ChangesFilter>>,
    reduces: RwLock<BTreeMap<String, ReduceFunction>>,
}

impl FunctionRegistry {
    /// Creates a registry with the built-in `_count` and `_sum` reduces.
    pub fn new() -> Self {
        let registry = Self {
            validations: RwLock::new(BTreeMap::new()),
            filters: RwLock::new(BTreeMap::new()),
            reduces: RwLock::new(BTreeMap::new()),
        };
        registry.set_reduce("_count", builtin_count());
        registry.set_reduce("_sum", builtin_sum());
        registry
    }

    /// Registers (or replaces) a validation function.
    pub fn set_validation(&self, name: impl Into<String>, f: ValidateFunction) {
        self.validations.write().insert(name.into(), f);
    }

    /// Removes a validation function.
    pub fn remove_validation(&self, name: &str) {
        self.validations.write().remove(name);
    }

    /// Runs every registered validation in name order.
    ///
    /// Returns the first rejection message, if any.
    pub fn validate(
        &self,
        new_rev: &Revision,
        prev_rev: Option<&Revision>,
    ) -> Result<(), String> {
        for f in self.validations.read().values() {
            f(new_rev, prev_rev)?;
        }
        Ok(())
    }

    /// Registers (or replaces) a changes filter.
    pub fn set_filter(&self, name: impl Into<String>, f: ChangesFilter) {
        self.filters.write().insert(name.into(), f);
    }

    /// Looks up a changes filter by name.
    pub fn filter(&self, name: &str) -> Option<ChangesFilter> {
        self.filters.read().get(name).cloned()
    }

    /// Registers (or replaces) a named reduce function.
    pub fn set_reduce(&self, name: impl Into<String>, f: ReduceFunction) {
        self.reduces.write().insert(name.into(), f);
    }

    /// Looks up a reduce function by name (`_count` and `_sum` are built
    /// in).
    pub fn reduce(&self, name: &str) -> Option<ReduceFunction> {
        self.reduces.read().get(name).cloned()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The `_count` reduce: row count, summed on rereduce.
pub fn builtin_count() -> ReduceFunction {
    Arc::new(|_keys: &[Value], values: &[Value], rereduce: bool| {
        if rereduce {
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            number(total)
        } else {
            number(values.len() as f64)
        }
    })
}

/// The `_sum` reduce: numeric sum of values; non-numeric values count as
/// zero. Identical in both reduce phases.
pub fn builtin_sum() -> ReduceFunction {
    Arc::new(|_keys: &[Value], values: &[Value], _rereduce: bool| {
        let total: f64 = values.iter().filter_map(Value::as_f64).sum();
        number(total)
    })
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
