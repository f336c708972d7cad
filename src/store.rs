//! The state scope `S`.
//!
//! Unlike `Env`, `Store` is not lexically scoped — `Get`/`Put`/`Modify`
//! mutate it in place for the remainder of the run (or the task, since a
//! spawned task works on its own clone, see `scheduler.rs`). It is kept as
//! an immutable snapshot (`Arc<HashMap<..>>`) so that `Task::spawn` can hand
//! a child task a cheap, independent copy-on-write clone without the parent
//! observing the child's writes (invariant 6/7).

use std::collections::HashMap;
use std::sync::Arc;

use crate::value::Value;

/// A persistent keyed store. Writes produce a new `Store` value; callers
/// thread the returned value back into the evaluator's state tuple the same
/// way a CESK machine threads its store component.
#[derive(Clone, Debug, Default)]
pub struct Store {
    table: Arc<HashMap<String, Value>>,
}

impl Store {
    pub fn new() -> Self {
        Store {
            table: Arc::new(HashMap::new()),
        }
    }

    pub fn from_map(map: HashMap<String, Value>) -> Self {
        Store {
            table: Arc::new(map),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.table.get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: Value) -> Store {
        let mut new_table = (*self.table).clone();
        new_table.insert(key.into(), value);
        Store {
            table: Arc::new(new_table),
        }
    }

    /// `Modify(key, f)`: apply `f` to the current value (or `Value::Unit` if
    /// absent) and store the result. Atomic per invariant 5: if `f` returns
    /// `Err`, `self` is returned unchanged.
    pub fn modify<E>(
        &self,
        key: &str,
        f: impl FnOnce(Value) -> Result<Value, E>,
    ) -> Result<Store, E> {
        let current = self.get(key).unwrap_or(Value::Unit);
        let next = f(current)?;
        Ok(self.put(key, next))
    }

    /// Isolated snapshot for a newly spawned task: clones the current `S`.
    /// Cheap: just bumps the `Arc` refcount of the underlying table; the
    /// first write in either branch clones the map.
    pub fn snapshot(&self) -> Store {
        self.clone()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let s = Store::new().put("k", Value::Int(7));
        assert_eq!(s.get("k"), Some(Value::Int(7)));
    }

    #[test]
    fn modify_atomicity_leaves_store_unchanged_on_error() {
        let s = Store::new().put("k", Value::Int(1));
        let result: Result<Store, &str> = s.modify("k", |_| Err("boom"));
        assert!(result.is_err());
        assert_eq!(s.get("k"), Some(Value::Int(1)));
    }

    #[test]
    fn modify_applies_transform_on_success() {
        let s = Store::new().put("k", Value::Int(1));
        let s2 = s
            .modify("k", |v| {
                let Value::Int(n) = v else { unreachable!() };
                Ok::<_, ()>(Value::Int(n + 1))
            })
            .unwrap();
        assert_eq!(s2.get("k"), Some(Value::Int(2)));
        assert_eq!(s.get("k"), Some(Value::Int(1)));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let s = Store::new().put("k", Value::Int(0));
        let snapshot = s.snapshot();
        let s2 = s.put("k", Value::Int(100));
        assert_eq!(snapshot.get("k"), Some(Value::Int(0)));
        assert_eq!(s2.get("k"), Some(Value::Int(100)));
    }

    #[test]
    fn missing_key_reads_as_none() {
        let s = Store::new();
        assert_eq!(s.get("absent"), None);
    }
}
