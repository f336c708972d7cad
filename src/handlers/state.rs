//! Default `Get`/`Put`/`Modify` handling.
//!
//! Unlike `Ask`, these need no nested evaluation — `Store` is already a
//! plain persistent map the evaluator owns directly — but they're native
//! (rather than an ordinary installed `HandlerFn`) for the same reason as
//! every family in this module: a boxed handler closure has no way to reach
//! `TaskState::store` at all.

use std::sync::Arc;

use crate::evaluator::{self, Signal, TaskState};
use crate::value::Value;

pub(crate) fn native_get(state: &mut TaskState, key: &str) -> Signal {
    let v = evaluator::store_get(state, key).unwrap_or(Value::Unit);
    evaluator::pure_next(state, v)
}

pub(crate) fn native_put(state: &mut TaskState, key: String, value: Value) -> Signal {
    evaluator::store_put(state, key, value);
    evaluator::pure_next(state, Value::Unit)
}

pub(crate) fn native_modify(
    state: &mut TaskState,
    key: &str,
    transform: Arc<dyn Fn(Value) -> Result<Value, crate::error::VmError> + Send + Sync>,
) -> Signal {
    match evaluator::store_modify(state, key, |v| transform(v)) {
        Ok(()) => evaluator::pure_next(state, Value::Unit),
        Err(e) => evaluator::fail_next(state, e),
    }
}
