//! Default `Tell`/`Listen` handling.
//!
//! `Tell` just appends to the current task's log, the same privileged-access
//! reasoning as `state.rs`: the log lives on the scheduler's `TaskEntry`, not
//! anywhere a boxed `HandlerFn` closure could reach. `Listen` needs a nested
//! sub-run the same way `Eval` does (see `evaluator::run_nested`), except it
//! reports back only the entries *that sub-run* produced rather than the
//! whole task's accumulated log.

use std::sync::Arc;

use crate::doctrl::DoCtrl;
use crate::effects::{LogEntry, ListenResult};
use crate::evaluator::{self, Outcome, Signal, TaskState, Vm};
use crate::value::Value;

pub(crate) fn native_tell(vm: &Arc<Vm>, state: &mut TaskState, entry: LogEntry) -> Signal {
    evaluator::append_log(vm, state, entry);
    evaluator::pure_next(state, Value::Unit)
}

pub(crate) fn native_listen(vm: &Arc<Vm>, state: &mut TaskState, program: DoCtrl) -> Signal {
    let (outcome, new_store, log) = evaluator::run_nested(vm, state, program);
    evaluator::set_store(state, new_store);
    match outcome {
        Outcome::Value(v) => {
            let result = ListenResult {
                value: v,
                log: Arc::new(log),
            };
            evaluator::pure_next(state, Value::opaque(result))
        }
        Outcome::Failure(f) => evaluator::fail_next(state, f.error),
    }
}
