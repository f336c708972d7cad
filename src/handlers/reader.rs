//! Default `Ask`/`Local` handling.
//!
//! `Local` itself needs no native handler — it's a plain `Env` scope push
//! reduced directly in `evaluator::reduce`. Only `Ask` needs privileged
//! access: forcing a lazy binding may itself need to run CESK reduction
//! (`env::Env::ask`'s `force` callback), which only the evaluator can do.

use std::sync::Arc;

use crate::env::EnvKey;
use crate::evaluator::{self, Outcome, Signal, TaskState, Vm};

pub(crate) fn native_ask(vm: &Arc<Vm>, state: &mut TaskState, key: EnvKey) -> Signal {
    let env = evaluator::env(state).clone();
    let store = state.store().clone();
    let h = evaluator::handler_stack(state).clone();
    let intercepts = evaluator::intercepts(state).clone();
    let task_id = evaluator::task_id(state);
    let vm2 = vm.clone();

    // Forcing a lazy cell runs as a nested, blocking sub-task on the same
    // scheduler (see DESIGN.md "nested Eval/Listen execution model"); any
    // Store writes the forced expression performs aren't threaded back into
    // `state`, only its resulting value.
    let env_for_force = env.clone();
    let result = env.ask(&key, move |expr| {
            let (outcome, _store, _log) = vm2.run_program(
                expr,
                env_for_force,
                store.clone(),
                h.clone(),
                intercepts.clone(),
                Some(task_id),
                None,
            );
            match outcome {
                Outcome::Value(v) => Ok(v),
                Outcome::Failure(f) => Err(f.error),
            }
    });

    match result {
        Ok(v) => evaluator::pure_next(state, v),
        Err(e) => evaluator::fail_next(state, e),
    }
}
