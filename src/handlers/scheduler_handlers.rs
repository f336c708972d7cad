//! Default scheduler-effect handling.
//!
//! Every family here needs the scheduler tables directly — `Spawn` must
//! register a new `TaskEntry`, `Wait`/`Gather`/`Race` must park the *current*
//! task as a waiter and potentially suspend the whole trampoline slice — none
//! of which an ordinary `HandlerFn` closure (just `(Effect, K) -> DoCtrl`)
//! has any way to reach. `evaluator.rs` exposes the handful of privileged
//! helpers (`push_child_task`, `gather_or_block`,...) this module calls.

use std::sync::Arc;

use crate::evaluator::{self, Signal, TaskState, Vm};
use crate::external_promise::ExternalPromise;
use crate::scheduler::{Completion, PromiseId, SemaphoreId, TaskHandle, TaskId, WaitHandle};
use crate::doctrl::DoCtrl;
use crate::value::{SourceContext, Value};

pub(crate) fn native_spawn(
    vm: &Arc<Vm>,
    state: &mut TaskState,
    program: DoCtrl,
    context: Option<SourceContext>,
) -> Signal {
    let id = evaluator::push_child_task(vm, state, program, context);
    evaluator::pure_next(state, Value::opaque(TaskHandle { id }))
}

pub(crate) fn native_wait(vm: &Arc<Vm>, state: &mut TaskState, handle: WaitHandle) -> Signal {
    evaluator::wait_or_block(vm, state, handle)
}

pub(crate) fn native_gather(vm: &Arc<Vm>, state: &mut TaskState, handles: Vec<WaitHandle>) -> Signal {
    evaluator::gather_or_block(vm, state, handles)
}

pub(crate) fn native_race(vm: &Arc<Vm>, state: &mut TaskState, handles: Vec<WaitHandle>) -> Signal {
    evaluator::race_or_block(vm, state, handles)
}

pub(crate) fn native_create_promise(vm: &Arc<Vm>, state: &mut TaskState) -> Signal {
    let entry = vm.scheduler.create_promise(false);
    evaluator::pure_next(state, Value::opaque(crate::scheduler::PromiseHandle { id: entry.id }))
}

pub(crate) fn native_complete_promise(
    vm: &Arc<Vm>,
    state: &mut TaskState,
    promise: PromiseId,
    value: Value,
) -> Signal {
    match vm.scheduler.resolve_promise(promise, Completion::Value(value)) {
        Ok(()) => evaluator::pure_next(state, Value::Unit),
        Err(e) => evaluator::fail_next(state, e),
    }
}

pub(crate) fn native_fail_promise(
    vm: &Arc<Vm>,
    state: &mut TaskState,
    promise: PromiseId,
    error: crate::error::VmError,
) -> Signal {
    match vm.scheduler.resolve_promise(promise, Completion::Error(error)) {
        Ok(()) => evaluator::pure_next(state, Value::Unit),
        Err(e) => evaluator::fail_next(state, e),
    }
}

pub(crate) fn native_create_external_promise(vm: &Arc<Vm>, state: &mut TaskState) -> Signal {
    let entry = vm.scheduler.create_promise(true);
    let ext = ExternalPromise::new(entry.id, vm.scheduler.external_channel.clone());
    evaluator::pure_next(state, Value::opaque(ext))
}

pub(crate) fn native_create_semaphore(vm: &Arc<Vm>, state: &mut TaskState, permits: i64) -> Signal {
    match vm.scheduler.create_semaphore(permits) {
        Ok(entry) => evaluator::pure_next(state, Value::opaque(crate::scheduler::SemaphoreHandle { id: entry.id })),
        Err(e) => evaluator::fail_next(state, e),
    }
}

pub(crate) fn native_acquire(vm: &Arc<Vm>, state: &mut TaskState, semaphore: SemaphoreId) -> Signal {
    evaluator::acquire_or_block(vm, state, semaphore)
}

pub(crate) fn native_release(vm: &Arc<Vm>, state: &mut TaskState, semaphore: SemaphoreId) -> Signal {
    match vm.scheduler.release(semaphore) {
        Ok(_woken) => evaluator::pure_next(state, Value::Unit),
        Err(e) => evaluator::fail_next(state, e),
    }
}

pub(crate) fn native_cancel(vm: &Arc<Vm>, state: &mut TaskState, task: TaskId) -> Signal {
    let cancelled = vm.scheduler.cancel_task(task);
    evaluator::pure_next(state, Value::Bool(cancelled))
}
