//! Default reference handlers — provided as reference handlers, not core.
//! Each family here needs privileged access to `TaskState`/`Vm` that an
//! ordinary `HandlerFn` closure never receives (direct `Store` mutation, the
//! scheduler tables, the nested-run machinery for `Ask`'s lazy forcing), so
//! they're wired in as a last resort once the ordinary handler stack search
//! in `evaluator::perform` comes up empty: default handlers sit at the
//! bottom.
//!
//! [`native_dispatch`] is that last resort: it downcasts the effect payload
//! against every family below in turn. `None` means truly unhandled, which
//! `evaluator::perform` turns into `VmError::UnhandledEffect`.

mod reader;
mod scheduler_handlers;
mod state;
mod writer;

use std::sync::Arc;

use crate::evaluator::{Signal, TaskState, Vm};
use crate::value::Effect;

pub(crate) fn native_dispatch(vm: &Arc<Vm>, state: &mut TaskState, effect: &Effect) -> Option<Signal> {
    use crate::effects::*;

    if let Some(ask) = effect.downcast::<Ask>() {
        return Some(reader::native_ask(vm, state, ask.key.clone()));
    }
    if let Some(get) = effect.downcast::<Get>() {
        return Some(state::native_get(state, &get.key));
    }
    if let Some(put) = effect.downcast::<Put>() {
        return Some(state::native_put(state, put.key.clone(), put.value.clone()));
    }
    if let Some(modify) = effect.downcast::<Modify>() {
        return Some(state::native_modify(state, &modify.key, modify.transform.clone()));
    }
    if let Some(tell) = effect.downcast::<Tell>() {
        return Some(writer::native_tell(vm, state, tell.entry.clone()));
    }
    if let Some(listen) = effect.downcast::<Listen>() {
        return Some(writer::native_listen(vm, state, listen.take_program()));
    }
    if let Some(spawn) = effect.downcast::<Spawn>() {
        return Some(scheduler_handlers::native_spawn(
                vm,
                state,
                spawn.take_program(),
                effect.context.clone(),
        ));
    }
    if let Some(wait) = effect.downcast::<Wait>() {
        return Some(scheduler_handlers::native_wait(vm, state, wait.handle));
    }
    if let Some(gather) = effect.downcast::<Gather>() {
        return Some(scheduler_handlers::native_gather(vm, state, gather.handles.clone()));
    }
    if let Some(race) = effect.downcast::<Race>() {
        return Some(scheduler_handlers::native_race(vm, state, race.handles.clone()));
    }
    if effect.downcast::<CreatePromise>().is_some() {
        return Some(scheduler_handlers::native_create_promise(vm, state));
    }
    if let Some(complete) = effect.downcast::<CompletePromiseEffect>() {
        return Some(scheduler_handlers::native_complete_promise(
                vm,
                state,
                complete.promise,
                complete.value.clone(),
        ));
    }
    if let Some(fail) = effect.downcast::<FailPromiseEffect>() {
        return Some(scheduler_handlers::native_fail_promise(
                vm,
                state,
                fail.promise,
                fail.error.clone(),
        ));
    }
    if effect.downcast::<CreateExternalPromise>().is_some() {
        return Some(scheduler_handlers::native_create_external_promise(vm, state));
    }
    if let Some(sem) = effect.downcast::<CreateSemaphore>() {
        return Some(scheduler_handlers::native_create_semaphore(vm, state, sem.permits));
    }
    if let Some(acq) = effect.downcast::<Acquire>() {
        return Some(scheduler_handlers::native_acquire(vm, state, acq.semaphore));
    }
    if let Some(rel) = effect.downcast::<Release>() {
        return Some(scheduler_handlers::native_release(vm, state, rel.semaphore));
    }
    if let Some(cancel) = effect.downcast::<CancelTask>() {
        return Some(scheduler_handlers::native_cancel(vm, state, cancel.task));
    }
    if let Some(await_eff) = effect.downcast::<crate::await_bridge::Await>() {
        return Some(crate::await_bridge::native_await(vm, state, await_eff));
    }
    None
}
