//! The CESK trampoline: the hardest part of the runtime.
//!
//! `Control`/`Env`/`Store`/`Continuation`/`HandlerNode` are the five CESK
//! components; this module is the `step` function that reduces one of them
//! at a time and the per-task driver (`drive_task`) that repeats `step`
//! until a task reaches `Done`, `Failed`, or needs to block on the
//! scheduler. No reduction here ever recurses into the host call stack for
//! user-level looping — `Expand`'s generators and `Gather`/`Race`'s waits
//! all thread back through the ready queue instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::continuation::{ContinuationObj, ContinuationRef, Continuation, Frame, PromptId, ScopeSignature};
use crate::doctrl::DoCtrl;
use crate::env::Env;
use crate::error::{Failure, VmError};
use crate::generator::{EffectProgram, GenInput, GenStep};
use crate::handler::{self, DispatchCtx, HandlerFrame, HandlerMode, HandlerNode};
use crate::handlers;
use crate::interceptor::{InterceptId, InterceptOutcome, InterceptorNode};
use crate::scheduler::{
    Completion, PendingProgram, Scheduler, TaskId, WaitHandle,
};
use crate::store::Store;
use crate::traceback::{HandlerOutcomeMark, TraceEntry, Traceback};
use crate::value::{Effect, SourceContext, Value};

static DISPATCH_COUNTER: AtomicU64 = AtomicU64::new(1);

fn fresh_dispatch_id() -> u64 {
    DISPATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// `C`, as actually threaded through the trampoline: either a `DoCtrl` still
/// to reduce, or an in-flight failure unwinding through `K`. Kept
/// separate from the public `DoCtrl` type since user/handler code never
/// constructs a "currently failing" control expression directly — it's
/// produced only by a `Call`/`Expand`/generator raising, or `Delegate`/dispatch
/// finding nothing.
enum Control {
    Expr(DoCtrl),
    Failing(VmError),
}

/// One task's full CESK state, parked in `Vm::blocked` while waiting on the
/// scheduler and otherwise owned by whichever call to `drive_task` is
/// currently stepping it.
pub struct TaskState {
    pub task_id: TaskId,
    control: Control,
    env: Arc<Env>,
    store: Store,
    k: Continuation,
    h: Arc<HandlerNode>,
    intercepts: Arc<InterceptorNode>,
    /// Side stack mirroring the nesting of in-flight dispatch rounds.
    /// `Frame::DispatchRestore` pops one level when reached by ordinary
    /// bubbling; `Transfer` pops it directly since it discards the frame
    /// that would otherwise have popped it.
    dispatch_stack: Vec<Arc<DispatchCtx>>,
    /// Ids of interceptors whose effectful replacement program is currently
    /// running somewhere on this task (spec §4.5 non-reentry). Consulted by
    /// `perform`'s call into `InterceptorNode::apply` alongside the
    /// per-effect exemption, since a replacement program typically performs
    /// brand-new effects that never inherit the original effect's exempt set.
    interceptor_guard: HashSet<InterceptId>,
    trace: Traceback,
}

impl TaskState {
    fn fresh(task_id: TaskId, program: DoCtrl, env: Arc<Env>, store: Store, h: Arc<HandlerNode>, intercepts: Arc<InterceptorNode>) -> Self {
        TaskState {
            task_id,
            control: Control::Expr(program),
            env,
            store,
            k: Continuation::new(),
            h,
            intercepts,
            dispatch_stack: Vec::new(),
            interceptor_guard: HashSet::new(),
            trace: Traceback::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// What a task reports back to whoever is waiting on it. `pub(crate)` so
/// `handlers::native_dispatch` can hand reductions straight back to the
/// trampoline instead of going through a parallel outcome type.
pub(crate) enum Signal {
    Continue,
    Done(Value),
    Failed(Failure),
    Block(PendingWait),
}

/// Bookkeeping kept alongside a blocked task's saved `TaskState` describing
/// what would unblock it and how to interpret the wakeup `Wait`/
/// `Gather`/`Race`).
pub(crate) enum PendingWait {
    Single,
    Gather {
        handles: Vec<WaitHandle>,
        results: Vec<Option<Completion>>,
    },
    Race {
        handles: Vec<WaitHandle>,
    },
}

struct Blocked {
    state: TaskState,
    wait: PendingWait,
}

/// The outcome a finished top-level (or nested `Eval`) run reports.
pub enum Outcome {
    Value(Value),
    Failure(Failure),
}

/// Drives CESK state machines across however many tasks a run spawns,
/// sharing one `Scheduler`. A single `Vm` is created per `run()`/`async_run()`
/// call (see `run.rs`) and also used re-entrantly by `Eval`/`Listen`'s nested
/// sub-executions, which register as ordinary tasks on the same scheduler
/// rather than as a separate machine (see DESIGN.md "nested Eval/Listen
/// execution model").
pub struct Vm {
    pub scheduler: Arc<Scheduler>,
    blocked: Mutex<HashMap<TaskId, Blocked>>,
    /// Tracebacks for failed tasks, kept out-of-band since `Scheduler`'s
    /// `Completion::Error` only carries the bare `VmError` (the
    /// traceback is an evaluator-level artifact, not scheduler bookkeeping).
    traces: Mutex<HashMap<TaskId, Traceback>>,
    /// Set by `async_run` so `Await` (see `await_bridge.rs`) can hand host
    /// futures to a real event loop instead of blocking the trampoline on
    /// them. `None` under `run()`, which falls back to driving awaited
    /// futures to completion synchronously.
    rt_handle: Mutex<Option<tokio::runtime::Handle>>,
}

impl Vm {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Vm> {
        Arc::new(Vm {
                scheduler,
                blocked: Mutex::new(HashMap::new()),
                traces: Mutex::new(HashMap::new()),
                rt_handle: Mutex::new(None),
        })
    }

    pub fn set_runtime_handle(&self, handle: tokio::runtime::Handle) {
        *self.rt_handle.lock().unwrap() = Some(handle);
    }

    pub(crate) fn runtime_handle(&self) -> Option<tokio::runtime::Handle> {
        self.rt_handle.lock().unwrap().clone()
    }

    /// Spawns `program` as a new task (or the root task, when `parent` is
    /// `None`) and drives the shared scheduler until that specific task
    /// reaches `Done`/`Failed`/`Cancelled`. Used both by `run.rs`'s top-level
    /// entry point and by `Eval`/`Listen` reductions, which need "run this
    /// to completion and give me the value back" without escaping the
    /// delimited-continuation machinery of the *caller's* task.
    pub fn run_program(
        self: &Arc<Vm>,
        program: DoCtrl,
        env: Arc<Env>,
        store: Store,
        h: Arc<HandlerNode>,
        intercepts: Arc<InterceptorNode>,
        parent: Option<TaskId>,
        spawn_context: Option<SourceContext>,
    ) -> (Outcome, Store, Vec<crate::effects::LogEntry>) {
        let entry = self.scheduler.spawn_task(
            parent,
            store,
            spawn_context,
            PendingProgram { program, env, h, intercepts },
        );
        let task_id = entry.id;
        self.drive_until(task_id);
        let traceback = self.traces.lock().unwrap().remove(&task_id).unwrap_or_default();
        let outcome = match entry.result.lock().unwrap().clone() {
            Some(Completion::Value(v)) => Outcome::Value(v),
            Some(Completion::Error(e)) => Outcome::Failure(Failure::new(e, traceback)),
            Some(Completion::Cancelled) => Outcome::Failure(Failure::new(
                    VmError::TaskCancelledError { task_id: task_id.0 },
                    traceback,
            )),
            None => Outcome::Failure(Failure::new(VmError::Deadlock { waiting_tasks: 0 }, traceback)),
        };
        let final_store = entry.store.lock().unwrap().clone();
        let log = entry.log.lock().unwrap().clone();
        (outcome, final_store, log)
    }

    /// The scheduling pump: repeatedly drives whatever task is ready,
    /// draining the external-promise channel or blocking on it when nothing
    /// else is runnable, until `target` has a recorded result.
    fn drive_until(self: &Arc<Vm>, target: TaskId) {
        loop {
            if let Some(entry) = self.scheduler.tasks.get(&target) {
                if entry.result.lock().unwrap().is_some() {
                    return;
                }
            } else {
                return;
            }
            match self.scheduler.pop_ready() {
                Some((task_id, resume)) => self.drive_task(task_id, resume),
                None => {
                    let drained = self.scheduler.external_channel.drain(&self.scheduler, 32);
                    if drained > 0 {
                        continue;
                    }
                    if self.scheduler.has_ready() {
                        continue;
                    }
                    if self.has_external_wait() {
                        if !self.scheduler.external_channel.blocking_recv_into(&self.scheduler) {
                            self.fail_all_waiting(VmError::Deadlock { waiting_tasks: 1 });
                            return;
                        }
                        continue;
                    }
                    if self.scheduler.is_deadlocked() {
                        let waiting = self.scheduler.task_count();
                        self.fail_all_waiting(VmError::Deadlock { waiting_tasks: waiting });
                        return;
                    }
                    // Nothing ready, nothing waiting, target not yet resolved:
                    // only reachable if `target` itself was never spawned.
                    return;
                }
            }
        }
    }

    fn has_external_wait(&self) -> bool {
        self.scheduler.promises.iter().any(|kv| {
                kv.value().external && kv.value().completed.lock().unwrap().is_none() && {
                    !kv.value().waiters.lock().unwrap().is_empty()
                }
        })
    }

    fn fail_all_waiting(self: &Arc<Vm>, err: VmError) {
        let blocked_ids: Vec<TaskId> = self.blocked.lock().unwrap().keys().copied().collect();
        for task_id in blocked_ids {
            let Some(Blocked { mut state, .. }) = self.blocked.lock().unwrap().remove(&task_id) else {
                continue;
            };
            let failure = Failure::new(err.clone(), std::mem::take(&mut state.trace));
            self.finish(task_id, Signal::Failed(failure), state);
        }
    }

    /// Runs one task until it blocks or finishes, starting it fresh from its
    /// `PendingProgram` the first time, or resuming its saved `TaskState`
    /// (applying `resume`, the wakeup outcome) on subsequent visits.
    fn drive_task(self: &Arc<Vm>, task_id: TaskId, resume: Option<Completion>) {
        let mut state = match self.blocked.lock().unwrap().remove(&task_id) {
            Some(Blocked { mut state, wait }) => {
                if !self.apply_wakeup(&mut state, wait, resume) {
                    // Still pending (e.g. a Gather with stragglers); re-parked
                    // inside apply_wakeup already.
                    return;
                }
                state
            }
            None => {
                let Some(entry) = self.scheduler.tasks.get(&task_id) else {
                    return;
                };
                let Some(pending) = entry.pending.lock().unwrap().take() else {
                    return;
                };
                let store = entry.store.lock().unwrap().clone();
                TaskState::fresh(task_id, pending.program, pending.env, store, pending.h, pending.intercepts)
            }
        };

        loop {
            *self.scheduler.tasks.get(&task_id).unwrap().status.lock().unwrap() = crate::scheduler::TaskStatus::Running;
            let signal = step(self, &mut state);
            match signal {
                Signal::Continue => continue,
                Signal::Block(wait) => {
                    *self.scheduler.tasks.get(&task_id).unwrap().status.lock().unwrap() =
                    crate::scheduler::TaskStatus::Waiting(WaitHandle::Task(task_id));
                    *self.scheduler.tasks.get(&task_id).unwrap().store.lock().unwrap() = state.store.clone();
                    self.blocked.lock().unwrap().insert(task_id, Blocked { state, wait });
                    return;
                }
                other => {
                    self.finish(task_id, other, state);
                    return;
                }
            }
        }
    }

    fn finish(self: &Arc<Vm>, task_id: TaskId, signal: Signal, state: TaskState) {
        if let Some(entry) = self.scheduler.tasks.get(&task_id) {
            *entry.store.lock().unwrap() = state.store;
        }
        match signal {
            Signal::Done(v) => {
                debug!(task_id = task_id.0, "task done");
                self.scheduler.complete_task(task_id, Completion::Value(v));
            }
            Signal::Failed(f) => {
                debug!(task_id = task_id.0, error = %f.error, "task failed");
                self.traces.lock().unwrap().insert(task_id, f.traceback);
                self.scheduler.complete_task(task_id, Completion::Error(f.error));
            }
            Signal::Continue | Signal::Block(_) => unreachable!("finish called with a non-terminal signal"),
        }
    }

    /// Applies a wakeup to a previously blocked task, returning `true` once
    /// the task's `control` has been updated and it should keep stepping, or
    /// `false` if it's still waiting (re-parking itself into `self.blocked`).
    fn apply_wakeup(self: &Arc<Vm>, state: &mut TaskState, wait: PendingWait, resume: Option<Completion>) -> bool {
        match wait {
            PendingWait::Single => {
                let completion = resume.unwrap_or(Completion::Cancelled);
                state.control = completion_to_control(completion);
                true
            }
            PendingWait::Gather { handles, mut results } => {
                for (slot, handle) in results.iter_mut().zip(handles.iter()) {
                    if slot.is_none() {
                        if let Some(c) = self.scheduler.already_complete(*handle) {
                            *slot = Some(c);
                        }
                    }
                }
                if let Some(err_idx) = results.iter().position(|r| matches!(r, Some(Completion::Error(_)))) {
                    let Some(Completion::Error(e)) = results[err_idx].take() else { unreachable!() };
                    state.control = Control::Failing(e);
                    return true;
                }
                if results.iter().any(|r| matches!(r, Some(Completion::Cancelled))) {
                    state.control = Control::Failing(VmError::HandlerContract {
                            message: "gathered task was cancelled".to_string(),
                    });
                    return true;
                }
                if results.iter().all(|r| r.is_some()) {
                    let values: Vec<Value> = results
                    .into_iter()
                    .map(|r| match r {
                            Some(Completion::Value(v)) => v,
                            _ => Value::Unit,
                    })
                    .collect();
                    state.control = Control::Expr(DoCtrl::Pure(Value::list(values)));
                    true
                } else {
                    self.blocked.lock().unwrap().insert(
                        state.task_id,
                        Blocked {
                            state: std::mem::replace(state, TaskState::fresh(state.task_id, DoCtrl::pure(Value::Unit), Env::empty(), Store::new(), HandlerNode::root(), InterceptorNode::root())),
                            wait: PendingWait::Gather { handles, results },
                        },
                    );
                    false
                }
            }
            PendingWait::Race { handles } => {
                for handle in &handles {
                    if let Some(c) = self.scheduler.already_complete(*handle) {
                        match c {
                            Completion::Value(value) => {
                                let rest: Vec<WaitHandle> =
                                handles.iter().copied().filter(|h| *h != *handle).collect();
                                let result = crate::scheduler::RaceResult { first: *handle, value, rest };
                                state.control = Control::Expr(DoCtrl::Pure(Value::opaque(result)));
                            }
                            Completion::Error(e) => state.control = Control::Failing(e),
                            Completion::Cancelled => {
                                state.control = Control::Failing(VmError::HandlerContract {
                                        message: "raced task was cancelled".to_string(),
                                })
                            }
                        }
                        return true;
                    }
                }
                self.blocked.lock().unwrap().insert(
                    state.task_id,
                    Blocked {
                        state: std::mem::replace(state, TaskState::fresh(state.task_id, DoCtrl::pure(Value::Unit), Env::empty(), Store::new(), HandlerNode::root(), InterceptorNode::root())),
                        wait: PendingWait::Race { handles },
                    },
                );
                false
            }
        }
    }
}

fn completion_to_control(completion: Completion) -> Control {
    match completion {
        Completion::Value(v) => Control::Expr(DoCtrl::Pure(v)),
        Completion::Error(e) => Control::Failing(e),
        Completion::Cancelled => Control::Failing(VmError::HandlerContract {
                message: "awaited task was cancelled".to_string(),
        }),
    }
}

/// One trampoline reduction: either bubbles a value/error through the next
/// `K` frame, or reduces whatever `DoCtrl` constructor `control` currently
/// holds.
fn step(vm: &Arc<Vm>, state: &mut TaskState) -> Signal {
    match std::mem::replace(&mut state.control, Control::Expr(DoCtrl::Pure(Value::Unit))) {
        Control::Expr(DoCtrl::Pure(v)) => bubble_value(state, v),
        Control::Expr(other) => reduce(vm, state, other),
        Control::Failing(e) => bubble_error(state, e),
    }
}

fn bubble_value(state: &mut TaskState, v: Value) -> Signal {
    let Some(frame) = state.k.pop() else {
        return Signal::Done(v);
    };
    match frame {
        Frame::Map(f) => {
            state.control = Control::Expr(DoCtrl::Pure(f(v)));
        }
        Frame::FlatMap(f) => {
            state.control = Control::Expr(f(v));
        }
        Frame::Prompt {.. } => {
            state.h = state.h.ancestor(1);
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        Frame::ClosedPrompt { restore_h } => {
            state.h = restore_h;
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        Frame::Env { previous } => {
            state.env = previous;
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        Frame::Intercept { previous } => {
            state.intercepts = previous;
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        Frame::InterceptGuard(id) => {
            state.interceptor_guard.remove(&id);
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        Frame::Catch => {
            state.control = Control::Expr(DoCtrl::Pure(Value::try_ok(v)));
        }
        Frame::GenStep(gen) => drive_gen_step(state, gen, GenInput::Value(v)),
        Frame::ExpandArgs { mut remaining, mut evaluated, factory } => {
            evaluated.push(v);
            if remaining.is_empty() {
                start_generator(state, factory, evaluated);
            } else {
                let next = remaining.remove(0);
                state.k.push(Frame::ExpandArgs { remaining, evaluated, factory });
                state.control = Control::Expr(next);
            }
        }
        Frame::DispatchRestore => {
            state.dispatch_stack.pop();
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
    }
    Signal::Continue
}

fn bubble_error(state: &mut TaskState, mut err: VmError) -> Signal {
    loop {
        let Some(frame) = state.k.pop() else {
            return Signal::Failed(Failure::new(err, std::mem::take(&mut state.trace)));
        };
        match frame {
            Frame::Map(_) | Frame::FlatMap(_) | Frame::ExpandArgs {.. } => continue,
            Frame::Prompt {.. } => {
                state.h = state.h.ancestor(1);
                continue;
            }
            Frame::ClosedPrompt { restore_h } => {
                state.h = restore_h;
                continue;
            }
            Frame::Env { previous } => {
                state.env = previous;
                continue;
            }
            Frame::Intercept { previous } => {
                state.intercepts = previous;
                continue;
            }
            Frame::InterceptGuard(id) => {
                state.interceptor_guard.remove(&id);
                continue;
            }
            Frame::Catch => {
                state.control = Control::Expr(DoCtrl::Pure(Value::try_err(err)));
                return Signal::Continue;
            }
            Frame::GenStep(gen) => {
                let step = gen.lock().expect("generator mutex poisoned").resume(GenInput::Error(err));
                match step {
                    GenStep::Yield(next) => {
                        state.k.push(Frame::GenStep(gen));
                        state.control = Control::Expr(next);
                        return Signal::Continue;
                    }
                    GenStep::Return(v) => {
                        state.control = Control::Expr(DoCtrl::Pure(v));
                        return Signal::Continue;
                    }
                    GenStep::Propagate(e2) => {
                        err = e2;
                        continue;
                    }
                }
            }
            Frame::DispatchRestore => {
                state.dispatch_stack.pop();
                continue;
            }
        }
    }
}

fn drive_gen_step(state: &mut TaskState, gen: crate::generator::GenHandle, input: GenInput) {
    let step = gen.lock().expect("generator mutex poisoned").resume(input);
    match step {
        GenStep::Yield(next) => {
            state.k.push(Frame::GenStep(gen));
            state.control = Control::Expr(next);
        }
        GenStep::Return(v) => {
            state.control = Control::Expr(DoCtrl::Pure(v));
        }
        GenStep::Propagate(e) => {
            state.control = Control::Failing(e);
        }
    }
}

fn start_generator(state: &mut TaskState, factory: crate::generator::GeneratorFactory, args: Vec<Value>) {
    let gen: crate::generator::GenHandle = Arc::new(Mutex::new(factory(args)));
    drive_gen_step(state, gen, GenInput::Value(Value::Unit));
}

fn reduce(vm: &Arc<Vm>, state: &mut TaskState, ctrl: DoCtrl) -> Signal {
    match ctrl {
        DoCtrl::Pure(_) => unreachable!("Pure is handled in step()"),
        DoCtrl::Call(f) => {
            match f() {
                Ok(v) => state.control = Control::Expr(DoCtrl::Pure(v)),
                Err(e) => state.control = Control::Failing(VmError::host(e)),
            }
        }
        DoCtrl::Map(e, f) => {
            state.k.push(Frame::Map(f));
            state.control = Control::Expr(*e);
        }
        DoCtrl::FlatMap(e, f) => {
            state.k.push(Frame::FlatMap(f));
            state.control = Control::Expr(*e);
        }
        DoCtrl::Local(bindings, e) => {
            let previous = state.env.clone();
            state.env = state.env.extend(bindings);
            state.k.push(Frame::Env { previous });
            state.control = Control::Expr(*e);
        }
        DoCtrl::WithHandler(handler_fn, e) => {
            let prompt_id = PromptId::fresh();
            state.h = state.h.push(HandlerFrame {
                    handler_fn,
                    prompt_id,
                    mode: HandlerMode::Normal,
                    label: "with_handler",
            });
            state.k.push(Frame::Prompt { prompt_id, label: "with_handler" });
            state.control = Control::Expr(*e);
        }
        DoCtrl::Mask(types, e) => {
            let prompt_id = PromptId::fresh();
            let placeholder: crate::doctrl::HandlerFn = Arc::new(|_eff, _k| DoCtrl::Pass);
            state.h = state.h.push(HandlerFrame {
                    handler_fn: placeholder,
                    prompt_id,
                    mode: HandlerMode::Masked(types),
                    label: "mask",
            });
            state.k.push(Frame::Prompt { prompt_id, label: "mask" });
            state.control = Control::Expr(*e);
        }
        DoCtrl::Override(handler_fn, types, e) => {
            let prompt_id = PromptId::fresh();
            let wrapped = handler::override_wrapper(handler_fn, types);
            state.h = state.h.push(HandlerFrame {
                    handler_fn: wrapped,
                    prompt_id,
                    mode: HandlerMode::Normal,
                    label: "override",
            });
            state.k.push(Frame::Prompt { prompt_id, label: "override" });
            state.control = Control::Expr(*e);
        }
        DoCtrl::WithIntercept(transform, e, filter) => {
            let previous = state.intercepts.clone();
            state.intercepts = state.intercepts.push(transform, filter);
            state.k.push(Frame::Intercept { previous });
            state.control = Control::Expr(*e);
        }
        DoCtrl::Try(e) => {
            state.k.push(Frame::Catch);
            state.control = Control::Expr(*e);
        }
        DoCtrl::Expand(factory, mut args) => {
            if args.is_empty() {
                start_generator(state, factory, Vec::new());
            } else {
                let first = args.remove(0);
                state.k.push(Frame::ExpandArgs { remaining: args, evaluated: Vec::new(), factory });
                state.control = Control::Expr(first);
            }
        }
        DoCtrl::Eval(e, handlers) => {
            let nested_h = handler::stack_from(handlers);
            let (outcome, new_store, _log) = vm.run_program(
                *e,
                state.env.clone(),
                state.store.clone(),
                nested_h,
                state.intercepts.clone(),
                Some(state.task_id),
                None,
            );
            state.store = new_store;
            match outcome {
                Outcome::Value(v) => state.control = Control::Expr(DoCtrl::Pure(v)),
                Outcome::Failure(f) => state.control = Control::Failing(f.error),
            }
        }
        DoCtrl::Perform(effect) => return perform(vm, state, effect),
        DoCtrl::Resume(k_ref, v) => return do_resume(state, k_ref, v),
        DoCtrl::Transfer(k_ref, v) => return do_transfer(state, k_ref, v),
        DoCtrl::Delegate(replacement) => return do_delegate(state, replacement),
        DoCtrl::Pass => return do_delegate(state, None),
    }
    Signal::Continue
}

fn perform(vm: &Arc<Vm>, state: &mut TaskState, effect: Effect) -> Signal {
    let effect = effect.with_dispatch_id(fresh_dispatch_id());

    match state.intercepts.apply(&effect, &state.interceptor_guard) {
        Some(InterceptOutcome::Replaced(e2)) => {
            state.control = Control::Expr(DoCtrl::Perform(e2));
            return Signal::Continue;
        }
        Some(InterceptOutcome::Expanded(program, id)) => {
            state.interceptor_guard.insert(id);
            state.k.push(Frame::InterceptGuard(id));
            state.control = Control::Expr(program);
            return Signal::Continue;
        }
        None => {}
    }

    match handler::dispatch(&state.h, effect.effect_type, &std::collections::HashSet::new()) {
        Some(hit) => launch_handler(state, effect, hit),
        None => match handlers::native_dispatch(vm, state, &effect) {
            Some(signal) => signal,
            None => {
                state.control = Control::Failing(VmError::UnhandledEffect { effect_type: effect.effect_type });
                Signal::Continue
            }
        },
    }
}

fn launch_handler(state: &mut TaskState, effect: Effect, hit: handler::DispatchHit) -> Signal {
    let h_at_capture = state.h.clone();
    let scope = ScopeSignature::of(&h_at_capture);
    let captured = state
    .k
    .split_at_prompt(hit.frame.prompt_id)
    .expect("dispatch hit implies a matching live prompt frame");
    let k_user = ContinuationObj::new(captured, h_at_capture.clone(), scope, effect.context.clone());
    let new_h = h_at_capture.ancestor(hit.depth_from_top + 1);
    let ctx = DispatchCtx::new(k_user.clone(), effect.clone(), new_h.clone());
    state.dispatch_stack.push(ctx.clone());
    state.k.push(Frame::DispatchRestore);
    state.trace.push(TraceEntry::Handler {
            label: hit.frame.label,
            install_site: None,
            outcome: None,
    });
    state.h = new_h;
    state.control = Control::Expr((hit.frame.handler_fn)(effect, k_user));
    Signal::Continue
}

fn do_resume(state: &mut TaskState, k_ref: ContinuationRef, v: Value) -> Signal {
    let Some(ctx) = state.dispatch_stack.last().cloned() else {
        state.control = Control::Failing(VmError::HandlerContract {
                message: "Resume called outside an active handler dispatch".to_string(),
        });
        return Signal::Continue;
    };
    let mut captured = match k_ref.take_frames() {
        Ok(frames) => frames,
        Err(e) => {
            state.control = Control::Failing(e);
            return Signal::Continue;
        }
    };
    if !k_ref.scope.still_valid_in(&state.h) {
        state.control = Control::Failing(VmError::CrossScopeResume);
        return Signal::Continue;
    }
    let resume_h = ctx.search_from();
    if let Some(Frame::Prompt {.. }) = captured.last() {
        let last = captured.len() - 1;
        captured[last] = Frame::ClosedPrompt { restore_h: resume_h };
    }
    state.k.splice_front(captured);
    state.h = k_ref.h_at_capture.clone();
    state.control = Control::Expr(DoCtrl::Pure(v));
    Signal::Continue
}

fn do_transfer(state: &mut TaskState, k_ref: ContinuationRef, v: Value) -> Signal {
    let Some(ctx) = state.dispatch_stack.last().cloned() else {
        state.control = Control::Failing(VmError::HandlerContract {
                message: "Transfer called outside an active handler dispatch".to_string(),
        });
        return Signal::Continue;
    };
    let mut captured = match k_ref.take_frames() {
        Ok(frames) => frames,
        Err(e) => {
            state.control = Control::Failing(e);
            return Signal::Continue;
        }
    };
    if !k_ref.scope.still_valid_in(&state.h) {
        state.control = Control::Failing(VmError::CrossScopeResume);
        return Signal::Continue;
    }
    let resume_h = ctx.search_from();
    if let Some(Frame::Prompt {.. }) = captured.last() {
        let last = captured.len() - 1;
        captured[last] = Frame::ClosedPrompt { restore_h: resume_h };
    }
    state.dispatch_stack.pop();
    // `Transfer` discards the handler's own live `K` (everything below
    // `captured`) without bubbling through it, so any `InterceptGuard`
    // frames in the discarded prefix never reach `bubble_value`/
    // `bubble_error` to remove themselves — compensate here the same way
    // `dispatch_stack.pop()` above compensates for the one `DispatchRestore`
    // frame `Transfer` always discards.
    for frame in std::mem::replace(&mut state.k, Continuation::new()).frames {
        if let Frame::InterceptGuard(id) = frame {
            state.interceptor_guard.remove(&id);
        }
    }
    state.k = Continuation { frames: captured };
    state.h = k_ref.h_at_capture.clone();
    state.control = Control::Expr(DoCtrl::Pure(v));
    Signal::Continue
}

fn do_delegate(state: &mut TaskState, replacement: Option<Effect>) -> Signal {
    let Some(ctx) = state.dispatch_stack.last().cloned() else {
        state.control = Control::Failing(VmError::HandlerContract {
                message: "Delegate/Pass called outside an active handler dispatch".to_string(),
        });
        return Signal::Continue;
    };
    let effect = match replacement {
        Some(e) => e,
        None => ctx.effect(),
    };
    match handler::dispatch(&ctx.search_from(), effect.effect_type, &std::collections::HashSet::new()) {
        Some(hit) => {
            let new_search_from = ctx.search_from().ancestor(hit.depth_from_top + 1);
            ctx.advance(effect.clone(), new_search_from.clone());
            state.trace.push(TraceEntry::Handler {
                    label: hit.frame.label,
                    install_site: None,
                    outcome: Some(HandlerOutcomeMark::Delegated),
            });
            state.h = new_search_from;
            state.control = Control::Expr((hit.frame.handler_fn)(effect, ctx.k_user.clone()));
        }
        None => {
            state.control = Control::Failing(VmError::UnhandledEffect { effect_type: effect.effect_type });
        }
    }
    Signal::Continue
}

// ---- scheduler-facing helpers used by handlers::scheduler_handlers -------

/// Registers `waiter_task` as blocked on every handle in `handles`, or
/// resolves immediately if they're all already complete (`Gather`'s
/// zero-wait fast path).
pub(crate) fn gather_or_block(vm: &Arc<Vm>, state: &mut TaskState, handles: Vec<WaitHandle>) -> Signal {
    let mut results: Vec<Option<Completion>> = Vec::with_capacity(handles.len());
    for handle in &handles {
        results.push(vm.scheduler.register_waiter(*handle, state.task_id));
    }
    if let Some(idx) = results.iter().position(|r| matches!(r, Some(Completion::Error(_)))) {
        let Some(Completion::Error(e)) = results[idx].take() else { unreachable!() };
        state.control = Control::Failing(e);
        return Signal::Continue;
    }
    if results.iter().all(|r| r.is_some()) {
        let values: Vec<Value> = results
        .into_iter()
        .map(|r| match r {
                Some(Completion::Value(v)) => v,
                _ => Value::Unit,
        })
        .collect();
        state.control = Control::Expr(DoCtrl::Pure(Value::list(values)));
        Signal::Continue
    } else {
        Signal::Block(PendingWait::Gather { handles, results })
    }
}

pub(crate) fn race_or_block(vm: &Arc<Vm>, state: &mut TaskState, handles: Vec<WaitHandle>) -> Signal {
    for handle in &handles {
        if let Some(completion) = vm.scheduler.already_complete(*handle) {
            match completion {
                Completion::Value(value) => {
                    let rest: Vec<WaitHandle> = handles.iter().copied().filter(|h| *h != *handle).collect();
                    let result = crate::scheduler::RaceResult { first: *handle, value, rest };
                    state.control = Control::Expr(DoCtrl::Pure(Value::opaque(result)));
                    return Signal::Continue;
                }
                Completion::Error(e) => {
                    state.control = Control::Failing(e);
                    return Signal::Continue;
                }
                Completion::Cancelled => {
                    state.control = Control::Failing(VmError::HandlerContract {
                            message: "raced task was cancelled".to_string(),
                    });
                    return Signal::Continue;
                }
            }
        }
    }
    for handle in &handles {
        vm.scheduler.register_waiter(*handle, state.task_id);
    }
    Signal::Block(PendingWait::Race { handles })
}

pub(crate) fn wait_or_block(vm: &Arc<Vm>, state: &mut TaskState, handle: WaitHandle) -> Signal {
    match vm.scheduler.register_waiter(handle, state.task_id) {
        Some(completion) => {
            state.control = completion_to_control(completion);
            Signal::Continue
        }
        None => Signal::Block(PendingWait::Single),
    }
}

pub(crate) fn acquire_or_block(vm: &Arc<Vm>, state: &mut TaskState, semaphore: crate::scheduler::SemaphoreId) -> Signal {
    match vm.scheduler.try_acquire(semaphore, state.task_id) {
        Ok(true) => {
            state.control = Control::Expr(DoCtrl::Pure(Value::Unit));
            Signal::Continue
        }
        Ok(false) => Signal::Block(PendingWait::Single),
        Err(e) => {
            state.control = Control::Failing(e);
            Signal::Continue
        }
    }
}

/// Runs `program` to completion on a fresh nested task sharing this `Vm`'s
/// scheduler, returning its log entries alongside the value (used by
/// `Listen`). Like `Eval`, this blocks the calling task's own `drive_task`
/// frame rather than truly suspending.
pub(crate) fn run_nested(
    vm: &Arc<Vm>,
    state: &TaskState,
    program: DoCtrl,
) -> (Outcome, Store, Vec<crate::effects::LogEntry>) {
    vm.run_program(
        program,
        state.env.clone(),
        state.store.clone(),
        state.h.clone(),
        state.intercepts.clone(),
        Some(state.task_id),
        None,
    )
}

pub(crate) fn push_child_task(
    vm: &Arc<Vm>,
    state: &TaskState,
    program: DoCtrl,
    context: Option<SourceContext>,
) -> crate::scheduler::TaskId {
    let entry = vm.scheduler.spawn_task(
        Some(state.task_id),
        state.store.snapshot(),
        context,
        PendingProgram {
            program,
            env: state.env.clone(),
            h: state.h.clone(),
            intercepts: state.intercepts.clone(),
        },
    );
    entry.id
}

pub(crate) fn append_log(vm: &Arc<Vm>, state: &TaskState, entry: crate::effects::LogEntry) {
    if let Some(task) = vm.scheduler.tasks.get(&state.task_id) {
        task.log.lock().unwrap().push(entry);
    }
}

pub(crate) fn set_env(state: &mut TaskState, env: Arc<Env>) {
    state.env = env;
}

pub(crate) fn set_store(state: &mut TaskState, store: Store) {
    state.store = store;
}

pub(crate) fn env(state: &TaskState) -> &Arc<Env> {
    &state.env
}

pub(crate) fn handler_stack(state: &TaskState) -> &Arc<HandlerNode> {
    &state.h
}

pub(crate) fn intercepts(state: &TaskState) -> &Arc<InterceptorNode> {
    &state.intercepts
}

pub(crate) fn task_id(state: &TaskState) -> TaskId {
    state.task_id
}

pub(crate) fn pure_next(state: &mut TaskState, v: Value) -> Signal {
    state.control = Control::Expr(DoCtrl::Pure(v));
    Signal::Continue
}

pub(crate) fn fail_next(state: &mut TaskState, e: VmError) -> Signal {
    state.control = Control::Failing(e);
    Signal::Continue
}

pub(crate) fn store_get(state: &TaskState, key: &str) -> Option<Value> {
    state.store.get(key)
}

pub(crate) fn store_put(state: &mut TaskState, key: String, value: Value) {
    state.store = state.store.put(key, value);
}

pub(crate) fn store_modify(state: &mut TaskState, key: &str, f: impl FnOnce(Value) -> Result<Value, VmError>) -> Result<(), VmError> {
    state.store = state.store.modify(key, f)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::EffectPayload;

    #[test]
    fn pure_done_with_empty_k() {
        let vm = Vm::new(Scheduler::new());
        let (outcome, _store, _log) = vm.run_program(
            DoCtrl::pure(42i64),
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        match outcome {
            Outcome::Value(Value::Int(42)) => {}
            _ => panic!("expected Pure(42) to finish as Done(42)"),
        }
    }

    #[derive(Debug)]
    struct Ping;
    impl EffectPayload for Ping {
        const EFFECT_NAME: &'static str = "Ping";
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[test]
    fn unhandled_effect_fails() {
        let vm = Vm::new(Scheduler::new());
        let (outcome, _store, _log) = vm.run_program(
            crate::effects::perform(Ping, None),
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        match outcome {
            Outcome::Failure(f) => assert_eq!(f.error.kind(), "UnhandledEffect"),
            Outcome::Value(_) => panic!("expected UnhandledEffect"),
        }
    }

    #[test]
    fn handler_resume_returns_value_to_caller() {
        let vm = Vm::new(Scheduler::new());
        let handler_fn: crate::doctrl::HandlerFn = Arc::new(|_eff, k| DoCtrl::Resume(k, Value::Int(7)));
        let program = DoCtrl::WithHandler(
            handler_fn,
            Box::new(crate::effects::perform(Ping, None).map(|v| match v {
                        Value::Int(n) => Value::Int(n + 1),
                        other => other,
            })),
        );
        let (outcome, _store, _log) = vm.run_program(
            program,
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        match outcome {
            Outcome::Value(Value::Int(8)) => {}
            other => panic!("expected Done(8), got {other:?}"),
        }
    }

    impl std::fmt::Debug for Outcome {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Outcome::Value(v) => write!(f, "Value({v:?})"),
                Outcome::Failure(e) => write!(f, "Failure({})", e.error),
            }
        }
    }

    #[test]
    fn one_shot_resume_violation_on_second_use() {
        let vm = Vm::new(Scheduler::new());
        let stash: Arc<Mutex<Option<ContinuationRef>>> = Arc::new(Mutex::new(None));
        let stash2 = stash.clone();
        let handler_fn: crate::doctrl::HandlerFn = Arc::new(move |_eff, k| {
                *stash2.lock().unwrap() = Some(k.clone());
                DoCtrl::Resume(k, Value::Int(1))
        });
        let program = DoCtrl::WithHandler(handler_fn, Box::new(crate::effects::perform(Ping, None)));
        let (_outcome, _store, _log) = vm.run_program(
            program,
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        let k = stash.lock().unwrap().clone().unwrap();
        assert!(k.is_consumed());
        assert!(matches!(k.take_frames(), Err(VmError::OneShotViolation)));
    }

    #[test]
    fn cross_scope_resume_is_rejected() {
        let vm = Vm::new(Scheduler::new());
        let stash: Arc<Mutex<Option<ContinuationRef>>> = Arc::new(Mutex::new(None));
        let stash_a = stash.clone();
        let handler_a: crate::doctrl::HandlerFn = Arc::new(move |_eff, k| {
                *stash_a.lock().unwrap() = Some(k.clone());
                DoCtrl::Resume(k, Value::Int(1))
        });
        let stash_b = stash.clone();
        let handler_b: crate::doctrl::HandlerFn = Arc::new(move |_eff, _k| {
                let escaped = stash_b.lock().unwrap().clone().expect("handler_a ran first");
                DoCtrl::Resume(escaped, Value::Int(99))
        });
        let program = DoCtrl::WithHandler(handler_a, Box::new(crate::effects::perform(Ping, None))).then(
            DoCtrl::WithHandler(handler_b, Box::new(crate::effects::perform(Ping, None))),
        );
        let (outcome, _store, _log) = vm.run_program(
            program,
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        match outcome {
            Outcome::Failure(f) => assert_eq!(f.error.kind(), "CrossScopeResume"),
            Outcome::Value(v) => panic!("expected CrossScopeResume failure, got {v:?}"),
        }
    }

    #[derive(Debug)]
    struct Query;
    impl EffectPayload for Query {
        const EFFECT_NAME: &'static str = "Query";
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Two lexically stacked handlers, only the outer one sees `Query`: a
    /// handler's own effects dispatch starting one frame below where it was
    /// found (invariant: a handler sees the stack at its installation
    /// depth), so `inner`'s body performing `Query` bubbles straight past
    /// it to `outer` without `inner` ever being asked.
    #[test]
    fn nested_dispatch_scope_doubles_outer_resume() {
        let vm = Vm::new(Scheduler::new());
        let outer: crate::doctrl::HandlerFn = Arc::new(|_eff, k| DoCtrl::Resume(k, Value::Int(42)));
        let inner: crate::doctrl::HandlerFn = Arc::new(|_eff, k| {
                crate::effects::perform(Query, None).flat_map(move |v| {
                        let doubled = match v {
                            Value::Int(n) => n * 2,
                            _ => 0,
                        };
                        DoCtrl::Resume(k.clone(), Value::Int(doubled))
                })
        });
        let body = crate::effects::perform(Ping, None).map(|v| match v {
                Value::Int(n) => Value::Int(n + 1),
                other => other,
        });
        let program = DoCtrl::WithHandler(outer, Box::new(DoCtrl::WithHandler(inner, Box::new(body))));
        let (outcome, _store, _log) = vm.run_program(
            program,
            Env::empty(),
            Store::new(),
            HandlerNode::root(),
            InterceptorNode::root(),
            None,
            None,
        );
        match outcome {
            Outcome::Value(Value::Int(85)) => {}
            other => panic!("expected Done(85), got {other:?}"),
        }
    }
}
