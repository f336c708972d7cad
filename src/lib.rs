//! # doeff-vm
//!
//! A CESK-style virtual machine for algebraic effects: programs are built as
//! `DoCtrl` trees, effects are performed against a persistent handler stack,
//! and the whole evaluator runs as a trampoline — no host-stack growth
//! regardless of how deep a program's continuations nest.
//!
//! ## Core Concepts
//!
//! A computation is a [`DoCtrl`] value threaded through four pieces of
//! machine state:
//! - `E` ([`Env`]) — lexical bindings, read by `Ask`
//! - `S` ([`Store`]) — mutable key/value state, read/written by `Get`/`Put`/`Modify`
//! - `K` ([`Continuation`](continuation::Continuation)) — what happens to the next value
//! - `H` ([`HandlerNode`]) — the stack of installed effect handlers
//!
//! Performing an [`Effect`] searches `H` innermost-first for a frame willing
//! to handle it; a handler can [`DoCtrl::Resume`] the captured continuation
//! (at most once), [`DoCtrl::Delegate`] to an outer frame, or
//! [`DoCtrl::Transfer`] control away entirely. [`DoCtrl::Eval`] and
//! [`Listen`](effects::Listen) run a nested program under its own isolated
//! handler stack and report back without disturbing the caller's.
//!
//! ## Scheduling
//!
//! [`Scheduler`] runs tasks cooperatively on a single logical thread of
//! control: `Spawn` enqueues a child task, `Wait`/`Gather`/`Race` park the
//! calling task until the tasks/promises/semaphores it names settle.
//! Cross-thread I/O completes through [`ExternalPromise`], and a foreign
//! `Future` can be lifted in with [`await_bridge::await_future`] — driven to
//! completion synchronously under [`run`], or bridged onto the host tokio
//! runtime under [`async_run`].
//!
//! ## Example
//!
//! ```ignore
//! use doeff_vm::{effects, run, RunOptions};
//! use doeff_vm::value::Value;
//! use std::collections::HashMap;
//!
//! let program = effects::ask("name").flat_map(|name| {
//! effects::tell(format!("hello, {name:?}"))
//! });
//!
//! let mut env = HashMap::new();
//! env.insert("name".into(), Value::from("world"));
//! let result = run(program, RunOptions { env,..Default::default() });
//! assert!(result.is_ok());
//! ```
//!
//! ## What This Is Not
//!
//! This crate is **not**:
//! - A language runtime with its own parser/bytecode compiler
//! - A work-stealing or multi-threaded executor (the trampoline itself is
//! single-threaded; concurrency comes from cooperative task switching)
//! - A general green-thread library — tasks only ever make progress inside
//! `run`/`async_run`'s drive loop

mod await_bridge;
mod continuation;
mod doctrl;
mod env;
mod error;
mod evaluator;
pub mod effects;
mod external_promise;
mod generator;
mod handler;
mod handlers;
mod interceptor;
mod run;
mod scheduler;
mod store;
mod traceback;
pub mod value;

pub use await_bridge::{await_future, Await, BoxFuture};
pub use continuation::{continuation_value, Continuation, ContinuationObj, ContinuationRef, Frame, PromptId, ScopeSignature};
pub use doctrl::{CallFn, DoCtrl, FlatMapFn, HandlerFn, InterceptFn, MapFn, TypeFilter};
pub use env::{bindings_from_values, Binding, Env, EnvKey, LazyCell};
pub use error::{Failure, VmError};
pub use evaluator::{Outcome, TaskState, Vm};
pub use external_promise::{ExternalChannel, ExternalPromise};
pub use generator::{EffectProgram, GenHandle, GenInput, GenStep, GeneratorFactory, LinearProgram};
pub use handler::{override_wrapper, stack_from, DispatchCtx, DispatchHit, HandlerFrame, HandlerMode, HandlerNode};
pub use interceptor::{InterceptId, InterceptorEntry, InterceptorNode};
pub use run::{async_run, default_async_handlers, default_handlers, run, RunOptions, RunResult};
pub use scheduler::{
    Completion, PendingProgram, PromiseEntry, PromiseHandle, PromiseId, RaceResult, Scheduler,
    SemaphoreEntry, SemaphoreHandle, SemaphoreId, TaskEntry, TaskHandle, TaskId, TaskStatus, WaitHandle,
};
pub use store::Store;
pub use value::{Effect, EffectPayload, EffectType, OpaqueValue, SourceContext, TryResult, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn pure_value_runs_to_completion() {
        let result = run(DoCtrl::pure(42i64), RunOptions::default());
        assert!(result.is_ok());
        assert_eq!(result.value(), Some(&Value::Int(42)));
    }

    #[test]
    fn store_seed_is_visible_to_get() {
        let mut store = HashMap::new();
        store.insert("k".to_string(), Value::Int(7));
        let result = run(
            effects::get("k"),
            RunOptions {
                store,
                ..Default::default()
            },
        );
        assert!(result.is_ok());
        assert_eq!(result.value(), Some(&Value::Int(7)));
    }
}
