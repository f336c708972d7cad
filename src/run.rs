//! Run entrypoints: `run`, `async_run`, and the `RunResult` they return.
//! Built around a "build options, execute once, get a result back" shape
//! rather than a long-lived service loop, since a `DoCtrl` program is a
//! single computation rather than an event-sourced service.

use std::collections::HashMap;
use std::sync::Arc;

use crate::doctrl::{DoCtrl, HandlerFn};
use crate::effects::LogEntry;
use crate::env::{bindings_from_values, Env, EnvKey};
use crate::error::VmError;
use crate::evaluator::{Outcome, Vm};
use crate::handler::{self, HandlerNode};
use crate::interceptor::InterceptorNode;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::traceback::Traceback;
use crate::value::Value;

/// Options accepted by [`run`]/[`async_run`]: `handlers`, `env`, and `store`
/// seed the initial handler stack, environment, and store respectively.
pub struct RunOptions {
    /// Extra handlers installed above the native default families
    /// (`Ask`/`Get`/`Put`/`Modify`/`Tell`/`Listen`/the scheduler effects,
    /// all handled by `handlers::native_dispatch` once the installed stack
    /// comes up empty — default handlers sit at the bottom).
    /// Innermost-first, same convention as `Eval`.
    pub handlers: Vec<HandlerFn>,
    pub env: HashMap<EnvKey, Value>,
    pub store: HashMap<String, Value>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            handlers: Vec::new(),
            env: HashMap::new(),
            store: HashMap::new(),
        }
    }
}

/// `default_handlers()` and `default_async_handlers()` are both empty —
/// every family they'd name (state, reader, writer, result-safe, scheduler,
/// lazy-ask, await) is handled natively once the installed stack is
/// exhausted, so there is nothing additional to install. Kept as functions
/// (rather than just documenting "pass `vec![]`") so call sites read the
/// same way and so a future non-native reference handler has somewhere to
/// be added without changing every call site.
pub fn default_handlers() -> Vec<HandlerFn> {
    Vec::new()
}

pub fn default_async_handlers() -> Vec<HandlerFn> {
    Vec::new()
}

/// What a run reports back.
pub struct RunResult {
    value: Option<Value>,
    error: Option<VmError>,
    traceback: Option<Traceback>,
    pub log: Vec<LogEntry>,
    pub final_store: HashMap<String, Value>,
}

impl RunResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&VmError> {
        self.error.as_ref()
    }

    pub fn traceback(&self) -> Option<&Traceback> {
        self.traceback.as_ref()
    }

    /// Renders `error` and `traceback` the way a failing run is shown to a
    /// user. Returns `None` for a successful run.
    pub fn render_failure(&self) -> Option<String> {
        let error = self.error.as_ref()?;
        let mut out = format!("{error}\n");
        if let Some(tb) = &self.traceback {
            out.push_str(&tb.to_string());
        }
        Some(out)
    }

    fn from_outcome(outcome: Outcome, store: Store, log: Vec<LogEntry>) -> RunResult {
        let final_store = store.keys().map(|k| (k.to_string(), store.get(k).unwrap())).collect();
        match outcome {
            Outcome::Value(v) => RunResult {
                value: Some(v),
                error: None,
                traceback: None,
                log,
                final_store,
            },
            Outcome::Failure(f) => RunResult {
                value: None,
                error: Some(f.error),
                traceback: Some(f.traceback),
                log,
                final_store,
            },
        }
    }
}

fn build_env(entries: HashMap<EnvKey, Value>) -> Arc<Env> {
    Env::empty().extend(bindings_from_values(entries))
}

/// Executes `program` to completion on a fresh scheduler/VM, synchronously.
/// `Await`'d futures are driven to completion in place since there is no
/// host event loop here — see `await_bridge`'s synchronous branch.
pub fn run(program: DoCtrl, opts: RunOptions) -> RunResult {
    let scheduler = Scheduler::new();
    let vm = Vm::new(scheduler);
    let h: Arc<HandlerNode> = handler::stack_from(opts.handlers);
    let env = build_env(opts.env);
    let store = Store::from_map(opts.store);
    let (outcome, final_store, log) = vm.run_program(program, env, store, h, InterceptorNode::root(), None, None);
    RunResult::from_outcome(outcome, final_store, log)
}

/// Same semantics as [`run`], but `Await`'d futures are spawned on the
/// calling task's tokio runtime instead of blocking synchronously, which
/// keeps the VM oblivious to the host's async runtime. The CESK trampoline
/// itself is still a synchronous loop (single logical thread of control) —
/// `spawn_blocking` keeps it off the async executor's worker threads so
/// other tasks on that runtime keep making progress while this run's
/// `Await`s are in flight.
pub async fn async_run(program: DoCtrl, opts: RunOptions) -> RunResult {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
            let scheduler = Scheduler::new();
            let vm = Vm::new(scheduler);
            vm.set_runtime_handle(handle);
            let h: Arc<HandlerNode> = handler::stack_from(opts.handlers);
            let env = build_env(opts.env);
            let store = Store::from_map(opts.store);
            let (outcome, final_store, log) =
            vm.run_program(program, env, store, h, InterceptorNode::root(), None, None);
            RunResult::from_outcome(outcome, final_store, log)
    })
    .await
    .expect("async_run's blocking task panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects;
    use crate::scheduler::WaitHandle;

    #[test]
    fn s1_reader_writer() {
        let program = effects::ask("x").flat_map(|v| {
                let n = match v {
                    Value::Int(n) => n,
                    _ => 0,
                };
                effects::tell(format!("v={n}"))
        });
        let mut env = HashMap::new();
        env.insert(EnvKey::from("x"), Value::Int(3));
        let result = run(
            program,
            RunOptions {
                env,
                ..Default::default()
            },
        );
        assert!(result.is_ok(), "{:?}", result.error().map(|e| e.to_string()));
        assert!(matches!(result.log.first(), Some(LogEntry::Message(m)) if &**m == "v=3"));
    }

    #[test]
    fn s5_isolated_task_store() {
        let program = effects::put("k", 0i64).then(
            effects::spawn(effects::put("k", 100i64)).flat_map(|task| {
                    let handle = task.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                    effects::wait(handle).then(effects::get("k"))
            }),
        );
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(result.value(), Some(&Value::Int(0)));
    }

    #[test]
    fn s4_gather_order() {
        let program = effects::spawn(DoCtrl::pure(1i64)).flat_map(|t1| {
                let h1 = t1.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                effects::spawn(DoCtrl::pure(2i64)).flat_map(move |t2| {
                        let h2 = t2.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                        effects::spawn(DoCtrl::pure(3i64)).flat_map(move |t3| {
                                let h3 = t3.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                                effects::gather(vec![h1, h2, h3])
                        })
                })
        });
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(
            result.value(),
            Some(&Value::list(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn s4_gather_fails_fast_on_first_failure() {
        let program = effects::spawn(DoCtrl::pure(1i64)).flat_map(|t1| {
                let h1 = t1.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                let boom: DoCtrl = DoCtrl::Call(Arc::new(|| anyhow::bail!("boom")));
                effects::spawn(boom).flat_map(move |t2| {
                        let h2 = t2.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                        effects::spawn(DoCtrl::pure(3i64)).flat_map(move |t3| {
                                let h3 = t3.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                                effects::gather(vec![h1, h2, h3])
                        })
                })
        });
        let result = run(program, RunOptions::default());
        assert!(!result.is_ok());
        assert_eq!(result.error().map(|e| e.kind()), Some("Host"));
    }

    /// Completes an external promise from another OS thread while the run
    /// is parked on it. `wait` on a single handle resolves straight to the
    /// completion value.
    #[test]
    fn s6_external_promise_completes_across_threads() {
        let program = effects::create_external_promise().flat_map(|ext| {
                let promise = ext.downcast_opaque::<crate::external_promise::ExternalPromise>().unwrap().clone();
                let handle = WaitHandle::Promise(promise.promise_id);
                std::thread::spawn(move || {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        promise.complete(Value::Int(42));
                });
                effects::wait(handle)
        });
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(result.value(), Some(&Value::Int(42)));
    }

    /// Two lexically stacked handlers for the same effect type: `Mask`
    /// makes the inner one transparent to it, so dispatch should skip
    /// straight to the outer handler (spec §4.1 `Mask`).
    #[test]
    fn mask_skips_the_masked_frame_for_listed_types() {
        use crate::value::{Effect, EffectType};

        let probe_type = EffectType::of::<Probe>();
        let outer: HandlerFn = Arc::new(|_eff, k| DoCtrl::Resume(k, Value::Int(99)));
        let inner: HandlerFn = Arc::new(|_eff, _k| {
                panic!("inner handler should never be dispatched while masked")
        });

        let program = DoCtrl::WithHandler(
            outer,
            Box::new(DoCtrl::WithHandler(
                    inner,
                    Box::new(DoCtrl::Mask(
                            Arc::from(vec![probe_type]),
                            Box::new(DoCtrl::Perform(Effect::new(Probe, None))),
                    )),
            )),
        );
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(result.value(), Some(&Value::Int(99)));
    }

    /// `Override(handler, types, e)` handles listed types itself and
    /// delegates everything else to the next outer handler.
    #[test]
    fn override_handles_listed_types_and_delegates_the_rest() {
        use crate::value::{Effect, EffectType};

        let probe_type = EffectType::of::<Probe>();
        let other_type = EffectType::of::<OtherProbe>();

        let outer: HandlerFn = Arc::new(move |eff, k| {
                if eff.effect_type == other_type {
                    DoCtrl::Resume(k, Value::Int(7))
                } else {
                    DoCtrl::Resume(k, Value::Int(-1))
                }
        });
        let override_handler: HandlerFn = Arc::new(|_eff, k| DoCtrl::Resume(k, Value::Int(55)));

        let program = DoCtrl::WithHandler(
            outer,
            Box::new(DoCtrl::Override(
                    override_handler,
                    Arc::from(vec![probe_type]),
                    Box::new(DoCtrl::Perform(Effect::new(OtherProbe, None))),
            )),
        );
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(result.value(), Some(&Value::Int(7)));
    }

    /// `Try(e)` converts a host-raised failure into `Pure(Err(..))` instead
    /// of letting it escape the run.
    #[test]
    fn try_converts_a_host_failure_into_a_value() {
        let boom: DoCtrl = DoCtrl::Call(Arc::new(|| anyhow::bail!("boom")));
        let program = DoCtrl::Try(Box::new(boom));
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        let try_result = result
            .value()
            .and_then(|v| v.as_try_result())
            .expect("Try should produce a TryResult");
        assert!(try_result.is_err());
    }

    /// `Race(a,b)` resolves as soon as the first finishes and reports which
    /// one won plus the handles still outstanding (spec §4.3 `Race`).
    #[test]
    fn race_returns_the_first_completion_and_the_rest() {
        let program = effects::spawn(DoCtrl::pure(1i64)).flat_map(|t1| {
                let h1 = t1.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                effects::spawn(DoCtrl::pure(2i64)).flat_map(move |t2| {
                        let h2 = t2.downcast_opaque::<crate::scheduler::TaskHandle>().unwrap().wait_handle();
                        effects::race(vec![h1, h2])
                })
        });
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        let race = result
            .value()
            .and_then(|v| v.downcast_opaque::<crate::scheduler::RaceResult>())
            .expect("Race should produce a RaceResult");
        assert_eq!(race.rest.len(), 1);
    }

    /// `Acquire` on a single-permit semaphore succeeds once and a matching
    /// `Release` makes the permit available to the next `Acquire`.
    #[test]
    fn semaphore_acquire_release_round_trips() {
        let program = effects::create_semaphore(1).flat_map(|sem_v| {
                let sem = sem_v.downcast_opaque::<crate::scheduler::SemaphoreHandle>().unwrap().id;
                effects::acquire(sem)
                .then(effects::release(sem))
                .then(effects::acquire(sem))
                .then(effects::release(sem))
        });
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
    }

    /// Under `run()` there is no host event loop, so `Await` drives the
    /// future to completion synchronously instead of suspending the task.
    #[test]
    fn await_future_resolves_synchronously_under_run() {
        let program = crate::await_bridge::await_future(std::future::ready(Ok(Value::Int(5))));
        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        assert_eq!(result.value(), Some(&Value::Int(5)));
    }

    /// An effectful interceptor (transform returns a program that performs
    /// the same filtered effect type again, not a bare `Perform`) must not
    /// re-intercept its own replacement program (spec §4.5 invariant 12).
    /// Without the task-scoped guard this would recurse through
    /// `InterceptorNode::apply` forever instead of reaching the handler.
    #[test]
    fn effectful_interceptor_does_not_reintercept_its_own_replacement() {
        use crate::value::{Effect, EffectType};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let probe_type = EffectType::of::<Probe>();
        let transform_calls = Arc::new(AtomicUsize::new(0));
        let calls = transform_calls.clone();
        let transform = move |_e: &Effect| {
            calls.fetch_add(1, Ordering::SeqCst);
            // An effectful replacement, not a bare `Perform`: performs the
            // same probe type again and then discards its value.
            DoCtrl::Perform(Effect::new(Probe, None)).then(DoCtrl::pure(Value::Int(7)))
        };

        let handler: HandlerFn = Arc::new(|_eff, k| DoCtrl::Resume(k, Value::Int(42)));
        let program = DoCtrl::WithHandler(
            handler,
            Box::new(crate::effects::with_intercept(
                    DoCtrl::Perform(Effect::new(Probe, None)),
                    transform,
                    crate::doctrl::TypeFilter::Include(Arc::from([probe_type])),
            )),
        );

        let result = run(program, RunOptions::default());
        assert!(result.is_ok(), "{:?}", result.error());
        // The outer `Perform` was intercepted exactly once; the Probe
        // performed *inside* the replacement reached the handler directly
        // instead of looping back through the same interceptor.
        assert_eq!(transform_calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.value(), Some(&Value::Int(7)));
    }

    #[derive(Debug, Clone)]
    struct Probe;
    #[derive(Debug, Clone)]
    struct OtherProbe;

    impl crate::value::EffectPayload for Probe {
        const EFFECT_NAME: &'static str = "Probe";
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
    impl crate::value::EffectPayload for OtherProbe {
        const EFFECT_NAME: &'static str = "OtherProbe";
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }
}
