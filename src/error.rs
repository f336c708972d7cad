//! VM-level error kinds.
//!
//! `VmError` is the only error type that crosses the `RunResult` boundary.
//! Host code run via `Call`/`Expand` may fail with an arbitrary `anyhow::Error`;
//! those are wrapped in [`VmError::Host`] as they unwind through the
//! continuation, keeping `anyhow::Error` as internal transport and
//! surfacing only a structured enum at the edge.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::traceback::Traceback;
use crate::value::EffectType;

/// Every error kind the VM can surface.
#[derive(Debug, Error, Clone)]
pub enum VmError {
    /// No handler frame matched a `Perform`'d effect.
    #[error("unhandled effect: {effect_type}")]
    UnhandledEffect {
        /// The effect type that had no matching handler.
        effect_type: EffectType,
    },

    /// A captured continuation was resumed a second time (invariant 1).
    #[error("continuation already resumed (one-shot violation)")]
    OneShotViolation,

    /// A continuation was resumed outside the handler-stack scope it was
    /// captured under (invariant 2).
    #[error("continuation resumed outside its capture scope")]
    CrossScopeResume,

    /// `Ask(key)` found no binding in the current environment chain.
    #[error("missing environment key: {key}")]
    MissingEnvKey {
        /// The key that was looked up.
        key: String,
    },

    /// A handler returned something other than a generator/`DoCtrl`, or
    /// violated the handler authoring protocol in some other way.
    #[error("handler contract violation: {message}")]
    HandlerContract {
        /// Description of which part of the protocol was violated.
        message: String,
    },

    /// A `Promise`/`ExternalPromise` was completed or failed a second time.
    #[error("promise {promise_id} already completed")]
    PromiseAlreadyCompleted {
        /// The promise's scheduler-assigned id.
        promise_id: u64,
    },

    /// The task this error is attached to was cancelled before completion.
    #[error("task {task_id} was cancelled")]
    TaskCancelledError {
        /// The cancelled task's id.
        task_id: u64,
    },

    /// The scheduler has tasks waiting on handles that will never resolve:
    /// no ready tasks and no pending external completions.
    #[error("scheduler deadlock: {waiting_tasks} task(s) waiting, nothing runnable")]
    Deadlock {
        /// Number of tasks parked on a waiter list with nothing left to run.
        waiting_tasks: usize,
    },

    /// A host exception raised during `Call`/`Expand` evaluation, propagated
    /// through the continuation as a `Failed` state. Wraps the original
    /// error as a display string since `anyhow::Error` isn't `Clone`.
    #[error("{message}")]
    Host {
        /// Rendered message of the original `anyhow::Error`.
        message: Arc<str>,
    },
}

impl VmError {
    pub fn host(err: anyhow::Error) -> Self {
        VmError::Host {
            message: Arc::from(format!("{err:#}")),
        }
    }

    /// Short, stable discriminant name used by traceback rendering and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            VmError::UnhandledEffect {.. } => "UnhandledEffect",
            VmError::OneShotViolation => "OneShotViolation",
            VmError::CrossScopeResume => "CrossScopeResume",
            VmError::MissingEnvKey {.. } => "MissingEnvKey",
            VmError::HandlerContract {.. } => "HandlerContract",
            VmError::PromiseAlreadyCompleted {.. } => "PromiseAlreadyCompleted",
            VmError::TaskCancelledError {.. } => "TaskCancelledError",
            VmError::Deadlock {.. } => "Deadlock",
            VmError::Host {.. } => "Host",
        }
    }
}

/// A `VmError` paired with the traceback captured at the point it escaped.
/// Traceback data is attached to every error that escapes.
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: VmError,
    pub traceback: Traceback,
}

impl Failure {
    pub fn new(error: VmError, traceback: Traceback) -> Self {
        Self { error, traceback }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.error)?;
        write!(f, "{}", self.traceback)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
