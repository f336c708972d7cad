//! Built-in effect families — provided as reference handlers, not core —
//! plus the scheduler's own effect vocabulary.
//!
//! Every payload here carries no behavior of its own: `evaluator.rs`'s
//! `native_dispatch` is where the semantics live; these are plain data
//! carriers whose handling lives in `handlers/`. These effects sit at the
//! *bottom* of dispatch: an ordinary user handler installed anywhere in `H`
//! still gets first refusal, since any handler stack frame not
//! masked/consumed wins. The native behavior below only runs once the
//! handler-stack search comes up empty, which is what "default handlers sit
//! at the bottom" amounts to when the default handler needs privileged
//! access to `E`/`S`/the scheduler tables that an ordinary
//! `Fn(Effect, K) -> DoCtrl` closure never receives.

use std::sync::Arc;

use crate::doctrl::{DoCtrl, InterceptFn, TypeFilter};
use crate::env::EnvKey;
use crate::scheduler::{PromiseId, SemaphoreId, TaskId, WaitHandle};
use crate::value::{Effect, EffectPayload, OpaqueValue, SourceContext, Value};

macro_rules! effect_payload {
    ($name:ident { $($field:ident: $ty:ty),* $(,)? }) => {
        #[derive(Debug)]
        pub struct $name { $(pub $field: $ty),* }
        impl EffectPayload for $name {
            const EFFECT_NAME: &'static str = stringify!($name);
            fn as_any(&self) -> &dyn std::any::Any { self }
        }
    };
}

// ---- Reader / Writer / State -------------------------------------------

effect_payload!(Ask { key: EnvKey });
effect_payload!(Get { key: String });
effect_payload!(Put { key: String, value: Value });

pub struct Modify {
    pub key: String,
    pub transform: Arc<dyn Fn(Value) -> Result<Value, crate::error::VmError> + Send + Sync>,
}
impl std::fmt::Debug for Modify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Modify({})", self.key)
    }
}
impl EffectPayload for Modify {
    const EFFECT_NAME: &'static str = "Modify";
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A structured writer log entry.
#[derive(Debug, Clone)]
pub enum LogEntry {
    Message(Arc<str>),
    Fields(Arc<std::collections::BTreeMap<String, Value>>),
}

effect_payload!(Tell { entry: LogEntry });

/// `Listen`'s result: the wrapped program's value paired with only the
/// writer entries it produced, not the whole task's log.
#[derive(Debug, Clone)]
pub struct ListenResult {
    pub value: Value,
    pub log: Arc<Vec<LogEntry>>,
}
impl OpaqueValue for ListenResult {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "ListenResult"
    }
}

/// `program` is taken exactly once by `handlers::writer::native_listen`; the
/// `Mutex<Option<_>>` is a one-shot cell like `DoCtrl::then`'s, not a
/// concurrency primitive — `DoCtrl` isn't `Clone`, so this is how an owned
/// sub-program rides inside an `Arc<dyn Any>` effect payload.
pub struct Listen {
    program: std::sync::Mutex<Option<DoCtrl>>,
}
impl std::fmt::Debug for Listen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listen(..)")
    }
}
impl EffectPayload for Listen {
    const EFFECT_NAME: &'static str = "Listen";
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
impl Listen {
    pub fn take_program(&self) -> DoCtrl {
        self.program
        .lock()
        .expect("listen mutex poisoned")
        .take()
        .expect("Listen program taken twice")
    }
}

// ---- Scheduler ----------------------------------------------

/// `program` is taken exactly once by
/// `handlers::scheduler_handlers::native_spawn`, same one-shot reasoning as
/// [`Listen`].
pub struct Spawn {
    program: std::sync::Mutex<Option<DoCtrl>>,
    pub context: Option<SourceContext>,
}
impl std::fmt::Debug for Spawn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Spawn(..)")
    }
}
impl EffectPayload for Spawn {
    const EFFECT_NAME: &'static str = "Spawn";
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
impl Spawn {
    pub fn take_program(&self) -> DoCtrl {
        self.program
        .lock()
        .expect("spawn mutex poisoned")
        .take()
        .expect("Spawn program taken twice")
    }
}
effect_payload!(Wait { handle: WaitHandle });
effect_payload!(Gather { handles: Vec<WaitHandle> });
effect_payload!(Race { handles: Vec<WaitHandle> });
effect_payload!(CreatePromise {});
effect_payload!(CompletePromiseEffect { promise: PromiseId, value: Value });
effect_payload!(FailPromiseEffect { promise: PromiseId, error: crate::error::VmError });
effect_payload!(CreateExternalPromise {});
effect_payload!(CreateSemaphore { permits: i64 });
effect_payload!(Acquire { semaphore: SemaphoreId });
effect_payload!(Release { semaphore: SemaphoreId });
effect_payload!(CancelTask { task: TaskId });

/// Builds `Perform(Effect::new(payload, ctx))`. Every public constructor
/// below is sugar over this.
pub fn perform<T: EffectPayload>(payload: T, context: Option<SourceContext>) -> DoCtrl {
    DoCtrl::Perform(Effect::new(payload, context))
}

pub fn ask(key: impl Into<EnvKey>) -> DoCtrl {
    perform(Ask { key: key.into() }, None)
}
pub fn get(key: impl Into<String>) -> DoCtrl {
    perform(Get { key: key.into() }, None)
}
pub fn put(key: impl Into<String>, value: impl Into<Value>) -> DoCtrl {
    perform(
        Put {
            key: key.into(),
            value: value.into(),
        },
        None,
    )
}
pub fn modify(
    key: impl Into<String>,
    f: impl Fn(Value) -> Result<Value, crate::error::VmError> + Send + Sync + 'static,
) -> DoCtrl {
    perform(
        Modify {
            key: key.into(),
            transform: Arc::new(f),
        },
        None,
    )
}
pub fn tell(message: impl Into<Arc<str>>) -> DoCtrl {
    perform(
        Tell {
            entry: LogEntry::Message(message.into()),
        },
        None,
    )
}
pub fn tell_fields(fields: std::collections::BTreeMap<String, Value>) -> DoCtrl {
    perform(
        Tell {
            entry: LogEntry::Fields(Arc::new(fields)),
        },
        None,
    )
}
pub fn listen(program: DoCtrl) -> DoCtrl {
    perform(
        Listen {
            program: std::sync::Mutex::new(Some(program)),
        },
        None,
    )
}

pub fn spawn(program: DoCtrl) -> DoCtrl {
    perform(
        Spawn {
            program: std::sync::Mutex::new(Some(program)),
            context: None,
        },
        None,
    )
}
pub fn wait(handle: WaitHandle) -> DoCtrl {
    perform(Wait { handle }, None)
}
pub fn gather(handles: Vec<WaitHandle>) -> DoCtrl {
    perform(Gather { handles }, None)
}
pub fn race(handles: Vec<WaitHandle>) -> DoCtrl {
    perform(Race { handles }, None)
}
pub fn create_promise() -> DoCtrl {
    perform(CreatePromise {}, None)
}
pub fn complete_promise(promise: PromiseId, value: Value) -> DoCtrl {
    perform(CompletePromiseEffect { promise, value }, None)
}
pub fn fail_promise(promise: PromiseId, error: crate::error::VmError) -> DoCtrl {
    perform(FailPromiseEffect { promise, error }, None)
}
pub fn create_external_promise() -> DoCtrl {
    perform(CreateExternalPromise {}, None)
}
pub fn create_semaphore(permits: i64) -> DoCtrl {
    perform(CreateSemaphore { permits }, None)
}
pub fn acquire(semaphore: SemaphoreId) -> DoCtrl {
    perform(Acquire { semaphore }, None)
}
pub fn release(semaphore: SemaphoreId) -> DoCtrl {
    perform(Release { semaphore }, None)
}
pub fn cancel_task(task: TaskId) -> DoCtrl {
    perform(CancelTask { task }, None)
}

// ---- Interceptors -------------------------------------------------------

/// `WithIntercept(program, transform, filter)`: installs `transform` ahead
/// of every `Perform` raised by `program` (and its sub-programs) whose
/// effect type matches `filter`, innermost-first alongside any interceptors
/// already installed by an enclosing `WithIntercept`.
pub fn with_intercept(
    program: DoCtrl,
    transform: impl Fn(&Effect) -> DoCtrl + Send + Sync + 'static,
    filter: TypeFilter,
) -> DoCtrl {
    let transform: InterceptFn = Arc::new(transform);
    DoCtrl::WithIntercept(transform, Box::new(program), filter)
}

/// `Intercept(program, transform)`: a thin convenience over
/// [`with_intercept`] for the common case of intercepting every effect type,
/// matching the original's two layers.
pub fn intercept(program: DoCtrl, transform: impl Fn(&Effect) -> DoCtrl + Send + Sync + 'static) -> DoCtrl {
    with_intercept(program, transform, TypeFilter::Exclude(Arc::from([])))
}
