//! The `Await` effect: bridges a host future into the VM without blocking
//! the trampoline on it.
//!
//! Lives outside `handlers/` (unlike `Ask`/`Get`/`Tell`/the scheduler
//! family) because it is the one native effect whose behavior genuinely
//! differs between the two run entrypoints: under `run()` there is no host
//! event loop to hand work to, so it falls back to driving the future to
//! completion in place; under `async_run()` the VM has a
//! `tokio::runtime::Handle` (`evaluator::Vm::runtime_handle`) and spawns the
//! future, bridging its result back through an `ExternalPromise` exactly the
//! way any other external I/O would.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::doctrl::DoCtrl;
use crate::error::VmError;
use crate::evaluator::{self, Signal, TaskState, Vm};
use crate::external_promise::ExternalPromise;
use crate::scheduler::WaitHandle;
use crate::value::{EffectPayload, Value};

pub type BoxFuture = Pin<Box<dyn Future<Output = Result<Value, VmError>> + Send>>;

/// `Await(future)`. The future is taken exactly once by `native_await`, the
/// same one-shot-cell reasoning as `Spawn`'s and `Listen`'s program fields
/// (`effects.rs`) — `DoCtrl`/futures aren't `Clone` and an effect payload
/// must be `Send + Sync` while only holding one logical owner.
pub struct Await {
    future: Mutex<Option<BoxFuture>>,
}

impl std::fmt::Debug for Await {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Await(..)")
    }
}

impl EffectPayload for Await {
    const EFFECT_NAME: &'static str = "Await";
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Lifts a host future into a `DoCtrl` performing `Await(hostFuture)`.
pub fn await_future(fut: impl Future<Output = Result<Value, VmError>> + Send + 'static) -> DoCtrl {
    crate::effects::perform(
        Await {
            future: Mutex::new(Some(Box::pin(fut))),
        },
        None,
    )
}

pub(crate) fn native_await(vm: &Arc<Vm>, state: &mut TaskState, effect: &Await) -> Signal {
    let fut = effect
    .future
    .lock()
    .expect("await future mutex poisoned")
    .take()
    .expect("Await future taken twice");

    match vm.runtime_handle() {
        Some(handle) => {
            // async_run: never block this thread on the future. Resolve it
            // on the host event loop and bridge the result back through the
            // same external-promise channel real cross-thread I/O uses.
            let entry = vm.scheduler.create_promise(true);
            let ext = ExternalPromise::new(entry.id, vm.scheduler.external_channel.clone());
            handle.spawn(async move {
                    match fut.await {
                        Ok(v) => ext.complete(v),
                        Err(e) => ext.fail(e),
                    }
            });
            evaluator::wait_or_block(vm, state, WaitHandle::Promise(entry.id))
        }
        None => {
            // run(): no event loop to hand this to, so drive it to
            // completion synchronously.
            match futures::executor::block_on(fut) {
                Ok(v) => evaluator::pure_next(state, v),
                Err(e) => evaluator::fail_next(state, e),
            }
        }
    }
}
