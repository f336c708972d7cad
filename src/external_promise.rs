//! External-promise bridge.
//!
//! `std::sync::mpsc`, not a `tokio` channel: completion producers may be
//! plain OS threads with no async runtime of their own. `tokio::sync::Notify`
//! wakes the run loop when it's idle waiting on this channel.

use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

use crate::error::VmError;
use crate::scheduler::{Completion, PromiseId, Scheduler};

/// One pending completion enqueued from outside the VM.
struct PendingCompletion {
    promise_id: PromiseId,
    outcome: Completion,
}

/// Owned by the scheduler; `ExternalPromise::complete`/`fail` hold a cheap
/// clone of the `Sender` half and may be called from any thread: they are
/// thread-safe because they only enqueue and return, never execute user
/// `DoCtrl` directly.
pub struct ExternalChannel {
    sender: Sender<PendingCompletion>,
    receiver: std::sync::Mutex<Receiver<PendingCompletion>>,
    pub notify: Notify,
}

impl std::fmt::Debug for ExternalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExternalChannel")
    }
}

impl ExternalChannel {
    pub fn new() -> Arc<ExternalChannel> {
        let (sender, receiver) = std::sync::mpsc::channel();
        Arc::new(ExternalChannel {
                sender,
                receiver: std::sync::Mutex::new(receiver),
                notify: Notify::new(),
        })
    }

    fn enqueue(&self, promise_id: PromiseId, outcome: Completion) {
        // A closed receiver only happens once the owning run has already
        // finished; completing into a finished run is a no-op, not an error,
        // since nothing is listening any more.
        let _ = self.sender.send(PendingCompletion { promise_id, outcome });
        self.notify.notify_one();
    }

    /// Drains at most `max` pending completions into `scheduler`. Draining
    /// is bounded per loop iteration to preserve fairness with ready tasks.
    pub fn drain(&self, scheduler: &Scheduler, max: usize) -> usize {
        let receiver = self.receiver.lock().unwrap();
        let mut drained = 0;
        while drained < max {
            match receiver.try_recv() {
                Ok(pending) => {
                    trace!(promise_id = pending.promise_id.0, "external completion drained");
                    let _ = scheduler.resolve_promise(pending.promise_id, pending.outcome);
                    drained += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        drained
    }

    /// Blocks the calling (VM run) thread until one external completion
    /// arrives, then applies it. Only called once the scheduler has nothing
    /// else runnable and at least one wait is known to be external, so the
    /// VM never spins. Returns `false` if every `ExternalPromise` handle for
    /// this channel has been dropped (the sender disconnected), which the
    /// caller treats as an unrecoverable deadlock.
    pub fn blocking_recv_into(&self, scheduler: &Scheduler) -> bool {
        let receiver = self.receiver.lock().unwrap();
        match receiver.recv() {
            Ok(pending) => {
                trace!(promise_id = pending.promise_id.0, "external completion received (blocking)");
                let _ = scheduler.resolve_promise(pending.promise_id, pending.outcome);
                true
            }
            Err(_) => false,
        }
    }
}

/// The host-facing handle returned by `CreateExternalPromise`.
/// `complete`/`fail` may be called from any thread; they are the only
/// cross-thread entry point into the VM's state.
#[derive(Clone, Debug)]
pub struct ExternalPromise {
    pub promise_id: PromiseId,
    channel: Arc<ExternalChannel>,
}

impl crate::value::OpaqueValue for ExternalPromise {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "ExternalPromise"
    }
}

impl ExternalPromise {
    pub fn new(promise_id: PromiseId, channel: Arc<ExternalChannel>) -> Self {
        ExternalPromise { promise_id, channel }
    }

    pub fn complete(&self, value: crate::value::Value) {
        self.channel.enqueue(self.promise_id, Completion::Value(value));
    }

    pub fn fail(&self, error: VmError) {
        self.channel.enqueue(self.promise_id, Completion::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::value::Value;

    #[test]
    fn complete_from_another_thread_is_drained_once() {
        let scheduler = Scheduler::new();
        let channel = ExternalChannel::new();
        let entry = scheduler.create_promise(true);
        let ext = ExternalPromise::new(entry.id, channel.clone());

        let handle = std::thread::spawn(move || {
                ext.complete(Value::Int(42));
        });
        handle.join().unwrap();

        let drained = channel.drain(&scheduler, 10);
        assert_eq!(drained, 1);
        let completed = entry.completed.lock().unwrap().clone();
        match completed {
            Some(Completion::Value(Value::Int(42))) => {}
            other => panic!("unexpected completion: {other:?}"),
        }
    }
}
