//! Cooperative task scheduler: task table, waiter graph, promise table,
//! semaphore table.
//!
//! Tables are `DashMap`s even though this scheduler is driven by a single
//! logical thread of control: `DashMap` buys lock-free reads for traceback
//! rendering and for the external-promise bridge's cross-thread completions
//! (`external_promise.rs`) without a dedicated `Mutex<HashMap<..>>` per
//! table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::doctrl::DoCtrl;
use crate::env::Env;
use crate::error::VmError;
use crate::external_promise::ExternalChannel;
use crate::handler::HandlerNode;
use crate::interceptor::InterceptorNode;
use crate::store::Store;
use crate::value::{OpaqueValue, Value};

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemaphoreId(pub u64);

/// Anything a task can `Wait` on: a task's own completion, or a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitHandle {
    Task(TaskId),
    Promise(PromiseId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    Waiting(WaitHandle),
    Done,
    Cancelled,
}

/// Outcome delivered to whoever waits on a task or promise.
#[derive(Debug, Clone)]
pub enum Completion {
    Value(Value),
    Error(VmError),
    Cancelled,
}

/// A spawned-but-not-yet-run program: the `DoCtrl` tree plus the lexical `E`
/// it closed over at `Spawn` time. Taken (moved out) the first time anything
/// drives this task to completion (`evaluator::Evaluator::drive_task`).
pub struct PendingProgram {
    pub program: DoCtrl,
    pub env: Arc<Env>,
    /// Handler stack and interceptor chain inherited from the spawn site
    /// (a spawned task still sees the ambient handlers lexically
    /// in scope at its `Spawn` call, not an empty one).
    pub h: Arc<HandlerNode>,
    pub intercepts: Arc<InterceptorNode>,
}

/// A scheduled program's bookkeeping.
pub struct TaskEntry {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    /// Spawn-site provenance for tracebacks.
    pub spawn_context: Option<crate::value::SourceContext>,
    pub status: std::sync::Mutex<TaskStatus>,
    pub result: std::sync::Mutex<Option<Completion>>,
    /// Tasks/waiters parked on this task's completion.
    pub waiters: std::sync::Mutex<Vec<WaitHandle>>,
    /// Isolated store snapshot this task owns (invariant 6/7).
    pub store: std::sync::Mutex<Store>,
    pub pending: std::sync::Mutex<Option<PendingProgram>>,
    /// Writer-effect entries accumulated while driving this task; read back
    /// once the task reaches `Done`/`Failed`.
    pub log: std::sync::Mutex<Vec<crate::effects::LogEntry>>,
}

pub struct PromiseEntry {
    pub id: PromiseId,
    pub completed: std::sync::Mutex<Option<Completion>>,
    pub waiters: std::sync::Mutex<Vec<WaitHandle>>,
    /// Set for promises created via `CreateExternalPromise`;
    /// lets the traceback assembler and `Deadlock` detection tell external
    /// waits apart from purely-internal ones.
    pub external: bool,
}

pub struct SemaphoreEntry {
    pub id: SemaphoreId,
    pub permits: std::sync::Mutex<i64>,
    /// FIFO queue of tasks parked on `Acquire`, for fair wakeup order.
    pub waiters: std::sync::Mutex<VecDeque<TaskId>>,
}

/// `Task` handle value returned by `Spawn`.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
}
impl OpaqueValue for TaskHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "Task"
    }
}
impl TaskHandle {
    pub fn wait_handle(&self) -> WaitHandle {
        WaitHandle::Task(self.id)
    }
}

/// `Promise` handle value.
#[derive(Debug, Clone)]
pub struct PromiseHandle {
    pub id: PromiseId,
}
impl OpaqueValue for PromiseHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "Promise"
    }
}
impl PromiseHandle {
    pub fn wait_handle(&self) -> WaitHandle {
        WaitHandle::Promise(self.id)
    }
}

/// `Semaphore` handle value.
#[derive(Debug, Clone)]
pub struct SemaphoreHandle {
    pub id: SemaphoreId,
}
impl OpaqueValue for SemaphoreHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "Semaphore"
    }
}

/// The result of a `Race`: the handle that won, its value, and the handles
/// still outstanding.
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub first: WaitHandle,
    pub value: Value,
    pub rest: Vec<WaitHandle>,
}
impl OpaqueValue for RaceResult {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "RaceResult"
    }
}

/// The scheduler owned by one `run()` call.
pub struct Scheduler {
    task_counter: AtomicU64,
    promise_counter: AtomicU64,
    semaphore_counter: AtomicU64,
    pub tasks: DashMap<TaskId, Arc<TaskEntry>>,
    pub promises: DashMap<PromiseId, Arc<PromiseEntry>>,
    pub semaphores: DashMap<SemaphoreId, Arc<SemaphoreEntry>>,
    /// FIFO ready queue: task ids plus what to resume them with.
    ready: std::sync::Mutex<VecDeque<(TaskId, Option<Completion>)>>,
    /// Cross-thread completion bridge shared by every `CreateExternalPromise`
    /// call made during this run.
    pub external_channel: Arc<ExternalChannel>,
}

impl Scheduler {
    pub fn new() -> Arc<Scheduler> {
        Arc::new(Scheduler {
                task_counter: AtomicU64::new(1),
                promise_counter: AtomicU64::new(1),
                semaphore_counter: AtomicU64::new(1),
                tasks: DashMap::new(),
                promises: DashMap::new(),
                semaphores: DashMap::new(),
                ready: std::sync::Mutex::new(VecDeque::new()),
                external_channel: ExternalChannel::new(),
        })
    }

    pub fn spawn_task(
        self: &Arc<Self>,
        parent: Option<TaskId>,
        store_snapshot: Store,
        spawn_context: Option<crate::value::SourceContext>,
        pending: PendingProgram,
    ) -> Arc<TaskEntry> {
        let id = TaskId(next_id(&self.task_counter));
        let entry = Arc::new(TaskEntry {
                id,
                parent,
                spawn_context,
                status: std::sync::Mutex::new(TaskStatus::Ready),
                result: std::sync::Mutex::new(None),
                waiters: std::sync::Mutex::new(Vec::new()),
                store: std::sync::Mutex::new(store_snapshot),
                pending: std::sync::Mutex::new(Some(pending)),
                log: std::sync::Mutex::new(Vec::new()),
        });
        self.tasks.insert(id, entry.clone());
        self.ready.lock().unwrap().push_back((id, None));
        debug!(task_id = id.0, ?parent, "task spawned");
        entry
    }

    /// Any task still sitting on an unrun program, for the synchronous
    /// "drive whatever's runnable" loop the evaluator's wait-for-progress
    /// path uses in place of true suspend/resume.
    pub fn any_pending_task(&self) -> Option<TaskId> {
        self.tasks
        .iter()
        .find(|kv| {
                matches!(*kv.value().status.lock().unwrap(), TaskStatus::Ready)
                && kv.value().pending.lock().unwrap().is_some()
        })
        .map(|kv| *kv.key())
    }

    pub fn already_complete(&self, handle: WaitHandle) -> Option<Completion> {
        match handle {
            WaitHandle::Task(t) => self.tasks.get(&t).and_then(|e| e.result.lock().unwrap().clone()),
            WaitHandle::Promise(p) => self.promises.get(&p).and_then(|e| e.completed.lock().unwrap().clone()),
        }
    }

    /// Take (and peek, without blocking) a permit outside the FIFO-waiter
    /// path: used by the synchronous `Acquire` fast path, which polls rather
    /// than truly suspending.
    pub fn acquire_poll(&self, id: SemaphoreId) -> Result<bool, VmError> {
        let entry = self.semaphores.get(&id).ok_or_else(|| VmError::HandlerContract {
                message: format!("unknown semaphore {}", id.0),
        })?;
        let mut permits = entry.permits.lock().unwrap();
        if *permits > 0 {
            *permits -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn pop_ready(&self) -> Option<(TaskId, Option<Completion>)> {
        self.ready.lock().unwrap().pop_front()
    }

    pub fn push_ready(&self, task_id: TaskId, resume: Option<Completion>) {
        self.ready.lock().unwrap().push_back((task_id, resume));
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.lock().unwrap().is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    fn waiting_task_count(&self) -> usize {
        self.tasks
        .iter()
        .filter(|kv| matches!(*kv.value().status.lock().unwrap(), TaskStatus::Waiting(_)))
        .count()
    }

    /// Called when a task finishes (successfully, with an error, or
    /// cancelled): records the result and wakes every waiter.
    pub fn complete_task(&self, task_id: TaskId, outcome: Completion) {
        let Some(entry) = self.tasks.get(&task_id) else {
            return;
        };
        {
            let mut status = entry.status.lock().unwrap();
            if *status == TaskStatus::Done || *status == TaskStatus::Cancelled {
                return;
            }
            *status = match &outcome {
                Completion::Cancelled => TaskStatus::Cancelled,
                _ => TaskStatus::Done,
            };
        }
        *entry.result.lock().unwrap() = Some(outcome.clone());
        let waiters = std::mem::take(&mut *entry.waiters.lock().unwrap());
        for waiter in waiters {
            self.wake_waiter(waiter, outcome.clone());
        }
        debug!(task_id = task_id.0, "task completed");
    }

    fn wake_waiter(&self, handle: WaitHandle, outcome: Completion) {
        match handle {
            WaitHandle::Task(t) => self.push_ready(t, Some(outcome)),
            WaitHandle::Promise(_) => {
                // Promises don't themselves "wake" into the ready queue; a
                // task parked on `Wait(promise)` is represented by a
                // `WaitHandle::Task` waiter on the *promise's* waiter list,
                // never the reverse, so this arm is unreachable in practice.
                warn!("wake_waiter called with a Promise handle, ignoring");
                let _ = outcome;
            }
        }
    }

    /// Register `waiter_task` as blocked on `target`: the task's state is
    /// saved, its task_id registered as a waiter. Returns `Some(completion)`
    /// immediately if `target` had already finished, so the caller doesn't
    /// need a separate "already done" check.
    pub fn register_waiter(&self, target: WaitHandle, waiter_task: TaskId) -> Option<Completion> {
        match target {
            WaitHandle::Task(t) => {
                let Some(entry) = self.tasks.get(&t) else {
                    return Some(Completion::Error(VmError::HandlerContract {
                                message: format!("Wait on unknown task {}", t.0),
                    }));
                };
                let status = entry.status.lock().unwrap();
                if matches!(*status, TaskStatus::Done | TaskStatus::Cancelled) {
                    return entry.result.lock().unwrap().clone();
                }
                drop(status);
                entry.waiters.lock().unwrap().push(WaitHandle::Task(waiter_task));
                None
            }
            WaitHandle::Promise(p) => {
                let Some(entry) = self.promises.get(&p) else {
                    return Some(Completion::Error(VmError::HandlerContract {
                                message: format!("Wait on unknown promise {}", p.0),
                    }));
                };
                let completed = entry.completed.lock().unwrap();
                if let Some(c) = completed.clone() {
                    return Some(c);
                }
                drop(completed);
                entry.waiters.lock().unwrap().push(WaitHandle::Task(waiter_task));
                None
            }
        }
    }

    pub fn create_promise(&self, external: bool) -> Arc<PromiseEntry> {
        let id = PromiseId(next_id(&self.promise_counter));
        let entry = Arc::new(PromiseEntry {
                id,
                completed: std::sync::Mutex::new(None),
                waiters: std::sync::Mutex::new(Vec::new()),
                external,
        });
        self.promises.insert(id, entry.clone());
        entry
    }

    /// `Complete`/`Fail` a promise. Double-completion raises, since
    /// completion is idempotent-once.
    pub fn resolve_promise(&self, id: PromiseId, outcome: Completion) -> Result<(), VmError> {
        let Some(entry) = self.promises.get(&id) else {
            return Err(VmError::HandlerContract {
                    message: format!("unknown promise {}", id.0),
            });
        };
        {
            let mut completed = entry.completed.lock().unwrap();
            if completed.is_some() {
                return Err(VmError::PromiseAlreadyCompleted { promise_id: id.0 });
            }
            *completed = Some(outcome.clone());
        }
        let waiters = std::mem::take(&mut *entry.waiters.lock().unwrap());
        for waiter in waiters {
            self.wake_waiter(waiter, outcome.clone());
        }
        trace!(promise_id = id.0, "promise resolved");
        Ok(())
    }

    pub fn create_semaphore(&self, permits: i64) -> Result<Arc<SemaphoreEntry>, VmError> {
        if permits < 1 {
            return Err(VmError::HandlerContract {
                    message: "permits must be >= 1".to_string(),
            });
        }
        let id = SemaphoreId(next_id(&self.semaphore_counter));
        let entry = Arc::new(SemaphoreEntry {
                id,
                permits: std::sync::Mutex::new(permits),
                waiters: std::sync::Mutex::new(VecDeque::new()),
        });
        self.semaphores.insert(id, entry.clone());
        Ok(entry)
    }

    /// Returns `true` if the permit was granted immediately, `false` if the
    /// caller must block (and has been enqueued as a waiter).
    pub fn try_acquire(&self, id: SemaphoreId, waiter_task: TaskId) -> Result<bool, VmError> {
        let entry = self.semaphores.get(&id).ok_or_else(|| VmError::HandlerContract {
                message: format!("unknown semaphore {}", id.0),
        })?;
        let mut permits = entry.permits.lock().unwrap();
        if *permits > 0 {
            *permits -= 1;
            Ok(true)
        } else {
            entry.waiters.lock().unwrap().push_back(waiter_task);
            Ok(false)
        }
    }

    /// Releases a permit, waking the next FIFO waiter if any.
    pub fn release(&self, id: SemaphoreId) -> Result<Option<TaskId>, VmError> {
        let entry = self.semaphores.get(&id).ok_or_else(|| VmError::HandlerContract {
                message: format!("unknown semaphore {}", id.0),
        })?;
        let mut waiters = entry.waiters.lock().unwrap();
        if let Some(next) = waiters.pop_front() {
            drop(waiters);
            self.push_ready(next, Some(Completion::Value(Value::Unit)));
            Ok(Some(next))
        } else {
            *entry.permits.lock().unwrap() += 1;
            Ok(None)
        }
    }

    /// Removes a waiting/cancelled-in-advance task from every waiter queue it
    /// might be parked in, resolving it with `TaskCancelledError`.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let Some(entry) = self.tasks.get(&id) else {
            return false;
        };
        let mut status = entry.status.lock().unwrap();
        if matches!(*status, TaskStatus::Done | TaskStatus::Cancelled) {
            return false;
        }
        *status = TaskStatus::Cancelled;
        drop(status);
        *entry.result.lock().unwrap() = Some(Completion::Cancelled);
        for kv in self.semaphores.iter() {
            kv.value().waiters.lock().unwrap().retain(|t| *t != id);
        }
        self.ready.lock().unwrap().retain(|(t, _)| *t != id);
        let waiters = std::mem::take(&mut *entry.waiters.lock().unwrap());
        for waiter in waiters {
            self.wake_waiter(waiter, Completion::Cancelled);
        }
        debug!(task_id = id.0, "task cancelled");
        true
    }

    /// No ready tasks and at least one task parked waiting:
    /// deadlock, *unless* some of those waits are on external promises that
    /// may still resolve from another thread (the caller checks that case
    /// before calling this).
    pub fn is_deadlocked(&self) -> bool {
        !self.has_ready() && self.waiting_task_count() > 0
    }
}
