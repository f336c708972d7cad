//! Continuation frames and the one-shot [`Continuation`] object.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::doctrl::{DoCtrl, FlatMapFn, MapFn};
use crate::env::Env;
use crate::error::VmError;
use crate::generator::{GenHandle, GeneratorFactory};
use crate::handler::HandlerNode;
use crate::interceptor::{InterceptId, InterceptorNode};
use crate::value::{OpaqueValue, SourceContext, Value};

static PROMPT_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique id for a `WithHandler`/`Override`/`Mask`/`Eval` installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromptId(pub u64);

impl PromptId {
    pub fn fresh() -> Self {
        PromptId(PROMPT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One frame of the continuation `K`: a map/flatMap slot, a handler-prompt
/// boundary marker, a local-env boundary, an interceptor boundary, or a
/// task-return slot.
///
/// Not `Clone`: `ExpandArgs` holds `Vec<DoCtrl>`, and `DoCtrl` is
/// deliberately not `Clone` (a handler/generator body is reduced, never
/// duplicated). Nothing needs to clone a `Frame`/`Continuation` directly —
/// captured continuations are shared as `ContinuationRef` (`Arc`) instead.
pub enum Frame {
    Map(MapFn),
    FlatMap(FlatMapFn),
    /// Boundary installed by `WithHandler`/`Mask`/`Override`/`Eval`. Paired
    /// 1:1 with a `HandlerFrame` of the same `prompt_id` in `H` (except for
    /// `Eval`, which runs its own nested trampoline and never shares `H`
    /// with the caller).
    Prompt { prompt_id: PromptId, label: &'static str },
    /// What a `Prompt` frame turns into once `Resume` has spliced the
    /// captured frames it belongs to back onto a live `K` (`evaluator.rs`):
    /// the frame's own `H` removal already happened at capture time, so
    /// reaching it again on replay must not touch `H` by the ordinary
    /// `ancestor(1)` rule — instead it *installs* `restore_h`, which is
    /// whatever `H` the resuming handler was running under at the moment it
    /// called `Resume`. That's what lets the handler's own code (after the
    /// `yield Resume(...)`) keep running under its own handler-stack view
    /// once the replayed user continuation bottoms out.
    ClosedPrompt { restore_h: Arc<HandlerNode> },
    /// Restores `E` to `previous` once the sub-expression under `Local`
    /// completes (invariant 4).
    Env { previous: Arc<Env> },
    /// Restores the interceptor chain to `previous` once the sub-expression
    /// under `WithIntercept` completes.
    Intercept { previous: Arc<InterceptorNode> },
    /// Marks the extent of an effectful replacement program produced by
    /// interceptor `id` (spec §4.5 non-reentry). Installed around the
    /// replacement so every effect it performs is exempt from `id`'s own
    /// filter for as long as it runs; removed from the guard set on either
    /// bubbling path once the replacement settles.
    InterceptGuard(InterceptId),
    /// `Try(e)` boundary: on a `Failed` unwind reaching this frame, the
    /// error becomes `Pure(Ok/Err)` instead of propagating.
    Catch,
    /// A suspended `@do` generator mid-`Expand`; driven one step per visit
    /// (`evaluator.rs`), feeding the reduced value or propagating error back
    /// into `EffectProgram::resume`.
    GenStep(GenHandle),
    /// `Expand(factory, args)` mid-flight: `args` are reduced left to right
    /// through the ordinary trampoline (not via host recursion, so a
    /// blocking effect inside an argument expression still suspends the
    /// whole task correctly) and accumulated here until all are ready, at
    /// which point `factory` is invoked and its generator is driven from
    /// its first step.
    ExpandArgs {
        remaining: Vec<DoCtrl>,
        evaluated: Vec<Value>,
        factory: GeneratorFactory,
    },
    /// Marks where a handler body's own dispatch round ends: reaching this
    /// frame (by ordinary bubbling, success or failure) pops one entry off
    /// the evaluator's side `dispatch_stack`, restoring the enclosing
    /// `Perform`'s delegate-monotonicity bookkeeping.
    /// `Transfer` discards its whole frame prefix including this one and
    /// pops `dispatch_stack` itself to compensate, since it never reaches
    /// this frame by bubbling.
    DispatchRestore,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Map(_) => write!(f, "Map(..)"),
            Frame::FlatMap(_) => write!(f, "FlatMap(..)"),
            Frame::Prompt { prompt_id, label } => write!(f, "Prompt({label}, {prompt_id})"),
            Frame::ClosedPrompt {.. } => write!(f, "ClosedPrompt"),
            Frame::Env {.. } => write!(f, "Env(restore)"),
            Frame::Intercept {.. } => write!(f, "Intercept(restore)"),
            Frame::InterceptGuard(id) => write!(f, "InterceptGuard({id:?})"),
            Frame::Catch => write!(f, "Catch"),
            Frame::GenStep(gen) => write!(f, "GenStep({:?})", gen.lock().expect("generator mutex poisoned")),
            Frame::ExpandArgs { remaining, evaluated, .. } => {
                write!(f, "ExpandArgs({} evaluated, {} remaining)", evaluated.len(), remaining.len())
            }
            Frame::DispatchRestore => write!(f, "DispatchRestore"),
        }
    }
}

/// `K`: an ordered list of frames, innermost/next-to-run at the end (Rust
/// `Vec` push/pop = stack top). Not `Clone`, same reason as `Frame`.
#[derive(Default)]
pub struct Continuation {
    pub frames: Vec<Frame>,
}

impl Continuation {
    pub fn new() -> Self {
        Continuation { frames: Vec::new() }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Captures the prefix down to and including the prompt frame for
    /// `prompt_id`, removing those frames from `self`. Returns frames in
    /// pop order (nearest-to-`Perform` first).
    pub fn split_at_prompt(&mut self, prompt_id: PromptId) -> Option<Vec<Frame>> {
        let mut captured = Vec::new();
        loop {
            let frame = self.frames.pop()?;
            let is_prompt = matches!(&frame, Frame::Prompt { prompt_id: p, .. } if *p == prompt_id);
            captured.push(frame);
            if is_prompt {
                return Some(captured);
            }
        }
    }

    /// Splice a captured prefix back onto the front of this continuation
    /// (i.e. make it run next), preserving internal order.
    pub fn splice_front(&mut self, captured: Vec<Frame>) {
        for frame in captured.into_iter().rev() {
            self.frames.push(frame);
        }
    }
}

/// The handler-stack depth recorded with a captured continuation: the
/// sequence of prompt ids that must still prefix the live handler stack for
/// a `Resume`/`Transfer` to be valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSignature(pub Vec<PromptId>);

impl ScopeSignature {
    pub fn of(h: &Arc<HandlerNode>) -> Self {
        ScopeSignature(h.prompt_ids())
    }

    /// True iff `current` extends `self` as a prefix: the current `H` is a
    /// prefix extended only by frames inside the handler's own evaluation.
    pub fn still_valid_in(&self, current: &Arc<HandlerNode>) -> bool {
        let current_ids = current.prompt_ids();
        current_ids.len() >= self.0.len() && current_ids[..self.0.len()] == self.0[..]
    }
}

/// A one-shot delimited continuation.
pub struct ContinuationObj {
    pub id: u64,
    frames: Mutex<Option<Vec<Frame>>>,
    /// Full `H` as it existed at the moment of capture (for full restore on
    /// `Resume`/`Transfer` — see `evaluator.rs`).
    pub h_at_capture: Arc<HandlerNode>,
    /// Scope the continuation may legally be resumed under.
    pub scope: ScopeSignature,
    pub context: Option<SourceContext>,
}

pub type ContinuationRef = Arc<ContinuationObj>;

impl fmt::Debug for ContinuationObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Continuation(#{})", self.id)
    }
}

impl ContinuationObj {
    pub fn new(
        frames: Vec<Frame>,
        h_at_capture: Arc<HandlerNode>,
        scope: ScopeSignature,
        context: Option<SourceContext>,
    ) -> ContinuationRef {
        Arc::new(ContinuationObj {
                id: CONT_COUNTER.fetch_add(1, Ordering::Relaxed),
                frames: Mutex::new(Some(frames)),
                h_at_capture,
                scope,
                context,
        })
    }

    /// Take ownership of the captured frames, enforcing one-shot use
    /// (invariant 1).
    pub fn take_frames(&self) -> Result<Vec<Frame>, VmError> {
        let mut guard = self.frames.lock().expect("continuation mutex poisoned");
        guard.take().ok_or(VmError::OneShotViolation)
    }

    pub fn is_consumed(&self) -> bool {
        self.frames.lock().expect("continuation mutex poisoned").is_none()
    }
}

impl OpaqueValue for ContinuationObj {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "Continuation"
    }
}

pub fn continuation_value(k: ContinuationRef) -> Value {
    Value::Opaque(k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerFrame, HandlerMode};

    fn frame(prompt_id: PromptId) -> HandlerFrame {
        HandlerFrame {
            handler_fn: Arc::new(|_, _| DoCtrl::Pass),
            prompt_id,
            mode: HandlerMode::Normal,
            label: "test",
        }
    }

    #[test]
    fn take_frames_is_one_shot() {
        let k = ContinuationObj::new(vec![], HandlerNode::root(), ScopeSignature(vec![]), None);
        assert!(k.take_frames().is_ok());
        assert!(k.is_consumed());
        match k.take_frames() {
            Err(VmError::OneShotViolation) => {}
            other => panic!("expected OneShotViolation, got {other:?}"),
        }
    }

    #[test]
    fn scope_signature_accepts_extension_but_rejects_divergence() {
        let p1 = PromptId::fresh();
        let p2 = PromptId::fresh();
        let root = HandlerNode::root();
        let h1 = root.push(frame(p1));
        let captured = ScopeSignature::of(&h1);

        // extending h1 with a nested frame still satisfies the prefix.
        let h1_nested = h1.push(frame(p2));
        assert!(captured.still_valid_in(&h1_nested));

        // a sibling stack that never had p1 installed does not.
        let p3 = PromptId::fresh();
        let sibling = root.push(frame(p3));
        assert!(!captured.still_valid_in(&sibling));

        // popping back below the capture depth also invalidates it.
        assert!(!captured.still_valid_in(&root));
    }

    #[test]
    fn split_at_prompt_captures_down_to_and_including_boundary() {
        let prompt_id = PromptId::fresh();
        let mut k = Continuation::new();
        k.push(Frame::Map(Arc::new(|v| v)));
        k.push(Frame::Prompt { prompt_id, label: "h" });
        k.push(Frame::Map(Arc::new(|v| v)));

        let captured = k.split_at_prompt(prompt_id).expect("prompt frame present");
        assert_eq!(captured.len(), 2);
        assert!(k.frames.len() == 1);
    }
}
