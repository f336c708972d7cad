//! Handler stack `H` and effect dispatch.
//!
//! `H` is modeled as a persistent cons-list (`Arc<HandlerNode>`), the same
//! technique `env.rs` uses for `E`: pushing is O(1) and cheap to clone, and
//! a capturable continuation can hold on to an old `Arc<HandlerNode>`
//! indefinitely (used for `ScopeSignature`/restore-on-`Resume`) without
//! disturbing the live stack.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::continuation::{ContinuationRef, PromptId};
use crate::doctrl::{DoCtrl, HandlerFn};
use crate::value::{Effect, EffectType};

/// How a handler frame participates in dispatch.
#[derive(Clone)]
pub enum HandlerMode {
    Normal,
    /// Transparent for the listed types: dispatch skips this frame for
    /// effects of these types (installed by `Mask`).
    Masked(Arc<[EffectType]>),
}

impl fmt::Debug for HandlerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerMode::Normal => write!(f, "Normal"),
            HandlerMode::Masked(types) => write!(f, "Masked({})", types.len()),
        }
    }
}

/// `(handler_fn, prompt_id, mode)` — one frame in `H`.
/// Immutable and persistent: per-dispatch "consumed" bookkeeping lives on
/// the stack of the call handling one `Perform`/`Delegate` walk
/// (`evaluator::DispatchCtx`), never mutated on the frame itself, so frames
/// can be shared freely between the live `H` and captured snapshots.
#[derive(Clone)]
pub struct HandlerFrame {
    pub handler_fn: HandlerFn,
    pub prompt_id: PromptId,
    pub mode: HandlerMode,
    pub label: &'static str,
}

impl fmt::Debug for HandlerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerFrame({}, {})", self.label, self.prompt_id)
    }
}

/// Persistent handler stack. `Root` is the bottom (no handlers); `Cons`
/// pushes one frame on top (innermost).
pub enum HandlerNode {
    Root,
    Cons(HandlerFrame, Arc<HandlerNode>),
}

impl HandlerNode {
    pub fn root() -> Arc<HandlerNode> {
        Arc::new(HandlerNode::Root)
    }

    pub fn push(self: &Arc<HandlerNode>, frame: HandlerFrame) -> Arc<HandlerNode> {
        Arc::new(HandlerNode::Cons(frame, self.clone()))
    }

    pub fn len(&self) -> usize {
        match self {
            HandlerNode::Root => 0,
            HandlerNode::Cons(_, parent) => 1 + parent.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, HandlerNode::Root)
    }

    /// `H` truncated to the frames strictly below `depth_from_top` frames
    /// from the innermost end. Used to compute the outer `H` minus the
    /// chosen frame and everything inside it.
    pub fn ancestor(self: &Arc<HandlerNode>, skip_from_top: usize) -> Arc<HandlerNode> {
        let mut node = self.clone();
        for _ in 0..skip_from_top {
            node = match &*node {
                HandlerNode::Root => return HandlerNode::root(),
                HandlerNode::Cons(_, parent) => parent.clone(),
            };
        }
        node
    }

    /// Prompt ids from outermost to innermost, for `ScopeSignature`.
    pub fn prompt_ids(&self) -> Vec<PromptId> {
        let mut ids = Vec::new();
        let mut node = self;
        loop {
            match node {
                HandlerNode::Root => break,
                HandlerNode::Cons(frame, parent) => {
                    ids.push(frame.prompt_id);
                    node = parent;
                }
            }
        }
        ids.reverse();
        ids
    }
}

/// Result of a successful dispatch search.
pub struct DispatchHit {
    /// Depth of the matched frame counted from the innermost end (0 = the
    /// very top).
    pub depth_from_top: usize,
    pub frame: HandlerFrame,
}

/// Search `h` innermost-first for a frame that (a) isn't masked for
/// `effect_type`, and (b) isn't in `excluded` (already consumed for this
/// dispatch walk).
pub fn dispatch(
    h: &Arc<HandlerNode>,
    effect_type: EffectType,
    excluded: &HashSet<PromptId>,
) -> Option<DispatchHit> {
    let mut node = h;
    let mut depth = 0usize;
    loop {
        match &**node {
            HandlerNode::Root => return None,
            HandlerNode::Cons(frame, parent) => {
                let masked = match &frame.mode {
                    HandlerMode::Masked(types) => types.iter().any(|t| *t == effect_type),
                    HandlerMode::Normal => false,
                };
                if !masked && !excluded.contains(&frame.prompt_id) {
                    return Some(DispatchHit {
                            depth_from_top: depth,
                            frame: frame.clone(),
                    });
                }
                node = parent;
                depth += 1;
            }
        }
    }
}

/// Bookkeeping for one `Perform`'s dispatch walk, live while a handler body
/// is running (`evaluator::perform`/`evaluator::step`'s `Delegate`/`Pass`
/// arm). Saved/restored across nested dispatches via `Frame::DispatchRestore`
/// so a handler that itself performs (and resolves) a different effect
/// doesn't corrupt the outer walk's notion of "where to search next".
pub struct DispatchCtx {
    /// The one continuation captured for this `Perform`, shared unchanged
    /// across however many `Delegate` rounds it takes to resolve: delegating
    /// doesn't recapture — the same `k_user` is handed to each handler tried.
    pub k_user: ContinuationRef,
    /// The effect currently being offered; `Delegate(Some(e'))` replaces it
    /// for the next round, `Delegate(None)`/`Pass` keep it as-is. Also
    /// doubles as the `H` the currently-running handler round executes
    /// under, and the `H` to restore once that round resumes/returns
    /// (invariant 7: a handler's own effects see its installation depth).
    /// Mutated only by `Delegate`/`Pass` between rounds; a single round's
    /// own execution never touches it.
    state: Mutex<(Effect, Arc<HandlerNode>)>,
}

impl DispatchCtx {
    pub fn new(k_user: ContinuationRef, effect: Effect, search_from: Arc<HandlerNode>) -> Arc<DispatchCtx> {
        Arc::new(DispatchCtx {
                k_user,
                state: Mutex::new((effect, search_from)),
        })
    }

    pub fn effect(&self) -> Effect {
        self.state.lock().expect("dispatch ctx mutex poisoned").0.clone()
    }

    pub fn search_from(&self) -> Arc<HandlerNode> {
        self.state.lock().expect("dispatch ctx mutex poisoned").1.clone()
    }

    /// Installed by `Delegate`/`Pass` once the next candidate handler is
    /// found: narrows the round-`H` and (optionally) replaces the effect.
    pub fn advance(&self, effect: Effect, new_search_from: Arc<HandlerNode>) {
        let mut guard = self.state.lock().expect("dispatch ctx mutex poisoned");
        *guard = (effect, new_search_from);
    }
}

/// Builds a fresh handler stack from a flat list, declared innermost-first:
/// `handlers[0]` is searched before `handlers[1]`, as in `Eval`'s and
/// `run()`'s handler lists. Pushing is innermost-on-top, so the list is
/// installed back-to-front.
pub fn stack_from(handlers: Vec<HandlerFn>) -> Arc<HandlerNode> {
    let mut h = HandlerNode::root();
    for handler_fn in handlers.into_iter().rev() {
        h = h.push(HandlerFrame {
                handler_fn,
                prompt_id: PromptId::fresh(),
                mode: HandlerMode::Normal,
                label: "installed",
        });
    }
    h
}

/// `Override(handler, types, e)` desugars to a `WithHandler` whose handler
/// function delegates for any effect type not in `types`.
pub fn override_wrapper(handler: HandlerFn, types: Arc<[EffectType]>) -> HandlerFn {
    Arc::new(move |effect, k| {
            if types.iter().any(|t| *t == effect.effect_type) {
                handler(effect, k)
            } else {
                DoCtrl::Delegate(None)
            }
    })
}
