//! Pre-dispatch interceptor pipeline.
//!
//! Modeled the same way `handler.rs` models `H`: a persistent cons-list so a
//! captured continuation (or a spawned task's lexical snapshot) can hold an
//! old `Arc<InterceptorNode>` without disturbing the live chain.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::doctrl::{DoCtrl, InterceptFn, TypeFilter};
use crate::value::Effect;

static INTERCEPT_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptId(pub u64);

impl InterceptId {
    pub fn fresh() -> Self {
        InterceptId(INTERCEPT_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// One installed `WithIntercept` frame.
pub struct InterceptorEntry {
    pub id: InterceptId,
    pub transform: InterceptFn,
    pub filter: TypeFilter,
}

/// Persistent interceptor chain, innermost (most recently installed) first.
pub enum InterceptorNode {
    Root,
    Cons(InterceptorEntry, Arc<InterceptorNode>),
}

impl fmt::Debug for InterceptorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = Vec::new();
        let mut node = self;
        loop {
            match node {
                InterceptorNode::Root => break,
                InterceptorNode::Cons(entry, parent) => {
                    ids.push(entry.id.0);
                    node = parent;
                }
            }
        }
        write!(f, "InterceptorNode({ids:?})")
    }
}

impl InterceptorNode {
    pub fn root() -> Arc<InterceptorNode> {
        Arc::new(InterceptorNode::Root)
    }

    pub fn push(self: &Arc<InterceptorNode>, transform: InterceptFn, filter: TypeFilter) -> Arc<InterceptorNode> {
        Arc::new(InterceptorNode::Cons(
                InterceptorEntry {
                    id: InterceptId::fresh(),
                    transform,
                    filter,
                },
                self.clone(),
        ))
    }

    /// Run `effect` through the chain, innermost-first, each stage seeing
    /// the previous stage's output. Stops early the moment a transform's
    /// output is not itself a `Perform` of the same effect-typed shape,
    /// since there is nothing further to intercept — that case is
    /// `InterceptOutcome::Expanded`, carrying the id of the interceptor that
    /// produced it so the caller can keep it exempt from its own filter for
    /// as long as the replacement program runs (invariant 12: an
    /// interceptor never re-intercepts its own emissions).
    ///
    /// `guard` is the set of interceptor ids currently expanding an
    /// effectful replacement elsewhere in this task's active call stack —
    /// those are skipped during matching the same way an exempt effect is,
    /// since `Effect::exempting` only travels with one effect value and
    /// can't cover effects freshly created deeper inside a replacement
    /// program.
    ///
    /// Returns `None` if no interceptor in the chain matched (the original
    /// `Perform(effect)` should be dispatched unchanged).
    pub fn apply(self: &Arc<InterceptorNode>, effect: &Effect, guard: &HashSet<InterceptId>) -> Option<InterceptOutcome> {
        let mut node = self.clone();
        let mut current = effect.clone();
        let mut replaced = false;
        loop {
            match &*node {
                InterceptorNode::Root => break,
                InterceptorNode::Cons(entry, parent) => {
                    let matches = entry.filter.matches(current.effect_type)
                    && !current.is_exempt(entry.id.0)
                    && !guard.contains(&entry.id);
                    if matches {
                        replaced = true;
                        let next = (entry.transform)(&current);
                        match next {
                            DoCtrl::Perform(e2) => {
                                current = e2.exempting(entry.id.0);
                            }
                            other => return Some(InterceptOutcome::Expanded(other, entry.id)),
                        }
                    }
                    node = parent.clone();
                }
            }
        }
        if replaced {
            Some(InterceptOutcome::Replaced(current))
        } else {
            None
        }
    }
}

/// What running an effect through the interceptor chain produced.
pub enum InterceptOutcome {
    /// Still conceptually the same `Perform`, carried through one or more
    /// matching entries that each re-offered it via `Perform`; dispatch the
    /// contained (possibly substituted) effect normally.
    Replaced(Effect),
    /// A transform returned a full effectful program instead of another
    /// `Perform`. `InterceptId` is the entry that produced it — the caller
    /// must keep that id exempt from its own filter while the program runs.
    Expanded(DoCtrl, InterceptId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{EffectPayload, EffectType, Value};
    use std::any::Any;

    #[derive(Debug)]
    struct Ping;
    impl EffectPayload for Ping {
        const EFFECT_NAME: &'static str = "Ping";
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn no_interceptors_returns_none() {
        let root = InterceptorNode::root();
        let eff = Effect::new(Ping, None);
        assert!(root.apply(&eff, &HashSet::new()).is_none());
    }

    #[test]
    fn non_reentrant_transform_is_applied_once() {
        let root = InterceptorNode::root();
        let filter = TypeFilter::Include(Arc::from([EffectType::of::<Ping>()]));
        let transform: InterceptFn = Arc::new(|e| DoCtrl::Perform(e.clone()));
        let chain = root.push(transform, filter);
        let eff = Effect::new(Ping, None);
        let replaced = chain.apply(&eff, &HashSet::new()).expect("should intercept");
        match replaced {
            InterceptOutcome::Replaced(e2) => {
                // Re-applying the chain to the already-transformed effect is a no-op:
                // the single interceptor already marked itself exempt.
                assert!(chain.apply(&e2, &HashSet::new()).is_none());
            }
            InterceptOutcome::Expanded(..) => panic!("expected Replaced"),
        }
    }

    /// A transform that returns an effectful program (not another `Perform`)
    /// reports which interceptor produced it, so the caller can guard
    /// against the program re-triggering the same interceptor (invariant
    /// 12). `apply` itself can't run that program — only check that the
    /// guard a caller installs from the returned id is actually honored on
    /// the next call.
    #[test]
    fn expanded_outcome_is_exempt_once_guarded() {
        let root = InterceptorNode::root();
        let filter = TypeFilter::Include(Arc::from([EffectType::of::<Ping>()]));
        let transform: InterceptFn = Arc::new(|_e| DoCtrl::pure(Value::Unit));
        let chain = root.push(transform, filter);
        let eff = Effect::new(Ping, None);

        let outcome = chain.apply(&eff, &HashSet::new()).expect("should intercept");
        let id = match outcome {
            InterceptOutcome::Expanded(_, id) => id,
            InterceptOutcome::Replaced(_) => panic!("expected Expanded"),
        };

        // Without the guard, a fresh Ping performed inside the expanded
        // program would be re-intercepted by the same entry.
        let fresh = Effect::new(Ping, None);
        assert!(chain.apply(&fresh, &HashSet::new()).is_some());

        // With `id` guarded (as the evaluator does for the duration of the
        // expanded program), the same fresh effect passes through untouched.
        let mut guard = HashSet::new();
        guard.insert(id);
        assert!(chain.apply(&fresh, &guard).is_none());
    }
}
