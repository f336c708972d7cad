//! `DoCtrl`: the VM's algebraic control-expression IR.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::continuation::ContinuationRef;
use crate::env::{Binding, EnvKey};
use crate::generator::GeneratorFactory;
use crate::handler::HandlerFrame;
use crate::value::{Effect, EffectType, Value};

pub type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(Value) -> DoCtrl + Send + Sync>;
pub type CallFn = Arc<dyn Fn() -> anyhow::Result<Value> + Send + Sync>;
/// A handler: `(effect, k_user) -> DoCtrl`. The returned `DoCtrl` is the
/// handler's body (typically an `Expand` node), the same generator shape a
/// handler is expected to return.
pub type HandlerFn = Arc<dyn Fn(Effect, ContinuationRef) -> DoCtrl + Send + Sync>;
/// `WithIntercept`'s transform: `effect -> replacement DoCtrl`.
pub type InterceptFn = Arc<dyn Fn(&Effect) -> DoCtrl + Send + Sync>;

/// Which effect types an interceptor or mask applies to.
#[derive(Clone)]
pub enum TypeFilter {
    Include(Arc<[EffectType]>),
    Exclude(Arc<[EffectType]>),
}

impl TypeFilter {
    pub fn matches(&self, t: EffectType) -> bool {
        match self {
            TypeFilter::Include(types) => types.iter().any(|x| *x == t),
            TypeFilter::Exclude(types) => !types.iter().any(|x| *x == t),
        }
    }
}

/// The algebraic control expression tree.
pub enum DoCtrl {
    Pure(Value),
    Call(CallFn),
    Map(Box<DoCtrl>, MapFn),
    FlatMap(Box<DoCtrl>, FlatMapFn),
    Perform(Effect),
    WithHandler(HandlerFn, Box<DoCtrl>),
    Resume(ContinuationRef, Value),
    Transfer(ContinuationRef, Value),
    /// `effect = None` re-offers the currently dispatching effect unchanged.
    Delegate(Option<Effect>),
    /// Sugar for `Delegate(None)`.
    Pass,
    Eval(Box<DoCtrl>, Vec<HandlerFn>),
    Local(HashMap<EnvKey, Binding>, Box<DoCtrl>),
    Mask(Arc<[EffectType]>, Box<DoCtrl>),
    Override(HandlerFn, Arc<[EffectType]>, Box<DoCtrl>),
    WithIntercept(InterceptFn, Box<DoCtrl>, TypeFilter),
    Expand(GeneratorFactory, Vec<DoCtrl>),
    /// `Try(e)`: catch a `Failed` unwind from `e` and turn it into
    /// `Pure(Ok(v))`/`Pure(Err(err))`. Modeled as a real continuation-frame
    /// boundary rather than sugar over handler dispatch, since a raised
    /// host exception is not a `Perform` and so no handler can see it.
    Try(Box<DoCtrl>),
}

impl fmt::Debug for DoCtrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoCtrl::Pure(v) => write!(f, "Pure({v:?})"),
            DoCtrl::Call(_) => write!(f, "Call(..)"),
            DoCtrl::Map(e, _) => write!(f, "Map({e:?}, ..)"),
            DoCtrl::FlatMap(e, _) => write!(f, "FlatMap({e:?}, ..)"),
            DoCtrl::Perform(eff) => write!(f, "Perform({:?})", eff.effect_type),
            DoCtrl::WithHandler(_, e) => write!(f, "WithHandler(.., {e:?})"),
            DoCtrl::Resume(k, v) => write!(f, "Resume(#{}, {v:?})", k.id),
            DoCtrl::Transfer(k, v) => write!(f, "Transfer(#{}, {v:?})", k.id),
            DoCtrl::Delegate(e) => write!(f, "Delegate({e:?})"),
            DoCtrl::Pass => write!(f, "Pass"),
            DoCtrl::Eval(e, hs) => write!(f, "Eval({e:?}, {} handlers)", hs.len()),
            DoCtrl::Local(_, e) => write!(f, "Local(.., {e:?})"),
            DoCtrl::Mask(types, e) => write!(f, "Mask({} types, {e:?})", types.len()),
            DoCtrl::Override(_, types, e) => write!(f, "Override({} types, {e:?})", types.len()),
            DoCtrl::WithIntercept(_, e, _) => write!(f, "WithIntercept(.., {e:?})"),
            DoCtrl::Expand(_, args) => write!(f, "Expand(.., {} args)", args.len()),
            DoCtrl::Try(e) => write!(f, "Try({e:?})"),
        }
    }
}

impl DoCtrl {
    pub fn pure(v: impl Into<Value>) -> Self {
        DoCtrl::Pure(v.into())
    }

    pub fn map(self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        DoCtrl::Map(Box::new(self), Arc::new(f))
    }

    pub fn flat_map(self, f: impl Fn(Value) -> DoCtrl + Send + Sync + 'static) -> Self {
        DoCtrl::FlatMap(Box::new(self), Arc::new(f))
    }

    /// Sequence `self` then `next`, discarding `self`'s value. A `DoCtrl`
    /// tree node is reduced at most once, so the interior `Mutex` here is
    /// just a `Fn`-compatible one-shot cell, not a concurrency mechanism.
    pub fn then(self, next: DoCtrl) -> Self {
        let slot = std::sync::Mutex::new(Some(next));
        self.flat_map(move |_| {
                slot.lock()
                .expect("DoCtrl::then mutex poisoned")
                .take()
                .expect("DoCtrl::then body reduced twice")
        })
    }
}
