//! The reader scope `E`.
//!
//! `Env` is a persistent, singly-linked chain of scopes: `Local(env, e)`
//! pushes a new link in front of the current one for the dynamic extent of
//! `e` and is popped (by dropping the `Arc`) when `e` completes, restoring
//! the parent exactly (invariant 4). Older `Arc<Env>` handles (e.g. ones
//! captured by a spawned task, or by a continuation) keep seeing the scope
//! as it was when they captured it — that's what "persistent" buys us here.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::doctrl::DoCtrl;
use crate::error::VmError;
use crate::value::Value;

/// A hashable environment key. Distinct from `Store`'s plain `String` keys:
/// `Env` needs hashable keys, `Store` just needs string keys.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum EnvKey {
    Str(Arc<str>),
    Sym(&'static str),
}

impl fmt::Debug for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvKey::Str(s) => write!(f, "{s:?}"),
            EnvKey::Sym(s) => write!(f, ":{s}"),
        }
    }
}

impl From<&'static str> for EnvKey {
    fn from(s: &'static str) -> Self {
        EnvKey::Sym(s)
    }
}
impl From<String> for EnvKey {
    fn from(s: String) -> Self {
        EnvKey::Str(Arc::from(s))
    }
}

/// A binding: either an already-resolved value, or an unforced `DoCtrl`
/// payload that is evaluated (and memoized) the first time it's read.
/// Resolution of a lazy cell forces the payload once and memoizes the
/// result in the surrounding scope.
pub enum Binding {
    Value(Value),
    Lazy(Mutex<LazyCell>),
}

pub enum LazyCell {
    Unforced(DoCtrl),
    Forcing,
    Forced(Value),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Value(v) => write!(f, "Value({v:?})"),
            Binding::Lazy(cell) => match &*cell.lock().expect("lazy cell mutex poisoned") {
                LazyCell::Unforced(_) => write!(f, "Lazy(unforced)"),
                LazyCell::Forcing => write!(f, "Lazy(forcing)"),
                LazyCell::Forced(v) => write!(f, "Lazy(forced={v:?})"),
            },
        }
    }
}

/// A single persistent environment scope, chained to its parent.
pub struct Env {
    parent: Option<Arc<Env>>,
    bindings: HashMap<EnvKey, Binding>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
        .field("bindings", &self.bindings)
        .field("has_parent", &self.parent.is_some())
        .finish()
    }
}

impl Env {
    pub fn empty() -> Arc<Env> {
        Arc::new(Env {
                parent: None,
                bindings: HashMap::new(),
        })
    }

    /// `Local(env, e)`: extend `self` with `bindings`, shadowing any
    /// existing entries of the same key (invariant: nested `Local` shadows
    /// outer entries).
    pub fn extend(self: &Arc<Env>, bindings: HashMap<EnvKey, Binding>) -> Arc<Env> {
        Arc::new(Env {
                parent: Some(self.clone()),
                bindings,
        })
    }

    /// Look up `key` in this scope or any ancestor, without forcing lazy
    /// cells. Used internally by the forcing path to avoid re-entrant
    /// borrow conflicts.
    fn find(&self, key: &EnvKey) -> Option<&Binding> {
        if let Some(b) = self.bindings.get(key) {
            return Some(b);
        }
        self.parent.as_ref().and_then(|p| p.find(key))
    }

    pub fn contains(&self, key: &EnvKey) -> bool {
        self.find(key).is_some()
    }

    /// Resolve `key`, forcing its lazy cell if needed. `force` evaluates an
    /// unforced `DoCtrl` payload to a `Value`; it is supplied by the caller
    /// (the evaluator) since forcing may itself need to run CESK reduction.
    pub fn ask(
        self: &Arc<Env>,
        key: &EnvKey,
        force: impl FnOnce(DoCtrl) -> Result<Value, VmError>,
    ) -> Result<Value, VmError> {
        let binding = self.find(key).ok_or_else(|| VmError::MissingEnvKey {
                key: format!("{key:?}"),
        })?;
        match binding {
            Binding::Value(v) => Ok(v.clone()),
            Binding::Lazy(cell) => {
                let taken = {
                    let mut guard = cell.lock().expect("lazy cell mutex poisoned");
                    match std::mem::replace(&mut *guard, LazyCell::Forcing) {
                        LazyCell::Forced(v) => {
                            *guard = LazyCell::Forced(v.clone());
                            return Ok(v);
                        }
                        LazyCell::Forcing => {
                            *guard = LazyCell::Forcing;
                            None
                        }
                        LazyCell::Unforced(e) => Some(e),
                    }
                };
                match taken {
                    None => {
                        // Already being forced by an outer frame on the same
                        // logical thread; re-entrant forcing of the same cell
                        // has no well-defined value, surface it as a missing key.
                        Err(VmError::MissingEnvKey {
                                key: format!("{key:?} (cyclic lazy binding)"),
                        })
                    }
                    Some(expr) => {
                        let value = force(expr)?;
                        *cell.lock().expect("lazy cell mutex poisoned") =
                        LazyCell::Forced(value.clone());
                        Ok(value)
                    }
                }
            }
        }
    }
}

pub fn bindings_from_values(
    pairs: impl IntoIterator<Item = (EnvKey, Value)>,
) -> HashMap<EnvKey, Binding> {
    pairs
    .into_iter()
    .map(|(k, v)| (k, Binding::Value(v)))
    .collect()
}
