//! Runtime values and effect records.
//!
//! The VM treats [`Value`] as opaque beyond equality, hashing and display.
//! Primitive variants exist so small host data (numbers, strings, lists used
//! as `Gather`/`Race` results, etc.) round-trips without boxing; anything
//! else rides in [`Value::Opaque`] behind `Arc<dyn OpaqueValue>`.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A host value produced or consumed by `DoCtrl` reduction.
///
/// Cloning is cheap (everything non-trivial is `Arc`-backed).
#[derive(Clone)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(u64), // bit pattern, so Value stays Eq/Hash
    Str(Arc<str>),
    List(Arc<Vec<Value>>),
    Map(Arc<BTreeMap<String, Value>>),
    Opaque(Arc<dyn OpaqueValue>),
}

/// Trait object payload for host values the VM never needs to inspect
/// structurally (tasks, promises, semaphores, user records,...).
pub trait OpaqueValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Stable tag used for display and for `Value`'s `Hash`/`Eq` impls.
    fn type_tag(&self) -> &'static str;

    /// Identity used for equality/hash. Defaults to pointer identity of the
    /// concrete value via its `Any` vtable address, which is stable for the
    /// lifetime of the `Arc` even though it isn't a "real" content hash.
    fn identity(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

/// The value a `Try(e)` boundary produces once `e` settles: success and
/// failure both become ordinary `Value`s so downstream `Map`/`FlatMap` code
/// can branch on them instead of needing a second escape hatch alongside
/// `Failed` unwinding.
#[derive(Debug, Clone)]
pub struct TryResult(pub Result<Value, crate::error::VmError>);

impl OpaqueValue for TryResult {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn type_tag(&self) -> &'static str {
        "TryResult"
    }
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn try_ok(v: Value) -> Value {
        Value::opaque(TryResult(Ok(v)))
    }

    pub fn try_err(e: crate::error::VmError) -> Value {
        Value::opaque(TryResult(Err(e)))
    }

    /// Unwraps a `Try`-produced value back into its `Result`, if this is one.
    pub fn as_try_result(&self) -> Option<&Result<Value, crate::error::VmError>> {
        self.downcast_opaque::<TryResult>().map(|t| &t.0)
    }

    pub fn float(f: f64) -> Self {
        Value::Float(f.to_bits())
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(items))
    }

    pub fn opaque<T: OpaqueValue>(v: T) -> Self {
        Value::Opaque(Arc::new(v))
    }

    pub fn downcast_opaque<T: 'static>(&self) -> Option<&T> {
        match self {
            Value::Opaque(o) => o.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Best-effort tag for display/traceback purposes.
    pub fn tag(&self) -> &'static str {
        match self {
            Value::Unit => "Unit",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::Opaque(o) => o.type_tag(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(_) => write!(f, "{}", self.as_float().unwrap()),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Map(m) => f.debug_map().entries(m.iter()).finish(),
            Value::Opaque(o) => write!(f, "<{}>", o.type_tag()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => {
                a.type_tag() == b.type_tag() && a.identity() == b.identity()
            }
            _ => false,
        }
    }
}
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Unit => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(bits) => bits.hash(state),
            Value::Str(s) => s.hash(state),
            Value::List(items) => items.hash(state),
            Value::Map(m) => {
                for (k, v) in m.iter() {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Value::Opaque(o) => {
                o.type_tag().hash(state);
                o.identity().hash(state);
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

/// Where an effect (or a continuation frame, see `continuation.rs`) was
/// created, for traceback rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceContext {
    pub file: &'static str,
    pub line: u32,
    pub qualname: &'static str,
}

impl fmt::Display for SourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} in {}", self.file, self.line, self.qualname)
    }
}

/// Captures `file!()`/`line!()` at the call site into a [`SourceContext`].
/// Rust has no runtime call-stack introspection API the VM can rely on, so
/// the macro captures the literal call site instead, which is the
/// information available at compile time.
#[macro_export]
macro_rules! source_context {
    ($qualname:expr) => {
        $crate::value::SourceContext {
            file: file!(),
            line: line!(),
            qualname: $qualname,
        }
    };
}

/// An effect's class identity, used for handler type-filtering and for
/// `Mask`/`Override`. Backed by the Rust `TypeId` of the concrete effect
/// payload type: the effect's runtime type identity is the dispatch key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EffectType {
    pub type_id: TypeId,
    pub name: &'static str,
}

impl fmt::Debug for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
impl fmt::Display for EffectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl EffectType {
    pub fn of<T: EffectPayload>() -> Self {
        EffectType {
            type_id: TypeId::of::<T>(),
            name: T::EFFECT_NAME,
        }
    }
}

/// Implemented by user-defined effect payload structs. `EFFECT_NAME` is the
/// stable display/trace name; effects are otherwise opaque except for their
/// type and context.
pub trait EffectPayload: Any + Send + Sync + fmt::Debug {
    const EFFECT_NAME: &'static str;

    fn as_any(&self) -> &dyn Any;
}

/// An immutable effect instance.
#[derive(Clone)]
pub struct Effect {
    pub effect_type: EffectType,
    pub payload: Arc<dyn Any + Send + Sync>,
    pub context: Option<SourceContext>,
    /// Identifies this particular `Perform` occurrence; used by dispatch to
    /// mark handler frames consumed for the current effect.
    pub dispatch_id: u64,
    /// Interceptor nodes that have already transformed this exact effect
    /// instance, so the interceptor pipeline doesn't re-intercept its own
    /// output.
    pub exempt_intercepts: Arc<[u64]>,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
        .field("type", &self.effect_type)
        .field("context", &self.context)
        .finish()
    }
}

impl Effect {
    pub fn new<T: EffectPayload>(payload: T, context: Option<SourceContext>) -> Self {
        Effect {
            effect_type: EffectType::of::<T>(),
            payload: Arc::new(payload),
            context,
            dispatch_id: 0,
            exempt_intercepts: Arc::from([]),
        }
    }

    pub fn with_dispatch_id(mut self, id: u64) -> Self {
        self.dispatch_id = id;
        self
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns a copy marked as already processed by interceptor `id`, for
    /// the non-reentry guard.
    pub fn exempting(&self, id: u64) -> Self {
        let mut ids: Vec<u64> = self.exempt_intercepts.iter().copied().collect();
        ids.push(id);
        Effect {
            exempt_intercepts: Arc::from(ids),
            ..self.clone()
        }
    }

    pub fn is_exempt(&self, id: u64) -> bool {
        self.exempt_intercepts.iter().any(|x| *x == id)
    }
}
