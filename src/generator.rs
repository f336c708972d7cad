//! Generator bridge: wraps host "generator" code into `DoCtrl` steps.
//!
//! Rust has no stable generator/coroutine primitive outside nightly, so a
//! generator function is represented here as a hand-rolled state machine
//! implementing [`EffectProgram`]: each call to `resume` either yields the
//! next `DoCtrl` step or reports completion, mirroring a `send`/return
//! generator protocol one call at a time. The CESK trampoline in
//! `evaluator.rs` drives this exactly the way it drives any other `DoCtrl`
//! reduction, so a generator that loops many times never grows the host
//! call stack.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::doctrl::DoCtrl;
use crate::error::VmError;
use crate::value::Value;

/// What's fed back into a suspended [`EffectProgram`] to resume it.
pub enum GenInput {
    /// The yielded `DoCtrl` reduced to this value; resume with it.
    Value(Value),
    /// The yielded `DoCtrl` failed; resume so the generator can run its own
    /// cleanup or propagate (exceptions unwind through generator
    /// frames like any other frame unless the generator itself catches).
    Error(VmError),
}

/// One step of driving an [`EffectProgram`].
pub enum GenStep {
    /// The generator yielded a `DoCtrl` to be reduced; feed the result back
    /// via `resume`.
    Yield(DoCtrl),
    /// The generator returned a final value.
    Return(Value),
    /// The generator did not catch an incoming `GenInput::Error` and it
    /// should keep propagating as a `Failed` unwind.
    Propagate(VmError),
}

/// A single in-flight `@do` function invocation. Implementors hold whatever
/// local state the user's generator body needs between yields (typically an
/// enum of "program counter" positions plus captured locals), the same
/// shape a compiler-generated generator state machine would have.
pub trait EffectProgram: Send {
    fn resume(&mut self, input: GenInput) -> GenStep;

    /// Name shown in tracebacks.
    fn name(&self) -> &'static str {
        "<anonymous>"
    }
}

impl fmt::Debug for dyn EffectProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectProgram({})", self.name())
    }
}

/// Shared handle to a running generator, held by a `Frame::GenStep` in the
/// continuation so the trampoline can call back into it after reducing each
/// yielded `DoCtrl`.
pub type GenHandle = Arc<Mutex<Box<dyn EffectProgram>>>;

/// The compiled form of an `Expand` call target: a factory that takes the
/// already-evaluated argument values (args are pre-evaluated in order) and
/// produces a fresh [`EffectProgram`]. Taking resolved values directly
/// (rather than closing over a zero-arg thunk) keeps the call pure and
/// re-entrant while avoiding a second argument-lifting pass inside the
/// factory itself; see DESIGN.md's generator bridge substrate entry.
pub type GeneratorFactory = Arc<dyn Fn(Vec<Value>) -> Box<dyn EffectProgram> + Send + Sync>;

/// Helper for building simple single-yield-site generators without the
/// boilerplate of a hand-written state machine: wraps a closure that, given
/// the resolved args, returns the *first* `DoCtrl` to run, plus a single
/// continuation closure invoked with the value that step produces. Handy
/// for reference handlers (`handlers/*.rs`) whose bodies are a short fixed
/// sequence rather than an arbitrary loop.
pub struct LinearProgram {
    name: &'static str,
    steps: std::vec::IntoIter<Box<dyn FnOnce(Value) -> DoCtrl + Send>>,
    first: Option<DoCtrl>,
}

impl LinearProgram {
    pub fn new(name: &'static str, first: DoCtrl, steps: Vec<Box<dyn FnOnce(Value) -> DoCtrl + Send>>) -> Self {
        LinearProgram {
            name,
            steps: steps.into_iter(),
            first: Some(first),
        }
    }
}

impl EffectProgram for LinearProgram {
    fn resume(&mut self, input: GenInput) -> GenStep {
        if let Some(first) = self.first.take() {
            return GenStep::Yield(first);
        }
        let value = match input {
            GenInput::Value(v) => v,
            GenInput::Error(e) => return GenStep::Propagate(e),
        };
        match self.steps.next() {
            Some(step) => GenStep::Yield(step(value)),
            None => GenStep::Return(value),
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_program_first_then_return() {
        let mut prog = LinearProgram::new("noop", DoCtrl::pure(1i64), vec![]);
        match prog.resume(GenInput::Value(Value::Unit)) {
            GenStep::Yield(DoCtrl::Pure(Value::Int(1))) => {}
            _ => panic!("expected first yield"),
        }
        match prog.resume(GenInput::Value(Value::Int(1))) {
            GenStep::Return(Value::Int(1)) => {}
            _ => panic!("expected return"),
        }
    }
}
