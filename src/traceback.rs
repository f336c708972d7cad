//! Structured execution trace assembler: a bounded, ordered collection of
//! entries assembled as reduction proceeds, rendered on demand rather than
//! eagerly formatted.

use std::fmt;

use crate::scheduler::TaskId;
use crate::value::SourceContext;

/// How a handler frame resolved an effect it saw, for the `✓`/`·`/`✗`
/// markers below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcomeMark {
    Resumed,
    Delegated,
    Threw,
}

impl fmt::Display for HandlerOutcomeMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            HandlerOutcomeMark::Resumed => '\u{2713}', // ✓
            HandlerOutcomeMark::Delegated => '\u{00b7}', // ·
            HandlerOutcomeMark::Threw => '\u{2717}', // ✗
        };
        write!(f, "{c}")
    }
}

/// One entry in the assembled trace. Walks `K` innermost-first, then the
/// currently active handlers, then ancestor-task frames.
#[derive(Debug, Clone)]
pub enum TraceEntry {
    /// A generator/`@do` frame: function name, yield site, and source line.
    Generator {
        name: &'static str,
        context: Option<SourceContext>,
    },
    /// An active handler frame and how it resolved (if known yet).
    Handler {
        label: &'static str,
        install_site: Option<SourceContext>,
        outcome: Option<HandlerOutcomeMark>,
    },
    /// Separator before a block of frames belonging to an ancestor task
    /// (`"── in task …"`).
    TaskBoundary { task_id: TaskId, parent: Option<TaskId> },
    /// A pending, not-yet-resolved resume arrow: a captured continuation
    /// still outstanding when the failure occurred.
    PendingResume { continuation_id: u64 },
}

/// The canonical trailing row of default handlers, reproduced verbatim
/// regardless of which of them actually fired.
pub const DEFAULT_HANDLER_ROW: [&str; 8] = [
    "sync_await_handler",
    "spawn_intercept",
    "LazyAsk",
    "Scheduler",
    "ResultSafe",
    "Writer",
    "Reader",
    "State",
];

/// An assembled trace, ready to render. The output deliberately hides
/// VM-internal frames.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub entries: Vec<TraceEntry>,
}

impl Traceback {
    pub fn new() -> Self {
        Traceback { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: TraceEntry) {
        self.entries.push(entry);
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match entry {
                TraceEntry::Generator { name, context } => match context {
                    Some(ctx) => writeln!(f, " in {name} at {ctx}")?,
                    None => writeln!(f, " in {name}")?,
                },
                TraceEntry::Handler {
                    label,
                    install_site,
                    outcome,
                } => {
                    let mark = outcome.map(|o| o.to_string()).unwrap_or_else(|| " ".to_string());
                    match install_site {
                        Some(ctx) => writeln!(f, " [{mark}] handler {label} (installed at {ctx})")?,
                        None => writeln!(f, " [{mark}] handler {label}")?,
                    }
                }
                TraceEntry::TaskBoundary { task_id, parent } => match parent {
                    Some(p) => writeln!(f, "── in task {} (spawned from task {}) ──", task_id.0, p.0)?,
                    None => writeln!(f, "── in task {} (root) ──", task_id.0)?,
                },
                TraceEntry::PendingResume { continuation_id } => {
                    writeln!(f, " --> pending resume of continuation #{continuation_id}")?
                }
            }
        }
        writeln!(f, " -- default handlers --")?;
        for name in DEFAULT_HANDLER_ROW {
            writeln!(f, " [{}] {name}", HandlerOutcomeMark::Delegated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_default_row_even_when_empty() {
        let tb = Traceback::new();
        let rendered = tb.to_string();
        for name in DEFAULT_HANDLER_ROW {
            assert!(rendered.contains(name), "missing {name} in {rendered}");
        }
    }
}
