//! Event filter engine
//!
//! A filter is a small rule program compiled from text:
//!
//! ```text
//! // drop noisy heartbeats, tag everything else
//! [in]
//! name == heartbeat && attr{_origin} == external => drop
//! attr{_group} # "^ops" => gosub tag
//! default => accept
//!
//! tag:
//! default => attr{tagged} = &i1; return
//!
//! [out]
//! name # "^debug\." => reject
//! ```
//!
//! Rules run top to bottom; the first `accept`, `reject` or `drop` ends the
//! program and running off the end accepts. `[in]` rules apply to events
//! arriving at a receiver, `[out]` rules to events leaving the dispatcher;
//! rules under `[any]` (or before any header) serve whichever direction has
//! no section of its own.

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;
mod registry;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

pub use ast::{Action, BinOp, CmpOp, Filter, JumpKind, LogLevel, Node, Predicate, Reference, Rule, Test};
pub use error::{FilterError, Result};
pub use eval::{FilterFlags, Outcome, STEP_LIMIT, Subject, Verdict, apply};
pub use parser::{MAX_ARG_INDEX, STACK_LIMIT};
pub use registry::{EMPTY_FILTER, FilterId, FilterTable, table};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Fail on malformed rules instead of skipping them
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Events arriving at a receiver
    In,
    /// Events leaving through the dispatcher
    Out,
}

/// Compiled programs for both directions
#[derive(Debug, Clone)]
pub struct FilterSet {
    input: Arc<Filter>,
    output: Arc<Filter>,
}

impl FilterSet {
    /// Accepts everything unchanged
    pub fn empty() -> Self {
        let any = Arc::new(Filter::default());
        Self {
            input: Arc::clone(&any),
            output: any,
        }
    }

    pub fn compile(src: &str, opts: CompileOptions) -> Result<Self> {
        let sections = parser::compile_source(src, opts.strict)?;
        let any = Arc::new(sections.any);
        let input = sections.input.map(Arc::new).unwrap_or_else(|| Arc::clone(&any));
        let output = sections.output.map(Arc::new).unwrap_or(any);
        debug!(input = input.len(), output = output.len(), "FilterSet::compile: compiled");
        Ok(Self { input, output })
    }

    pub fn from_file(path: &Path, opts: CompileOptions) -> Result<Self> {
        debug!(?path, "FilterSet::from_file: reading");
        let src = std::fs::read_to_string(path)?;
        Self::compile(&src, opts)
    }

    pub fn input(&self) -> &Filter {
        &self.input
    }

    pub fn output(&self) -> &Filter {
        &self.output
    }

    pub fn get(&self, direction: Direction) -> &Filter {
        match direction {
            Direction::In => &self.input,
            Direction::Out => &self.output,
        }
    }

    /// True when both directions run the same program
    pub fn shares_program(&self) -> bool {
        Arc::ptr_eq(&self.input, &self.output)
    }

    /// Run one direction over `event`
    pub fn apply(&self, direction: Direction, event: &mut eddievent::Event, flags: FilterFlags) -> Result<Vec<Outcome>> {
        apply(self.get(direction), event, flags)
    }
}

impl Default for FilterSet {
    fn default() -> Self {
        Self::empty()
    }
}
