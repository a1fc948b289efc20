//! EDDI - event distribution daemon
//!
//! Threads in a process exchange [`eddievent::Event`]s through named
//! mailboxes. A dispatcher thread fans events out to other threads, runs them
//! through rule-based filters, and forwards them to other processes over a
//! Unix socket hub.
//!
//! # Modules
//!
//! - [`pool`] - pre-built events handed out and reclaimed by generation
//! - [`filter`] - filter language, compiler and evaluator
//! - [`evbox`] - per-thread box lists, mailboxes and the registry ring
//! - [`dispatch`] - the dispatcher thread and the [`Eddi`] client handle
//! - [`link`] - socket framing, hub server and link client
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod evbox;
pub mod filter;
pub mod link;
pub mod pool;

mod sync;

pub use config::Config;
pub use dispatch::{DispatchState, Dispatcher, DispatcherHandle, Eddi};
pub use error::{EddiError, Result};
pub use evbox::{BoxList, BoxRegistry, EventBox, ThreadKey, Trigger};
pub use filter::{CompileOptions, Direction, FilterSet, Verdict};
pub use link::{Link, LinkHandle};
pub use pool::{EventPool, PooledEvent};
