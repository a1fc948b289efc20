//! eddievent - the EDDI event model
//!
//! An [`Event`] is a named record carrying positional arguments, named
//! attributes and indexed variables, optionally prefixed by a routing target.
//! Events travel between threads and processes in a line-oriented text form:
//!
//! ```text
//! * ping:"42"::{reason="health"}
//! # replyto:&i1::pong:&i2a::{_origin="internal", var/load/0=&f3ff0000000000000}
//! ```
//!
//! # Modules
//!
//! - [`text`] - reference-counted buffers backing zero-copy string slices
//! - [`value`] - the typed value union
//! - [`event`] - the event record, accessors, copy and merge
//! - [`parse`] - wire text to [`Event`]
//! - [`write`] - [`Event`] to wire text (size pass + write pass)
//!
//! # Example
//!
//! ```
//! use eddievent::{Event, WriteOptions};
//!
//! let mut ev = Event::parse(r#"* ping:"42"::{reason="health"}"#).unwrap();
//! ev.add_attr("_origin", "internal", true).unwrap();
//! assert_eq!(ev.attr_str("REASON").unwrap(), "health");
//! assert_eq!(
//!     ev.serialize(&WriteOptions::default()).unwrap(),
//!     r#"* ping:"42"::{_origin="internal", reason="health"}"#
//! );
//! ```

pub mod error;
pub mod event;
mod name;
pub mod parse;
mod quote;
pub mod text;
pub mod value;
pub mod write;

pub use error::{EventError, Result};
pub use event::{Attr, Event, Target, Var};
pub use name::{is_valid_key, normalize_name};
pub use parse::parse_value;
pub use text::Text;
pub use value::{Value, ValueKind};
pub use write::WriteOptions;
