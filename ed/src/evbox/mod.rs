//! Event boxes and routing
//!
//! Every participating thread owns a [`BoxList`]: a set of named FIFO
//! [`EventBox`]es plus routing state (filter, groups, global-event
//! subscription). Lists are kept in the [`BoxRegistry`] ring, which the
//! dispatcher walks round-robin when delivering.

mod boxlist;
mod mailbox;
mod registry;
mod trigger;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use boxlist::BoxList;
pub use mailbox::{BoxFull, Envelope, EventBox};
pub use registry::{BoxRegistry, FINISH_WAIT, RingCursor};
pub use trigger::{Callback, Trigger};

/// Default box for accepted events
pub const ACCEPT_BOX: &str = "accept";

/// Default box for rejected events
pub const REJECT_BOX: &str = "reject";

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_KEY: ThreadKey = ThreadKey::fresh();
}

/// Identity of a box list owner
///
/// OS threads get one lazily via [`ThreadKey::current`]; components that
/// own a list without being a thread of their own take a fresh key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ThreadKey(u64);

impl ThreadKey {
    pub fn current() -> Self {
        CURRENT_KEY.with(|k| *k)
    }

    pub fn fresh() -> Self {
        ThreadKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Box used when the named box does not exist
pub(crate) fn fallback_box(name: &str) -> &'static str {
    let is_reject = name
        .get(..REJECT_BOX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(REJECT_BOX));
    if is_reject { REJECT_BOX } else { ACCEPT_BOX }
}
