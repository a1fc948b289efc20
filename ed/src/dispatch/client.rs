//! Thread-side handle to the dispatcher

use std::sync::Arc;
use std::time::Duration;

use eddievent::Event;
use tracing::debug;

use super::{DIST_BOX, IN_BOX, OUT_BOX};
use crate::error::Result;
use crate::evbox::{BoxList, BoxRegistry, ThreadKey};
use crate::pool::{EventPool, PooledEvent};

/// Sends events to the dispatcher and receives from the calling thread's boxes
///
/// Cheap to clone; every method acts on behalf of the calling thread.
#[derive(Clone)]
pub struct Eddi {
    registry: Arc<BoxRegistry>,
    dispatcher: Arc<BoxList>,
}

impl Eddi {
    pub(crate) fn new(registry: Arc<BoxRegistry>, dispatcher: Arc<BoxList>) -> Self {
        Self { registry, dispatcher }
    }

    pub fn pool(&self) -> &EventPool {
        self.registry.pool()
    }

    /// The calling thread's box list
    pub fn boxes(&self) -> Arc<BoxList> {
        self.registry.current()
    }

    fn post(&self, event: Event, box_name: &str) -> Result<()> {
        let pooled = self.pool().adopt(event)?;
        let sender = ThreadKey::current();
        // make sure replies have somewhere to land
        self.registry.current();
        debug!(name = ?pooled.name(), box_name, %sender, "Eddi::post: called");
        self.dispatcher.insert(pooled, box_name, sender)?;
        Ok(())
    }

    /// Send `event` out over the link
    pub fn send(&self, event: Event) -> Result<()> {
        self.post(event, OUT_BOX)
    }

    /// Deliver `event` to every other thread in the process
    pub fn distribute(&self, event: Event) -> Result<()> {
        self.post(event, DIST_BOX)
    }

    /// Treat `event` as if it had arrived from outside the process
    pub fn inject(&self, event: Event) -> Result<()> {
        self.post(event, IN_BOX)
    }

    /// Receive events that arrive from outside the process
    pub fn subscribe_global(&self, on: bool) {
        self.registry.current().set_global(on);
    }

    /// Wait up to `timeout` for an event in one of the caller's boxes
    pub fn recv(&self, box_name: &str, timeout: Duration) -> Option<PooledEvent> {
        let list = self.registry.current();
        list.open_box(box_name);
        if list.wait(box_name, timeout) {
            list.pop(box_name)
        } else {
            None
        }
    }

    /// Release the caller's boxes; returns the number of events discarded
    pub fn finish(&self) -> usize {
        self.registry.finish()
    }
}
