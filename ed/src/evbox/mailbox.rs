//! A single named event box

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use super::ThreadKey;
use super::trigger::Trigger;
use crate::config::BoxConfig;
use crate::error::EddiError;
use crate::pool::PooledEvent;
use crate::sync::{lock, wait_until};

/// An event in a box, tagged with the thread that sent it
#[derive(Debug)]
pub struct Envelope {
    pub event: PooledEvent,
    pub sender: ThreadKey,
}

/// The box is at its maximum size; the envelope is handed back
#[derive(Debug, Error)]
#[error("box '{box_name}' is full")]
pub struct BoxFull {
    pub envelope: Envelope,
    pub box_name: String,
}

impl From<BoxFull> for EddiError {
    fn from(e: BoxFull) -> Self {
        EddiError::Full(format!("box {}", e.box_name))
    }
}

struct Ring {
    slots: Vec<Option<Envelope>>,
    first: usize,
    len: usize,
    received: u64,
    trigger: Trigger,
}

impl Ring {
    fn grow(&mut self, increment: usize, max: usize) -> bool {
        let cap = self.slots.len();
        if cap >= max {
            return false;
        }
        let new_cap = (cap + increment.max(1)).min(max);
        // unroll so the live range starts at slot 0
        let mut slots: Vec<Option<Envelope>> = Vec::with_capacity(new_cap);
        for i in 0..self.len {
            slots.push(self.slots[(self.first + i) % cap].take());
        }
        slots.resize_with(new_cap, || None);
        self.slots = slots;
        self.first = 0;
        true
    }
}

/// Bounded FIFO of envelopes that grows in steps up to a maximum
pub struct EventBox {
    name: String,
    id: usize,
    increment: usize,
    max: usize,
    ring: Mutex<Ring>,
    ready: Condvar,
}

impl EventBox {
    pub fn new(name: &str, id: usize, config: &BoxConfig) -> Self {
        let initial = config.queue_size.max(1);
        debug!(name, id, initial, max = config.max_size, "EventBox::new: called");
        Self {
            name: name.to_string(),
            id,
            increment: config.increment,
            max: config.max_size.max(initial),
            ring: Mutex::new(Ring {
                slots: (0..initial).map(|_| None).collect(),
                first: 0,
                len: 0,
                received: 0,
                trigger: Trigger::default(),
            }),
            ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Append at the tail, growing if needed
    pub fn push(&self, envelope: Envelope) -> std::result::Result<(), BoxFull> {
        let trigger = {
            let mut ring = lock(&self.ring);
            if ring.len == ring.slots.len() && !ring.grow(self.increment, self.max) {
                debug!(box_name = %self.name, len = ring.len, "EventBox::push: box full");
                return Err(BoxFull {
                    envelope,
                    box_name: self.name.clone(),
                });
            }
            let cap = ring.slots.len();
            let tail = (ring.first + ring.len) % cap;
            ring.slots[tail] = Some(envelope);
            ring.len += 1;
            ring.received += 1;
            trace!(box_name = %self.name, len = ring.len, "EventBox::push: queued");
            ring.trigger.clone()
        };
        self.ready.notify_all();
        trigger.fire(&self.name);
        Ok(())
    }

    /// Take the oldest envelope, if any
    pub fn pop(&self) -> Option<Envelope> {
        let mut ring = lock(&self.ring);
        if ring.len == 0 {
            return None;
        }
        let first = ring.first;
        let envelope = ring.slots[first].take();
        ring.first = (first + 1) % ring.slots.len();
        ring.len -= 1;
        envelope
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.ring).slots.len()
    }

    /// Envelopes ever accepted
    pub fn received(&self) -> u64 {
        lock(&self.ring).received
    }

    /// Block until the box is non-empty or `timeout` passes
    pub fn wait(&self, timeout: Duration) -> bool {
        wait_until(&self.ready, lock(&self.ring), timeout, |r| r.len > 0)
    }

    pub fn set_trigger(&self, trigger: Trigger) {
        lock(&self.ring).trigger = trigger;
    }

    /// Remove everything, oldest first
    pub fn drain(&self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = self.pop() {
            out.push(envelope);
        }
        out
    }
}
