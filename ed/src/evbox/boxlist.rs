//! Per-thread box lists

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::mailbox::{BoxFull, Envelope, EventBox};
use super::trigger::Trigger;
use super::{ACCEPT_BOX, REJECT_BOX, ThreadKey, fallback_box};
use crate::config::BoxConfig;
use crate::error::Result;
use crate::filter::{self, Direction, FilterFlags, FilterId, Subject, Verdict};
use crate::pool::{EventPool, PooledEvent};
use crate::sync::{lock, read, wait_until, write};

#[derive(Default)]
struct Boxes {
    by_id: Vec<Arc<EventBox>>,
    /// lowercase name -> id
    by_name: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Routing {
    filter: Option<FilterId>,
    groups: Vec<String>,
}

/// The boxes owned by one thread plus how events reach them
pub struct BoxList {
    key: ThreadKey,
    config: BoxConfig,
    pool: EventPool,
    boxes: RwLock<Boxes>,
    routing: RwLock<Routing>,
    enabled: AtomicBool,
    global: AtomicBool,
    released: AtomicBool,
    pending: Mutex<usize>,
    ready: Condvar,
    trigger: RwLock<Trigger>,
}

impl std::fmt::Debug for BoxList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxList")
            .field("key", &self.key)
            .field("boxes", &self.box_names())
            .field("pending", &self.pending())
            .finish()
    }
}

impl BoxList {
    /// New enabled list holding the `accept` and `reject` boxes
    pub fn new(key: ThreadKey, config: &BoxConfig, pool: EventPool) -> Self {
        debug!(%key, "BoxList::new: called");
        let list = Self {
            key,
            config: config.clone(),
            pool,
            boxes: RwLock::new(Boxes::default()),
            routing: RwLock::new(Routing::default()),
            enabled: AtomicBool::new(true),
            global: AtomicBool::new(false),
            released: AtomicBool::new(false),
            pending: Mutex::new(0),
            ready: Condvar::new(),
            trigger: RwLock::new(Trigger::default()),
        };
        list.open_box(ACCEPT_BOX);
        list.open_box(REJECT_BOX);
        list
    }

    pub fn key(&self) -> ThreadKey {
        self.key
    }

    pub fn pool(&self) -> &EventPool {
        &self.pool
    }

    // === Boxes ===

    /// Id of the named box, creating it if needed
    pub fn open_box(&self, name: &str) -> usize {
        let lower = name.to_ascii_lowercase();
        if let Some(id) = read(&self.boxes).by_name.get(&lower) {
            return *id;
        }
        let mut boxes = write(&self.boxes);
        if let Some(id) = boxes.by_name.get(&lower) {
            return *id;
        }
        let id = boxes.by_id.len();
        boxes.by_id.push(Arc::new(EventBox::new(name, id, &self.config)));
        boxes.by_name.insert(lower, id);
        debug!(key = %self.key, box_name = name, id, "BoxList::open_box: created");
        id
    }

    pub fn find_box(&self, name: &str) -> Option<Arc<EventBox>> {
        let boxes = read(&self.boxes);
        let id = boxes.by_name.get(&name.to_ascii_lowercase())?;
        boxes.by_id.get(*id).cloned()
    }

    pub fn box_names(&self) -> Vec<String> {
        read(&self.boxes).by_id.iter().map(|b| b.name().to_string()).collect()
    }

    /// Box for `name`, or the fallback when it does not exist
    fn resolve(&self, name: &str) -> Arc<EventBox> {
        if let Some(b) = self.find_box(name) {
            return b;
        }
        let fallback = fallback_box(name);
        match self.find_box(fallback) {
            Some(b) => b,
            None => {
                let id = self.open_box(fallback);
                Arc::clone(&read(&self.boxes).by_id[id])
            }
        }
    }

    // === Insertion ===

    /// Queue `event` into the named box (or its fallback)
    pub fn insert(&self, event: PooledEvent, box_name: &str, sender: ThreadKey) -> std::result::Result<(), BoxFull> {
        let target = self.resolve(box_name);
        // counted before the push so `pending` never trails the boxes
        *lock(&self.pending) += 1;
        if let Err(full) = target.push(Envelope { event, sender }) {
            self.uncount(1);
            return Err(full);
        }
        self.ready.notify_all();
        let trigger = read(&self.trigger).clone();
        trigger.fire(target.name());
        Ok(())
    }

    /// Route `event` through this list's input filter
    ///
    /// Outcomes are delivered in order: `Drop` discards, `Reject` goes to
    /// `reject`, `Accept` goes to the box named by the accept target or to
    /// `accept`. A full box on the main path fails the call; branch copies
    /// that do not fit are dropped with a warning.
    pub fn filter_insert(&self, mut event: PooledEvent, sender: ThreadKey) -> Result<()> {
        let set = self.routing_filter();
        let Some(set) = set else {
            self.insert(event, ACCEPT_BOX, sender)?;
            return Ok(());
        };

        let outcomes = set.apply(Direction::In, &mut event, FilterFlags::default())?;
        let mut input = Some(event);
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            let pooled = match outcome.subject {
                Subject::Input => match input.take() {
                    Some(ev) => ev,
                    None => continue,
                },
                Subject::Copy(copy) => self.pool.adopt(copy)?,
            };
            let box_name = match outcome.verdict {
                Verdict::Drop => {
                    debug!(key = %self.key, "BoxList::filter_insert: dropped by filter");
                    continue;
                }
                Verdict::Reject => REJECT_BOX.to_string(),
                Verdict::Accept => outcome
                    .target
                    .map(|t| t.name.to_string())
                    .unwrap_or_else(|| ACCEPT_BOX.to_string()),
            };
            match self.insert(pooled, &box_name, sender) {
                Ok(()) => {}
                Err(full) if idx == 0 => return Err(full.into()),
                Err(full) => warn!(key = %self.key, box_name = %full.box_name, "BoxList::filter_insert: branch copy dropped"),
            }
        }
        Ok(())
    }

    fn routing_filter(&self) -> Option<Arc<filter::FilterSet>> {
        let id = read(&self.routing).filter?;
        let set = filter::table().get(id);
        if set.is_none() {
            warn!(key = %self.key, id, "BoxList::routing_filter: filter no longer registered");
        }
        set
    }

    // === Retrieval ===

    pub fn pop_envelope(&self, box_name: &str) -> Option<Envelope> {
        let envelope = self.find_box(box_name)?.pop()?;
        self.uncount(1);
        Some(envelope)
    }

    pub fn pop(&self, box_name: &str) -> Option<PooledEvent> {
        self.pop_envelope(box_name).map(|e| e.event)
    }

    /// Wait for the named box to have an event
    pub fn wait(&self, box_name: &str, timeout: Duration) -> bool {
        match self.find_box(box_name) {
            Some(b) => b.wait(timeout),
            None => false,
        }
    }

    /// Wait for any box of the list to have an event
    ///
    /// Also returns `true` once the list has been released.
    pub fn wait_any(&self, timeout: Duration) -> bool {
        wait_until(&self.ready, lock(&self.pending), timeout, |p| *p > 0 || self.is_released())
    }

    /// Wait until one of the named boxes has an event
    ///
    /// Events sitting in other boxes of the list do not count. Returns
    /// `true` once the list has been released.
    pub fn wait_boxes(&self, names: &[&str], timeout: Duration) -> bool {
        let boxes: Vec<_> = names.iter().filter_map(|n| self.find_box(n)).collect();
        wait_until(&self.ready, lock(&self.pending), timeout, |_| {
            self.is_released() || boxes.iter().any(|b| !b.is_empty())
        })
    }

    fn uncount(&self, n: usize) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(n);
    }

    /// Events queued across all boxes
    pub fn pending(&self) -> usize {
        *lock(&self.pending)
    }

    /// Empty every box, returning the events to the pool
    pub fn drain(&self) -> usize {
        let boxes: Vec<_> = read(&self.boxes).by_id.clone();
        let drained: usize = boxes.iter().map(|b| b.drain().len()).sum();
        self.uncount(drained);
        debug!(key = %self.key, drained, "BoxList::drain: done");
        drained
    }

    // === Routing state ===

    pub fn set_filter(&self, id: Option<FilterId>) {
        write(&self.routing).filter = id;
    }

    pub fn filter(&self) -> Option<FilterId> {
        read(&self.routing).filter
    }

    pub fn set_groups(&self, groups: Vec<String>) {
        write(&self.routing).groups = groups;
    }

    pub fn groups(&self) -> Vec<String> {
        read(&self.routing).groups.clone()
    }

    /// Membership test, ignoring ASCII case
    pub fn in_group(&self, group: &str) -> bool {
        read(&self.routing).groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Subscribe to events arriving from outside the process
    pub fn set_global(&self, global: bool) {
        self.global.store(global, Ordering::Release);
    }

    pub fn wants_global(&self) -> bool {
        self.global.load(Ordering::Acquire)
    }

    /// Trigger fired on insertion into any box of the list
    pub fn set_trigger(&self, trigger: Trigger) {
        *write(&self.trigger) = trigger;
    }

    pub fn set_box_trigger(&self, box_name: &str, trigger: Trigger) {
        let id = self.open_box(box_name);
        if let Some(b) = read(&self.boxes).by_id.get(id) {
            b.set_trigger(trigger);
        }
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
        let _pending = lock(&self.pending);
        self.ready.notify_all();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}
