//! Dispatcher
//!
//! A single thread that owns three inbound boxes and moves events between
//! threads and the outside world:
//!
//! - `dist`: events from local threads, copied into every other enabled list
//! - `out`: events from local threads bound for the link
//! - `in`: events from the link, broadcast to lists that want global events
//!
//! Each wakeup polls `dist`, then `out`, then `in`, then pushes any frames
//! the link could not take earlier.

mod client;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eddievent::{Event, Value, WriteOptions};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use client::Eddi;

use crate::config::DispatchConfig;
use crate::error::Result;
use crate::evbox::{ACCEPT_BOX, BoxList, BoxRegistry, Envelope, RingCursor, ThreadKey};
use crate::filter::{self, Direction, FilterFlags, FilterId, FilterSet, Subject, Verdict};
use crate::link::LinkHandle;
use crate::pool::{EventPool, PooledEvent};
use crate::sync::lock;

pub const OUT_BOX: &str = "out";
pub const DIST_BOX: &str = "dist";
pub const IN_BOX: &str = "in";
pub const REJECT_OUT_BOX: &str = "reject_out";

pub const ATTR_DATE: &str = "_date";
pub const ATTR_SENDER: &str = "_sender";
pub const ATTR_ORIGIN: &str = "_origin";
pub const ATTR_GROUP: &str = "_group";

/// Raised to global subscribers when an inbound event could not be delivered
pub const FATAL_EVENT: &str = "fatalerror";

const ERROR_PAUSE: Duration = Duration::from_millis(10);

/// Frames held while the link queue is full; the oldest go first
const MAX_PENDING_FRAMES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchState {
    Init,
    Polling,
    ShuttingDown,
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

pub struct Dispatcher {
    registry: Arc<BoxRegistry>,
    pool: EventPool,
    config: DispatchConfig,
    filter: Option<FilterId>,
    link: Option<LinkHandle>,
    inbox: Arc<BoxList>,
    cursor: RingCursor,
    pending: VecDeque<String>,
    state: Arc<Mutex<DispatchState>>,
    shutdown: Arc<AtomicBool>,
    pid: i64,
}

impl Dispatcher {
    pub fn new(registry: Arc<BoxRegistry>, pool: EventPool, config: DispatchConfig, filter: Option<FilterId>) -> Self {
        let inbox = registry.register(ThreadKey::fresh());
        for name in [OUT_BOX, DIST_BOX, IN_BOX, REJECT_OUT_BOX] {
            inbox.open_box(name);
        }
        debug!(key = %inbox.key(), ?filter, "Dispatcher::new: called");
        Self {
            registry,
            pool,
            config,
            filter,
            link: None,
            inbox,
            cursor: RingCursor::default(),
            pending: VecDeque::new(),
            state: Arc::new(Mutex::new(DispatchState::Init)),
            shutdown: Arc::new(AtomicBool::new(false)),
            pid: i64::from(std::process::id()),
        }
    }

    /// Send outbound events over `link`
    pub fn with_link(mut self, link: LinkHandle) -> Self {
        self.link = Some(link);
        self
    }

    /// The dispatcher's own list (`out`, `dist`, `in`, `reject_out`)
    pub fn inbox(&self) -> Arc<BoxList> {
        Arc::clone(&self.inbox)
    }

    /// Client bound to this dispatcher
    pub fn client(&self) -> Eddi {
        Eddi::new(Arc::clone(&self.registry), Arc::clone(&self.inbox))
    }

    pub fn spawn(self) -> Result<DispatcherHandle> {
        let shutdown = Arc::clone(&self.shutdown);
        let state = Arc::clone(&self.state);
        let inbox = Arc::clone(&self.inbox);
        let registry = Arc::clone(&self.registry);
        let thread = thread::Builder::new()
            .name("eddi-dispatch".to_string())
            .spawn(move || self.run())?;
        Ok(DispatcherHandle {
            shutdown,
            state,
            inbox,
            registry,
            thread: Some(thread),
        })
    }

    fn set_state(&self, state: DispatchState) {
        *lock(&self.state) = state;
    }

    fn run(mut self) {
        self.set_state(DispatchState::Polling);
        info!(key = %self.inbox.key(), wait = ?self.config.wait(), "Dispatcher::run: polling");
        while !self.shutdown.load(Ordering::Acquire) {
            self.inbox.wait_boxes(&[DIST_BOX, OUT_BOX, IN_BOX], self.config.wait());
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.poll_dist();
            self.poll_out();
            self.poll_in();
            self.maybe_send_pending();
        }
        self.set_state(DispatchState::ShuttingDown);
        if !self.pending.is_empty() {
            warn!(frames = self.pending.len(), "Dispatcher::run: unsent frames discarded");
        }
        info!("Dispatcher::run: stopped");
    }

    fn filter_set(&self) -> Option<Arc<FilterSet>> {
        self.filter.and_then(|id| filter::table().get(id))
    }

    fn event_failed(&self, stage: &str, error: &crate::error::EddiError) {
        warn!(stage, error = %error, "Dispatcher: event failed");
        thread::sleep(ERROR_PAUSE);
    }

    // === dist ===

    fn poll_dist(&mut self) {
        while let Some(envelope) = self.inbox.pop_envelope(DIST_BOX) {
            if let Err(e) = self.handle_dist(envelope) {
                self.event_failed(DIST_BOX, &e);
            }
        }
    }

    fn handle_dist(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { mut event, sender } = envelope;
        event.add_attr(ATTR_DATE, Value::Date(now_micros()), true)?;
        event.add_attr(ATTR_ORIGIN, "internal", true)?;
        if self.config.send_internal_events {
            event.add_attr(ATTR_SENDER, Value::Int(self.pid), true)?;
            self.queue_frame(&event);
        }

        let group = event.attr_str(ATTR_GROUP).ok().map(str::to_string);
        let mut delivered = 0;
        for list in self.registry.snapshot_from(&mut self.cursor) {
            if list.key() == sender || list.key() == self.inbox.key() || !list.enabled() {
                continue;
            }
            if let Some(group) = &group
                && !list.in_group(group)
            {
                continue;
            }
            if self.deliver_with_retry(&list, &event, sender, false) {
                delivered += 1;
            }
        }
        debug!(name = ?event.name(), %sender, delivered, "Dispatcher::handle_dist: distributed");
        Ok(())
    }

    // === out ===

    fn poll_out(&mut self) {
        while let Some(envelope) = self.inbox.pop_envelope(OUT_BOX) {
            if let Err(e) = self.handle_out(envelope) {
                self.event_failed(OUT_BOX, &e);
            }
        }
    }

    fn handle_out(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { mut event, sender } = envelope;
        event.add_attr(ATTR_DATE, Value::Date(now_micros()), true)?;
        event.add_attr(ATTR_SENDER, Value::Int(self.pid), true)?;

        let Some(set) = self.filter_set() else {
            self.queue_frame(&event);
            return Ok(());
        };
        let flags = FilterFlags {
            set_target: true,
            ..Default::default()
        };
        let outcomes = set.apply(Direction::Out, &mut event, flags)?;
        let mut input = Some(event);
        for outcome in outcomes {
            let pooled = match outcome.subject {
                Subject::Input => match input.take() {
                    Some(ev) => ev,
                    None => continue,
                },
                Subject::Copy(copy) => self.pool.adopt(copy)?,
            };
            match outcome.verdict {
                Verdict::Drop => debug!(name = ?pooled.name(), "Dispatcher::handle_out: dropped by filter"),
                Verdict::Reject => self.inbox.insert(pooled, REJECT_OUT_BOX, sender)?,
                Verdict::Accept => self.queue_frame(&pooled),
            }
        }
        Ok(())
    }

    // === in ===

    fn poll_in(&mut self) {
        while let Some(envelope) = self.inbox.pop_envelope(IN_BOX) {
            if let Err(e) = self.handle_in(envelope) {
                self.event_failed(IN_BOX, &e);
            }
        }
    }

    fn handle_in(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { mut event, sender } = envelope;
        event.add_attr(ATTR_ORIGIN, "external", true)?;

        let Some(set) = self.filter_set() else {
            self.broadcast(&event, sender);
            return Ok(());
        };
        let flags = FilterFlags {
            copy: true,
            ..Default::default()
        };
        let outcomes = set.apply(Direction::In, &mut event, flags)?;
        for outcome in &outcomes {
            if outcome.verdict == Verdict::Drop {
                debug!(name = ?event.name(), "Dispatcher::handle_in: dropped by filter");
                continue;
            }
            self.broadcast(outcome.event(&event), sender);
        }
        Ok(())
    }

    fn broadcast(&mut self, event: &Event, sender: ThreadKey) {
        for list in self.registry.snapshot_from(&mut self.cursor) {
            if list.key() == self.inbox.key() || !list.enabled() || !list.wants_global() {
                continue;
            }
            self.deliver_with_retry(&list, event, sender, true);
        }
    }

    // === delivery ===

    /// Hand a fresh copy to `list`, retrying while it is full
    fn deliver_with_retry(&self, list: &BoxList, event: &Event, sender: ThreadKey, fatal_on_drop: bool) -> bool {
        let tries = self.config.retries.max(1);
        for attempt in 1..=tries {
            let result = self
                .pool
                .copy_of(event)
                .and_then(|copy| list.filter_insert(copy, sender));
            match result {
                Ok(()) => return true,
                Err(e) if e.is_full() && attempt < tries => {
                    debug!(key = %list.key(), attempt, "Dispatcher::deliver_with_retry: receiver full, retrying");
                    thread::sleep(self.config.retry_backoff());
                }
                Err(e) => {
                    warn!(key = %list.key(), name = ?event.name(), attempt, error = %e, "Dispatcher::deliver_with_retry: event dropped");
                    if fatal_on_drop && self.config.drop_is_fatal {
                        self.raise_fatal(list, event);
                    }
                    return false;
                }
            }
        }
        false
    }

    /// Tell every global subscriber that an event was lost
    fn raise_fatal(&self, failed: &BoxList, lost: &Event) {
        let mut fatal = match self.pool.acquire() {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "Dispatcher::raise_fatal: no event available");
                return;
            }
        };
        if let Err(e) = build_fatal(&mut fatal, failed.key(), lost) {
            warn!(error = %e, "Dispatcher::raise_fatal: could not build event");
            return;
        }
        warn!(key = %failed.key(), "Dispatcher::raise_fatal: raising {}", FATAL_EVENT);
        for list in self.registry.snapshot_from(&mut RingCursor::default()) {
            if list.key() == self.inbox.key() || !list.enabled() || !list.wants_global() {
                continue;
            }
            let result = self
                .pool
                .copy_of(&fatal)
                .and_then(|copy| list.insert(copy, ACCEPT_BOX, self.inbox.key()).map_err(Into::into));
            if let Err(e) = result {
                warn!(key = %list.key(), error = %e, "Dispatcher::raise_fatal: subscriber missed it");
            }
        }
    }

    // === link ===

    fn queue_frame(&mut self, event: &Event) {
        let Some(link) = &self.link else {
            debug!(name = ?event.name(), "Dispatcher::queue_frame: no link, not sent");
            return;
        };
        let frame = match event.serialize(&WriteOptions::default()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dispatcher::queue_frame: event not sent");
                return;
            }
        };
        if !self.pending.is_empty() {
            self.hold_frame(frame);
            return;
        }
        if let Err(frame) = link.queue(frame) {
            self.hold_frame(frame);
        }
    }

    fn hold_frame(&mut self, frame: String) {
        if self.pending.len() >= MAX_PENDING_FRAMES {
            warn!(limit = MAX_PENDING_FRAMES, "Dispatcher::hold_frame: backlog full, oldest frame dropped");
            self.pending.pop_front();
        }
        self.pending.push_back(frame);
    }

    fn maybe_send_pending(&mut self) {
        let Some(link) = &self.link else {
            return;
        };
        while let Some(frame) = self.pending.pop_front() {
            if let Err(frame) = link.queue(frame) {
                self.pending.push_front(frame);
                break;
            }
        }
    }
}

fn build_fatal(fatal: &mut PooledEvent, failed: ThreadKey, lost: &Event) -> eddievent::Result<()> {
    fatal.set_name(FATAL_EVENT)?;
    fatal.push_arg(lost.name().unwrap_or_default());
    fatal.add_attr("reason", "delivery failed", true)?;
    fatal.add_attr("receiver", failed.to_string().as_str(), true)?;
    fatal.add_attr(ATTR_ORIGIN, "internal", true)?;
    fatal.add_attr(ATTR_DATE, Value::Date(now_micros()), true)?;
    Ok(())
}

/// Running dispatcher; dropping it stops the thread
pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<DispatchState>>,
    inbox: Arc<BoxList>,
    registry: Arc<BoxRegistry>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub fn state(&self) -> DispatchState {
        *lock(&self.state)
    }

    pub fn inbox(&self) -> Arc<BoxList> {
        Arc::clone(&self.inbox)
    }

    pub fn client(&self) -> Eddi {
        Eddi::new(Arc::clone(&self.registry), Arc::clone(&self.inbox))
    }

    /// Stop the loop and release the dispatcher's boxes
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        info!("DispatcherHandle::shutdown: stopping dispatcher");
        self.shutdown.store(true, Ordering::Release);
        self.inbox.mark_released();
        if thread.join().is_err() {
            warn!("DispatcherHandle::shutdown: dispatcher thread panicked");
        }
        self.registry.finish_list(Arc::clone(&self.inbox));
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoxConfig, PoolConfig};
    use crate::filter::CompileOptions;
    use std::time::Instant;

    fn setup() -> (Arc<BoxRegistry>, EventPool) {
        let pool = EventPool::new(&PoolConfig {
            size: Some(64),
            grow: true,
        });
        (Arc::new(BoxRegistry::new(&BoxConfig::default(), pool.clone())), pool)
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            wait_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_state_transitions() {
        let (registry, pool) = setup();
        let mut handle = Dispatcher::new(registry, pool, config(), None).spawn().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != DispatchState::Polling && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.state(), DispatchState::Polling);
        handle.shutdown();
        assert_eq!(handle.state(), DispatchState::ShuttingDown);
    }

    #[test]
    fn test_build_fatal() {
        let (_, pool) = setup();
        let mut fatal = pool.acquire().unwrap();
        let lost = Event::new("payload").unwrap();
        build_fatal(&mut fatal, ThreadKey::fresh(), &lost).unwrap();
        assert_eq!(fatal.name(), Some(FATAL_EVENT));
        assert_eq!(fatal.arg_str(0).unwrap(), "payload");
        assert_eq!(fatal.attr_str(ATTR_ORIGIN).unwrap(), "internal");
    }

    #[test]
    fn test_out_without_link_is_consumed() {
        let (registry, pool) = setup();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), pool.clone(), config(), None);
        let inbox = dispatcher.inbox();
        let client = dispatcher.client();
        let _handle = dispatcher.spawn().unwrap();

        client.send(Event::new("bye").unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while inbox.pending() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(inbox.pending(), 0);
    }

    #[test]
    fn test_out_filter_reject_goes_to_reject_out() {
        let (registry, pool) = setup();
        let id = filter::table().insert(FilterSet::compile("[out]\nname == secret => reject\n", CompileOptions::default()).unwrap());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), pool.clone(), config(), Some(id));
        let inbox = dispatcher.inbox();
        let client = dispatcher.client();
        let _handle = dispatcher.spawn().unwrap();

        client.send(Event::new("secret").unwrap()).unwrap();
        assert!(inbox.wait(REJECT_OUT_BOX, Duration::from_secs(5)));
        let rejected = inbox.pop(REJECT_OUT_BOX).unwrap();
        assert_eq!(rejected.name(), Some("secret"));
        assert!(rejected.has_attr(ATTR_DATE));
        assert_eq!(rejected.attr_int(ATTR_SENDER).unwrap(), i64::from(std::process::id()));
        filter::table().remove(id).unwrap();
    }
}
