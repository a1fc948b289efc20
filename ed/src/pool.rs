//! Event pool
//!
//! A fixed set of pre-built events handed out as [`PooledEvent`] handles.
//! Each handle records the slot index and the generation the slot had when
//! it was acquired; releasing checks both, so a handle can only ever return
//! the slot it came from. When every slot is taken the pool either
//! heap-allocates an overflow event or fails with `Full`.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, OnceLock};

use eddievent::Event;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::{EddiError, Result};
use crate::sync::lock;

/// Smallest pool ever built
pub const MIN_POOL_SIZE: usize = 10;

/// Pool size used when neither size nor queue size is configured
pub const DEFAULT_POOL_SIZE: usize = 64;

static GLOBAL_POOL: OnceLock<EventPool> = OnceLock::new();

/// Initialize the process-wide pool; later calls return the first pool
pub fn init(config: &PoolConfig) -> EventPool {
    GLOBAL_POOL.get_or_init(|| EventPool::new(config)).clone()
}

/// The process-wide pool, created with defaults on first use
pub fn global() -> EventPool {
    GLOBAL_POOL.get_or_init(|| EventPool::new(&PoolConfig::default())).clone()
}

struct Slot {
    used: bool,
    generation: u32,
    spare: Option<Box<Event>>,
}

struct PoolState {
    slots: Vec<Slot>,
    grow: bool,
    in_use: usize,
    overflow: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Slot { index: u32, generation: u32 },
    Overflow,
}

/// Usage counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub overflow: usize,
}

/// Shared handle to a pool of reusable events
#[derive(Clone)]
pub struct EventPool {
    state: Arc<Mutex<PoolState>>,
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool").field("stats", &self.stats()).finish()
    }
}

impl Default for EventPool {
    fn default() -> Self {
        Self::new(&PoolConfig::default())
    }
}

impl EventPool {
    pub fn new(config: &PoolConfig) -> Self {
        let capacity = config.size.unwrap_or(DEFAULT_POOL_SIZE).max(MIN_POOL_SIZE);
        debug!(capacity, grow = config.grow, "EventPool::new: building slots");
        let slots = (0..capacity)
            .map(|_| Slot {
                used: false,
                generation: 0,
                spare: Some(Box::default()),
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(PoolState {
                slots,
                grow: config.grow,
                in_use: 0,
                overflow: 0,
            })),
        }
    }

    /// Take a cleared event from the pool
    pub fn acquire(&self) -> Result<PooledEvent> {
        self.take(None)
    }

    /// Move an existing event under pool management
    ///
    /// The event replaces the spare of a free slot, or becomes an overflow
    /// event when none is free.
    pub fn adopt(&self, event: Event) -> Result<PooledEvent> {
        self.take(Some(Box::new(event)))
    }

    /// Acquire and fill with a copy of `src` (strings shared, not duplicated)
    pub fn copy_of(&self, src: &Event) -> Result<PooledEvent> {
        let mut pooled = self.acquire()?;
        pooled.copy_from(src);
        Ok(pooled)
    }

    fn take(&self, event: Option<Box<Event>>) -> Result<PooledEvent> {
        let mut state = lock(&self.state);
        let free = state.slots.iter().position(|s| !s.used);
        let (event, origin) = match free {
            Some(index) => {
                let slot = &mut state.slots[index];
                slot.used = true;
                slot.generation = slot.generation.wrapping_add(1);
                let spare = slot.spare.take();
                let origin = Origin::Slot {
                    index: index as u32,
                    generation: slot.generation,
                };
                state.in_use += 1;
                (event.or(spare).unwrap_or_default(), origin)
            }
            None if state.grow => {
                state.overflow += 1;
                debug!(overflow = state.overflow, "EventPool::take: pool exhausted, allocating overflow event");
                (event.unwrap_or_default(), Origin::Overflow)
            }
            None => {
                return Err(EddiError::Full(format!("event pool of {} slots", state.slots.len())));
            }
        };
        Ok(PooledEvent {
            event: Some(event),
            origin,
            pool: Arc::clone(&self.state),
        })
    }

    /// Return an event early
    ///
    /// Dropping a [`PooledEvent`] does the same; this variant reports a
    /// handle that belongs to a different pool.
    pub fn release(&self, event: PooledEvent) -> Result<()> {
        if !Arc::ptr_eq(&self.state, &event.pool) {
            warn!(origin = ?event.origin, "EventPool::release: handle belongs to another pool");
            return Err(EddiError::Param("event handle belongs to another pool".to_string()));
        }
        drop(event);
        Ok(())
    }

    /// True if `event` occupies one of this pool's slots
    pub fn is_pooled(&self, event: &PooledEvent) -> bool {
        if !Arc::ptr_eq(&self.state, &event.pool) {
            return false;
        }
        match event.origin {
            Origin::Slot { index, generation } => {
                let state = lock(&self.state);
                state
                    .slots
                    .get(index as usize)
                    .is_some_and(|s| s.used && s.generation == generation)
            }
            Origin::Overflow => false,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            capacity: state.slots.len(),
            in_use: state.in_use,
            overflow: state.overflow,
        }
    }
}

/// An event on loan from an [`EventPool`]
///
/// Dereferences to [`Event`]. Dropping it clears the event and frees its
/// slot; overflow events are simply freed.
pub struct PooledEvent {
    event: Option<Box<Event>>,
    origin: Origin,
    pool: Arc<Mutex<PoolState>>,
}

impl PooledEvent {
    /// Copy the contents out as a plain event
    pub fn to_event(&self) -> Event {
        self.deref().clone()
    }

    pub fn is_overflow(&self) -> bool {
        self.origin == Origin::Overflow
    }
}

impl Deref for PooledEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        // Only `Drop` takes the box out
        self.event.as_deref().unwrap_or_else(|| unreachable!("pooled event used after release"))
    }
}

impl DerefMut for PooledEvent {
    fn deref_mut(&mut self) -> &mut Event {
        self.event
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("pooled event used after release"))
    }
}

impl fmt::Debug for PooledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledEvent")
            .field("origin", &self.origin)
            .field("event", &self.event)
            .finish()
    }
}

impl fmt::Display for PooledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.deref(), f)
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        let Some(mut event) = self.event.take() else {
            return;
        };
        let mut state = lock(&self.pool);
        match self.origin {
            Origin::Slot { index, generation } => {
                let Some(slot) = state.slots.get_mut(index as usize) else {
                    warn!(index, "PooledEvent::drop: slot index out of range");
                    return;
                };
                if !slot.used || slot.generation != generation {
                    warn!(index, generation, "PooledEvent::drop: stale handle, event freed");
                    return;
                }
                event.clear();
                slot.spare = Some(event);
                slot.used = false;
                state.in_use -= 1;
            }
            Origin::Overflow => {
                state.overflow = state.overflow.saturating_sub(1);
            }
        }
    }
}
