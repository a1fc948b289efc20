//! Ring of registered box lists

use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::ThreadKey;
use super::boxlist::BoxList;
use crate::config::BoxConfig;
use crate::pool::{self, EventPool};
use crate::sync::lock;

/// How long `finish_list` waits for other holders to let go
pub const FINISH_WAIT: Duration = Duration::from_secs(5);

static GLOBAL_REGISTRY: OnceLock<Arc<BoxRegistry>> = OnceLock::new();

/// Position in the ring, owned by whoever walks it
#[derive(Debug, Clone, Default)]
pub struct RingCursor {
    last: Option<ThreadKey>,
}

/// All box lists of the process, in registration order
pub struct BoxRegistry {
    config: BoxConfig,
    pool: EventPool,
    lists: Mutex<Vec<Arc<BoxList>>>,
}

impl BoxRegistry {
    pub fn new(config: &BoxConfig, pool: EventPool) -> Self {
        Self {
            config: config.clone(),
            pool,
            lists: Mutex::new(Vec::new()),
        }
    }

    /// Initialize the process-wide registry; later calls return the first one
    pub fn init(config: &BoxConfig, pool: EventPool) -> Arc<BoxRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(BoxRegistry::new(config, pool))))
    }

    /// The process-wide registry, backed by the global pool
    pub fn global() -> Arc<BoxRegistry> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(BoxRegistry::new(&BoxConfig::default(), pool::global()))))
    }

    pub fn pool(&self) -> &EventPool {
        &self.pool
    }

    /// The calling thread's list, registered on first use
    pub fn current(&self) -> Arc<BoxList> {
        self.register(ThreadKey::current())
    }

    /// List for `key`, created and linked into the ring if missing
    pub fn register(&self, key: ThreadKey) -> Arc<BoxList> {
        let mut lists = lock(&self.lists);
        if let Some(existing) = lists.iter().find(|l| l.key() == key) {
            return Arc::clone(existing);
        }
        let list = Arc::new(BoxList::new(key, &self.config, self.pool.clone()));
        lists.push(Arc::clone(&list));
        info!(%key, lists = lists.len(), "BoxRegistry::register: list linked");
        list
    }

    pub fn lookup(&self, key: ThreadKey) -> Option<Arc<BoxList>> {
        lock(&self.lists).iter().find(|l| l.key() == key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.lists).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live lists starting after the cursor; advances the cursor by one
    ///
    /// Successive calls rotate the starting point so no list is always
    /// served first.
    pub fn snapshot_from(&self, cursor: &mut RingCursor) -> Vec<Arc<BoxList>> {
        let lists = lock(&self.lists);
        let start = cursor
            .last
            .and_then(|key| lists.iter().position(|l| l.key() == key))
            .map_or(0, |pos| pos + 1);
        let n = lists.len();
        let snapshot: Vec<_> = (0..n)
            .map(|i| &lists[(start + i) % n.max(1)])
            .filter(|l| !l.is_released())
            .cloned()
            .collect();
        cursor.last = snapshot.first().map(|l| l.key());
        snapshot
    }

    /// Release the calling thread's list
    pub fn finish(&self) -> usize {
        match self.lookup(ThreadKey::current()) {
            Some(list) => self.finish_list(list),
            None => 0,
        }
    }

    /// Unlink `list`, wait for other holders, then drain it
    ///
    /// Returns the number of events drained back to the pool.
    pub fn finish_list(&self, list: Arc<BoxList>) -> usize {
        list.mark_released();
        lock(&self.lists).retain(|l| !Arc::ptr_eq(l, &list));

        let deadline = Instant::now() + FINISH_WAIT;
        while Arc::strong_count(&list) > 1 {
            if Instant::now() >= deadline {
                warn!(key = %list.key(), holders = Arc::strong_count(&list) - 1, "BoxRegistry::finish_list: still referenced, draining anyway");
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let drained = list.drain();
        debug!(key = %list.key(), drained, "BoxRegistry::finish_list: released");
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn registry() -> BoxRegistry {
        BoxRegistry::new(
            &BoxConfig::default(),
            EventPool::new(&PoolConfig {
                size: Some(16),
                grow: true,
            }),
        )
    }

    fn keys(lists: &[Arc<BoxList>]) -> Vec<ThreadKey> {
        lists.iter().map(|l| l.key()).collect()
    }

    #[test]
    fn test_current_registers_once() {
        let reg = registry();
        let a = reg.current();
        let b = reg.current();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert!(reg.lookup(ThreadKey::current()).is_some());
        let other = thread::spawn(ThreadKey::current).join().unwrap();
        assert!(reg.lookup(other).is_none());
    }

    #[test]
    fn test_snapshot_rotates() {
        let reg = registry();
        let (a, b, c) = (ThreadKey::fresh(), ThreadKey::fresh(), ThreadKey::fresh());
        for k in [a, b, c] {
            reg.register(k);
        }
        let mut cursor = RingCursor::default();
        assert_eq!(keys(&reg.snapshot_from(&mut cursor)), vec![a, b, c]);
        assert_eq!(keys(&reg.snapshot_from(&mut cursor)), vec![b, c, a]);
        assert_eq!(keys(&reg.snapshot_from(&mut cursor)), vec![c, a, b]);
        assert_eq!(keys(&reg.snapshot_from(&mut cursor)), vec![a, b, c]);
    }

    #[test]
    fn test_snapshot_skips_released() {
        let reg = registry();
        let (a, b) = (ThreadKey::fresh(), ThreadKey::fresh());
        reg.register(a);
        let lb = reg.register(b);
        lb.mark_released();
        let mut cursor = RingCursor::default();
        assert_eq!(keys(&reg.snapshot_from(&mut cursor)), vec![a]);
    }

    #[test]
    fn test_snapshot_empty() {
        let reg = registry();
        let mut cursor = RingCursor::default();
        assert!(reg.snapshot_from(&mut cursor).is_empty());
    }

    #[test]
    fn test_finish_list_drains() {
        let reg = registry();
        let key = ThreadKey::fresh();
        let list = reg.register(key);
        let ev = reg.pool().acquire().unwrap();
        list.insert(ev, "accept", key).unwrap();
        assert_eq!(reg.pool().stats().in_use, 1);

        assert_eq!(reg.finish_list(list), 1);
        assert!(reg.lookup(key).is_none());
        assert_eq!(reg.pool().stats().in_use, 0);
        assert_eq!(reg.finish(), 0);
    }
}
