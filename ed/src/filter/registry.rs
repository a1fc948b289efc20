//! Process-wide table of compiled filters

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use super::FilterSet;
use crate::error::{EddiError, Result};
use crate::sync::{read, write};

pub type FilterId = u32;

/// Id of the permanent empty (accept-all) filter set
pub const EMPTY_FILTER: FilterId = 0;

static TABLE: OnceLock<Arc<FilterTable>> = OnceLock::new();

/// The global filter table
pub fn table() -> Arc<FilterTable> {
    Arc::clone(TABLE.get_or_init(|| Arc::new(FilterTable::new())))
}

struct TableState {
    next_id: FilterId,
    sets: HashMap<FilterId, Arc<FilterSet>>,
    protected: HashSet<FilterId>,
}

/// Compiled filter sets by id
///
/// Lookups hand out `Arc` clones, so a set removed from the table stays
/// usable by whoever still holds it.
pub struct FilterTable {
    state: RwLock<TableState>,
}

impl Default for FilterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterTable {
    pub fn new() -> Self {
        let mut sets = HashMap::new();
        sets.insert(EMPTY_FILTER, Arc::new(FilterSet::empty()));
        Self {
            state: RwLock::new(TableState {
                next_id: EMPTY_FILTER + 1,
                sets,
                protected: HashSet::new(),
            }),
        }
    }

    pub fn insert(&self, set: FilterSet) -> FilterId {
        let mut state = write(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.sets.insert(id, Arc::new(set));
        debug!(id, "FilterTable::insert: registered filter");
        id
    }

    pub fn get(&self, id: FilterId) -> Option<Arc<FilterSet>> {
        read(&self.state).sets.get(&id).cloned()
    }

    pub fn remove(&self, id: FilterId) -> Result<()> {
        let mut state = write(&self.state);
        if id == EMPTY_FILTER || state.protected.contains(&id) {
            return Err(EddiError::Param(format!("filter {} is protected", id)));
        }
        match state.sets.remove(&id) {
            Some(_) => {
                debug!(id, "FilterTable::remove: removed filter");
                Ok(())
            }
            None => Err(EddiError::NotFound(format!("filter {}", id))),
        }
    }

    /// Prevent `remove` from dropping `id`
    pub fn protect(&self, id: FilterId) -> Result<()> {
        let mut state = write(&self.state);
        if !state.sets.contains_key(&id) {
            return Err(EddiError::NotFound(format!("filter {}", id)));
        }
        state.protected.insert(id);
        Ok(())
    }

    pub fn unprotect(&self, id: FilterId) -> Result<()> {
        if id == EMPTY_FILTER {
            return Err(EddiError::Param("the empty filter is always protected".to_string()));
        }
        let mut state = write(&self.state);
        if !state.protected.remove(&id) {
            return Err(EddiError::NotFound(format!("protected filter {}", id)));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        read(&self.state).sets.len()
    }

    /// Never true; the empty filter is always present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::CompileOptions;

    fn sample() -> FilterSet {
        FilterSet::compile("name == x => drop\n", CompileOptions::default()).unwrap()
    }

    #[test]
    fn test_empty_filter_present() {
        let table = FilterTable::new();
        let empty = table.get(EMPTY_FILTER).unwrap();
        assert!(empty.input().is_empty());
        assert!(matches!(table.remove(EMPTY_FILTER), Err(EddiError::Param(_))));
        assert!(matches!(table.unprotect(EMPTY_FILTER), Err(EddiError::Param(_))));
    }

    #[test]
    fn test_insert_get_remove() {
        let table = FilterTable::new();
        let id = table.insert(sample());
        assert_ne!(id, EMPTY_FILTER);
        let held = table.get(id).unwrap();
        table.remove(id).unwrap();
        assert!(table.get(id).is_none());
        // holders keep their reference
        assert_eq!(held.input().len(), 1);
        assert!(table.remove(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_protect() {
        let table = FilterTable::new();
        let id = table.insert(sample());
        table.protect(id).unwrap();
        assert!(matches!(table.remove(id), Err(EddiError::Param(_))));
        table.unprotect(id).unwrap();
        table.remove(id).unwrap();
        assert!(table.protect(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let table = FilterTable::new();
        let a = table.insert(sample());
        table.remove(a).unwrap();
        let b = table.insert(sample());
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }
}
