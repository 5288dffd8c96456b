//! The in-memory key/value store behind the cell's HTTP surface.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Outcome of a store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The payload was stored.
    Stored,
    /// An identical payload is already stored under this key; a retransmit
    /// is success.
    AlreadyPresent,
    /// The payload does not fit in the remaining budget.
    Full,
}

#[derive(Debug, Default)]
struct StoreState {
    used: u64,
    storage: BTreeMap<String, String>,
}

/// A byte-budgeted map of keys to payloads.
#[derive(Debug)]
pub struct KeyStore {
    capacity: u64,
    state: Mutex<StoreState>,
}

impl KeyStore {
    /// An empty store holding at most `capacity` payload bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Store `payload` under `key` if it fits.
    pub fn store(&self, key: &str, payload: &str) -> StoreOutcome {
        let mut state = self.state.lock();

        let old_size = match state.storage.get(key) {
            Some(old) if old == payload => return StoreOutcome::AlreadyPresent,
            Some(old) => old.len() as u64,
            None => 0,
        };

        let size = payload.len() as u64;
        if state.used - old_size + size > self.capacity {
            return StoreOutcome::Full;
        }

        state.used = state.used - old_size + size;
        state.storage.insert(key.to_string(), payload.to_string());
        StoreOutcome::Stored
    }

    /// The payload under `key`, if present.
    pub fn retrieve(&self, key: &str) -> Option<String> {
        self.state.lock().storage.get(key).cloned()
    }

    /// Remove `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        match state.storage.remove(key) {
            Some(old) => {
                state.used -= old.len() as u64;
                true
            }
            None => false,
        }
    }

    /// Unused budget, in bytes.
    pub fn free_space(&self) -> u64 {
        self.capacity - self.state.lock().used
    }

    /// Every `(key, payload)` pair currently held.
    pub fn contents(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .storage
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget() {
        let store = KeyStore::new(10);

        assert_eq!(store.store("a", "xxxxx"), StoreOutcome::Stored);
        assert_eq!(store.free_space(), 5);

        // rejecting a payload that does not fit leaves the store untouched
        assert_eq!(store.store("b", "yyyyyy"), StoreOutcome::Full);
        assert_eq!(store.free_space(), 5);

        // an identical retransmit is success, not a second copy
        assert_eq!(store.store("a", "xxxxx"), StoreOutcome::AlreadyPresent);
        assert_eq!(store.free_space(), 5);
    }

    #[test]
    fn test_delete_reclaims() {
        let store = KeyStore::new(10);
        store.store("a", "xxxxxxxxxx");

        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.free_space(), 10);
    }

    #[test]
    fn test_replace_adjusts_budget() {
        let store = KeyStore::new(10);
        store.store("a", "xxxxxxxx");

        // replacing with a smaller payload frees the difference
        assert_eq!(store.store("a", "xx"), StoreOutcome::Stored);
        assert_eq!(store.free_space(), 8);
    }

    #[test]
    fn test_contents() {
        let store = KeyStore::new(100);
        store.store("a", "xxxxx");
        store.store("b", "yy");

        let contents = store.contents();
        assert_eq!(
            contents,
            vec![
                ("a".to_string(), "xxxxx".to_string()),
                ("b".to_string(), "yy".to_string()),
            ]
        );
    }
}
