// Session registry — maps caller-assigned keys to live engine handles, in insertion order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::{SessionId, SessionKey, TorrentHandle};
use crate::error::{ControllerError, Result};

#[derive(Clone)]
pub struct SessionEntry {
    pub key: SessionKey,
    pub id: SessionId,
    pub handle: Arc<dyn TorrentHandle>,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: RwLock<Vec<SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a session about to be created.
    pub fn allocate_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert `handle` under `key` with a fresh id.
    pub fn register(&self, key: &str, handle: Arc<dyn TorrentHandle>) -> Result<SessionId> {
        let id = self.allocate_id();
        self.register_as(key, id, handle)?;
        Ok(id)
    }

    /// Insert `handle` under `key` with a previously allocated id. Fails if the key is already live.
    pub fn register_as(
        &self,
        key: &str,
        id: SessionId,
        handle: Arc<dyn TorrentHandle>,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.key == key) {
            return Err(ControllerError::DuplicateKey(key.to_string()));
        }
        entries.push(SessionEntry {
            key: key.to_string(),
            id,
            handle,
        });
        debug!("session {} registered as #{} ({} live)", key, id, entries.len());
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<dyn TorrentHandle>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.handle.clone())
            .ok_or_else(|| ControllerError::UnknownKey(key.to_string()))
    }

    /// The handle of session instance `id`, if `key` still refers to it.
    pub fn lookup_session(&self, key: &str, id: SessionId) -> Option<Arc<dyn TorrentHandle>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.key == key && e.id == id)
            .map(|e| e.handle.clone())
    }

    pub fn unregister(&self, key: &str) -> Result<Arc<dyn TorrentHandle>> {
        let mut entries = self.entries.write();
        let index = entries
            .iter()
            .position(|e| e.key == key)
            .ok_or_else(|| ControllerError::UnknownKey(key.to_string()))?;
        let entry = entries.remove(index);
        debug!("session {} unregistered ({} live)", key, entries.len());
        Ok(entry.handle)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().iter().any(|e| e.key == key)
    }

    /// Copy of the current entries in insertion order. The lock is released on return.
    pub fn list_all(&self) -> Vec<SessionEntry> {
        self.entries.read().clone()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<SessionEntry> {
        std::mem::take(&mut *self.entries.write())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::StaticHandle;

    fn handle() -> Arc<dyn TorrentHandle> {
        Arc::new(StaticHandle::default())
    }

    #[test]
    fn test_entry_count_tracks_starts_minus_stops() {
        let registry = SessionRegistry::new();
        let ops: &[(bool, &str)] = &[
            (true, "a"),
            (true, "b"),
            (false, "a"),
            (true, "c"),
            (true, "a"),
            (false, "b"),
            (false, "c"),
        ];
        let (mut starts, mut stops) = (0usize, 0usize);
        for (start, key) in ops {
            if *start {
                registry.register(key, handle()).unwrap();
                starts += 1;
            } else {
                registry.unregister(key).unwrap();
                stops += 1;
            }
            assert_eq!(registry.len(), starts - stops);
        }
        assert!(registry.lookup("a").is_ok());
        assert!(matches!(registry.lookup("b"), Err(ControllerError::UnknownKey(_))));
        assert!(registry.lookup("c").is_err());
    }

    #[test]
    fn test_duplicate_key_leaves_entry_untouched() {
        let registry = SessionRegistry::new();
        let first = handle();
        registry.register("k1", first.clone()).unwrap();

        let err = registry.register("k1", handle()).unwrap_err();
        assert!(matches!(err, ControllerError::DuplicateKey(ref k) if k == "k1"));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.lookup("k1").unwrap(), &first));
    }

    #[test]
    fn test_unregister_unknown_key() {
        let registry = SessionRegistry::new();
        registry.register("k1", handle()).unwrap();
        assert!(matches!(
            registry.unregister("k2"),
            Err(ControllerError::UnknownKey(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_all_keeps_insertion_order() {
        let registry = SessionRegistry::new();
        for key in ["z", "a", "m"] {
            registry.register(key, handle()).unwrap();
        }
        registry.unregister("a").unwrap();
        registry.register("b", handle()).unwrap();
        let keys: Vec<_> = registry.list_all().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["z", "m", "b"]);
    }

    #[test]
    fn test_reused_key_gets_new_id() {
        let registry = SessionRegistry::new();
        let first = registry.register("k1", handle()).unwrap();
        assert!(registry.lookup_session("k1", first).is_some());

        registry.unregister("k1").unwrap();
        let second = registry.register("k1", handle()).unwrap();
        assert_ne!(first, second);
        assert!(registry.lookup_session("k1", first).is_none());
        assert!(registry.lookup_session("k1", second).is_some());
        assert!(registry.lookup_session("k2", second).is_none());
    }
}
