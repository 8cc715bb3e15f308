use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::handler::Handler;

/// Key -> handler map shared by a sub-reactor and external callers.
///
/// The loop never iterates under the lock; it copies handles out with
/// `snapshot` and works on the copy.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
}

impl HandlerRegistry {
    pub(crate) fn get(&self, key: &str) -> Option<Arc<Handler>> {
        self.handlers.read().ok()?.get(key).cloned()
    }

    /// Insert `handler`, returning the one it replaced.
    pub(crate) fn add(&self, handler: Arc<Handler>) -> Option<Arc<Handler>> {
        self.handlers
            .write()
            .ok()?
            .insert(handler.key().to_string(), handler)
    }

    pub(crate) fn remove(&self, key: &str) -> Option<Arc<Handler>> {
        self.handlers.write().ok()?.remove(key)
    }

    /// Replace `out` with the current handler set.
    pub(crate) fn snapshot(&self, out: &mut Vec<Arc<Handler>>) {
        out.clear();
        if let Ok(guard) = self.handlers.read() {
            out.extend(guard.values().cloned());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.read().map(|g| g.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::memory::MemoryStorage;
    use crate::reactor::replica::LogReplica;
    use crate::reactor::types::ReplicaConfig;

    fn handler(key: &str) -> Arc<Handler> {
        let replica = LogReplica::new(ReplicaConfig::new(1, vec![1])).unwrap();
        Arc::new(Handler::new(key, replica, Arc::new(MemoryStorage::new())))
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = HandlerRegistry::default();
        registry.add(handler("a"));
        registry.add(handler("b"));

        let mut snap = Vec::new();
        registry.snapshot(&mut snap);
        assert_eq!(snap.len(), 2);

        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert_eq!(snap.len(), 2);
        assert_eq!(registry.len(), 1);

        assert!(registry.add(handler("b")).is_some());
        registry.snapshot(&mut snap);
        assert_eq!(snap.len(), 1);
    }
}
