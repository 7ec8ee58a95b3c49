//! Process-wide table of active sessions keyed by room identifier.

use crate::{error::RegistryError, runtime::SessionHandle};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle callbacks fired by the registry. Both run while the registry's
/// write lock is held and must not call back into it.
pub trait RegistryHook: Send + Sync {
    fn on_register(&self, _handle: &SessionHandle) {}
    fn on_evict(&self, _handle: &SessionHandle) {}
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    hooks: Vec<Arc<dyn RegistryHook>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn RegistryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Registers a session. A room holds at most one session at a time.
    pub async fn register(&self, handle: SessionHandle) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&handle.room_id) {
            warn!(room_id = %handle.room_id, "Rejected duplicate session registration");
            return Err(RegistryError::DuplicateRoom(handle.room_id));
        }
        for hook in &self.hooks {
            hook.on_register(&handle);
        }
        info!(room_id = %handle.room_id, session_id = %handle.session_id, "Session registered");
        sessions.insert(handle.room_id.clone(), handle);
        Ok(())
    }

    pub async fn lookup(&self, room_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(room_id).cloned()
    }

    /// Removes the session for `room_id`. Removing an absent room is a no-op.
    pub async fn unregister(&self, room_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(room_id);
        if let Some(handle) = &removed {
            self.evicted(handle);
        }
        removed
    }

    /// Removes the session for `room_id` only if it is still `session_id`,
    /// so that a finished session never evicts its successor.
    pub async fn unregister_if(&self, room_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(room_id) {
            Some(handle) if handle.session_id == session_id => {
                if let Some(handle) = sessions.remove(room_id) {
                    self.evicted(&handle);
                }
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<SessionHandle> {
        let mut handles: Vec<_> = self.sessions.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        handles
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn evicted(&self, handle: &SessionHandle) {
        for hook in &self.hooks {
            hook.on_evict(handle);
        }
        info!(room_id = %handle.room_id, session_id = %handle.session_id, "Session unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn handle(room: &str) -> SessionHandle {
        let (events, _rx) = mpsc::channel(1);
        SessionHandle {
            room_id: room.to_string(),
            session_id: Uuid::new_v4(),
            subject_id: Some("u123".to_string()),
            created_at: Utc::now(),
            events,
        }
    }

    #[derive(Default)]
    struct CountingHook {
        registered: AtomicUsize,
        evicted: AtomicUsize,
    }

    impl RegistryHook for CountingHook {
        fn on_register(&self, _handle: &SessionHandle) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }
        fn on_evict(&self, _handle: &SessionHandle) {
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn duplicate_room_is_rejected() {
        let registry = SessionRegistry::new();
        registry.register(handle("room-a")).await.unwrap();

        let err = registry.register(handle("room-a")).await.unwrap_err();
        assert_eq!(err, RegistryError::DuplicateRoom("room-a".to_string()));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.register(handle("room-a")).await.unwrap();

        assert!(registry.unregister("room-a").await.is_some());
        assert!(registry.unregister("room-a").await.is_none());
        assert!(registry.lookup("room-a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn unregister_if_keeps_a_newer_session() {
        let registry = SessionRegistry::new();
        let old = handle("room-a");
        let old_id = old.session_id;
        registry.register(old).await.unwrap();
        registry.unregister("room-a").await;

        let new = handle("room-a");
        let new_id = new.session_id;
        registry.register(new).await.unwrap();

        assert!(!registry.unregister_if("room-a", old_id).await);
        assert_eq!(
            registry.lookup("room-a").await.map(|h| h.session_id),
            Some(new_id)
        );
        assert!(registry.unregister_if("room-a", new_id).await);
    }

    #[tokio::test]
    async fn hooks_observe_lifecycle() {
        let hook = Arc::new(CountingHook::default());
        let registry = SessionRegistry::new().with_hook(hook.clone());

        registry.register(handle("room-a")).await.unwrap();
        let _ = registry.register(handle("room-a")).await;
        registry.unregister("room-a").await;
        registry.unregister("room-a").await;

        assert_eq!(hook.registered.load(Ordering::SeqCst), 1);
        assert_eq!(hook.evicted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_admits_one_session_per_room() {
        let registry = Arc::new(SessionRegistry::new());

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let room = format!("room-{}", i % 4);
                tokio::spawn(async move { registry.register(handle(&room)).await.is_ok() })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
        assert_eq!(registry.len().await, 4);
    }
}
