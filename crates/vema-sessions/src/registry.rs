use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::manager::{RouterFactory, SessionManager};

/// Per-user `SessionManager` registry. Each user id gets isolated storage
/// under `{root}/{user_id}/`; managers are memoized per user id.
pub struct SessionRegistry {
    root: PathBuf,
    factory: Arc<dyn RouterFactory>,
    managers: DashMap<String, Arc<SessionManager>>,
}

impl SessionRegistry {
    pub fn new(root: impl Into<PathBuf>, factory: Arc<dyn RouterFactory>) -> Self {
        Self {
            root: root.into(),
            factory,
            managers: DashMap::new(),
        }
    }

    pub fn get(&self, user_id: &str) -> Arc<SessionManager> {
        self.managers
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionManager::new(
                    user_id,
                    &self.root.join(user_id),
                    self.factory.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vema_agent::router::Router;

    struct NoRouter;
    impl RouterFactory for NoRouter {
        fn create_router(&self, _: &str, _: &str) -> Router {
            unreachable!("registry tests never run a turn")
        }
    }

    #[test]
    fn managers_are_memoized_and_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path(), Arc::new(NoRouter));

        let alice = registry.get("alice");
        let alice_again = registry.get("alice");
        assert!(Arc::ptr_eq(&alice, &alice_again));

        let bob = registry.get("bob");
        let id = alice.create_session().unwrap();
        assert!(alice.get_session(&id).is_some());
        assert!(bob.get_session(&id).is_none());
        assert!(dir.path().join("alice").join("sessions_meta.json").exists());
    }
}
