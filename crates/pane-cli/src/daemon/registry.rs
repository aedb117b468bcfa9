//! Session registry: id assignment, lookup, listing, destruction.
//!
//! One mutex guards the map; every command handler holds it for the
//! duration of its work on the map, and nothing reads frames while it
//! is held. Ids are UUID v4 strings, unique for the server's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use pane_core::error::CommandError;
use pane_core::protocol::SessionInfo;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::daemon::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and start its child. Names are non-unique; a
    /// failed spawn inserts nothing.
    pub async fn create(
        &self,
        name: Option<String>,
        command_line: Option<Vec<String>>,
    ) -> Result<Arc<Session>, CommandError> {
        let mut sessions = self.sessions.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        let (session, output) = match Session::start(id.clone(), name, command_line) {
            Ok(started) => started,
            Err(e) => {
                warn!("session spawn failed: {e:#}");
                return Err(CommandError::create_failed());
            }
        };
        session.spawn_pump(output);
        sessions.insert(id.clone(), session.clone());
        info!(session = %id, pid = ?session.info().process_id, "session created");
        Ok(session)
    }

    /// Infos for all sessions, oldest first, ties broken by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<_> = sessions.values().cloned().collect();
        all.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        all.iter().map(|s| s.info()).collect()
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Remove and terminate. Termination happens after the registry
    /// lock is released so slow children cannot stall other commands.
    pub async fn destroy(&self, id: &str) -> Result<(), CommandError> {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.terminate().await;
                info!(session = %id, "session destroyed");
                Ok(())
            }
            None => Err(CommandError::session_not_found()),
        }
    }

    /// Resolve an attach target. Without an explicit id there must be
    /// exactly one running session.
    pub async fn attach_target(&self, id: Option<&str>) -> Result<Arc<Session>, CommandError> {
        let sessions = self.sessions.lock().await;
        match id {
            Some(id) => sessions
                .get(id)
                .cloned()
                .ok_or_else(CommandError::session_not_found),
            None => {
                let running: Vec<_> =
                    sessions.values().filter(|s| s.is_running()).collect();
                match running.as_slice() {
                    [] => Err(CommandError::no_running_sessions()),
                    [only] => Ok(Arc::clone(only)),
                    _ => Err(CommandError::multiple_running_sessions()),
                }
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Terminate every session; used on server shutdown.
    pub async fn destroy_all(&self) {
        let all: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in all {
            session.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cat() -> Option<Vec<String>> {
        Some(vec!["cat".to_string()])
    }

    #[tokio::test]
    async fn create_assigns_unique_ids() {
        let registry = Arc::new(SessionRegistry::new());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.create(None, cat()).await.expect("create")
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.expect("task").id().to_string());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5, "ids must be distinct");

        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn list_is_sorted_by_creation() {
        let registry = SessionRegistry::new();
        let first = registry
            .create(Some("a".into()), cat())
            .await
            .expect("create");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry
            .create(Some("b".into()), cat())
            .await
            .expect("create");

        let listed = registry.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id());
        assert_eq!(listed[1].id, second.id());

        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn duplicate_names_are_allowed() {
        let registry = SessionRegistry::new();
        registry
            .create(Some("same".into()), cat())
            .await
            .expect("first");
        registry
            .create(Some("same".into()), cat())
            .await
            .expect("second");
        assert_eq!(registry.count().await, 2);
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn destroy_removes_and_reports_missing() {
        let registry = SessionRegistry::new();
        let session = registry.create(None, cat()).await.expect("create");
        let id = session.id().to_string();

        registry.destroy(&id).await.expect("destroy");
        assert_eq!(registry.count().await, 0);
        assert!(registry.list().await.is_empty());

        let err = registry.destroy(&id).await.expect_err("gone");
        assert_eq!(err.message, "session not found");
        let err = registry.destroy("bogus").await.expect_err("never existed");
        assert_eq!(err.message, "session not found");
    }

    #[tokio::test]
    async fn failed_spawn_inserts_nothing() {
        let registry = SessionRegistry::new();
        let err = registry
            .create(None, Some(vec!["/definitely/not/a/binary".into()]))
            .await
            .expect_err("spawn must fail");
        assert_eq!(err.message, "create session failed");
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn attach_target_selection() {
        let registry = SessionRegistry::new();

        let err = registry.attach_target(None).await.expect_err("empty");
        assert_eq!(err.message, "no running sessions (specify session id)");

        let only = registry.create(None, cat()).await.expect("create");
        let target = registry.attach_target(None).await.expect("single");
        assert_eq!(target.id(), only.id());

        let by_id = registry
            .attach_target(Some(only.id()))
            .await
            .expect("by id");
        assert_eq!(by_id.id(), only.id());

        registry.create(None, cat()).await.expect("second");
        let err = registry.attach_target(None).await.expect_err("ambiguous");
        assert_eq!(
            err.message,
            "multiple running sessions (specify session id)"
        );

        let err = registry
            .attach_target(Some("missing"))
            .await
            .expect_err("unknown id");
        assert_eq!(err.message, "session not found");

        registry.destroy_all().await;
    }
}
