use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use vema_agent::router::{Router, RouterError, RouterResponse};

use crate::error::{Result, SessionError};
use crate::types::{HistoryEntry, SessionMeta};

/// Auto-titles take this many characters of the first user message.
const TITLE_CHARS: usize = 20;
const MAX_TITLE_CHARS: usize = 80;

/// Builds a router (and through it, the session's memory) for a session.
/// The gateway implements this with the process-wide executor and LLM stack.
pub trait RouterFactory: Send + Sync {
    fn create_router(&self, user_id: &str, session_id: &str) -> Router;
}

/// One conversation. The router is created lazily on first use; turns must
/// be serialized by holding the manager's per-session mutex across the turn.
pub struct Session {
    user_id: String,
    session_id: String,
    pub history: Vec<HistoryEntry>,
    router: Option<Router>,
    factory: Arc<dyn RouterFactory>,
}

impl Session {
    fn new(
        user_id: String,
        session_id: String,
        history: Vec<HistoryEntry>,
        factory: Arc<dyn RouterFactory>,
    ) -> Self {
        Self {
            user_id,
            session_id,
            history,
            router: None,
            factory,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn router(&mut self) -> &mut Router {
        if self.router.is_none() {
            self.router = Some(
                self.factory
                    .create_router(&self.user_id, &self.session_id),
            );
        }
        self.router.as_mut().expect("router just created")
    }

    /// Run one turn through the router.
    pub async fn chat(
        &mut self,
        message: &str,
        file_path: Option<&Path>,
    ) -> std::result::Result<RouterResponse, RouterError> {
        self.router().chat(message, file_path).await
    }

    /// Append one user and one assistant entry. Returns the assistant
    /// message id (freshly generated when not supplied).
    #[allow(clippy::too_many_arguments)]
    pub fn save_turn(
        &mut self,
        user_input: &str,
        assistant_response: &str,
        chart_data: Option<Value>,
        table_data: Option<Value>,
        data_type: Option<String>,
        file_id: Option<String>,
        download_file: Option<Value>,
        message_id: Option<String>,
    ) -> String {
        let assistant_message_id =
            message_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..12].to_string());

        self.history.push(HistoryEntry::user(user_input));
        self.history.push(HistoryEntry {
            role: "assistant".to_string(),
            content: assistant_response.to_string(),
            data_type,
            chart_data,
            table_data,
            message_id: Some(assistant_message_id.clone()),
            file_id,
            download_file,
            timestamp: chrono::Utc::now().to_rfc3339(),
        });

        assistant_message_id
    }
}

/// Manages all sessions of one user. Metadata lives in `sessions_meta.json`,
/// each conversation in `history/{session_id}.json`.
pub struct SessionManager {
    user_id: String,
    meta_file: PathBuf,
    history_dir: PathBuf,
    factory: Arc<dyn RouterFactory>,
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Session>>>>,
    metas: Mutex<HashMap<String, SessionMeta>>,
}

impl SessionManager {
    pub fn new(user_id: &str, storage_dir: &Path, factory: Arc<dyn RouterFactory>) -> Self {
        let history_dir = storage_dir.join("history");
        let manager = Self {
            user_id: user_id.to_string(),
            meta_file: storage_dir.join("sessions_meta.json"),
            history_dir,
            factory,
            sessions: Mutex::new(HashMap::new()),
            metas: Mutex::new(HashMap::new()),
        };
        manager.load_from_disk();
        manager
    }

    /// Create a new session with a fresh short id, unique in this manager.
    pub fn create_session(&self) -> Result<String> {
        let session_id = {
            let mut metas = self.metas.lock().unwrap();
            let session_id = loop {
                let candidate = Uuid::new_v4().simple().to_string()[..8].to_string();
                if !metas.contains_key(&candidate) {
                    break candidate;
                }
            };
            metas.insert(session_id.clone(), SessionMeta::new(&session_id));
            self.save_metas(&metas)?;
            session_id
        };

        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            Arc::new(tokio::sync::Mutex::new(Session::new(
                self.user_id.clone(),
                session_id.clone(),
                Vec::new(),
                self.factory.clone(),
            ))),
        );
        Ok(session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<tokio::sync::Mutex<Session>>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Return the session for `session_id`, creating it (under that id, or a
    /// fresh one when absent) if unknown.
    pub fn get_or_create(&self, session_id: Option<&str>) -> Result<(String, Arc<tokio::sync::Mutex<Session>>)> {
        if let Some(id) = session_id {
            if let Some(session) = self.get_session(id) {
                return Ok((id.to_string(), session));
            }
        }

        let id = match session_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().simple().to_string()[..8].to_string(),
        };

        let session = Arc::new(tokio::sync::Mutex::new(Session::new(
            self.user_id.clone(),
            id.clone(),
            Vec::new(),
            self.factory.clone(),
        )));
        self.sessions
            .lock()
            .unwrap()
            .insert(id.clone(), session.clone());
        {
            let mut metas = self.metas.lock().unwrap();
            metas
                .entry(id.clone())
                .or_insert_with(|| SessionMeta::new(&id));
            self.save_metas(&metas)?;
        }
        Ok((id, session))
    }

    /// Sessions newest-first by `updated_at`.
    pub fn list_sessions(&self) -> Vec<SessionMeta> {
        let metas = self.metas.lock().unwrap();
        let mut list: Vec<SessionMeta> = metas.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub fn get_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.metas.lock().unwrap().get(session_id).cloned()
    }

    /// Delete a session, its metadata, and its history file.
    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        let existed = self.metas.lock().unwrap().remove(session_id).is_some();
        self.sessions.lock().unwrap().remove(session_id);
        if !existed {
            return Err(SessionError::NotFound {
                id: session_id.to_string(),
            });
        }

        let history_file = self.history_dir.join(format!("{session_id}.json"));
        if history_file.exists() {
            if let Err(e) = std::fs::remove_file(&history_file) {
                warn!(error = %e, "failed to remove history file");
            }
        }
        let metas = self.metas.lock().unwrap();
        self.save_metas(&metas)
    }

    /// Bump counters after one committed turn and derive the title from the
    /// first user message.
    pub fn after_turn(
        &self,
        session_id: &str,
        first_message: &str,
        last_result_file: Option<Value>,
    ) -> Result<()> {
        let mut metas = self.metas.lock().unwrap();
        let meta = metas
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;

        meta.message_count += 1;
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        if let Some(file) = last_result_file {
            meta.last_result_file = Some(file);
        }
        if meta.message_count == 1 {
            meta.title = auto_title(first_message);
        }
        self.save_metas(&metas)
    }

    /// Manually set the title. Empty titles are rejected.
    pub fn set_title(&self, session_id: &str, title: &str) -> Result<String> {
        let clean: String = title.trim().chars().take(MAX_TITLE_CHARS).collect();
        if clean.is_empty() {
            return Err(SessionError::EmptyTitle);
        }
        let mut metas = self.metas.lock().unwrap();
        let meta = metas
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                id: session_id.to_string(),
            })?;
        meta.title = clean.clone();
        meta.updated_at = chrono::Utc::now().to_rfc3339();
        self.save_metas(&metas)?;
        Ok(clean)
    }

    /// Persist one session's history file.
    pub fn persist_history(&self, session_id: &str, history: &[HistoryEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.history_dir)?;
        let path = self.history_dir.join(format!("{session_id}.json"));
        let text = serde_json::to_string_pretty(history)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn save_metas(&self, metas: &HashMap<String, SessionMeta>) -> Result<()> {
        if let Some(parent) = self.meta_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut list: Vec<&SessionMeta> = metas.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let text = serde_json::to_string_pretty(&list)?;
        std::fs::write(&self.meta_file, text)?;
        Ok(())
    }

    fn load_from_disk(&self) {
        let metas_list: Vec<SessionMeta> = match std::fs::read_to_string(&self.meta_file) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "discarding corrupt sessions_meta.json");
                    return;
                }
            },
            Err(_) => return,
        };

        let mut sessions = self.sessions.lock().unwrap();
        let mut metas = self.metas.lock().unwrap();
        for meta in metas_list {
            let history_file = self.history_dir.join(format!("{}.json", meta.session_id));
            let history: Vec<HistoryEntry> = std::fs::read_to_string(&history_file)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default();

            sessions.insert(
                meta.session_id.clone(),
                Arc::new(tokio::sync::Mutex::new(Session::new(
                    self.user_id.clone(),
                    meta.session_id.clone(),
                    history,
                    self.factory.clone(),
                ))),
            );
            metas.insert(meta.session_id.clone(), meta);
        }
        info!(user_id = %self.user_id, count = metas.len(), "loaded sessions");
    }
}

fn auto_title(message: &str) -> String {
    let chars: Vec<char> = message.chars().collect();
    if chars.len() > TITLE_CHARS {
        let head: String = chars[..TITLE_CHARS].iter().collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRouter;

    impl RouterFactory for NoRouter {
        fn create_router(&self, _user_id: &str, _session_id: &str) -> Router {
            unreachable!("tests here never run a turn")
        }
    }

    fn manager(dir: &Path) -> SessionManager {
        SessionManager::new("default", dir, Arc::new(NoRouter))
    }

    #[test]
    fn create_list_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        let id = mgr.create_session().unwrap();
        assert_eq!(id.len(), 8);
        assert_eq!(mgr.list_sessions().len(), 1);
        assert!(mgr.get_session(&id).is_some());

        mgr.delete_session(&id).unwrap();
        assert!(mgr.list_sessions().is_empty());
        assert!(matches!(
            mgr.delete_session(&id),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn history_alternates_user_assistant() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let (id, session) = mgr.get_or_create(None).unwrap();

        let mut guard = session.lock().await;
        for i in 0..3 {
            guard.save_turn(
                &format!("question {i}"),
                &format!("answer {i}"),
                None,
                None,
                None,
                None,
                None,
                None,
            );
        }

        assert_eq!(guard.history.len(), 6);
        for (i, entry) in guard.history.iter().enumerate() {
            let expected = if i % 2 == 0 { "user" } else { "assistant" };
            assert_eq!(entry.role, expected);
        }
        drop(guard);
        let _ = id;
    }

    #[tokio::test]
    async fn assistant_entries_get_fresh_message_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let (_, session) = mgr.get_or_create(None).unwrap();

        let mut guard = session.lock().await;
        let first = guard.save_turn("a", "b", None, None, None, None, None, None);
        let second = guard.save_turn("c", "d", None, None, None, None, None, None);
        assert_eq!(first.len(), 12);
        assert_ne!(first, second);
        assert_eq!(guard.history[1].message_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn persistence_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let id;
        {
            let mgr = manager(dir.path());
            let (created_id, session) = mgr.get_or_create(None).unwrap();
            id = created_id;
            let mut guard = session.lock().await;
            guard.save_turn("查询CO2", "已完成", None, None, None, None, None, None);
            let history = guard.history.clone();
            drop(guard);
            mgr.after_turn(&id, "查询CO2", None).unwrap();
            mgr.persist_history(&id, &history).unwrap();
        }

        let reloaded = manager(dir.path());
        let metas = reloaded.list_sessions();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].session_id, id);
        assert_eq!(metas[0].message_count, 1);
        assert_eq!(metas[0].title, "查询CO2");

        let session = reloaded.get_session(&id).unwrap();
        let guard = session.lock().await;
        assert_eq!(guard.history.len(), 2);
        assert_eq!(guard.history[0].content, "查询CO2");
        assert_eq!(guard.history[1].content, "已完成");
    }

    #[test]
    fn title_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let id = mgr.create_session().unwrap();

        let long = "这是一条非常长的用户消息超过二十个字符用于测试标题截断";
        mgr.after_turn(&id, long, None).unwrap();
        let meta = mgr.get_meta(&id).unwrap();
        assert!(meta.title.ends_with("..."));
        assert_eq!(meta.title.chars().count(), TITLE_CHARS + 3);

        let set = mgr.set_title(&id, "  自定义标题  ").unwrap();
        assert_eq!(set, "自定义标题");
        assert!(matches!(mgr.set_title(&id, "   "), Err(SessionError::EmptyTitle)));
    }

    #[test]
    fn second_turn_does_not_retitle() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let id = mgr.create_session().unwrap();
        mgr.after_turn(&id, "第一条", None).unwrap();
        mgr.after_turn(&id, "第二条", None).unwrap();
        assert_eq!(mgr.get_meta(&id).unwrap().title, "第一条");
    }
}
