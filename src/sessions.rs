use crate::ledger::ConversationLedger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One HTTP-side conversation: identity plus its own independently
/// locked ledger. Sessions never share ledger state, so serving many
/// conversations concurrently contends only on the registry map itself.
pub struct SessionState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub ledger: ConversationLedger,
    character_id: Mutex<Option<String>>,
}

impl SessionState {
    fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            ledger: ConversationLedger::new(),
            character_id: Mutex::new(None),
        }
    }

    pub fn character_id(&self) -> Option<String> {
        self.character_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_character_id(&self, character_id: Option<String>) {
        *self
            .character_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = character_id;
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at.to_rfc3339(),
            message_count: self.ledger.message_count(),
            total_tokens: self.ledger.current_total(),
            character_id: self.character_id(),
        }
    }
}

/// Summary row for the session listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
    pub message_count: u64,
    pub total_tokens: u64,
    pub character_id: Option<String>,
}

/// In-process registry of live sessions, keyed by caller-chosen id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionState>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch the session, creating it on first use — the original
    /// server materializes a session the moment an unknown id chats.
    pub fn get_or_create(&self, id: &str) -> Arc<SessionState> {
        let mut sessions = self.lock();
        Arc::clone(
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(SessionState::new(id.to_string()))),
        )
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.lock().values().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Speaker;

    #[test]
    fn get_or_create_returns_the_same_session_for_the_same_id() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("abc");
        first.ledger.append_turn(Speaker::User, "hi");
        let second = registry.get_or_create("abc");
        assert_eq!(second.ledger.history_snapshot().len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sessions_have_independent_ledgers() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        a.ledger.add_token_usage(10);
        assert_eq!(a.ledger.current_total(), 10);
        assert_eq!(b.ledger.current_total(), 0);
    }

    #[test]
    fn remove_forgets_the_session() {
        let registry = SessionRegistry::new();
        registry.get_or_create("gone");
        assert!(registry.remove("gone"));
        assert!(!registry.remove("gone"));
        assert!(registry.get("gone").is_none());
    }

    #[test]
    fn info_reflects_ledger_state_and_character() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("s");
        session
            .ledger
            .append_exchange("q", "a", 5, std::time::Duration::from_millis(10));
        session.set_character_id(Some("takeshi".into()));

        let info = session.info();
        assert_eq!(info.message_count, 1);
        assert_eq!(info.total_tokens, 5);
        assert_eq!(info.character_id.as_deref(), Some("takeshi"));
    }

    #[test]
    fn list_is_sorted_by_creation_time() {
        let registry = SessionRegistry::new();
        registry.get_or_create("one");
        registry.get_or_create("two");
        let infos = registry.list();
        assert_eq!(infos.len(), 2);
        assert!(infos[0].created_at <= infos[1].created_at);
    }
}
