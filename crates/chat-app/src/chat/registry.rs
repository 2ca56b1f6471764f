use std::sync::Arc;

use parley_storage::{KeyValueStore, SESSIONS_KEY, SessionId, StorageError};
use snafu::{OptionExt, ResultExt, Snafu};

use super::message::{Message, Session};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistryError {
    #[snafu(display("session {session_id} does not exist"))]
    UnknownSession {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("failed to serialize sessions on `{stage}`: {source}"))]
    SerializeSessions {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to persist sessions on `{stage}`: {source}"))]
    PersistSessions {
        stage: &'static str,
        source: StorageError,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Ordered session collection (newest first) plus the current selection.
///
/// Every mutation rewrites the whole collection under [`SESSIONS_KEY`].
pub struct SessionRegistry {
    store: Arc<dyn KeyValueStore>,
    sessions: Vec<Session>,
    current: Option<SessionId>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            sessions: Vec::new(),
            current: None,
        }
    }

    /// Replaces in-memory state with the persisted collection.
    ///
    /// Missing or unreadable data is treated as "no sessions".
    pub fn load(&mut self) -> &[Session] {
        self.sessions = read_sessions(self.store.as_ref());
        self.current = None;
        tracing::debug!(session_count = self.sessions.len(), "loaded sessions");
        &self.sessions
    }

    /// Inserts an empty session at the front and makes it current.
    pub fn create_session(&mut self) -> RegistryResult<SessionId> {
        let session = Session::new(SessionId::new_v7());
        let session_id = session.id;

        self.sessions.insert(0, session);
        self.current = Some(session_id);
        self.persist("create-session")?;

        tracing::info!(session_id = %session_id, "created session");
        Ok(session_id)
    }

    /// Makes `session_id` current. Unknown ids leave the selection untouched.
    pub fn select_session(&mut self, session_id: SessionId) -> RegistryResult<&Session> {
        let index = self.index_of(session_id).context(UnknownSessionSnafu {
            stage: "select-session",
            session_id,
        })?;

        self.current = Some(session_id);
        self.persist("select-session")?;
        Ok(&self.sessions[index])
    }

    pub fn rename_session(
        &mut self,
        session_id: SessionId,
        name: impl Into<String>,
    ) -> RegistryResult<()> {
        let index = self.index_of(session_id).context(UnknownSessionSnafu {
            stage: "rename-session",
            session_id,
        })?;

        self.sessions[index].name = name.into();
        self.persist("rename-session")
    }

    /// Appends to the session transcript and returns the new transcript length.
    pub fn append_message(
        &mut self,
        session_id: SessionId,
        message: Message,
    ) -> RegistryResult<usize> {
        let index = self.index_of(session_id).context(UnknownSessionSnafu {
            stage: "append-message",
            session_id,
        })?;

        self.sessions[index].conversation.push(message);
        let length = self.sessions[index].conversation.len();
        self.persist("append-message")?;
        Ok(length)
    }

    /// Drops a trailing error message, if any, and reports whether one was removed.
    pub fn remove_last_error(&mut self, session_id: SessionId) -> RegistryResult<bool> {
        let index = self.index_of(session_id).context(UnknownSessionSnafu {
            stage: "remove-last-error",
            session_id,
        })?;

        let conversation = &mut self.sessions[index].conversation;
        if !conversation.last().is_some_and(|message| message.error) {
            return Ok(false);
        }

        conversation.pop();
        self.persist("remove-last-error")?;
        Ok(true)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == session_id)
    }

    pub fn current_id(&self) -> Option<SessionId> {
        self.current
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.and_then(|session_id| self.get(session_id))
    }

    fn index_of(&self, session_id: SessionId) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.id == session_id)
    }

    fn persist(&self, stage: &'static str) -> RegistryResult<()> {
        let serialized =
            serde_json::to_string(&self.sessions).context(SerializeSessionsSnafu { stage })?;
        self.store
            .set(SESSIONS_KEY, &serialized)
            .context(PersistSessionsSnafu { stage })
    }
}

fn read_sessions(store: &dyn KeyValueStore) -> Vec<Session> {
    let raw = match store.get(SESSIONS_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(error) => {
            tracing::warn!(error = %error, "failed to read stored sessions; starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<Session>>(&raw) {
        Ok(sessions) => sessions,
        Err(error) => {
            tracing::warn!(
                error = %error,
                stored_bytes = raw.len(),
                "stored sessions are corrupt; starting empty"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_storage::MemoryStore;

    use super::*;
    use crate::chat::message::DEFAULT_SESSION_NAME;

    fn registry_with(store: Arc<MemoryStore>) -> SessionRegistry {
        let mut registry = SessionRegistry::new(store);
        registry.load();
        registry
    }

    #[test]
    fn missing_data_loads_as_empty() {
        let mut registry = SessionRegistry::new(Arc::new(MemoryStore::new()));
        assert!(registry.load().is_empty());
        assert_eq!(registry.current_id(), None);
    }

    #[test]
    fn corrupt_data_loads_as_empty() {
        let store = Arc::new(MemoryStore::with_entry(SESSIONS_KEY, "{not json"));
        let mut registry = SessionRegistry::new(store);
        assert!(registry.load().is_empty());
    }

    #[test]
    fn create_inserts_newest_first_and_selects_it() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry_with(store.clone());

        let first = registry.create_session().expect("first");
        let second = registry.create_session().expect("second");

        let order = registry
            .sessions()
            .iter()
            .map(|session| session.id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![second, first]);
        assert_eq!(registry.current_id(), Some(second));

        let current = registry.current().expect("current");
        assert_eq!(current.name, DEFAULT_SESSION_NAME);
        assert!(current.conversation.is_empty());
        assert!(store.get(SESSIONS_KEY).expect("get").is_some());
    }

    #[test]
    fn create_then_select_activates_empty_transcript() {
        let mut registry = registry_with(Arc::new(MemoryStore::new()));
        let older = registry.create_session().expect("older");
        registry
            .append_message(older, Message::user("hello"))
            .expect("append");

        let newer = registry.create_session().expect("newer");
        registry.select_session(older).expect("select older");
        let selected = registry.select_session(newer).expect("select newer");

        assert_eq!(selected.id, newer);
        assert!(selected.conversation.is_empty());
    }

    #[test]
    fn selecting_unknown_session_leaves_state_unchanged() {
        let mut registry = registry_with(Arc::new(MemoryStore::new()));
        let session_id = registry.create_session().expect("create");
        registry
            .append_message(session_id, Message::user("keep me"))
            .expect("append");

        let error = registry
            .select_session(SessionId::new_v7())
            .expect_err("unknown id must be reported");

        assert!(matches!(error, RegistryError::UnknownSession { .. }));
        assert_eq!(registry.current_id(), Some(session_id));
        assert_eq!(
            registry.current().expect("current").conversation,
            vec![Message::user("keep me")]
        );
    }

    #[test]
    fn rename_requires_existing_session() {
        let mut registry = registry_with(Arc::new(MemoryStore::new()));
        let session_id = registry.create_session().expect("create");

        registry
            .rename_session(session_id, "Meal Planning Tips")
            .expect("rename");
        assert_eq!(registry.current().expect("current").name, "Meal Planning Tips");

        let error = registry
            .rename_session(SessionId::new_v7(), "ghost")
            .expect_err("unknown id");
        assert!(matches!(error, RegistryError::UnknownSession { .. }));
    }

    #[test]
    fn persisted_collection_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = registry_with(store.clone());

        let first = registry.create_session().expect("first");
        registry.append_message(first, Message::user("hello")).expect("append");
        registry.append_message(first, Message::bot("hi there")).expect("append");
        registry.rename_session(first, "Greeting").expect("rename");

        let second = registry.create_session().expect("second");
        registry.append_message(second, Message::user("offline?")).expect("append");
        registry
            .append_message(second, Message::error("Unable to connect"))
            .expect("append");

        let reloaded = registry_with(store);
        assert_eq!(reloaded.sessions(), registry.sessions());
    }

    #[test]
    fn remove_last_error_only_drops_trailing_errors() {
        let mut registry = registry_with(Arc::new(MemoryStore::new()));
        let session_id = registry.create_session().expect("create");
        registry.append_message(session_id, Message::user("hello")).expect("append");

        assert!(!registry.remove_last_error(session_id).expect("no error yet"));

        registry
            .append_message(session_id, Message::error("offline"))
            .expect("append");
        assert!(registry.remove_last_error(session_id).expect("remove"));
        assert_eq!(
            registry.current().expect("current").conversation,
            vec![Message::user("hello")]
        );
    }
}
