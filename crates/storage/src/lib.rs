pub mod error;
pub mod file;
pub mod ids;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use ids::SessionId;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key holding the serialized session collection.
pub const SESSIONS_KEY: &str = "ai_chat_sessions";

/// Key holding the light/dark theme preference.
pub const THEME_KEY: &str = "theme";

/// Synchronous string-keyed store. Values are opaque documents owned by the caller.
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` when the key has never been written.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    /// Replaces the whole value stored under `key`.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
}

pub(crate) fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
}

pub(crate) fn current_unix_timestamp_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
