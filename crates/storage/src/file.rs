use std::path::{Path, PathBuf};

use snafu::{ResultExt, ensure};

use super::error::{
    CreateDirectorySnafu, InvalidKeySnafu, ReadValueSnafu, RenameTempFileSnafu, StorageResult,
    WriteValueSnafu,
};
use super::{KeyValueStore, is_valid_key};

const VALUE_FILE_EXTENSION: &str = "json";
const TEMP_FILE_EXTENSION: &str = "json.tmp";

/// Directory-backed store keeping one file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root.join(key).with_extension(VALUE_FILE_EXTENSION)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        ensure!(
            is_valid_key(key),
            InvalidKeySnafu {
                stage: "file-store-get",
                key,
            }
        );

        let path = self.value_path(key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(ReadValueSnafu {
                stage: "file-store-read",
                path: display_path(&path),
            }),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(
            is_valid_key(key),
            InvalidKeySnafu {
                stage: "file-store-set",
                key,
            }
        );

        std::fs::create_dir_all(&self.root).context(CreateDirectorySnafu {
            stage: "file-store-create-directory",
            path: display_path(&self.root),
        })?;

        let path = self.value_path(key);
        let temp_path = self.root.join(key).with_extension(TEMP_FILE_EXTENSION);
        std::fs::write(&temp_path, value).context(WriteValueSnafu {
            stage: "file-store-write-temporary",
            path: display_path(&temp_path),
        })?;

        // Rename last so readers only ever observe a complete document.
        std::fs::rename(&temp_path, &path).context(RenameTempFileSnafu {
            stage: "file-store-rename-temporary",
            from: display_path(&temp_path),
            to: display_path(&path),
        })?;

        tracing::debug!(key, path = %path.display(), bytes = value.len(), "stored value");
        Ok(())
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SESSIONS_KEY, StorageError, THEME_KEY};

    #[test]
    fn missing_directory_reads_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path().join("not-created-yet"));

        assert_eq!(store.get(SESSIONS_KEY).expect("get"), None);
    }

    #[test]
    fn values_survive_a_fresh_handle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("parley");

        FileStore::new(&root)
            .set(SESSIONS_KEY, "[{\"id\":\"x\"}]")
            .expect("set sessions");
        FileStore::new(&root).set(THEME_KEY, "dark").expect("set theme");

        let reopened = FileStore::new(&root);
        assert_eq!(
            reopened.get(SESSIONS_KEY).expect("get").as_deref(),
            Some("[{\"id\":\"x\"}]")
        );
        assert_eq!(reopened.get(THEME_KEY).expect("get").as_deref(), Some("dark"));
        assert!(!root.join("ai_chat_sessions.json.tmp").exists());
    }

    #[test]
    fn rejects_path_like_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());

        let error = store.get("../secrets").expect_err("path traversal must fail");
        assert!(matches!(error, StorageError::InvalidKey { .. }));
    }
}
