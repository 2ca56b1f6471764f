use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized},
};
use parley_llm::{DEFAULT_MODEL, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const CREDENTIAL_FALLBACK_ENV: &str = "OPENAI_API_KEY";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful nutrition specialist. Answer all questions with expertise in nutrition, diet, and healthy eating.";
pub const DEFAULT_WELCOME_MESSAGE: &str =
    "Hi! I'm your nutrition AI assistant. How can I help with your diet and nutrition questions today?";

/// Where chat sessions are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: Option<String>,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            system_prompt: default_system_prompt(),
            welcome_message: default_welcome_message(),
            storage: StorageBackend::default(),
            data_dir: None,
        }
    }
}

impl AppSettings {
    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint, &self.model)
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Directory holding the session store. Falls back to the platform data directory.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".parley"))
        })
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model = non_blank_or(self.model, default_model);
        self.system_prompt = non_blank_or(self.system_prompt, default_system_prompt);
        self.welcome_message = self
            .welcome_message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty());
        self.data_dir = self
            .data_dir
            .filter(|path| !path.as_os_str().is_empty());
        self
    }

    fn with_credential_fallback(mut self, fallback: Option<&str>) -> Self {
        if self.api_key.is_empty()
            && let Some(fallback) = fallback.map(str::trim).filter(|key| !key.is_empty())
        {
            self.api_key = fallback.to_string();
        }
        self
    }
}

/// Layered settings: defaults < JSON file < `PARLEY_*` environment.
pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
    /// Credential as written in the file.
    file_api_key: String,
    /// Credential supplied by the environment; never written back to the file.
    env_api_key: Option<String>,
    /// Set when the file exists but does not parse; it is then never overwritten.
    file_unreadable: bool,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let fallback = std::env::var(CREDENTIAL_FALLBACK_ENV).ok();
        Self::with_overrides(config_path, Env::prefixed(ENV_PREFIX), fallback.as_deref())
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub(crate) fn with_overrides(
        config_path: PathBuf,
        overrides: impl Provider,
        credential_fallback: Option<&str>,
    ) -> Self {
        let overrides = Figment::from(overrides);
        let file_layer = file_figment(&config_path);
        let file_api_key = file_layer
            .extract_inner::<String>("api_key")
            .map(|key| key.trim().to_string())
            .unwrap_or_default();

        let file_settings = match file_layer.extract::<AppSettings>() {
            Ok(settings) => Some(settings),
            Err(error) => {
                tracing::warn!(
                    path = %config_path.display(),
                    error = %error,
                    "failed to parse settings file; using defaults with environment overrides"
                );
                None
            }
        };
        let file_unreadable = file_settings.is_none();

        let layered = if file_unreadable {
            defaults_figment().merge(overrides)
        } else {
            file_layer.merge(overrides)
        };
        let settings = match layered.extract::<AppSettings>() {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(error = %error, "ignoring invalid environment settings");
                file_settings.unwrap_or_default()
            }
        }
        .normalized()
        .with_credential_fallback(credential_fallback);
        let env_api_key = (settings.api_key != file_api_key).then(|| settings.api_key.clone());

        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            file_api_key,
            env_api_key,
            file_unreadable,
        }
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        ensure!(
            !self.file_unreadable,
            UnreadableFileSnafu {
                stage: "persist-settings",
                path: self.config_path.clone(),
            }
        );

        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let mut on_disk = settings.clone();
        if self.env_api_key.as_deref() == Some(on_disk.api_key.as_str()) {
            on_disk.api_key = self.file_api_key.clone();
        }

        let content = serde_json::to_string_pretty(&on_disk).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display(
        "refusing to overwrite settings file at {path:?} that failed to parse on `{stage}`"
    ))]
    UnreadableFile { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn defaults_figment() -> Figment {
    Figment::from(Serialized::defaults(AppSettings::default()))
}

fn file_figment(path: &Path) -> Figment {
    let figment = defaults_figment();
    if path.exists() {
        figment.merge(Json::file(path))
    } else {
        tracing::info!(path = %path.display(), "settings file not found; using defaults");
        figment
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_welcome_message() -> Option<String> {
    Some(DEFAULT_WELCOME_MESSAGE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_overrides() -> Serialized<serde_json::Map<String, serde_json::Value>> {
        Serialized::defaults(serde_json::Map::new())
    }

    fn write_settings(dir: &Path, json: &str) -> PathBuf {
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(&path, json).expect("write settings");
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            SettingsStore::with_overrides(dir.path().join("absent.json"), no_overrides(), None);

        let settings = store.settings();
        assert_eq!(*settings, AppSettings::default());
        assert!(!settings.has_credential());
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_settings(
            dir.path(),
            r#"{"provider_id": "  openrouter ", "api_key": " sk-file ", "model": "", "storage": "sqlite", "welcome_message": "   "}"#,
        );

        let settings = SettingsStore::with_overrides(path, no_overrides(), None).settings();

        assert_eq!(settings.provider_id, "openrouter");
        assert_eq!(settings.api_key, "sk-file");
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.storage, StorageBackend::Sqlite);
        assert_eq!(settings.welcome_message, None);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_settings(dir.path(), r#"{"model": "from-file"}"#);

        let settings =
            SettingsStore::with_overrides(path, Serialized::default("model", "from-env"), None)
                .settings();

        assert_eq!(settings.model, "from-env");
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_settings(dir.path(), r#"{"storage": "floppy"}"#);

        let settings = SettingsStore::with_overrides(path, no_overrides(), None).settings();
        assert_eq!(settings.storage, StorageBackend::File);
    }

    #[test]
    fn malformed_file_keeps_environment_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_settings(dir.path(), r#"{"storage": "floppy", "model": "from-file"}"#);

        let settings =
            SettingsStore::with_overrides(path, Serialized::default("model", "from-env"), None)
                .settings();
        assert_eq!(settings.model, "from-env");
        assert_eq!(settings.storage, StorageBackend::File);
    }

    #[test]
    fn update_leaves_a_malformed_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let contents = r#"{"storage": "floppy"}"#;
        let path = write_settings(dir.path(), contents);
        let store = SettingsStore::with_overrides(path.clone(), no_overrides(), None);

        let mut settings = (*store.settings()).clone();
        settings.model = "gpt-4.1-mini".to_string();
        let error = store.update(settings).expect_err("update should refuse");
        assert!(matches!(error, SettingsError::UnreadableFile { .. }));
        assert_eq!(std::fs::read_to_string(&path).expect("read"), contents);
    }

    #[test]
    fn credential_fallback_only_fills_an_empty_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let empty = SettingsStore::with_overrides(
            dir.path().join("absent.json"),
            no_overrides(),
            Some("sk-fallback"),
        );
        assert_eq!(empty.settings().api_key, "sk-fallback");

        let path = write_settings(dir.path(), r#"{"api_key": "sk-file"}"#);
        let configured = SettingsStore::with_overrides(path, no_overrides(), Some("sk-fallback"));
        assert_eq!(configured.settings().api_key, "sk-file");
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::with_overrides(path.clone(), no_overrides(), None);

        let mut settings = (*store.settings()).clone();
        settings.model = " gpt-4.1-mini ".to_string();
        store.update(settings).expect("update");

        assert_eq!(store.settings().model, "gpt-4.1-mini");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::with_overrides(path, no_overrides(), None);
        assert_eq!(reloaded.settings().model, "gpt-4.1-mini");
    }

    #[test]
    fn environment_credentials_are_not_written_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        let store = SettingsStore::with_overrides(
            path.clone(),
            Serialized::default("api_key", "sk-env"),
            None,
        );
        assert_eq!(store.settings().api_key, "sk-env");

        let mut settings = (*store.settings()).clone();
        settings.model = "gpt-4.1".to_string();
        store.update(settings).expect("update");

        let written = std::fs::read_to_string(&path).expect("read");
        assert!(!written.contains("sk-env"));
        assert_eq!(store.settings().api_key, "sk-env");
    }

    #[test]
    fn provider_config_carries_settings() {
        let settings = AppSettings {
            api_key: "sk-test".to_string(),
            ..AppSettings::default()
        };
        let config = settings.to_provider_config();

        assert_eq!(config.provider_id, DEFAULT_PROVIDER_ID);
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.model, DEFAULT_MODEL);
    }
}
