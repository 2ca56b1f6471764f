use std::fmt;

use parley_storage::{KeyValueStore, StorageResult, THEME_KEY};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThemeMode {
    #[default]
    Light,
    Dark,
}

impl ThemeMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::Light => Self::Dark,
            Self::Dark => Self::Light,
        }
    }
}

impl fmt::Display for ThemeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn parse_theme_mode(value: &str) -> ThemeMode {
    if value.trim().eq_ignore_ascii_case("dark") {
        ThemeMode::Dark
    } else {
        ThemeMode::Light
    }
}

/// Reads the stored preference; anything unreadable means light.
pub fn load_theme(store: &dyn KeyValueStore) -> ThemeMode {
    match store.get(THEME_KEY) {
        Ok(value) => value.as_deref().map_or(ThemeMode::Light, parse_theme_mode),
        Err(error) => {
            tracing::warn!(error = %error, "failed to read theme preference");
            ThemeMode::Light
        }
    }
}

pub fn toggle_theme(store: &dyn KeyValueStore, current: ThemeMode) -> StorageResult<ThemeMode> {
    let next = current.toggled();
    store.set(THEME_KEY, next.name())?;
    tracing::debug!(theme = %next, "theme toggled");
    Ok(next)
}
