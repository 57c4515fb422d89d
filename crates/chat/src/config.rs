//! File-based application configuration, merged over built-in defaults.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use banter_llm::DEFAULT_GEMINI_MODEL;

pub const CONFIG_DIRECTORY_NAME: &str = "banter";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "chat.db";

/// Settings-write debounce window in milliseconds. A coalescing knob, not
/// a correctness knob.
pub const DEFAULT_SETTINGS_DEBOUNCE_MS: u64 = 400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_settings_debounce_ms")]
    pub settings_debounce_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            model_id: default_model_id(),
            settings_debounce_ms: default_settings_debounce_ms(),
        }
    }
}

impl AppConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{CONFIG_DIRECTORY_NAME}")))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        let figment =
            Figment::from(Serialized::defaults(Self::default())).merge(Json::file(path));

        match figment.extract::<Self>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse config from {:?}: {}. using defaults",
                    path,
                    error
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_config_path())
    }

    /// Writes through a temp file and rename so a crash mid-write never
    /// leaves a truncated config behind.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(self).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: path.to_path_buf(),
        })?;

        tracing::info!("saved config to {:?}", path);
        Ok(())
    }

    fn normalized(mut self) -> Self {
        self.model_id = self.model_id.trim().to_string();
        if self.model_id.is_empty() {
            self.model_id = default_model_id();
        }
        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(CONFIG_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| {
            PathBuf::from(format!(".{CONFIG_DIRECTORY_NAME}")).join(DATABASE_FILE_NAME)
        })
}

fn default_model_id() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_settings_debounce_ms() -> u64 {
    DEFAULT_SETTINGS_DEBOUNCE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_the_gemini_model() {
        let config = AppConfig::default();
        assert_eq!(config.model_id, DEFAULT_GEMINI_MODEL);
        assert_eq!(config.settings_debounce_ms, DEFAULT_SETTINGS_DEBOUNCE_MS);
        assert!(config.database_path.ends_with(DATABASE_FILE_NAME));
    }

    #[test]
    fn normalization_repairs_a_blank_model_id() {
        let config = AppConfig {
            model_id: "   ".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.normalized().model_id, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/banter/config.json"));
        assert_eq!(config, AppConfig::default());
    }
}
