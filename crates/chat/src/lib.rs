pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod presets;
pub mod settings;
pub mod stream;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;

use banter_llm::GeminiFactory;
use banter_storage::SqliteLog;

pub use config::{AppConfig, ConfigError};
pub use conversation::{ConversationView, PendingToken, ViewEntry};
pub use engine::{
    ChatEngine, EngineOptions, HISTORY_CLEARED_NOTICE, Identity, MISSING_CREDENTIAL_NOTICE,
    SendOutcome,
};
pub use error::{EngineError, EngineResult};
pub use presets::{
    ASSISTANT_DISPLAY_NAME, DEFAULT_GREETING, DEFAULT_SYSTEM_INSTRUCTION, Personality,
    SYSTEM_DISPLAY_NAME, personalities,
};
pub use settings::{DEFAULT_THEME, ThemeSpec, default_settings, resolve_theme, theme_exists, themes};
pub use stream::{StreamPhase, StreamRejection, StreamTransition};
pub use trigger::{TRIGGER_TOKEN, TriggerOutcome};

/// Opens the whole stack described by a config file: sqlite-backed durable
/// log and settings store, the Gemini provider, and an engine wired to
/// them.
pub async fn open_from_config(config: AppConfig) -> EngineResult<ChatEngine> {
    let location = config.database_path.display().to_string();
    let log = Arc::new(SqliteLog::open(&location).await.context(
        crate::error::StorageSnafu {
            stage: "open-sqlite-log",
        },
    )?);

    Ok(ChatEngine::new(
        log.clone(),
        log,
        Arc::new(GeminiFactory),
        EngineOptions {
            model_id: config.model_id,
            settings_debounce: Duration::from_millis(config.settings_debounce_ms),
        },
    ))
}
