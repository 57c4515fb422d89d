//! Per-identity settings: the theme registry, defaults, and the state
//! holder that keeps an optimistically updated snapshot while persistence
//! catches up in the background.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use banter_storage::{SettingsRecord, SettingsStore, StorageResult};

use crate::presets::DEFAULT_SYSTEM_INSTRUCTION;

pub const DEFAULT_THEME: &str = "emerald";

/// One entry of the fixed theme registry. Visual payloads live with the
/// presentation layer; the engine only validates keys and tracks darkness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub is_dark: bool,
}

pub fn themes() -> &'static [ThemeSpec] {
    &[
        ThemeSpec {
            key: "emerald",
            name: "Emerald",
            is_dark: false,
        },
        ThemeSpec {
            key: "violet",
            name: "Violet",
            is_dark: false,
        },
        ThemeSpec {
            key: "blue",
            name: "Ocean",
            is_dark: false,
        },
        ThemeSpec {
            key: "amber",
            name: "Sunset",
            is_dark: false,
        },
        ThemeSpec {
            key: "rose",
            name: "Rose",
            is_dark: false,
        },
        ThemeSpec {
            key: "slate",
            name: "Midnight",
            is_dark: true,
        },
        ThemeSpec {
            key: "frutiger",
            name: "Frutiger Aero",
            is_dark: false,
        },
        ThemeSpec {
            key: "frutigerDark",
            name: "Dark Aero",
            is_dark: true,
        },
    ]
}

pub fn theme_exists(key: &str) -> bool {
    themes().iter().any(|theme| theme.key == key)
}

/// Resolves a stored key, falling back to the default theme for keys that
/// predate the current registry.
pub fn resolve_theme(key: &str) -> &'static ThemeSpec {
    themes()
        .iter()
        .find(|theme| theme.key == key)
        .or_else(|| themes().iter().find(|theme| theme.key == DEFAULT_THEME))
        .expect("default theme is always registered")
}

pub fn default_settings(username: &str) -> SettingsRecord {
    SettingsRecord {
        username: username.to_string(),
        theme: DEFAULT_THEME.to_string(),
        api_credential: String::new(),
        behavior_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
    }
}

/// Engine-owned settings state.
///
/// Reads go through a lock-free snapshot that observers may share. Writes
/// land on the snapshot immediately; persistence is either immediate
/// (theme) or funneled through the debounced writer task, which coalesces
/// rapid successive edits into one store write.
pub(crate) struct SettingsState {
    store: Arc<dyn SettingsStore>,
    snapshot: Arc<ArcSwap<SettingsRecord>>,
    writer_tx: mpsc::UnboundedSender<SettingsRecord>,
}

impl SettingsState {
    pub(crate) fn new(store: Arc<dyn SettingsStore>, debounce_window: Duration) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_settings_writer(
            store.clone(),
            debounce_window,
            writer_rx,
        ));

        Self {
            store,
            snapshot: Arc::new(ArcSwap::from_pointee(default_settings(""))),
            writer_tx,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<SettingsRecord> {
        self.snapshot.load_full()
    }

    pub(crate) fn shared(&self) -> Arc<ArcSwap<SettingsRecord>> {
        self.snapshot.clone()
    }

    /// Loads the identity's settings, creating the default row on first
    /// join. Failures here are the caller's to surface.
    pub(crate) async fn adopt(&self, username: &str) -> StorageResult<SettingsRecord> {
        let record = match self.store.load(username).await? {
            Some(record) => record,
            None => {
                let record = default_settings(username);
                self.store.save(record.clone()).await?;
                record
            }
        };

        self.snapshot.store(Arc::new(record.clone()));
        Ok(record)
    }

    /// Optimistic update persisted immediately, best-effort.
    pub(crate) async fn update_now(&self, record: SettingsRecord) {
        self.snapshot.store(Arc::new(record.clone()));
        if let Err(error) = self.store.save(record).await {
            tracing::error!(error = %error, "failed to persist settings");
        }
    }

    /// Optimistic update handed to the debounced writer.
    pub(crate) fn update_debounced(&self, record: SettingsRecord) {
        self.snapshot.store(Arc::new(record.clone()));
        if self.writer_tx.send(record).is_err() {
            tracing::error!("settings writer task is gone; change not persisted");
        }
    }

    /// Drops the adopted identity's snapshot; the stored row stays put.
    pub(crate) fn reset(&self) {
        self.snapshot.store(Arc::new(default_settings("")));
    }
}

async fn run_settings_writer(
    store: Arc<dyn SettingsStore>,
    window: Duration,
    mut writer_rx: mpsc::UnboundedReceiver<SettingsRecord>,
) {
    while let Some(mut latest) = writer_rx.recv().await {
        // Latest-wins coalescing: keep absorbing edits until the window
        // passes without a newer one, then write once.
        loop {
            match tokio::time::timeout(window, writer_rx.recv()).await {
                Ok(Some(newer)) => latest = newer,
                Ok(None) => break,
                Err(_elapsed) => break,
            }
        }

        if let Err(error) = store.save(latest).await {
            tracing::error!(error = %error, "failed to persist debounced settings");
        }
    }
}
