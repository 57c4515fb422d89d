//! The reconciliation engine: merges local intents, remote change
//! notifications, and streamed assistant output into one ordered
//! conversation, and drives the assistant attempt lifecycle.

use std::sync::Arc;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use snafu::{ResultExt, ensure};

use banter_llm::{
    DEFAULT_GEMINI_MODEL, ProviderFactory, ProviderResult, ProviderSession, SessionConfig,
    StreamEvent,
};
use banter_storage::{
    EntryLog, EntryPatch, EntryRecord, LogEvent, LogEvents, NewEntry, Sender, SettingsRecord,
    SettingsStore, StorageResult,
};

use crate::conversation::{ConversationView, ViewEntry};
use crate::error::{
    AlreadyJoinedSnafu, EmptyUsernameSnafu, EngineResult, NotJoinedSnafu, StorageSnafu,
    UnknownThemeSnafu,
};
use crate::presets::{ASSISTANT_DISPLAY_NAME, DEFAULT_GREETING, SYSTEM_DISPLAY_NAME};
use crate::settings::{SettingsState, theme_exists};
use crate::stream::{StreamPhase, StreamTransition};
use crate::trigger::{self, TriggerOutcome};

/// Posted when a trigger arrives while no credential is configured.
pub const MISSING_CREDENTIAL_NOTICE: &str =
    "Error: Gemini API Key is missing. Please set it via the Key icon in the header.";

/// Posted after the user-facing history wipe.
pub const HISTORY_CLEARED_NOTICE: &str = "History cleared.";

/// What one send intent amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Whitespace-only input; nothing was sent.
    Ignored,
    /// An assistant attempt is in flight; the send was rejected.
    Busy,
    /// Ordinary message delivered to the room.
    Delivered,
    /// Trigger token with nothing after it; no assistant attempt was made.
    PromptMissing,
    /// No credential configured; a system notice was posted instead.
    CredentialMissing,
    /// The assistant streamed its reply to completion.
    AssistantReplied,
    /// The attempt ended on the hard-fault path.
    AssistantFailed,
}

/// The joined user of this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
}

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub model_id: String,
    pub settings_debounce: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_GEMINI_MODEL.to_string(),
            settings_debounce: Duration::from_millis(crate::config::DEFAULT_SETTINGS_DEBOUNCE_MS),
        }
    }
}

/// Provider session cache, compared by value against the pair it was built
/// from. Checked lazily at the start of each attempt, so several setting
/// edits between sends cost one rebuild at the next use.
struct CachedSession {
    api_credential: String,
    behavior_instruction: String,
    session: Arc<dyn ProviderSession>,
}

/// Per-session coordinator between the durable log, the provider, and the
/// conversation projection.
///
/// All engine logic runs on one task; the only suspension points are log
/// calls, stream fragments, and the settings debounce. Remote change
/// notifications are drained at the start of every intent and, while a
/// stream is live, inside the same select loop as the fragments.
pub struct ChatEngine {
    log: Arc<dyn EntryLog>,
    settings: SettingsState,
    providers: Arc<dyn ProviderFactory>,
    events: LogEvents,
    view: ConversationView,
    identity: Option<Identity>,
    phase: StreamPhase,
    cached_session: Option<CachedSession>,
    model_id: String,
}

impl ChatEngine {
    /// Wires an engine to its collaborators. Must run inside a tokio
    /// runtime: the debounced settings writer is spawned here.
    pub fn new(
        log: Arc<dyn EntryLog>,
        settings_store: Arc<dyn SettingsStore>,
        providers: Arc<dyn ProviderFactory>,
        options: EngineOptions,
    ) -> Self {
        let events = log.subscribe();
        let settings = SettingsState::new(settings_store, options.settings_debounce);

        Self {
            log,
            settings,
            providers,
            events,
            view: ConversationView::new(),
            identity: None,
            phase: StreamPhase::default(),
            cached_session: None,
            model_id: options.model_id,
        }
    }

    pub fn entries(&self) -> &[ViewEntry] {
        self.view.entries()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// True for the whole credential-check → terminal span of an attempt;
    /// the send control stays disabled while this holds.
    pub fn is_typing(&self) -> bool {
        self.phase.is_busy()
    }

    pub fn settings_snapshot(&self) -> Arc<SettingsRecord> {
        self.settings.snapshot()
    }

    /// Lock-free settings handle for observers outside the engine task.
    pub fn shared_settings(&self) -> Arc<ArcSwap<SettingsRecord>> {
        self.settings.shared()
    }

    /// Adopts an identity: loads (or creates) its settings, hydrates the
    /// conversation from the log, seeds the greeting into an empty room,
    /// and announces the arrival. Failures here are blocking.
    pub async fn join(&mut self, username: &str) -> EngineResult<()> {
        let username = username.trim();
        ensure!(
            !username.is_empty(),
            EmptyUsernameSnafu {
                stage: "join-validate-username",
            }
        );
        if let Some(identity) = &self.identity {
            return AlreadyJoinedSnafu {
                stage: "join-single-identity",
                username: identity.username.clone(),
            }
            .fail();
        }

        self.drain_notifications();

        self.settings.adopt(username).await.context(StorageSnafu {
            stage: "join-load-settings",
        })?;

        let records = self.log.list().await.context(StorageSnafu {
            stage: "join-load-history",
        })?;
        let seed_greeting = records.is_empty();
        self.view.replace(records);
        self.identity = Some(Identity {
            username: username.to_string(),
        });

        if seed_greeting {
            let greeting = NewEntry::new(
                Sender::Ai,
                ASSISTANT_DISPLAY_NAME,
                DEFAULT_GREETING,
                now_ms(),
            );
            self.append_durable(greeting).await.context(StorageSnafu {
                stage: "join-seed-greeting",
            })?;
        }

        let notice = NewEntry::new(
            Sender::System,
            SYSTEM_DISPLAY_NAME,
            format!("{username} joined the chat"),
            now_ms(),
        );
        self.append_durable(notice).await.context(StorageSnafu {
            stage: "join-announce",
        })?;

        Ok(())
    }

    /// Announces the departure and clears the identity. The settings row
    /// stays in the store for the next time this username joins.
    pub async fn leave(&mut self) -> EngineResult<()> {
        let Some(identity) = self.identity.take() else {
            return NotJoinedSnafu {
                stage: "leave-require-identity",
            }
            .fail();
        };

        self.drain_notifications();

        let notice = NewEntry::new(
            Sender::System,
            SYSTEM_DISPLAY_NAME,
            format!("{} left the chat", identity.username),
            now_ms(),
        );
        self.append_best_effort(notice).await;
        self.settings.reset();
        Ok(())
    }

    /// Sends one message into the room and, when the trigger token leads
    /// it, runs an assistant attempt for the remainder.
    pub async fn send_message(&mut self, input: &str) -> EngineResult<SendOutcome> {
        self.drain_notifications();

        let Some(identity) = &self.identity else {
            return NotJoinedSnafu {
                stage: "send-require-identity",
            }
            .fail();
        };
        let username = identity.username.clone();

        let text = input.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        if self.phase.is_busy() {
            return Ok(SendOutcome::Busy);
        }

        let draft = NewEntry::new(Sender::User, username, text, now_ms());
        self.append_best_effort(draft).await;

        match trigger::detect(text) {
            TriggerOutcome::NotAddressed => Ok(SendOutcome::Delivered),
            TriggerOutcome::EmptyPrompt => Ok(SendOutcome::PromptMissing),
            TriggerOutcome::Prompt(prompt) => Ok(self.run_assistant_attempt(prompt).await),
        }
    }

    /// Validates and applies a theme choice. Display-only: persisted right
    /// away, never announced.
    pub async fn set_theme(&mut self, theme_key: &str) -> EngineResult<()> {
        self.drain_notifications();
        ensure!(
            self.identity.is_some(),
            NotJoinedSnafu {
                stage: "set-theme-require-identity",
            }
        );

        let key = theme_key.trim();
        ensure!(
            theme_exists(key),
            UnknownThemeSnafu {
                stage: "set-theme-validate",
                key: key.to_string(),
            }
        );

        let mut record = (*self.settings.snapshot()).clone();
        if record.theme == key {
            return Ok(());
        }
        record.theme = key.to_string();
        self.settings.update_now(record).await;
        Ok(())
    }

    /// Applies a credential change optimistically, queues the debounced
    /// write, and announces that a change happened, never the value.
    pub async fn set_credential(&mut self, credential: &str) -> EngineResult<()> {
        self.drain_notifications();
        let username = self.require_identity("set-credential-require-identity")?;

        let credential = credential.trim();
        let mut record = (*self.settings.snapshot()).clone();
        if record.api_credential == credential {
            return Ok(());
        }
        record.api_credential = credential.to_string();
        self.settings.update_debounced(record);

        self.post_system_notice(&format!("{username} updated the API key."))
            .await;
        Ok(())
    }

    /// Applies a behavior-instruction change the same way as a credential
    /// change; the cached provider session is rebuilt lazily at next use.
    pub async fn set_instruction(&mut self, instruction: &str) -> EngineResult<()> {
        self.drain_notifications();
        let username = self.require_identity("set-instruction-require-identity")?;

        let instruction = instruction.trim();
        let mut record = (*self.settings.snapshot()).clone();
        if record.behavior_instruction == instruction {
            return Ok(());
        }
        record.behavior_instruction = instruction.to_string();
        self.settings.update_debounced(record);

        self.post_system_notice(&format!("{username} changed the AI personality."))
            .await;
        Ok(())
    }

    /// The user-facing wipe: clears the log for everyone, then posts the
    /// reset notice.
    pub async fn clear_history(&mut self) -> EngineResult<()> {
        self.drain_notifications();
        ensure!(
            self.identity.is_some(),
            NotJoinedSnafu {
                stage: "clear-require-identity",
            }
        );

        self.log.clear().await.context(StorageSnafu {
            stage: "clear-history",
        })?;
        self.view.clear();
        self.post_system_notice(HISTORY_CLEARED_NOTICE).await;
        Ok(())
    }

    /// Administrative wipe behind the reserved navigation path: clears the
    /// log and nothing else: no confirmation, no notice. A privileged
    /// shortcut, not a user-facing button.
    pub async fn purge_history(&mut self) -> EngineResult<()> {
        self.log.clear().await.context(StorageSnafu {
            stage: "purge-history",
        })?;
        self.view.clear();
        Ok(())
    }

    /// Merges one change notification into the projection. Inserting an id
    /// twice is a no-op the second time; updates replace in place.
    pub fn apply_remote_notification(&mut self, entry: EntryRecord) {
        self.view.upsert_remote(entry);
    }

    /// Drains queued notifications without blocking. Called at the start
    /// of every intent; hosts may also call it on their own cadence.
    pub fn drain_notifications(&mut self) {
        while let Some(event) = self.events.try_recv() {
            self.apply_log_event(event);
        }
    }

    fn apply_log_event(&mut self, event: LogEvent) {
        match event {
            LogEvent::Upserted(record) => self.view.upsert_remote(record),
            LogEvent::Cleared => self.view.clear(),
        }
    }

    async fn run_assistant_attempt(&mut self, prompt: String) -> SendOutcome {
        if let Err(rejection) = self.apply_phase(StreamTransition::Begin) {
            tracing::warn!(?rejection, "assistant attempt rejected");
            return SendOutcome::Busy;
        }

        let settings = self.settings.snapshot();
        if settings.api_credential.trim().is_empty() {
            self.post_system_notice(MISSING_CREDENTIAL_NOTICE).await;
            let _ = self.apply_phase(StreamTransition::Decline);
            return SendOutcome::CredentialMissing;
        }

        let session = match self.ensure_provider_session(&settings) {
            Ok(session) => session,
            Err(error) => {
                tracing::error!(error = %error, "failed to open provider session");
                self.post_system_notice(&format!("Error: {error}")).await;
                let _ = self.apply_phase(StreamTransition::Decline);
                return SendOutcome::AssistantFailed;
            }
        };

        let placeholder_draft =
            NewEntry::new(Sender::Ai, ASSISTANT_DISPLAY_NAME, "", now_ms()).streaming();
        let Some(placeholder) = self
            .append_best_effort(placeholder_draft)
            .await
            .map(|record| record.id)
        else {
            // Without a durable id there is nothing to stream into.
            let _ = self.apply_phase(StreamTransition::Decline);
            return SendOutcome::AssistantFailed;
        };

        if self
            .apply_phase(StreamTransition::Open { placeholder })
            .is_err()
        {
            return SendOutcome::AssistantFailed;
        }

        let handle = session.stream_prompt(prompt);
        let _worker = tokio::spawn(handle.worker);
        let mut stream = handle.stream;
        let mut accumulator = String::new();

        let outcome = loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(StreamEvent::Fragment(chunk)) => {
                        accumulator.push_str(&chunk);
                        self.view
                            .patch(placeholder, Some(accumulator.clone()), None);
                        if let Err(error) = self
                            .log
                            .update(placeholder, EntryPatch::text(accumulator.clone()))
                            .await
                        {
                            tracing::error!(error = %error, "failed to persist streamed text");
                        }
                    }
                    Some(StreamEvent::Done) => break SendOutcome::AssistantReplied,
                    None => {
                        tracing::error!("assistant stream ended before a terminal event");
                        break SendOutcome::AssistantFailed;
                    }
                },
                notification = self.events.recv() => {
                    if let Some(event) = notification {
                        self.apply_log_event(event);
                    }
                }
            }
        };

        // Exactly one terminal flip, on success and failure alike, so no
        // streaming-marked entry outlives its attempt.
        self.view.patch(placeholder, None, Some(false));
        if let Err(error) = self.log.update(placeholder, EntryPatch::stream_closed()).await {
            tracing::error!(error = %error, "failed to close the streamed entry");
        }

        let terminal = if outcome == SendOutcome::AssistantReplied {
            StreamTransition::Complete
        } else {
            StreamTransition::Fail
        };
        let _ = self.apply_phase(terminal);
        outcome
    }

    fn ensure_provider_session(
        &mut self,
        settings: &SettingsRecord,
    ) -> ProviderResult<Arc<dyn ProviderSession>> {
        if let Some(cached) = &self.cached_session
            && cached.api_credential == settings.api_credential
            && cached.behavior_instruction == settings.behavior_instruction
        {
            return Ok(cached.session.clone());
        }

        let config = SessionConfig::new(
            settings.api_credential.clone(),
            settings.behavior_instruction.clone(),
            self.model_id.clone(),
        );
        let session = self.providers.open_session(config)?;
        self.cached_session = Some(CachedSession {
            api_credential: settings.api_credential.clone(),
            behavior_instruction: settings.behavior_instruction.clone(),
            session: session.clone(),
        });
        Ok(session)
    }

    /// Optimistic insert reconciled with the log acknowledgment; the error
    /// is the caller's to interpret.
    async fn append_durable(&mut self, draft: NewEntry) -> StorageResult<EntryRecord> {
        let token = self.view.stage_local(draft.clone());
        let record = self.log.append(draft).await?;
        self.view.confirm_local(token, record.clone());
        Ok(record)
    }

    /// In-conversation write policy: on failure, log it and leave the
    /// optimistic entry in place. No rollback, no retry.
    async fn append_best_effort(&mut self, draft: NewEntry) -> Option<EntryRecord> {
        match self.append_durable(draft).await {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::error!(error = %error, "failed to persist entry; keeping the optimistic copy");
                None
            }
        }
    }

    async fn post_system_notice(&mut self, text: &str) -> Option<EntryRecord> {
        let draft = NewEntry::new(Sender::System, SYSTEM_DISPLAY_NAME, text, now_ms());
        self.append_best_effort(draft).await
    }

    fn apply_phase(
        &mut self,
        transition: StreamTransition,
    ) -> Result<(), crate::stream::StreamRejection> {
        let next = self.phase.apply(transition)?;
        self.phase = next;
        Ok(())
    }

    fn require_identity(&self, stage: &'static str) -> EngineResult<String> {
        match &self.identity {
            Some(identity) => Ok(identity.username.clone()),
            None => NotJoinedSnafu { stage }.fail(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use banter_llm::{FragmentStream, ProviderWorker, StreamHandle, fragment_channel};
    use banter_storage::{BoxFuture, EntryId, MemoryLog};

    use crate::presets::DEFAULT_SYSTEM_INSTRUCTION;

    struct ScriptedFactory {
        scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
        opened: AtomicUsize,
        last_config: Mutex<Option<SessionConfig>>,
    }

    impl ScriptedFactory {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opened: AtomicUsize::new(0),
                last_config: Mutex::new(None),
            })
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn last_config(&self) -> Option<SessionConfig> {
            self.last_config.lock().expect("config poisoned").clone()
        }
    }

    impl ProviderFactory for ScriptedFactory {
        fn open_session(
            &self,
            config: SessionConfig,
        ) -> ProviderResult<Arc<dyn ProviderSession>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            *self.last_config.lock().expect("config poisoned") = Some(config);
            let script = self
                .scripts
                .lock()
                .expect("scripts poisoned")
                .pop_front()
                .unwrap_or_default();
            Ok(Arc::new(ScriptedSession { script }))
        }
    }

    struct ScriptedSession {
        script: Vec<StreamEvent>,
    }

    impl ProviderSession for ScriptedSession {
        fn stream_prompt(&self, _prompt: String) -> StreamHandle {
            let (event_tx, stream): (_, FragmentStream) = fragment_channel();
            let script = self.script.clone();
            let worker: ProviderWorker = Box::pin(async move {
                for event in script {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            });
            StreamHandle { stream, worker }
        }
    }

    fn fragment(text: &str) -> StreamEvent {
        StreamEvent::Fragment(text.to_string())
    }

    fn test_options() -> EngineOptions {
        EngineOptions {
            model_id: "scripted-model".to_string(),
            settings_debounce: Duration::from_millis(100),
        }
    }

    fn engine_on(log: Arc<MemoryLog>, factory: Arc<ScriptedFactory>) -> ChatEngine {
        ChatEngine::new(log.clone(), log, factory, test_options())
    }

    async fn listed(log: &MemoryLog) -> Vec<EntryRecord> {
        log.list().await.expect("list")
    }

    #[derive(Default)]
    struct RecordingSettingsStore {
        saves: Mutex<Vec<SettingsRecord>>,
    }

    impl SettingsStore for RecordingSettingsStore {
        fn load(&self, _username: &str) -> BoxFuture<'_, StorageResult<Option<SettingsRecord>>> {
            Box::pin(async move { Ok(None) })
        }

        fn save(&self, record: SettingsRecord) -> BoxFuture<'_, StorageResult<()>> {
            Box::pin(async move {
                self.saves.lock().expect("saves poisoned").push(record);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn join_seeds_greeting_once_and_announces() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");

        let entries = listed(&log).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sender, Sender::Ai);
        assert_eq!(entries[0].text, DEFAULT_GREETING);
        assert_eq!(entries[1].sender, Sender::System);
        assert_eq!(entries[1].text, "ada joined the chat");
        assert_eq!(engine.entries().len(), 2);

        // A second session over the same history must not re-seed.
        let mut second = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        second.join("grace").await.expect("join");
        let greetings = listed(&log)
            .await
            .iter()
            .filter(|entry| entry.text == DEFAULT_GREETING)
            .count();
        assert_eq!(greetings, 1);
    }

    #[tokio::test]
    async fn join_rejects_blank_and_double_identities() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log, ScriptedFactory::new(vec![]));

        assert!(matches!(
            engine.join("   ").await,
            Err(crate::EngineError::EmptyUsername { .. })
        ));

        engine.join("ada").await.expect("join");
        assert!(matches!(
            engine.join("grace").await,
            Err(crate::EngineError::AlreadyJoined { .. })
        ));
    }

    #[tokio::test]
    async fn plain_messages_are_delivered_and_persisted() {
        let log = Arc::new(MemoryLog::new());
        let factory = ScriptedFactory::new(vec![]);
        let mut engine = engine_on(log.clone(), factory.clone());
        engine.join("ada").await.expect("join");

        let outcome = engine.send_message("hello everyone").await.expect("send");
        assert_eq!(outcome, SendOutcome::Delivered);
        assert_eq!(factory.opened(), 0);

        let entries = listed(&log).await;
        let last = entries.last().expect("entries");
        assert_eq!(last.sender, Sender::User);
        assert_eq!(last.username, "ada");
        assert_eq!(last.text, "hello everyone");
    }

    #[tokio::test]
    async fn missing_credential_posts_one_notice_and_skips_the_provider() {
        let log = Arc::new(MemoryLog::new());
        let factory = ScriptedFactory::new(vec![]);
        let mut engine = engine_on(log.clone(), factory.clone());
        engine.join("ada").await.expect("join");
        let before = listed(&log).await.len();

        let outcome = engine.send_message("!gemini hello").await.expect("send");
        assert_eq!(outcome, SendOutcome::CredentialMissing);
        assert_eq!(factory.opened(), 0);
        assert!(!engine.is_typing());

        let entries = listed(&log).await;
        // The user message plus exactly one system notice.
        assert_eq!(entries.len(), before + 2);
        let notice = entries.last().expect("entries");
        assert_eq!(notice.sender, Sender::System);
        assert_eq!(notice.text, MISSING_CREDENTIAL_NOTICE);
    }

    #[tokio::test]
    async fn bare_trigger_makes_no_assistant_attempt() {
        let log = Arc::new(MemoryLog::new());
        let factory = ScriptedFactory::new(vec![]);
        let mut engine = engine_on(log.clone(), factory.clone());
        engine.join("ada").await.expect("join");
        let before = listed(&log).await.len();

        let outcome = engine.send_message("!gemini").await.expect("send");
        assert_eq!(outcome, SendOutcome::PromptMissing);
        assert_eq!(factory.opened(), 0);
        assert!(!engine.is_typing());

        // Only the user's own message was appended.
        let entries = listed(&log).await;
        assert_eq!(entries.len(), before + 1);
        assert_eq!(entries.last().expect("entries").sender, Sender::User);
    }

    #[tokio::test]
    async fn fragments_accumulate_into_one_placeholder() {
        let log = Arc::new(MemoryLog::new());
        let factory = ScriptedFactory::new(vec![vec![
            fragment("Hel"),
            fragment("lo"),
            fragment("!"),
            StreamEvent::Done,
        ]]);
        let mut engine = engine_on(log.clone(), factory.clone());
        engine.join("ada").await.expect("join");
        engine.set_credential("test-key").await.expect("credential");

        let mut observer = log.subscribe();
        let outcome = engine.send_message("!gemini greet").await.expect("send");
        assert_eq!(outcome, SendOutcome::AssistantReplied);
        assert!(!engine.is_typing());

        let entries = listed(&log).await;
        let reply = entries.last().expect("entries");
        assert_eq!(reply.sender, Sender::Ai);
        assert_eq!(reply.username, ASSISTANT_DISPLAY_NAME);
        assert_eq!(reply.text, "Hello!");
        assert!(!reply.is_streaming);

        // Exactly one assistant entry per attempt (plus the seeded greeting).
        let ai_entries = entries
            .iter()
            .filter(|entry| entry.sender == Sender::Ai)
            .count();
        assert_eq!(ai_entries, 2);

        // Every intermediate accumulation was observable, in arrival order.
        let mut placeholder_texts = Vec::new();
        while let Some(event) = observer.try_recv() {
            if let LogEvent::Upserted(record) = event
                && record.id == reply.id
            {
                placeholder_texts.push((record.text.clone(), record.is_streaming));
            }
        }
        assert_eq!(
            placeholder_texts,
            vec![
                ("".to_string(), true),
                ("Hel".to_string(), true),
                ("Hello".to_string(), true),
                ("Hello!".to_string(), true),
                ("Hello!".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn a_dead_worker_still_reaches_a_terminal_state() {
        let log = Arc::new(MemoryLog::new());
        // Script without a terminal Done: the channel just closes.
        let factory = ScriptedFactory::new(vec![vec![fragment("par")]]);
        let mut engine = engine_on(log.clone(), factory);
        engine.join("ada").await.expect("join");
        engine.set_credential("test-key").await.expect("credential");

        let outcome = engine.send_message("!gemini go").await.expect("send");
        assert_eq!(outcome, SendOutcome::AssistantFailed);
        assert!(!engine.is_typing());

        let entries = listed(&log).await;
        let reply = entries.last().expect("entries");
        assert_eq!(reply.text, "par");
        assert!(!reply.is_streaming, "no orphaned streaming entry survives");
    }

    #[tokio::test]
    async fn sends_are_rejected_while_an_attempt_is_active() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");
        let before = listed(&log).await.len();

        engine.phase = StreamPhase::Streaming {
            placeholder: EntryId::new_v7(),
        };
        let outcome = engine.send_message("!gemini again").await.expect("send");
        assert_eq!(outcome, SendOutcome::Busy);
        assert_eq!(listed(&log).await.len(), before, "busy sends append nothing");
        engine.phase = StreamPhase::Idle;
    }

    #[tokio::test]
    async fn provider_session_is_rebuilt_lazily_on_setting_changes() {
        let log = Arc::new(MemoryLog::new());
        let factory = ScriptedFactory::new(vec![
            vec![StreamEvent::Done],
            vec![StreamEvent::Done],
        ]);
        let mut engine = engine_on(log, factory.clone());
        engine.join("ada").await.expect("join");
        engine.set_credential("key-1").await.expect("credential");

        engine.send_message("!gemini one").await.expect("send");
        assert_eq!(factory.opened(), 1);
        let config = factory.last_config().expect("config");
        assert_eq!(config.api_key, "key-1");
        assert_eq!(config.instruction, DEFAULT_SYSTEM_INSTRUCTION);
        assert_eq!(config.model_id, "scripted-model");

        // Several edits between sends cost one rebuild at the next use.
        engine.set_instruction("be a pirate").await.expect("instruction");
        engine.set_instruction("be a lighthouse").await.expect("instruction");
        assert_eq!(factory.opened(), 1);

        engine.send_message("!gemini two").await.expect("send");
        assert_eq!(factory.opened(), 2);

        // Unchanged settings reuse the cached session.
        engine.send_message("!gemini three").await.expect("send");
        assert_eq!(factory.opened(), 2);
    }

    #[tokio::test]
    async fn credential_changes_are_announced_and_debounced() {
        let log = Arc::new(MemoryLog::new());
        let store = Arc::new(RecordingSettingsStore::default());
        let mut engine = ChatEngine::new(
            log.clone(),
            store.clone(),
            ScriptedFactory::new(vec![]),
            test_options(),
        );
        engine.join("ada").await.expect("join");
        let baseline_saves = store.saves.lock().expect("saves").len();

        engine.set_credential("a").await.expect("set");
        engine.set_credential("ab").await.expect("set");
        engine.set_credential("abc").await.expect("set");
        assert_eq!(engine.settings_snapshot().api_credential, "abc");

        tokio::time::sleep(Duration::from_millis(500)).await;
        let saves = store.saves.lock().expect("saves");
        assert_eq!(saves.len(), baseline_saves + 1);
        assert_eq!(saves.last().expect("saves").api_credential, "abc");
        drop(saves);

        let announcements = listed(&log)
            .await
            .iter()
            .filter(|entry| entry.text == "ada updated the API key.")
            .count();
        assert_eq!(announcements, 3);
    }

    #[tokio::test]
    async fn theme_changes_validate_and_stay_silent() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");
        let before = listed(&log).await.len();

        engine.set_theme("slate").await.expect("theme");
        assert_eq!(engine.settings_snapshot().theme, "slate");
        assert_eq!(listed(&log).await.len(), before, "themes are not announced");

        assert!(matches!(
            engine.set_theme("sepia").await,
            Err(crate::EngineError::UnknownTheme { .. })
        ));
    }

    #[tokio::test]
    async fn clear_history_wipes_and_posts_the_reset_notice() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");
        engine.send_message("doomed message").await.expect("send");

        engine.clear_history().await.expect("clear");

        let entries = listed(&log).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sender, Sender::System);
        assert_eq!(entries[0].text, HISTORY_CLEARED_NOTICE);

        engine.drain_notifications();
        assert_eq!(engine.entries().len(), 1);
    }

    #[tokio::test]
    async fn purge_history_wipes_without_a_notice() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");

        engine.purge_history().await.expect("purge");
        assert!(listed(&log).await.is_empty());
        assert!(engine.entries().is_empty());
    }

    #[tokio::test]
    async fn remote_writes_from_another_session_merge_at_the_tail() {
        let log = Arc::new(MemoryLog::new());
        let mut ada = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        ada.join("ada").await.expect("join");
        let mut bob = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        bob.join("bob").await.expect("join");

        bob.send_message("hi from the other tab").await.expect("send");

        ada.drain_notifications();
        let tail = ada.entries().last().expect("entries");
        assert_eq!(tail.username(), "bob");
        assert_eq!(tail.text(), "hi from the other tab");

        // Draining again changes nothing.
        let len = ada.entries().len();
        ada.drain_notifications();
        assert_eq!(ada.entries().len(), len);
    }

    #[tokio::test]
    async fn leave_announces_and_preserves_settings() {
        let log = Arc::new(MemoryLog::new());
        let mut engine = engine_on(log.clone(), ScriptedFactory::new(vec![]));
        engine.join("ada").await.expect("join");
        engine.set_credential("kept-key").await.expect("credential");
        tokio::time::sleep(Duration::from_millis(500)).await;

        engine.leave().await.expect("leave");
        assert!(engine.identity().is_none());

        let entries = listed(&log).await;
        assert_eq!(entries.last().expect("entries").text, "ada left the chat");

        let stored = log.load("ada").await.expect("load").expect("settings row");
        assert_eq!(stored.api_credential, "kept-key");

        assert!(matches!(
            engine.send_message("anyone there?").await,
            Err(crate::EngineError::NotJoined { .. })
        ));
    }
}
