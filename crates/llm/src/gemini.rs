use std::sync::Arc;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use rig::streaming::StreamedAssistantContent;
use snafu::ensure;
use tokio::sync::mpsc;

use super::provider::{
    MissingApiKeySnafu, ProviderFactory, ProviderResult, ProviderSession, ProviderWorker,
    SessionConfig, StreamEvent, StreamHandle, fragment_channel,
};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Failure texts delivered as ordinary stream content, so they render as
/// assistant text instead of crashing the conversation.
pub const CLIENT_INIT_FRAGMENT: &str =
    "Error: Gemini API client failed to initialize with the provided key.";
pub const INVALID_KEY_FRAGMENT: &str =
    "\n\n(Error: Invalid API Key. Please check your key in settings.)";
pub const ENTITY_NOT_FOUND_FRAGMENT: &str = "\n\n(Error: Requested entity was not found. This might indicate an issue with the API key or model access.)";
pub const GENERIC_FAILURE_FRAGMENT: &str = "\n\n(I encountered an error processing that request.)";

/// Builds Gemini-backed sessions over rig.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeminiFactory;

impl ProviderFactory for GeminiFactory {
    fn open_session(&self, config: SessionConfig) -> ProviderResult<Arc<dyn ProviderSession>> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-open-session",
                model_id: config.model_id.clone(),
            }
        );

        Ok(Arc::new(GeminiSession { config }))
    }
}

/// One Gemini chat session, pinned to the (credential, instruction) pair it
/// was opened with.
pub struct GeminiSession {
    config: SessionConfig,
}

impl ProviderSession for GeminiSession {
    fn stream_prompt(&self, prompt: String) -> StreamHandle {
        let (event_tx, stream) = fragment_channel();
        let worker: ProviderWorker =
            Box::pin(run_stream_worker(self.config.clone(), prompt, event_tx));
        StreamHandle { stream, worker }
    }
}

async fn run_stream_worker(
    config: SessionConfig,
    prompt: String,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let client = match gemini::Client::builder()
        .api_key(config.api_key.as_str())
        .build()
    {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(error = %error, "failed to build gemini client");
            let _ = event_tx.send(StreamEvent::Fragment(CLIENT_INIT_FRAGMENT.to_string()));
            let _ = event_tx.send(StreamEvent::Done);
            return;
        }
    };

    let model = client.completion_model(config.model_id.clone());
    let mut builder = model.completion_request(RigMessage::user(prompt));
    if !config.instruction.is_empty() {
        builder = builder.preamble(config.instruction.clone());
    }

    let mut stream = match builder.stream().await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(
                model_id = %config.model_id,
                error = %error,
                "failed to open gemini stream"
            );
            let _ = event_tx.send(StreamEvent::Fragment(classify_stream_error(&error)));
            let _ = event_tx.send(StreamEvent::Done);
            return;
        }
    };

    loop {
        match stream.next().await {
            Some(Ok(item)) => {
                if let Some(text) = fragment_text(item)
                    && event_tx.send(StreamEvent::Fragment(text)).is_err()
                {
                    // Consumer went away; stop producing.
                    return;
                }
            }
            Some(Err(error)) => {
                tracing::warn!(error = %error, "gemini stream emitted an error chunk");
                let _ = event_tx.send(StreamEvent::Fragment(classify_stream_error(&error)));
                break;
            }
            None => break,
        }
    }

    let _ = event_tx.send(StreamEvent::Done);
}

fn fragment_text<R>(item: StreamedAssistantContent<R>) -> Option<String>
where
    R: Clone + Unpin,
{
    match item {
        StreamedAssistantContent::Text(text) => Some(text.text),
        // Reasoning and tool traffic stay out of the chat room transcript.
        StreamedAssistantContent::Reasoning(_)
        | StreamedAssistantContent::ReasoningDelta { .. }
        | StreamedAssistantContent::ToolCall { .. }
        | StreamedAssistantContent::ToolCallDelta { .. }
        | StreamedAssistantContent::Final(_) => None,
    }
}

fn classify_stream_error(error: &rig::completion::CompletionError) -> String {
    let message = error.to_string().to_lowercase();

    if message.contains("api key not valid")
        || message.contains("api_key_invalid")
        || message.contains("authentication failed")
        || message.contains("unauthenticated")
    {
        INVALID_KEY_FRAGMENT.to_string()
    } else if message.contains("requested entity was not found") {
        ENTITY_NOT_FOUND_FRAGMENT.to_string()
    } else {
        GENERIC_FAILURE_FRAGMENT.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use rig::completion::CompletionError;

    #[test]
    fn open_session_requires_a_credential() {
        let factory = GeminiFactory;
        let error = factory
            .open_session(SessionConfig::new("   ", "any", DEFAULT_GEMINI_MODEL))
            .err()
            .expect("blank key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));

        assert!(
            factory
                .open_session(SessionConfig::new("key", "", DEFAULT_GEMINI_MODEL))
                .is_ok()
        );
    }

    #[test]
    fn classifies_invalid_key_messages() {
        let error = CompletionError::ProviderError(
            "400 INVALID_ARGUMENT: API key not valid. Please pass a valid API key.".to_string(),
        );
        assert_eq!(classify_stream_error(&error), INVALID_KEY_FRAGMENT);

        let error = CompletionError::ProviderError("401: authentication failed".to_string());
        assert_eq!(classify_stream_error(&error), INVALID_KEY_FRAGMENT);
    }

    #[test]
    fn classifies_missing_entity_messages() {
        let error = CompletionError::ProviderError(
            "404 NOT_FOUND: Requested entity was not found.".to_string(),
        );
        assert_eq!(classify_stream_error(&error), ENTITY_NOT_FOUND_FRAGMENT);
    }

    #[test]
    fn unknown_failures_fall_back_to_the_generic_apology() {
        let error = CompletionError::ProviderError("503: overloaded".to_string());
        assert_eq!(classify_stream_error(&error), GENERIC_FAILURE_FRAGMENT);
    }
}
