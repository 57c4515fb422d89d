use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::mpsc;

/// Everything a provider session is built from. A session is bound to one
/// (credential, instruction) pair; changing either requires a fresh session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub api_key: String,
    pub instruction: String,
    pub model_id: String,
}

impl SessionConfig {
    pub fn new(
        api_key: impl Into<String>,
        instruction: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into().trim().to_string(),
            instruction: instruction.into().trim().to_string(),
            model_id: model_id.into().trim().to_string(),
        }
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for model '{model_id}'"))]
    MissingApiKey {
        stage: &'static str,
        model_id: String,
    },
}

/// One event on a fragment stream.
///
/// The sequence is finite: zero or more fragments followed by `Done`.
/// Provider-side failures arrive as ordinary fragments so they render as
/// assistant text; a worker that dies without sending `Done` is the only
/// hard-fault signal consumers ever see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(String),
    Done,
}

/// Receiver half of one streaming call.
///
/// Dropping the stream ends the worker: its sends start failing and it
/// returns. There is no explicit cancel signal.
pub struct FragmentStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl FragmentStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }
}

/// One streaming call: the consumer spawns `worker` and drives `stream`.
pub struct StreamHandle {
    pub stream: FragmentStream,
    pub worker: ProviderWorker,
}

/// A live provider session bound to one (credential, instruction) pair.
/// Each call is independent; the engine assumes no cross-call memory
/// beyond what the provider manages internally.
pub trait ProviderSession: Send + Sync {
    fn stream_prompt(&self, prompt: String) -> StreamHandle;
}

/// Builds provider sessions. Sessions are cheap to construct and callers
/// never observe a partially-built one.
pub trait ProviderFactory: Send + Sync {
    fn open_session(&self, config: SessionConfig) -> ProviderResult<Arc<dyn ProviderSession>>;
}

/// Builds the sender/receiver pair for one streaming call. Public so that
/// provider implementations outside this crate can assemble handles.
pub fn fragment_channel() -> (mpsc::UnboundedSender<StreamEvent>, FragmentStream) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (event_tx, FragmentStream { events: event_rx })
}
