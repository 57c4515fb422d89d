mod gemini;
mod provider;

pub use gemini::{
    CLIENT_INIT_FRAGMENT, DEFAULT_GEMINI_MODEL, ENTITY_NOT_FOUND_FRAGMENT,
    GENERIC_FAILURE_FRAGMENT, GeminiFactory, GeminiSession, INVALID_KEY_FRAGMENT,
};
pub use provider::{
    FragmentStream, ProviderError, ProviderFactory, ProviderResult, ProviderSession,
    ProviderWorker, SessionConfig, StreamEvent, StreamHandle, fragment_channel,
};
