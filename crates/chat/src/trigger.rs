//! Detection of messages addressed to the assistant.

/// Leading token that routes a user message to the assistant.
pub const TRIGGER_TOKEN: &str = "!gemini";

/// Result of inspecting one outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Ordinary chat message; the assistant stays silent.
    NotAddressed,
    /// The token alone, with nothing to ask.
    EmptyPrompt,
    /// The trimmed prompt that follows the token.
    Prompt(String),
}

/// Matches the trigger token case-insensitively at the start of the trimmed
/// message, requiring a word boundary after it so that text like
/// `!geminihello` stays an ordinary message.
pub fn detect(text: &str) -> TriggerOutcome {
    let trimmed = text.trim();
    let Some(head) = trimmed.get(..TRIGGER_TOKEN.len()) else {
        return TriggerOutcome::NotAddressed;
    };

    if !head.eq_ignore_ascii_case(TRIGGER_TOKEN) {
        return TriggerOutcome::NotAddressed;
    }

    let rest = &trimmed[TRIGGER_TOKEN.len()..];
    if rest
        .chars()
        .next()
        .is_some_and(|next| next.is_alphanumeric() || next == '_')
    {
        return TriggerOutcome::NotAddressed;
    }

    let prompt = rest.trim();
    if prompt.is_empty() {
        TriggerOutcome::EmptyPrompt
    } else {
        TriggerOutcome::Prompt(prompt.to_string())
    }
}
