//! Deterministic lifecycle for one assistant streaming attempt.

use banter_storage::EntryId;

/// Where the current assistant attempt stands.
///
/// The busy span covers everything outside `Idle`: the send path is closed
/// from the credential check until the attempt reaches a terminal
/// transition, success or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    /// A trigger was accepted; the credential has not been checked yet.
    CheckingCredential,
    /// Fragments are being folded into the placeholder entry.
    Streaming { placeholder: EntryId },
}

/// State transition input for the attempt lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    /// A trigger message was accepted for processing.
    Begin,
    /// The attempt stops before contacting the provider.
    Decline,
    /// The placeholder entry is persisted and fragments may flow.
    Open { placeholder: EntryId },
    /// The fragment sequence ended normally.
    Complete,
    /// The stream died without a terminal event.
    Fail,
}

/// Rejection reason for an illegal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRejection {
    AlreadyActive,
    NotCheckingCredential,
    NotStreaming,
}

pub type StreamPhaseResult = Result<StreamPhase, StreamRejection>;

impl StreamPhase {
    /// True for the whole credential-check → terminal span.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// Returns the placeholder entry id while fragments are flowing.
    pub fn streaming_placeholder(&self) -> Option<EntryId> {
        match self {
            Self::Streaming { placeholder } => Some(*placeholder),
            Self::Idle | Self::CheckingCredential => None,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Every terminal transition lands back on `Idle`; there are no resting
    /// done/failed states, so a finished attempt leaves nothing to reset.
    pub fn apply(&self, transition: StreamTransition) -> StreamPhaseResult {
        match transition {
            StreamTransition::Begin => match self {
                Self::Idle => Ok(Self::CheckingCredential),
                Self::CheckingCredential | Self::Streaming { .. } => {
                    Err(StreamRejection::AlreadyActive)
                }
            },
            StreamTransition::Decline => match self {
                Self::CheckingCredential => Ok(Self::Idle),
                Self::Idle | Self::Streaming { .. } => {
                    Err(StreamRejection::NotCheckingCredential)
                }
            },
            StreamTransition::Open { placeholder } => match self {
                Self::CheckingCredential => Ok(Self::Streaming { placeholder }),
                Self::Idle | Self::Streaming { .. } => {
                    Err(StreamRejection::NotCheckingCredential)
                }
            },
            StreamTransition::Complete | StreamTransition::Fail => match self {
                Self::Streaming { .. } => Ok(Self::Idle),
                Self::Idle | Self::CheckingCredential => Err(StreamRejection::NotStreaming),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholder() -> EntryId {
        EntryId::new_v7()
    }

    #[test]
    fn walks_the_full_successful_lifecycle() {
        let id = placeholder();
        let phase = StreamPhase::Idle;

        let phase = phase.apply(StreamTransition::Begin).expect("begin");
        assert_eq!(phase, StreamPhase::CheckingCredential);
        assert!(phase.is_busy());

        let phase = phase
            .apply(StreamTransition::Open { placeholder: id })
            .expect("open");
        assert_eq!(phase.streaming_placeholder(), Some(id));

        let phase = phase.apply(StreamTransition::Complete).expect("complete");
        assert_eq!(phase, StreamPhase::Idle);
        assert!(!phase.is_busy());
    }

    #[test]
    fn missing_credential_declines_back_to_idle() {
        let phase = StreamPhase::Idle
            .apply(StreamTransition::Begin)
            .expect("begin");
        let phase = phase.apply(StreamTransition::Decline).expect("decline");
        assert_eq!(phase, StreamPhase::Idle);
    }

    #[test]
    fn a_second_attempt_is_rejected_while_busy() {
        let checking = StreamPhase::CheckingCredential;
        assert_eq!(
            checking.apply(StreamTransition::Begin),
            Err(StreamRejection::AlreadyActive)
        );

        let streaming = StreamPhase::Streaming {
            placeholder: placeholder(),
        };
        assert_eq!(
            streaming.apply(StreamTransition::Begin),
            Err(StreamRejection::AlreadyActive)
        );
    }

    #[test]
    fn terminal_transitions_require_an_active_stream() {
        assert_eq!(
            StreamPhase::Idle.apply(StreamTransition::Complete),
            Err(StreamRejection::NotStreaming)
        );
        assert_eq!(
            StreamPhase::CheckingCredential.apply(StreamTransition::Fail),
            Err(StreamRejection::NotStreaming)
        );
    }

    #[test]
    fn failure_also_lands_on_idle() {
        let phase = StreamPhase::Streaming {
            placeholder: placeholder(),
        };
        assert_eq!(phase.apply(StreamTransition::Fail), Ok(StreamPhase::Idle));
    }
}
