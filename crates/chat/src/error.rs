use snafu::Snafu;

use banter_storage::StorageError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("a username is required to join the chat"))]
    EmptyUsername { stage: &'static str },
    #[snafu(display("this session already joined as '{username}'"))]
    AlreadyJoined {
        stage: &'static str,
        username: String,
    },
    #[snafu(display("no identity has joined this session"))]
    NotJoined { stage: &'static str },
    #[snafu(display("unknown theme '{key}'"))]
    UnknownTheme { stage: &'static str, key: String },
    #[snafu(display("durable log operation failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
