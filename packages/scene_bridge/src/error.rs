//! Error type shared by the bridge components.
//!
//! Extension misbehaviour is contained at the bridge boundary: these errors are
//! returned to the shell, logged and turned into diagnostics, never propagated
//! into host rendering code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("layer view requires a non-empty layer id")]
    MissingLayerId,

    #[error("invalid {what} id `{id}`")]
    InvalidId { what: &'static str, id: String },

    #[error("instance `{0}` is already registered")]
    DuplicateInstance(String),

    #[error("unknown instance `{0}`")]
    UnknownInstance(String),

    #[error("[{instance}] script failed to compile: {message}")]
    Compile { instance: String, message: String },

    #[error("[{instance}] script error: {message}")]
    Script { instance: String, message: String },

    #[error("[{owner}] value at `{path}` cannot be transferred across the sandbox boundary")]
    NotMarshalable { owner: String, path: String },

    #[error("recipient `{recipient}` failed handling message from `{sender}`: {message}")]
    RecipientFailure {
        sender: String,
        recipient: String,
        message: String,
    },

    #[error("recipient `{0}` is busy")]
    RecipientBusy(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type BridgeResult<T> = Result<T, BridgeError>;
