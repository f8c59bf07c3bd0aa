//! Error types for the result pipeline.

use thiserror::Error;

/// A socket message that could not be turned into a [`crate::TestEvent`].
///
/// Always recoverable: the message is logged and dropped.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} message carries no test id")]
    MissingId { kind: String },

    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// A run that produced nothing at all and exited unsuccessfully.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FatalRunError {
    #[error("test command {} and produced no output", describe_exit(.exit_code))]
    Silent { exit_code: Option<i32> },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_owned(),
    }
}
