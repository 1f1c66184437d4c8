//! Structured failures carried in reply envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes returned in negative replies.
///
/// These codes are stable and used for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The job did not satisfy the worker's input requirements.
    InvalidRequest,
    /// The submitted archive failed its digest check or could not be extracted.
    CorruptPayload,
    /// The build delegate failed.
    BuildFailed,
    /// No handler is registered for the job's channel.
    UnknownChannel,
    /// The worker failed while preparing or publishing the result.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::CorruptPayload => write!(f, "CORRUPT_PAYLOAD"),
            Self::BuildFailed => write!(f, "BUILD_FAILED"),
            Self::UnknownChannel => write!(f, "UNKNOWN_CHANNEL"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Failure payload of a negative reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error code from the registry.
    pub code: ErrorCode,
    /// Human-readable, single-line error message.
    pub message: String,
    /// Optional machine-readable details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn corrupt_payload(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CorruptPayload, message)
    }

    pub fn build_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BuildFailed, message)
    }

    pub fn unknown_channel(channel: &str) -> Self {
        Self::with_data(
            ErrorCode::UnknownChannel,
            format!("no handler for channel '{}'", channel),
            serde_json::json!({ "channel": channel }),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for JobError {}
