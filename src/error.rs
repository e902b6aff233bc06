//! Error taxonomy for bughunt
//!
//! Systemic failures surface as `HuntError`. Phase-local issues (a weak
//! lexical flag, one failed participant, a rejected fix skeleton) are data
//! and never show up here.

use crate::chamber::ParticipantOutcome;
use thiserror::Error;

/// Why a code unit was refused before analysis began
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("input size {size} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { size: usize, limit: usize },

    #[error("input is not text: {0}")]
    NotText(String),
}

/// Classification of a single provider failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    Auth,
    Network,
    Server,
    MalformedReply,
    Cancelled,
}

impl ProviderErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimited => "rate limited",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Server => "server",
            ProviderErrorKind::MalformedReply => "malformed reply",
            ProviderErrorKind::Cancelled => "cancelled",
        }
    }
}

/// A failure reported by a model provider
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("provider error ({}): {message}", kind.label())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(model_id: &str, secs: u64) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("{} did not answer within {}s", model_id, secs),
        )
    }
}

#[derive(Error, Debug)]
pub enum HuntError {
    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    /// Every participant failed, so nothing could be arbitrated
    #[error("no quorum: 0 of {} participants returned a proposal", outcomes.len())]
    NoQuorum { outcomes: Vec<ParticipantOutcome> },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("nothing to deliberate: no proposal skeletons were promoted")]
    EmptyAgenda,

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type HuntResult<T> = Result<T, HuntError>;

impl HuntError {
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Systemic errors stop the convergence loop instead of pausing one unit
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HuntError::Persistence(_) | HuntError::Config(_) | HuntError::Input(_)
        )
    }
}

impl From<std::io::Error> for HuntError {
    fn from(err: std::io::Error) -> Self {
        HuntError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for HuntError {
    fn from(err: serde_json::Error) -> Self {
        HuntError::Persistence(format!("serialization: {}", err))
    }
}
