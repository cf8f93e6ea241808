//! Typed error kinds shared across the forwarding engine.
//!
//! Mirrors the error taxonomy the controller expects back on a
//! `CommandResponse.message` field: `"<kind>: <detail>"`.

use thiserror::Error;

/// The forwarding engine's single error type.
///
/// Every fallible operation in `gost-core` returns this type (or
/// `anyhow::Error` at the binary entrypoint) so that callers can match on
/// `kind()` without parsing message strings.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid: {0}")]
    Invalid(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("decrypt: {0}")]
    Decrypt(String),

    #[error("decompress: {0}")]
    Decompress(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("no node: {0}")]
    NoNode(String),

    #[error("dial failed: {0}")]
    DialFail(String),

    #[error("publish failed: {0}")]
    PublishFail(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ForwardError {
    /// Short kind tag, matching the vocabulary in the error handling design:
    /// `Invalid`, `Duplicate`, `NotFound`, `Parse`, `Decrypt`, `Decompress`,
    /// `RateLimit`, `NoNode`, `DialFail`, `PublishFail`, `Transient`, `Fatal`.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Invalid(_) => "Invalid",
            ForwardError::Duplicate(_) => "Duplicate",
            ForwardError::NotFound(_) => "NotFound",
            ForwardError::Parse(_) => "Parse",
            ForwardError::Decrypt(_) => "Decrypt",
            ForwardError::Decompress(_) => "Decompress",
            ForwardError::RateLimit(_) => "RateLimit",
            ForwardError::NoNode(_) => "NoNode",
            ForwardError::DialFail(_) => "DialFail",
            ForwardError::PublishFail(_) => "PublishFail",
            ForwardError::Transient(_) => "Transient",
            ForwardError::Fatal(_) => "Fatal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ForwardError>;
