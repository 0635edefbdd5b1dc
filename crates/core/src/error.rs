//! Error taxonomy shared across the engine.
//!
//! `DispatchError` covers this crate's own fallible operations (mostly
//! config parsing); `ClassifiedError` is the output of the `ErrorClassifier`
//! and is what the worker and circuit breaker actually reason about.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ProviderKind;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// The category a `ClassifiedError` falls into.
///
/// `Unknown` is deliberately distinct from `Provider` in the type (so callers
/// can tell "we recognised this as transient-ish" from "we have no idea"),
/// but spec.md §7 treats it as `Provider` for circuit-breaker and retry
/// purposes — see `ClassifiedError::is_recipient_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Recipient,
    Provider,
    Unknown,
}

/// A provider-agnostic categorisation of a raw send error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub original: String,
    pub provider: ProviderKind,
    pub http_status: u16,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl ClassifiedError {
    /// Only recipient-classified failures are excluded from the circuit
    /// breaker (spec.md §4.3, the manager-level filter).
    pub fn is_recipient_error(&self) -> bool {
        self.kind == ErrorKind::Recipient
    }
}
