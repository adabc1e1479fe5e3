//! Error types for the state system.

use crate::types::{Quark, ValueKind};
use thiserror::Error;

/// Main error type for state system operations.
#[derive(Debug, Error)]
pub enum StateSystemError {
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    #[error("Time {t} outside valid range [{start}, {end}]")]
    TimeRange { t: i64, start: i64, end: i64 },

    #[error("Time {t} is before ongoing start {ongoing_start} of quark {quark}")]
    NonMonotonicTime {
        quark: Quark,
        t: i64,
        ongoing_start: i64,
    },

    #[error("State value type mismatch on quark {quark}: expected {expected:?}, got {got:?}")]
    StateValueType {
        quark: Quark,
        expected: ValueKind,
        got: ValueKind,
    },

    #[error("Quark {0} is not a stack attribute")]
    NotAStack(Quark),

    #[error("State system has been disposed")]
    Disposed,

    #[error("Quark {quark} out of bounds (attribute count {count})")]
    OutOfBounds { quark: Quark, count: usize },

    #[error("Stack limit reached on quark {0}")]
    StackOverflow(Quark),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid history format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Provider version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: i32, got: i32 },

    #[error("History is locked by another process")]
    Locked,

    #[error("State provider failed: {0}")]
    ProviderFailed(String),
}

impl StateSystemError {
    /// True for the errors that signal an out-of-range or out-of-order time.
    pub fn is_time_range(&self) -> bool {
        matches!(
            self,
            StateSystemError::TimeRange { .. } | StateSystemError::NonMonotonicTime { .. }
        )
    }

    /// True for value-kind errors, including stack misuse.
    pub fn is_value_type(&self) -> bool {
        matches!(
            self,
            StateSystemError::StateValueType { .. } | StateSystemError::NotAStack(_)
        )
    }
}

impl From<serde_json::Error> for StateSystemError {
    fn from(e: serde_json::Error) -> Self {
        StateSystemError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StateSystemError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateSystemError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateSystemError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateSystemError::Deserialization(e.to_string())
    }
}

impl From<regex::Error> for StateSystemError {
    fn from(e: regex::Error) -> Self {
        StateSystemError::InvalidPattern(e.to_string())
    }
}

/// Result type for state system operations.
pub type Result<T> = std::result::Result<T, StateSystemError>;
