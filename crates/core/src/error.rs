//! Error classification shared by every layer.
//!
//! Each crate owns its concrete `thiserror` enum. What they share is the
//! taxonomy: every error belongs to one [`ErrorClass`] and carries a stable,
//! machine-readable code that callers can match on without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message shown for dependency failures. Internal detail is never exposed.
pub const DEPENDENCY_MESSAGE: &str = "service temporarily unavailable, please try again";

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input shape; the caller's fault, never retried.
    Validation,
    /// The entity does not exist.
    NotFound,
    /// Invalid transition, duplicate delivery, already-processed state.
    Conflict,
    /// The actor does not own the entity.
    Unauthorized,
    /// Gateway, broker or database unavailable. The caller may retry.
    Dependency,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Dependency)
    }
}

/// Implemented by every error that can reach a caller.
pub trait Classified: core::fmt::Display {
    fn class(&self) -> ErrorClass;

    /// Stable machine-readable code (e.g. `"order_not_found"`).
    fn code(&self) -> &'static str;

    /// User-visible representation.
    fn to_body(&self) -> ErrorBody {
        let message = match self.class() {
            ErrorClass::Dependency => DEPENDENCY_MESSAGE.to_string(),
            _ => self.to_string(),
        };
        ErrorBody {
            error: self.code().to_string(),
            class: self.class(),
            message,
        }
    }
}

/// Serializable error payload returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub class: ErrorClass,
    pub message: String,
}

/// An identifier failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid identifier ({kind}): {reason}")]
pub struct IdParseError {
    pub kind: &'static str,
    pub reason: String,
}

impl Classified for IdParseError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }

    fn code(&self) -> &'static str {
        "invalid_id"
    }
}
