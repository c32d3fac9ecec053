//! # Error Handling for RoostDB
//!
//! This module defines the error types used throughout RoostDB. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures uniform and lets the dispatch layer map errors to HTTP status
//! codes in one place.
//!
//! ## Error Categories
//!
//! | Category | Examples | HTTP class |
//! |----------|----------|------------|
//! | Bad request | path shape, verb/kind mismatch, malformed body | 400 |
//! | Unauthorized | missing/expired/unknown bearer | 401 |
//! | Not found | missing intermediate or terminal resource | 404 |
//! | Conflict | no-overwrite PUT on an existing document | 412 |
//! | Schema | post-write value rejected by the validator | 400 |
//! | Patch | bad pointer, type mismatch during patching | 400 |
//! | Dispatch | partial fan-out delivery | logged only |
//!
//! Errors cross module boundaries verbatim: the skip list surfaces whatever
//! the caller's check function returned, the resource tree wraps lookup
//! failures as `NotFound`, and the api layer performs the final status-code
//! mapping.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in RoostDB operations.
///
/// Each variant corresponds to one row of the error taxonomy; the `#[error]`
/// attribute defines the message that becomes the JSON response body.
#[derive(Error, Debug)]
pub enum Error {
    /// The request shape is invalid: unsupported verb for the resource kind,
    /// wrong trailing slash, disallowed query parameter, unparsable body, or
    /// a create-only PUT colliding with an existing collection or database.
    #[error("{0}")]
    BadRequest(String),

    /// The bearer token is missing, unknown, or expired.
    #[error("{0}")]
    Unauthorized(String),

    /// An intermediate path segment or the target resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A no-overwrite PUT found the document already present.
    ///
    /// Maps to `412 Precondition Failed`; the stored document is untouched.
    #[error("{0}")]
    Conflict(String),

    /// The would-be document content failed schema validation.
    ///
    /// The write is not committed; the previous content (if any) remains
    /// observable.
    #[error("schema validation failed: {0}")]
    Schema(String),

    /// A patch operation could not be applied: invalid JSON pointer, a
    /// non-object encountered while navigating, or a terminal type mismatch.
    ///
    /// The whole PATCH aborts and the document is unchanged.
    #[error("{0}")]
    Patch(String),

    /// The key falls outside the ordered map's sentinel bounds and cannot be
    /// stored.
    #[error("invalid key")]
    InvalidKey,

    /// A subscriber channel was registered twice for the same resource path.
    #[error("channel already registered")]
    AlreadyRegistered,

    /// One or more non-blocking sends were dropped during fan-out.
    ///
    /// The write that triggered the dispatch still succeeds; delivery is
    /// best-effort.
    #[error("message dispatch failed to {failed} client(s)")]
    PartialDispatch {
        /// Number of subscriber channels whose buffer was full.
        failed: usize,
    },

    /// Filesystem failure while reading the schema or tokens file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON that could not be parsed or serialized.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages become JSON response bodies, so their wording is part
    /// of the external contract.
    #[test]
    fn test_error_display() {
        let not_found = Error::NotFound("Document does not exist doc1: not found".to_string());
        assert_eq!(
            not_found.to_string(),
            "Document does not exist doc1: not found"
        );

        let conflict = Error::Conflict("document already exists".to_string());
        assert_eq!(conflict.to_string(), "document already exists");

        assert_eq!(Error::InvalidKey.to_string(), "invalid key");
        assert_eq!(
            Error::AlreadyRegistered.to_string(),
            "channel already registered"
        );

        let dispatch = Error::PartialDispatch { failed: 3 };
        assert_eq!(
            dispatch.to_string(),
            "message dispatch failed to 3 client(s)"
        );
    }

    #[test]
    fn test_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let our_err: Error = parse_err.into();
        assert!(matches!(our_err, Error::Json(_)));
        assert!(our_err.to_string().contains("invalid JSON"));
    }
}
