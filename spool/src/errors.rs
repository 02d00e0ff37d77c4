//! The runner's error taxonomy.
//!
//! Configuration errors are fatal at construction. Usage errors are raised
//! back to user code that asked for something its context does not offer.
//! Anything a user callback returns is wrapped exactly once as
//! [`Error::UserCode`]; transient split conditions are `Ok(None)` on the
//! operations that can produce them, never errors.

use thiserror::Error;

/// The boxed error type user callbacks return.
pub type UserError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The result type of user callbacks.
pub type UserResult<T> = Result<T, UserError>;

/// Failures surfaced by the runner.
#[derive(Debug, Error)]
pub enum Error {
    /// The transform descriptor or the wiring around it is unusable.
    #[error("invalid transform configuration: {0}")]
    Config(String),

    /// User code asked for something its current context does not offer.
    #[error("{0}")]
    Usage(String),

    /// A user callback failed; the cause is carried unchanged.
    #[error("user code in transform {transform} failed: {source}")]
    UserCode {
        /// The transform whose callback failed.
        transform: String,
        /// The user's error.
        #[source]
        source: UserError,
    },

    /// A payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Wraps a codec-layer failure.
    pub fn codec<E: std::fmt::Display>(err: E) -> Self {
        Error::Codec(err.to_string())
    }

    /// Wraps an error returned by a user callback.
    ///
    /// Errors that originated in the runner (usage errors the user merely
    /// propagated, or an already-wrapped failure) pass through unchanged, so
    /// wrapping is applied exactly once.
    pub fn user(transform: &str, err: UserError) -> Self {
        match err.downcast::<Error>() {
            Ok(own) => *own,
            Err(err) => Error::UserCode {
                transform: transform.to_owned(),
                source: err,
            },
        }
    }
}
