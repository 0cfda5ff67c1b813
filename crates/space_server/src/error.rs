//! Error types and handling for the space server.
//!
//! This module defines the error types that can occur during server
//! operations, providing clear categorization of different failure modes.

/// Enumeration of possible server errors.
///
/// Categorizes errors into network/transport failures, authentication
/// rejections, and internal server errors to help with debugging and error
/// handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures, unreachable peers,
    /// or closed connections
    #[error("Network error: {0}")]
    Network(String),

    /// A session credential was rejected by the authenticator
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Internal server errors including wiring and serialization issues
    #[error("Internal error: {0}")]
    Internal(String),
}
