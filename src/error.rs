//! Error types for mail-print.

use std::path::PathBuf;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Staging error: {0}")]
    Stage(#[from] StageError),

    #[error("Print error: {0}")]
    Print(#[from] PrintError),
}

/// Configuration-related errors. Only ever raised at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse filter criteria: {0}")]
    ParseError(String),
}

/// Mailbox store errors.
///
/// All of these are fatal for the current cycle only.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Cannot select folder {name}: {reason}")]
    Folder { name: String, reason: String },

    #[error("Search failed: {0}")]
    Search(String),

    #[error("Fetch of UID {uid} failed: {reason}")]
    Fetch { uid: u32, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,
}

/// Message decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Message of {len} bytes could not be parsed as MIME")]
    Unparseable { len: usize },
}

/// Attachment staging errors.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Print subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum PrintError {
    #[error("Failed to run print command for {printer}: {reason}")]
    Spawn { printer: String, reason: String },

    #[error("Printer {printer} rejected {file} (exit status {status}): {stderr}")]
    Rejected {
        printer: String,
        file: String,
        status: i32,
        stderr: String,
    },

    #[error("Queue status query failed: {0}")]
    Status(String),

    #[error("{failed} of {total} submissions failed")]
    PartialSubmission { failed: usize, total: usize },

    #[error("Cancelled while waiting for queue drain")]
    Cancelled,
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
