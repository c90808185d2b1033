//! Domain error types for the AMQP integration harness.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use std::time::Duration;

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Broker host must not be empty.
    #[error("broker host must not be empty")]
    EmptyHost,

    /// Broker port must be non-zero.
    #[error("broker port must be non-zero")]
    InvalidPort,

    /// A credential is empty, usually an unset `${VAR}`.
    #[error("{field} must not be empty after environment expansion")]
    EmptyCredential { field: &'static str },

    /// A routing prefix is empty or contains whitespace.
    #[error("invalid routing prefix '{0}': must be non-empty and contain no whitespace")]
    InvalidPrefix(String),

    /// Inbound and outbound prefixes must differ.
    #[error("inbound and outbound prefixes must differ, both are '{0}'")]
    DuplicatePrefix(String),

    /// A timeout was configured as zero.
    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Kind of broker-side entity, used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Exchange,
    Queue,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exchange => f.write_str("exchange"),
            Self::Queue => f.write_str("queue"),
        }
    }
}

/// Errors raised while talking to the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not open a connection to the broker.
    #[error("failed to connect to {target}: {message}")]
    Connection { target: String, message: String },

    /// Connection attempt did not finish in time.
    #[error("connection to {target} timed out after {timeout_ms}ms")]
    ConnectTimeout { target: String, timeout_ms: u64 },

    /// The session has already been closed.
    #[error("session '{label}' is closed")]
    SessionClosed { label: String },

    /// A referenced exchange or queue does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// Redeclaration with incompatible arguments.
    #[error("precondition failed for {kind} '{name}': {message}")]
    PreconditionFailed {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    /// The broker refused a published message.
    #[error("broker rejected message published to exchange '{exchange}'")]
    PublishNacked { exchange: String },

    /// Failure reported by the AMQP client.
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Failure injected by a test double.
    #[error("injected failure: {operation} on '{target}'")]
    Injected { operation: String, target: String },
}

/// Errors surfaced by the test harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Broker communication failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// No message arrived within the bound. The broker itself may be healthy.
    #[error("no message arrived on queue '{queue}' within {timeout:?}")]
    ReceiveTimeout { queue: String, timeout: Duration },

    /// The subscription ended before any delivery arrived.
    #[error("subscription on queue '{queue}' ended without a delivery")]
    SubscriptionClosed { queue: String },

    /// The operation is not valid in the harness's current state.
    #[error("harness is {state}, expected {expected}")]
    InvalidState {
        state: &'static str,
        expected: &'static str,
    },

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HarnessError {
    /// True when the error means "nothing arrived" rather than a broker fault.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReceiveTimeout { .. })
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
