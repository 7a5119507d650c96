use thiserror::Error;

use crate::channel::State;

/// The error type for commlink operations.
///
/// This encompasses all errors that can occur when using the library:
/// registry and alias management, URL parsing, channel life-cycle
/// operations and transport I/O.
///
/// Failures inside `open`/`process`/`post` additionally move the channel
/// into the `Error` state and emit a STATE message, so every failure is
/// observable either as a return value or through the callback plane.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Registry Errors
    // ============================================================================

    /// Attempted to register a protocol, alias or channel name that already exists.
    #[error("Duplicate {kind} '{name}'")]
    Duplicate {
        /// What was being registered ("impl", "alias" or "channel").
        kind: &'static str,
        /// The name that collided.
        name: String,
    },

    /// The requested protocol, alias, channel name or master does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// What was looked up ("impl", "alias", "channel" or "master").
        kind: &'static str,
        /// The name that was not found.
        name: String,
    },

    /// A registry entry exists under this name but is of the other kind,
    /// or a master channel is not of the kind the impl requires.
    #[error("'{name}' is not {expected}")]
    TypeMismatch {
        name: String,
        /// Human readable description of what was expected.
        expected: &'static str,
    },

    /// Unregister was called with an impl pointer that does not match the
    /// registered entry.
    #[error("Impl registered as '{name}' does not match")]
    ImplMismatch { name: String },

    /// An alias URL carries a field aliases must not define (`tll.host`, `name`).
    #[error("Alias '{name}' has non-empty field '{field}'")]
    AliasInvalid { name: String, field: String },

    /// An alias chain does not terminate in a registered impl.
    #[error("Channel impl '{proto}' not found")]
    Unresolvable { proto: String },

    /// A cycle was detected while resolving an alias chain.
    #[error("Detected loop in alias resolution at '{proto}'")]
    AliasLoop { proto: String },

    /// An impl requested re-initialization with an impl that was already tried.
    #[error("Detected loop in channel initialization at '{protocol}'")]
    InitLoop { protocol: String },

    /// The same parameter is defined both by an alias and by the URL itself.
    #[error("Duplicate field '{key}': both in alias '{proto}' and in url")]
    DuplicateField { key: String, proto: String },

    // ============================================================================
    // Life-Cycle Errors
    // ============================================================================

    /// The impl reported failure during channel construction.
    #[error("Failed to init channel '{url}'")]
    InitFailed { url: String },

    /// The impl reported failure during open.
    #[error("Failed to open channel '{name}'")]
    OpenFailed { name: String },

    /// The impl reported failure during close.
    #[error("Failed to close channel '{name}'")]
    CloseFailed { name: String },

    /// Operation is not valid in the channel's current state.
    #[error("Can not {op} channel in state {state:?}")]
    State { op: &'static str, state: State },

    // ============================================================================
    // Non-Blocking Operation
    // ============================================================================

    /// Non-blocking operation has no work right now or would block; retry later.
    #[error("Resource temporarily unavailable")]
    Again,

    /// A process or poll deadline expired.
    #[error("Operation timed out")]
    Timeout,

    // ============================================================================
    // Argument and Configuration Errors
    // ============================================================================

    /// Malformed URL, missing required parameter or a value of the wrong type.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration lookup through the defaults store failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // ============================================================================
    // Transport Errors
    // ============================================================================

    /// I/O failure reported by a transport; carries the original cause.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to load a channel module shared object.
    #[error("Failed to load module '{path}': {reason}")]
    ModuleLoad { path: String, reason: String },
}

impl Error {
    /// True for the non-blocking "no work right now" code.
    ///
    /// Event loops treat `Again` as "sleep until readiness"; all other
    /// errors are real failures.
    pub fn is_again(&self) -> bool {
        matches!(self, Error::Again)
    }

    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
