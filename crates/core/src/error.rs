//! Error types for the Hearth domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant, and every error can report
//! the [`Phase`] it was raised in so callers can tell a bad configuration apart
//! from an unrecoverable runtime failure.

use thiserror::Error;

/// The top-level error type for all Hearth operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Inference backend errors ---
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    // --- Context window errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Tool-call envelope errors ---
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Transport ---
    #[error("Session is closed")]
    SessionClosed,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// The stage of a session's life an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Building the session: configuration, model load, session-cache load.
    Construction,
    /// Running the decode/sample cycle.
    Decode,
    /// Parsing or executing tool calls.
    ToolDispatch,
    /// Talking to a session that has already stopped.
    Transport,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Construction => "construction",
            Phase::Decode => "decode",
            Phase::ToolDispatch => "tool dispatch",
            Phase::Transport => "transport",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    /// The phase this error belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Error::Config { .. } | Error::Io(_) => Phase::Construction,
            Error::Backend(e) if e.is_construction() => Phase::Construction,
            Error::Backend(_) | Error::Internal(_) => Phase::Decode,
            Error::Context(ContextError::InvalidWindow(_) | ContextError::PromptTooLong { .. }) => {
                Phase::Construction
            }
            Error::Context(_) => Phase::Decode,
            Error::Tool(_) | Error::Dispatch(_) | Error::Serialization(_) => Phase::ToolDispatch,
            Error::SessionClosed => Phase::Transport,
        }
    }

    /// Whether the caller can fix this by changing what it passed in.
    ///
    /// Everything else is a runtime failure that ends the session.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::Config { .. }
                | Error::Context(ContextError::InvalidWindow(_))
                | Error::Context(ContextError::PromptTooLong { .. })
        )
    }
}

// --- Bounded context errors ---

/// Failures reported by the inference backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Model failed to load: {0}")]
    ModelLoad(String),

    #[error("Context failed to initialize: {0}")]
    ContextInit(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode failed with code {code}: {reason}")]
    Decode { code: i32, reason: String },

    #[error("Sampling failed: {0}")]
    Sample(String),

    #[error("Session file {path}: {reason}")]
    SessionFile { path: String, reason: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    fn is_construction(&self) -> bool {
        matches!(
            self,
            BackendError::ModelLoad(_)
                | BackendError::ContextInit(_)
                | BackendError::SessionFile { .. }
                | BackendError::Unavailable(_)
        )
    }
}

/// Conditions raised by context window management.
#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("Context is full ({n_ctx} tokens) and window shifting is disabled")]
    Exhausted { n_ctx: u32 },

    #[error("No KV cache slot for a batch of {batch} tokens at position {n_past}")]
    NoKvSlot { batch: usize, n_past: i32 },

    #[error("Prompt is too long ({len} tokens, max {max})")]
    PromptTooLong { len: usize, max: usize },

    #[error("Invalid window parameters: {0}")]
    InvalidWindow(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

/// A tool-call envelope the model produced could not be honoured.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Malformed tool call ({reason}): {envelope}")]
    MalformedCall { reason: String, envelope: String },

    #[error("Unknown tool requested: {0}")]
    UnknownTool(String),
}
