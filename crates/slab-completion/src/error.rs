use thiserror::Error;

use crate::session::SessionId;

/// Failures reported by the external inference engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Tokenization failed (engine returned a negative token count).
    #[error("tokenization failed with code {0}")]
    TokenizeFailed(i32),

    /// Decode failed.
    #[error("decode failed with code {0}")]
    DecodeFailed(i32),

    /// Token-to-piece conversion failed.
    #[error("token to piece conversion failed with code {0}")]
    TokenToPieceFailed(i32),

    /// The constraint compiler refused the pattern.
    #[error("constraint compiler rejected the pattern: {0}")]
    ConstraintRejected(String),

    /// Any other engine-specific failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Invalid completion request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Failed to tokenize prompt")]
    TokenizeFailed {
        #[source]
        source: EngineError,
    },

    #[error("Failed to decode prompt for session {session_id}")]
    PromptDecodeFailed {
        session_id: SessionId,
        #[source]
        source: EngineError,
    },

    #[error("Failed to compile grammar: {pattern}")]
    GrammarCompileFailed {
        pattern: String,
        #[source]
        source: EngineError,
    },

    #[error("Failed to convert generated token to text in session {session_id}")]
    TokenToPieceFailed {
        session_id: SessionId,
        #[source]
        source: EngineError,
    },

    #[error("Failed to feed generated token back into context for session {session_id}")]
    DecodeFailed {
        session_id: SessionId,
        #[source]
        source: EngineError,
    },

    #[error("Token batch is full (capacity {capacity})")]
    BatchFull { capacity: usize },

    #[error("No free sequence slot: all {max_sessions} sessions are in use")]
    CapacityExhausted { max_sessions: usize },

    #[error("Session {session_id} already has a step in flight")]
    SessionBusy { session_id: SessionId },

    #[error("Lock poisoned while trying to {operation}")]
    LockPoisoned { operation: &'static str },

    #[error("Generation worker shut down unexpectedly")]
    WorkerShutdown,
}
