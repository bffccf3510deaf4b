//! Error types for the voice gateway.

use serde::{Deserialize, Serialize};

/// Pipeline stage a response frame or engine failure originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Speech-to-text.
    Asr,
    /// Dialogue generation.
    Llm,
    /// Text-to-speech.
    Tts,
}

impl Stage {
    /// Lowercase wire name (`asr`, `llm`, `tts`).
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Asr => "asr",
            Self::Llm => "llm",
            Self::Tts => "tts",
        }
    }

    /// Stage-tagged failure code surfaced in `error` frames.
    #[must_use]
    pub fn failure_code(self) -> &'static str {
        match self {
            Self::Asr => "ASR_FAILED",
            Self::Llm => "LLM_FAILED",
            Self::Tts => "TTS_FAILED",
        }
    }
}

/// Top-level error type for the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed frame, unknown type, missing field, payload shape mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// No factory registered for the requested engine provider.
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    /// Engine backend cannot be reached or refused authentication mid-turn.
    #[error("{} provider unreachable: {message}", stage.name())]
    ProviderUnreachable {
        /// Stage whose backend failed.
        stage: Stage,
        /// Underlying transport / auth failure.
        message: String,
    },

    /// Engine call exceeded its configured deadline.
    #[error("{} stage timed out", .0.name())]
    ProviderTimeout(Stage),

    /// Engine produced an error artifact mid-stream.
    #[error("{} stage failed: {message}", stage.name())]
    Stage {
        /// Originating stage.
        stage: Stage,
        /// Engine-reported failure.
        message: String,
    },

    /// Pipeline cancelled by interruption or shutdown. Never surfaced to clients.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Connection cap reached; the new connection is refused.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Session removed by cap enforcement or idle timeout.
    #[error("session evicted: {0}")]
    Evicted(String),

    /// Outbound queue stalled past the write deadline, or the peer is gone.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation / programming defect.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire-level error code carried in `error` frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Config(_) => "CONFIG_INVALID",
            Self::UnsupportedProvider(_) => "UNSUPPORTED_PROVIDER",
            Self::ProviderUnreachable { .. } => "PROVIDER_UNREACHABLE",
            Self::ProviderTimeout(stage) | Self::Stage { stage, .. } => stage.failure_code(),
            Self::Cancelled => "CANCELLED",
            Self::Capacity(_) => "CAPACITY_EXCEEDED",
            Self::Evicted(_) => "SESSION_EVICTED",
            Self::Channel(_) => "CHANNEL_STALLED",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether the session survives this error in a usable state.
    ///
    /// Recoverable errors leave the session alive (returning to `Listening`
    /// or `Idle` when raised inside a pipeline); non-recoverable errors drive
    /// the session to `Error` or refuse the connection outright.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        match self {
            Self::Protocol(_)
            | Self::ProviderUnreachable { .. }
            | Self::ProviderTimeout(_)
            | Self::Stage { .. }
            | Self::Cancelled
            | Self::Evicted(_) => true,
            Self::Config(_)
            | Self::UnsupportedProvider(_)
            | Self::Capacity(_)
            | Self::Channel(_)
            | Self::Io(_)
            | Self::Internal(_) => false,
        }
    }

    /// Stage tag, when this error originated inside an engine call.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::ProviderUnreachable { stage, .. } | Self::Stage { stage, .. } => Some(*stage),
            Self::ProviderTimeout(stage) => Some(*stage),
            _ => None,
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, GatewayError>;
