//! Message types passed between pipeline stages.

use crate::error::{GatewayError, Stage};
use crate::protocol::ResponsePayload;

/// One artifact emitted by an engine stream.
#[derive(Debug, Clone)]
pub struct StageArtifact {
    /// Originating stage.
    pub stage: Stage,
    /// Text content (transcript so far, reply fragment, or empty).
    pub content: String,
    /// Stage-reported confidence, when available.
    pub confidence: Option<f32>,
    /// True for incremental fragments.
    pub is_delta: bool,
    /// True for the terminal artifact of a stream.
    pub is_complete: bool,
    /// Synthesized audio bytes (TTS only).
    pub audio: Option<Vec<u8>>,
}

impl StageArtifact {
    /// An incremental fragment.
    #[must_use]
    pub fn delta(stage: Stage, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
            confidence: None,
            is_delta: true,
            is_complete: false,
            audio: None,
        }
    }

    /// The terminal artifact carrying the full content.
    #[must_use]
    pub fn complete(stage: Stage, content: impl Into<String>) -> Self {
        Self {
            stage,
            content: content.into(),
            confidence: None,
            is_delta: false,
            is_complete: true,
            audio: None,
        }
    }

    /// An audio-bearing artifact (TTS).
    #[must_use]
    pub fn audio(stage: Stage, bytes: Vec<u8>, is_complete: bool) -> Self {
        Self {
            stage,
            content: String::new(),
            confidence: None,
            is_delta: !is_complete,
            is_complete,
            audio: Some(bytes),
        }
    }

    /// Attach a confidence score.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Render as a `response` frame payload.
    #[must_use]
    pub fn to_response(&self) -> ResponsePayload {
        ResponsePayload {
            stage: self.stage,
            content: self.content.clone(),
            confidence: self.confidence,
            is_delta: self.is_delta,
            is_final: self.is_complete,
            audio_data: self.audio.clone(),
            metadata: None,
        }
    }
}

/// How a pipeline run ended, reported back to the owning session.
#[derive(Debug)]
pub enum TurnOutcome {
    /// All three stages completed; the assistant turn was recorded.
    Completed,
    /// ASR resolved to empty text; LLM/TTS never ran.
    EmptyUtterance,
    /// Cancelled by interruption, stop, or shutdown. No frames owed.
    Cancelled,
    /// A stage failed; the error frame has already been emitted unless the
    /// outbound channel itself is gone.
    Failed(GatewayError),
}
