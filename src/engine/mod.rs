//! Pluggable engine adapters for the three pipeline capabilities.
//!
//! Each capability (ASR, LLM, TTS) is a trait with a streaming call and a
//! batch call folded from it. Adapters are process-wide, stateless with
//! respect to sessions, and receive all context as parameters.
//!
//! ## Streaming contract
//!
//! - Every stream terminates: a terminal artifact (`is_complete = true`), an
//!   error item, or the caller's cancellation token firing. The caller sees
//!   exactly one of the three.
//! - Adapters tolerate cancellation at any suspension point and release any
//!   external handles they hold (sockets, subprocesses, files).
//! - Artifacts from one call arrive in order; calls never interleave.
//! - LLM adapters never mutate the conversation view they are handed.

pub mod mock;
pub mod openai;
pub mod registry;

use crate::dialogue::Turn;
use crate::error::{GatewayError, Result, Stage};
use crate::pipeline::messages::StageArtifact;
use crate::protocol::AudioFormat;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use registry::EngineRegistry;

/// Capabilities an adapter can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCapability {
    /// Single-shot processing.
    Batch,
    /// Incremental artifact streaming.
    Stream,
    /// LLM function calling.
    FunctionCall,
    /// TTS synthesis fed delta-by-delta instead of full text.
    IncrementalSynthesis,
}

/// Identity and capability set of a constructed adapter.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    /// Capability slot this adapter fills.
    pub kind: Stage,
    /// Registered provider name.
    pub provider: String,
    /// Backend model identifier.
    pub model: String,
    /// Advertised capabilities.
    pub capabilities: Vec<EngineCapability>,
}

impl EngineDescriptor {
    /// Whether the adapter advertises a capability.
    #[must_use]
    pub fn supports(&self, capability: EngineCapability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Audio handed to an ASR adapter: one accumulated utterance.
#[derive(Debug, Clone)]
pub struct AudioInput {
    /// Encoding of `data`.
    pub format: AudioFormat,
    /// Raw audio bytes.
    pub data: Vec<u8>,
}

/// Lazy, ordered sequence of stage artifacts.
pub type ArtifactStream = Pin<Box<dyn futures_util::Stream<Item = Result<StageArtifact>> + Send>>;

/// Fold a stream to its single final artifact, concatenating text deltas and
/// audio chunks along the way.
///
/// # Errors
///
/// Propagates the first error item; a stream that ends without a terminal
/// artifact is a stage failure.
pub async fn fold_stream(mut stream: ArtifactStream, stage: Stage) -> Result<StageArtifact> {
    let mut content = String::new();
    let mut audio: Vec<u8> = Vec::new();
    let mut confidence = None;
    while let Some(item) = stream.next().await {
        let artifact = item?;
        if artifact.confidence.is_some() {
            confidence = artifact.confidence;
        }
        if let Some(bytes) = &artifact.audio {
            audio.extend_from_slice(bytes);
        }
        if artifact.is_complete {
            let mut folded = if artifact.content.is_empty() && !content.is_empty() {
                StageArtifact::complete(stage, content)
            } else {
                StageArtifact::complete(stage, artifact.content)
            };
            folded.confidence = confidence;
            if !audio.is_empty() {
                folded.audio = Some(audio);
            }
            return Ok(folded);
        }
        content.push_str(&artifact.content);
    }
    Err(GatewayError::Stage {
        stage,
        message: "stream ended without a terminal artifact".to_owned(),
    })
}

/// Speech-to-text adapter contract.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    /// Adapter identity and capabilities.
    fn descriptor(&self) -> &EngineDescriptor;

    /// Transcribe one utterance, yielding intermediate artifacts and a
    /// terminal artifact carrying the full transcript.
    async fn transcribe_stream(
        &self,
        audio: AudioInput,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream>;

    /// Batch form: the streaming call folded to its final artifact.
    async fn transcribe(&self, audio: AudioInput) -> Result<StageArtifact> {
        let stream = self
            .transcribe_stream(audio, CancellationToken::new())
            .await?;
        fold_stream(stream, Stage::Asr).await
    }

    /// Release external handles.
    async fn close(&self) {}
}

/// Dialogue-generation adapter contract.
///
/// `history` is a trimmed snapshot, system turn first; adapters may produce
/// a further-trimmed view for their backend but never persist one.
#[async_trait]
pub trait LlmEngine: Send + Sync {
    /// Adapter identity and capabilities.
    fn descriptor(&self) -> &EngineDescriptor;

    /// Generate a reply, yielding text deltas and a terminal artifact with
    /// the full reply.
    async fn generate_stream(
        &self,
        history: Vec<Turn>,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream>;

    /// Batch form: the streaming call folded to its final artifact.
    async fn generate(&self, history: Vec<Turn>) -> Result<StageArtifact> {
        let stream = self.generate_stream(history, CancellationToken::new()).await?;
        fold_stream(stream, Stage::Llm).await
    }

    /// Release external handles.
    async fn close(&self) {}
}

/// Text-to-speech adapter contract.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Adapter identity and capabilities.
    fn descriptor(&self) -> &EngineDescriptor;

    /// Synthesize the reply text, yielding audio-bearing artifacts and a
    /// terminal artifact.
    async fn synthesize_stream(
        &self,
        text: String,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream>;

    /// Batch form: the streaming call folded to its final artifact.
    async fn synthesize(&self, text: String) -> Result<StageArtifact> {
        let stream = self.synthesize_stream(text, CancellationToken::new()).await?;
        fold_stream(stream, Stage::Tts).await
    }

    /// Release external handles.
    async fn close(&self) {}
}

/// The three adapters a running gateway is wired with.
#[derive(Clone)]
pub struct EngineSet {
    /// Speech-to-text.
    pub asr: Arc<dyn AsrEngine>,
    /// Dialogue generation.
    pub llm: Arc<dyn LlmEngine>,
    /// Text-to-speech.
    pub tts: Arc<dyn TtsEngine>,
}

impl EngineSet {
    /// Close all three adapters.
    pub async fn close(&self) {
        self.asr.close().await;
        self.llm.close().await;
        self.tts.close().await;
    }
}
