//! Deterministic in-process engines.
//!
//! The `mock` provider needs no backend: ASR yields a scripted transcript,
//! the LLM echoes or replays a scripted reply, and TTS synthesizes a
//! deterministic PCM tone. It backs the integration suite (including scripted
//! failures and artificial latency) and lets the gateway run end-to-end on a
//! machine with no models at all.

use crate::config::EngineConfig;
use crate::dialogue::{Role, Turn};
use crate::engine::{
    ArtifactStream, AsrEngine, AudioInput, EngineCapability, EngineDescriptor, LlmEngine,
    TtsEngine,
};
use crate::error::{GatewayError, Result, Stage};
use crate::pipeline::messages::StageArtifact;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleep that returns `true` when the token fired instead.
async fn cancellable_sleep(delay_ms: u64, cancel: &CancellationToken) -> bool {
    if delay_ms == 0 {
        return cancel.is_cancelled();
    }
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
    }
}

/// Scripted speech-to-text.
///
/// Non-silent audio transcribes to the configured `transcript`; all-zero
/// audio transcribes to the empty string, which the pipeline treats as a
/// no-op utterance.
pub struct MockAsr {
    descriptor: EngineDescriptor,
    transcript: String,
    emit_partial: bool,
    delay_ms: u64,
}

impl MockAsr {
    const KNOWN_OPTIONS: &'static [&'static str] = &["transcript", "partial", "delay_ms"];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Never fails today; signature matches the factory contract.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Asr,
                provider: "mock".to_owned(),
                model: "scripted".to_owned(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            transcript: config.opt_str("transcript").unwrap_or_else(|| "hello".to_owned()),
            emit_partial: config.opt_bool("partial").unwrap_or(true),
            delay_ms: config.opt_u64("delay_ms").unwrap_or(0),
        })
    }
}

#[async_trait]
impl AsrEngine for MockAsr {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn transcribe_stream(
        &self,
        audio: AudioInput,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let silent = audio.data.iter().all(|b| *b == 0);
        let transcript = if silent { String::new() } else { self.transcript.clone() };
        let emit_partial = self.emit_partial && !transcript.is_empty();
        let delay_ms = self.delay_ms;

        Ok(Box::pin(async_stream::stream! {
            if cancellable_sleep(delay_ms, &cancel).await {
                return;
            }
            if emit_partial {
                let half: String = transcript
                    .chars()
                    .take(transcript.chars().count().div_ceil(2))
                    .collect();
                yield Ok(StageArtifact::delta(Stage::Asr, half).with_confidence(0.5));
                if cancellable_sleep(delay_ms, &cancel).await {
                    return;
                }
            }
            yield Ok(StageArtifact::complete(Stage::Asr, transcript).with_confidence(0.95));
        }))
    }
}

/// Scripted dialogue generation.
///
/// With a `reply` configured the reply is fixed; otherwise the last user turn
/// is echoed back. `fail_after_deltas` injects a timeout mid-stream for
/// failure-path tests.
pub struct MockLlm {
    descriptor: EngineDescriptor,
    reply: Option<String>,
    delta_chars: usize,
    delta_delay_ms: u64,
    fail_after_deltas: Option<u64>,
}

impl MockLlm {
    const KNOWN_OPTIONS: &'static [&'static str] =
        &["reply", "delta_chars", "delta_delay_ms", "fail_after_deltas"];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `delta_chars` is zero.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        let delta_chars = usize::try_from(config.opt_u64("delta_chars").unwrap_or(4))
            .map_err(|_| GatewayError::Config("delta_chars out of range".to_owned()))?;
        if delta_chars == 0 {
            return Err(GatewayError::Config("delta_chars must be positive".to_owned()));
        }
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Llm,
                provider: "mock".to_owned(),
                model: "scripted".to_owned(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            reply: config.opt_str("reply"),
            delta_chars,
            delta_delay_ms: config.opt_u64("delta_delay_ms").unwrap_or(0),
            fail_after_deltas: config.opt_u64("fail_after_deltas"),
        })
    }

    fn reply_for(&self, history: &[Turn]) -> String {
        if let Some(reply) = &self.reply {
            return reply.clone();
        }
        let last_user = history
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map_or("", |t| t.content.as_str());
        format!("You said: {last_user}")
    }
}

#[async_trait]
impl LlmEngine for MockLlm {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn generate_stream(
        &self,
        history: Vec<Turn>,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let reply = self.reply_for(&history);
        let delta_chars = self.delta_chars;
        let delay_ms = self.delta_delay_ms;
        let fail_after = self.fail_after_deltas;

        Ok(Box::pin(async_stream::stream! {
            let chars: Vec<char> = reply.chars().collect();
            let mut emitted: u64 = 0;
            for piece in chars.chunks(delta_chars) {
                if fail_after.is_some_and(|limit| emitted >= limit) {
                    yield Err(GatewayError::ProviderTimeout(Stage::Llm));
                    return;
                }
                if cancellable_sleep(delay_ms, &cancel).await {
                    return;
                }
                yield Ok(StageArtifact::delta(Stage::Llm, piece.iter().collect::<String>()));
                emitted += 1;
            }
            if fail_after.is_some_and(|limit| emitted >= limit) {
                yield Err(GatewayError::ProviderTimeout(Stage::Llm));
                return;
            }
            yield Ok(StageArtifact::complete(Stage::Llm, reply));
        }))
    }
}

/// Deterministic text-to-speech.
///
/// Synthesizes a triangle-wave PCM16 buffer sized by the reply length and
/// streams it in `chunks` pieces, the last one terminal.
pub struct MockTts {
    descriptor: EngineDescriptor,
    bytes_per_char: usize,
    chunks: usize,
    chunk_delay_ms: u64,
}

impl MockTts {
    const KNOWN_OPTIONS: &'static [&'static str] = &["bytes_per_char", "chunks", "chunk_delay_ms"];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `chunks` is zero.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        let chunks = usize::try_from(config.opt_u64("chunks").unwrap_or(2))
            .map_err(|_| GatewayError::Config("chunks out of range".to_owned()))?;
        if chunks == 0 {
            return Err(GatewayError::Config("chunks must be positive".to_owned()));
        }
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Tts,
                provider: "mock".to_owned(),
                model: "triangle".to_owned(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            bytes_per_char: usize::try_from(config.opt_u64("bytes_per_char").unwrap_or(64))
                .unwrap_or(64),
            chunks,
            chunk_delay_ms: config.opt_u64("chunk_delay_ms").unwrap_or(0),
        })
    }
}

/// Triangle-wave PCM16 of a deterministic length derived from the text.
fn synth_pcm(text: &str, bytes_per_char: usize) -> Vec<u8> {
    let samples = (text.chars().count().max(1) * bytes_per_char.max(2)) / 2;
    let mut out = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let phase = i32::try_from(i % 100).unwrap_or(0);
        let value = i16::try_from((phase - 50).abs() * 600 - 15_000).unwrap_or(0);
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

#[async_trait]
impl TtsEngine for MockTts {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn synthesize_stream(
        &self,
        text: String,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let pcm = synth_pcm(&text, self.bytes_per_char);
        let chunk_len = pcm.len().div_ceil(self.chunks).max(2);
        let delay_ms = self.chunk_delay_ms;

        Ok(Box::pin(async_stream::stream! {
            let pieces: Vec<Vec<u8>> = pcm.chunks(chunk_len).map(<[u8]>::to_vec).collect();
            let last = pieces.len().saturating_sub(1);
            for (i, piece) in pieces.into_iter().enumerate() {
                if cancellable_sleep(delay_ms, &cancel).await {
                    return;
                }
                yield Ok(StageArtifact::audio(Stage::Tts, piece, i == last));
            }
        }))
    }
}
