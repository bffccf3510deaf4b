//! OpenAI-compatible engine adapters.
//!
//! Works against any backend implementing the OpenAI audio/chat APIs:
//! Ollama, vLLM, llama.cpp server, LocalAI, or the hosted service. One
//! adapter per capability:
//!
//! - ASR: `POST /v1/audio/transcriptions` (multipart)
//! - LLM: `POST /v1/chat/completions` with `stream: true` (SSE)
//! - TTS: `POST /v1/audio/speech` (streamed byte body)

use crate::config::EngineConfig;
use crate::dialogue::{Role, Turn};
use crate::engine::{
    ArtifactStream, AsrEngine, AudioInput, EngineCapability, EngineDescriptor, LlmEngine,
    TtsEngine,
};
use crate::error::{GatewayError, Result, Stage};
use crate::pipeline::messages::StageArtifact;
use crate::protocol::AudioFormat;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared connection details resolved from a provider block.
#[derive(Debug, Clone)]
struct Connection {
    base_url: String,
    model: String,
    api_key: String,
}

impl Connection {
    fn from_config(config: &EngineConfig, slot: Stage) -> Result<Self> {
        let model = config.opt_str("model").unwrap_or_default();
        if model.is_empty() {
            return Err(GatewayError::Config(format!(
                "engines.{}: `model` is required for the openai provider",
                slot.name()
            )));
        }
        Ok(Self {
            base_url: config
                .opt_str("base_url")
                .unwrap_or_else(|| "http://localhost:11434".to_owned()),
            model,
            api_key: config.opt_str("api_key").unwrap_or_default(),
        })
    }

    /// Normalized endpoint URL: tolerate base URLs with or without `/v1`.
    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.strip_suffix("/v1").unwrap_or(&self.base_url);
        let base = base.trim_end_matches('/');
        format!("{base}/v1/{path}")
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))
}

/// Classify a non-success HTTP status for a stage.
fn status_error(stage: Stage, status: reqwest::StatusCode) -> GatewayError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        GatewayError::ProviderUnreachable {
            stage,
            message: format!("backend rejected credentials ({status})"),
        }
    } else {
        GatewayError::Stage {
            stage,
            message: format!("backend returned {status}"),
        }
    }
}

fn transport_error(stage: Stage, err: &reqwest::Error) -> GatewayError {
    GatewayError::ProviderUnreachable {
        stage,
        message: err.to_string(),
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

/// Chat-completions adapter streaming deltas over SSE.
pub struct OpenAiLlm {
    descriptor: EngineDescriptor,
    conn: Connection,
    client: reqwest::Client,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u64>,
}

impl OpenAiLlm {
    const KNOWN_OPTIONS: &'static [&'static str] = &[
        "base_url",
        "model",
        "api_key",
        "temperature",
        "top_p",
        "max_tokens",
    ];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Returns `Config` when `model` is missing or the HTTP client cannot be
    /// built.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        let conn = Connection::from_config(config, Stage::Llm)?;
        info!("openai LLM configured: {} model={}", conn.base_url, conn.model);
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Llm,
                provider: "openai".to_owned(),
                model: conn.model.clone(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            conn,
            client: http_client()?,
            temperature: config.opt_f64("temperature"),
            top_p: config.opt_f64("top_p"),
            max_tokens: config.opt_u64("max_tokens"),
        })
    }

    fn request_body(&self, history: &[Turn]) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                serde_json::json!({ "role": role, "content": turn.content })
            })
            .collect();
        let mut body = serde_json::json!({
            "model": self.conn.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = t.into();
        }
        if let Some(p) = self.top_p {
            body["top_p"] = p.into();
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = m.into();
        }
        body
    }
}

/// Extract the delta content and finish reason from one SSE data line.
fn parse_chat_chunk(data: &str) -> Result<(Option<String>, bool)> {
    let chunk: serde_json::Value = serde_json::from_str(data).map_err(|e| GatewayError::Stage {
        stage: Stage::Llm,
        message: format!("malformed stream chunk: {e}"),
    })?;
    let delta = chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    let finished = chunk["choices"][0]["finish_reason"].as_str() == Some("stop");
    Ok((delta, finished))
}

#[async_trait]
impl LlmEngine for OpenAiLlm {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn generate_stream(
        &self,
        history: Vec<Turn>,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let url = self.conn.endpoint("chat/completions");
        let request = self
            .conn
            .apply_auth(self.client.post(&url))
            .json(&self.request_body(&history));

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            res = request.send() => res.map_err(|e| transport_error(Stage::Llm, &e))?,
        };
        if !response.status().is_success() {
            return Err(status_error(Stage::Llm, response.status()));
        }

        let mut body = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            let mut buffer = String::new();
            let mut full = String::new();
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("chat completion stream cancelled");
                        return;
                    }
                    chunk = body.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(transport_error(Stage::Llm, &e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_owned();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        yield Ok(StageArtifact::complete(Stage::Llm, full));
                        return;
                    }
                    match parse_chat_chunk(data) {
                        Ok((delta, finished)) => {
                            if let Some(text) = delta {
                                full.push_str(&text);
                                yield Ok(StageArtifact::delta(Stage::Llm, text));
                            }
                            if finished {
                                yield Ok(StageArtifact::complete(Stage::Llm, full));
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
            // Body ended without an explicit terminator; the accumulated
            // text is still the complete reply.
            yield Ok(StageArtifact::complete(Stage::Llm, full));
        }))
    }
}

// ---------------------------------------------------------------------------
// ASR
// ---------------------------------------------------------------------------

/// Transcriptions adapter. The utterance is uploaded in one multipart request
/// and the transcript comes back as a single terminal artifact.
pub struct OpenAiAsr {
    descriptor: EngineDescriptor,
    conn: Connection,
    client: reqwest::Client,
    language: Option<String>,
}

impl OpenAiAsr {
    const KNOWN_OPTIONS: &'static [&'static str] = &["base_url", "model", "api_key", "language"];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Returns `Config` when `model` is missing or the HTTP client cannot be
    /// built.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        let conn = Connection::from_config(config, Stage::Asr)?;
        info!("openai ASR configured: {} model={}", conn.base_url, conn.model);
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Asr,
                provider: "openai".to_owned(),
                model: conn.model.clone(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            conn,
            client: http_client()?,
            language: config.opt_str("language"),
        })
    }
}

fn upload_file_name(format: AudioFormat) -> (&'static str, &'static str) {
    match format {
        AudioFormat::Wav => ("audio.wav", "audio/wav"),
        AudioFormat::Opus => ("audio.opus", "audio/ogg"),
        AudioFormat::Pcm16k16bit | AudioFormat::Pcm24k16bit => {
            ("audio.raw", "application/octet-stream")
        }
    }
}

#[async_trait]
impl AsrEngine for OpenAiAsr {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn transcribe_stream(
        &self,
        audio: AudioInput,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let url = self.conn.endpoint("audio/transcriptions");
        let (file_name, mime) = upload_file_name(audio.format);
        let part = reqwest::multipart::Part::bytes(audio.data)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| GatewayError::Internal(format!("invalid upload mime: {e}")))?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.conn.model.clone())
            .part("file", part);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let request = self.conn.apply_auth(self.client.post(&url)).multipart(form);
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            res = request.send() => res.map_err(|e| transport_error(Stage::Asr, &e))?,
        };
        if !response.status().is_success() {
            return Err(status_error(Stage::Asr, response.status()));
        }

        let body: serde_json::Value = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            body = response.json() => body.map_err(|e| GatewayError::Stage {
                stage: Stage::Asr,
                message: format!("malformed transcription response: {e}"),
            })?,
        };
        let text = body["text"].as_str().unwrap_or_default().to_owned();

        Ok(Box::pin(futures_util::stream::once(async move {
            Ok(StageArtifact::complete(Stage::Asr, text))
        })))
    }
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

/// Speech-synthesis adapter streaming the response body as audio artifacts.
pub struct OpenAiTts {
    descriptor: EngineDescriptor,
    conn: Connection,
    client: reqwest::Client,
    voice: String,
    response_format: String,
}

impl OpenAiTts {
    const KNOWN_OPTIONS: &'static [&'static str] =
        &["base_url", "model", "api_key", "voice", "response_format"];

    /// Build from the provider block.
    ///
    /// # Errors
    ///
    /// Returns `Config` when `model` is missing or the HTTP client cannot be
    /// built.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.warn_unknown_options(Self::KNOWN_OPTIONS);
        let conn = Connection::from_config(config, Stage::Tts)?;
        info!("openai TTS configured: {} model={}", conn.base_url, conn.model);
        Ok(Self {
            descriptor: EngineDescriptor {
                kind: Stage::Tts,
                provider: "openai".to_owned(),
                model: conn.model.clone(),
                capabilities: vec![EngineCapability::Batch, EngineCapability::Stream],
            },
            conn,
            client: http_client()?,
            voice: config.opt_str("voice").unwrap_or_else(|| "alloy".to_owned()),
            response_format: config
                .opt_str("response_format")
                .unwrap_or_else(|| "pcm".to_owned()),
        })
    }
}

#[async_trait]
impl TtsEngine for OpenAiTts {
    fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    async fn synthesize_stream(
        &self,
        text: String,
        cancel: CancellationToken,
    ) -> Result<ArtifactStream> {
        let url = self.conn.endpoint("audio/speech");
        let body = serde_json::json!({
            "model": self.conn.model,
            "input": text,
            "voice": self.voice,
            "response_format": self.response_format,
        });

        let request = self.conn.apply_auth(self.client.post(&url)).json(&body);
        let response = tokio::select! {
            () = cancel.cancelled() => return Err(GatewayError::Cancelled),
            res = request.send() => res.map_err(|e| transport_error(Stage::Tts, &e))?,
        };
        if !response.status().is_success() {
            return Err(status_error(Stage::Tts, response.status()));
        }

        let mut body = response.bytes_stream();
        Ok(Box::pin(async_stream::stream! {
            // One-chunk lookahead so the last chunk can carry the terminal
            // flag.
            let mut pending: Option<Vec<u8>> = None;
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("speech stream cancelled");
                        return;
                    }
                    chunk = body.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(prev) = pending.replace(bytes.to_vec()) {
                            yield Ok(StageArtifact::audio(Stage::Tts, prev, false));
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(transport_error(Stage::Tts, &e));
                        return;
                    }
                    None => break,
                }
            }
            yield Ok(StageArtifact::audio(Stage::Tts, pending.unwrap_or_default(), true));
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn engine_config(extra: &str) -> EngineConfig {
        toml::from_str(&format!("provider = \"openai\"\n{extra}")).unwrap()
    }

    #[test]
    fn missing_model_is_config_error() {
        let err = OpenAiLlm::from_config(&engine_config("")).err().unwrap();
        assert_eq!(err.code(), "CONFIG_INVALID");
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn endpoint_tolerates_v1_suffix() {
        let conn = Connection {
            base_url: "http://host:8080/v1".to_owned(),
            model: "m".to_owned(),
            api_key: String::new(),
        };
        assert_eq!(
            conn.endpoint("chat/completions"),
            "http://host:8080/v1/chat/completions"
        );

        let conn = Connection {
            base_url: "http://host:8080/".to_owned(),
            model: "m".to_owned(),
            api_key: String::new(),
        };
        assert_eq!(
            conn.endpoint("audio/speech"),
            "http://host:8080/v1/audio/speech"
        );
    }

    #[test]
    fn chat_chunk_parsing() {
        let (delta, finished) =
            parse_chat_chunk(r#"{"choices":[{"delta":{"content":"hi"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(delta.as_deref(), Some("hi"));
        assert!(!finished);

        let (delta, finished) =
            parse_chat_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(delta, None);
        assert!(finished);

        assert!(parse_chat_chunk("not json").is_err());
    }

    #[test]
    fn upload_names_follow_format() {
        assert_eq!(upload_file_name(AudioFormat::Wav).0, "audio.wav");
        assert_eq!(
            upload_file_name(AudioFormat::Pcm16k16bit).1,
            "application/octet-stream"
        );
    }
}
