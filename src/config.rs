//! Configuration types for the voice gateway.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Transport settings (listener, caps, heartbeat).
    pub server: ServerConfig,
    /// Per-session behavior (caps, buffering, interruption).
    pub session: SessionConfig,
    /// Dialogue store settings (history, context budget, eviction).
    pub dialogue: DialogueConfig,
    /// Engine provider selection, one block per capability.
    pub engines: EnginesConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` picks an ephemeral port (used by tests).
    pub port: u16,
    /// WebSocket endpoint path.
    pub path: String,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Maximum accepted text-frame size in bytes.
    pub max_frame_bytes: usize,
    /// Bounded outbound frame queue depth per connection.
    pub outbound_queue: usize,
    /// Deadline for enqueueing an audio frame before the connection is
    /// considered stalled, in milliseconds.
    pub write_timeout_ms: u64,
    /// Server-driven ping period in seconds.
    pub ping_period_secs: u64,
    /// How long a peer may go without a pong before the connection closes,
    /// in seconds.
    pub pong_wait_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8790,
            path: "/ws".to_owned(),
            max_connections: 256,
            max_frame_bytes: 1 << 20,
            outbound_queue: 64,
            write_timeout_ms: 5_000,
            ping_period_secs: 20,
            pong_wait_secs: 45,
        }
    }
}

/// Interaction mode for a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Open mic: audio flows continuously and each utterance starts a turn.
    #[default]
    Continuous,
    /// One utterance per `start_session`, then back to idle.
    Single,
    /// Client-side wake word gates the stream; the server waits for an
    /// explicit `start_session` instead of waking on audio.
    Wakeword,
}

impl SessionMode {
    /// Lowercase wire name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Single => "single",
            Self::Wakeword => "wakeword",
        }
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum live sessions before the oldest is evicted.
    pub max_concurrent_sessions: usize,
    /// Idle time in seconds before a session is swept.
    pub session_timeout_secs: u64,
    /// Sweep period for the idle-session reaper, in seconds.
    pub sweep_interval_secs: u64,
    /// Accumulation-buffer high watermark in bytes. Reaching it flushes the
    /// buffered audio into the pipeline even without an `is_final` chunk.
    pub audio_buffer_size: usize,
    /// Mode assigned to new sessions.
    pub default_mode: SessionMode,
    /// Default gate for audio-driven barge-in while the assistant speaks.
    /// Sessions can override it via `set_mode interrupt`.
    pub enable_interrupt: bool,
    /// How long to wait for a cancelled pipeline to acknowledge before the
    /// session is torn down, in milliseconds.
    pub cancel_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 64,
            session_timeout_secs: 300,
            sweep_interval_secs: 30,
            // 10s of 16 kHz mono s16le.
            audio_buffer_size: 320_000,
            default_mode: SessionMode::Continuous,
            enable_interrupt: true,
            cancel_wait_ms: 1_000,
        }
    }
}

/// Dialogue store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Maximum retained turns per conversation, counting the system turn.
    pub max_history_turns: usize,
    /// Approximate token budget per conversation.
    pub max_context_length: usize,
    /// Maximum conversations held before LRU eviction.
    pub max_conversations: usize,
    /// System prompt seeded into every conversation. Empty disables it.
    pub system_prompt: String,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            max_context_length: 4_096,
            max_conversations: 256,
            system_prompt: "You are a helpful voice assistant. Keep replies short and speakable."
                .to_owned(),
        }
    }
}

/// Engine selection, one block per pipeline capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    /// Speech-to-text provider.
    pub asr: EngineConfig,
    /// Dialogue generation provider.
    pub llm: EngineConfig,
    /// Text-to-speech provider.
    pub tts: EngineConfig,
}

/// Configuration for a single engine slot.
///
/// `provider` selects the adapter factory; everything else in the block is
/// provider-specific and handed to the factory as-is. Options the selected
/// adapter does not recognize are ignored with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registered provider name (`mock`, `openai`, ...).
    pub provider: String,
    /// Per-call deadline in seconds.
    pub timeout_secs: u64,
    /// Provider-specific options, passed through to the adapter factory.
    #[serde(flatten)]
    pub options: toml::Table,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_owned(),
            timeout_secs: 30,
            options: toml::Table::new(),
        }
    }
}

impl EngineConfig {
    /// String option from the provider block.
    #[must_use]
    pub fn opt_str(&self, key: &str) -> Option<String> {
        self.options
            .get(key)
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
    }

    /// Integer option from the provider block.
    #[must_use]
    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.options
            .get(key)
            .and_then(toml::Value::as_integer)
            .and_then(|v| u64::try_from(v).ok())
    }

    /// Float option from the provider block.
    #[must_use]
    pub fn opt_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(toml::Value::as_float)
    }

    /// Boolean option from the provider block.
    #[must_use]
    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(toml::Value::as_bool)
    }

    /// Warn once per key the selected adapter does not consume.
    pub fn warn_unknown_options(&self, known: &[&str]) {
        for key in self.options.keys() {
            if !known.contains(&key.as_str()) {
                tracing::warn!(
                    provider = %self.provider,
                    option = %key,
                    "ignoring unrecognized engine option"
                );
            }
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, interpolating `${VAR}` and
    /// `${VAR:-fallback}` environment references in the raw text first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, references an unset
    /// variable without a fallback, or fails to parse.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let content = interpolate_env(&content)?;
        toml::from_str(&content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Serialize to pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

/// Expand `${VAR}` / `${VAR:-fallback}` references against the process
/// environment. A reference to an unset variable without a fallback is a
/// configuration error; `$` not followed by `{` passes through unchanged.
pub fn interpolate_env(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(GatewayError::Config(format!(
                "unterminated environment reference near `{}`",
                &rest[start..rest.len().min(start + 24)]
            )));
        };
        let inner = &after[..end];
        let (name, fallback) = match inner.split_once(":-") {
            Some((n, f)) => (n, Some(f)),
            None => (inner, None),
        };
        if name.is_empty() {
            return Err(GatewayError::Config(
                "empty environment variable name in `${}`".to_owned(),
            ));
        }
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match fallback {
                Some(f) => out.push_str(f),
                None => {
                    return Err(GatewayError::Config(format!(
                        "environment variable `{name}` is not set"
                    )));
                }
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
