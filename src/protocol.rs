//! Wire protocol: the frame envelope and its typed payloads.
//!
//! Frames are JSON text records: `{type, session_id, timestamp, data}`.
//! Binary audio travels inside the envelope as a base64 string — that is the
//! canonical form, and any other JSON shape for `audio_data` is rejected.
//! Decoding validates the envelope and the payload shape together and never
//! yields a partially-decoded frame.

use crate::config::SessionMode;
use crate::error::{GatewayError, Result, Stage};
use serde::{Deserialize, Serialize};

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client → server audio chunk.
    AudioStream,
    /// Client → server control command.
    Command,
    /// Server → client pipeline artifact.
    Response,
    /// Server → client session state report.
    Status,
    /// Server → client classified error.
    Error,
}

impl MessageType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "audio_stream" => Some(Self::AudioStream),
            "command" => Some(Self::Command),
            "response" => Some(Self::Response),
            "status" => Some(Self::Status),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Known audio encodings for `audio_stream` frames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    /// 16 kHz mono signed 16-bit little-endian PCM.
    #[default]
    #[serde(rename = "pcm_16khz_16bit")]
    Pcm16k16bit,
    /// 24 kHz mono signed 16-bit little-endian PCM.
    #[serde(rename = "pcm_24khz_16bit")]
    Pcm24k16bit,
    /// RIFF/WAV container.
    #[serde(rename = "wav")]
    Wav,
    /// Opus frames.
    #[serde(rename = "opus")]
    Opus,
}

/// Serde adapter: `Vec<u8>` as a base64 string, strings only.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(de)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 audio_data: {e}")))
    }
}

/// Serde adapter: optional `Vec<u8>` as a base64 string.
mod base64_bytes_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_str(&STANDARD.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(s) => STANDARD
                .decode(s.as_bytes())
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid base64 audio_data: {e}"))),
        }
    }
}

/// Payload of an `audio_stream` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamPayload {
    /// Audio encoding of this chunk.
    #[serde(default)]
    pub format: AudioFormat,
    /// Strictly increasing per utterance; reordering is a protocol error.
    pub chunk_id: u64,
    /// Closes the current utterance when true.
    #[serde(default)]
    pub is_final: bool,
    /// Raw audio bytes, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub audio_data: Vec<u8>,
}

/// Commands a client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartSession,
    StopSession,
    Pause,
    Resume,
    SetMode,
    GetStatus,
    Interrupt,
    ClearContext,
}

/// Payload of a `command` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// The command to execute.
    pub command: CommandKind,
    /// Mode argument for `start_session` / `set_mode`. Besides the session
    /// modes, `interrupt` is accepted as a per-session barge-in override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Free-form command parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Payload of a `response` frame: one pipeline artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// Originating pipeline stage.
    pub stage: Stage,
    /// Text content (transcript, reply text, or empty for pure audio).
    pub content: String,
    /// Stage-reported confidence, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// True for incremental fragments.
    #[serde(default)]
    pub is_delta: bool,
    /// True for the terminal artifact of this stage.
    pub is_final: bool,
    /// Synthesized audio bytes, base64 on the wire.
    #[serde(default, with = "base64_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub audio_data: Option<Vec<u8>>,
    /// Optional stage metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Session state as reported in `status` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
    Connected,
    Disconnected,
}

/// Conversation reference carried in `status` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Stable conversation identifier; survives reconnects.
    pub conversation_id: String,
    /// Turns currently retained in the conversation.
    pub turns: usize,
}

/// Payload of a `status` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// Current session state.
    pub state: StatusState,
    /// Current session mode.
    pub mode: SessionMode,
    /// Live sessions on the server.
    pub concurrent_streams: usize,
    /// Conversation reference, when bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
}

/// Payload of an `error` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code (`PROTOCOL_ERROR`, `LLM_FAILED`, ...).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether the session survives in a usable state.
    pub recoverable: bool,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&GatewayError> for ErrorPayload {
    fn from(err: &GatewayError) -> Self {
        Self {
            code: err.code().to_owned(),
            message: err.to_string(),
            recoverable: err.recoverable(),
            details: None,
        }
    }
}

/// A decoded payload, tagged by frame type.
#[derive(Debug, Clone)]
pub enum Payload {
    Audio(AudioStreamPayload),
    Command(CommandPayload),
    Response(ResponsePayload),
    Status(StatusPayload),
    Error(ErrorPayload),
}

impl Payload {
    /// The envelope type for this payload.
    #[must_use]
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Audio(_) => MessageType::AudioStream,
            Self::Command(_) => MessageType::Command,
            Self::Response(_) => MessageType::Response,
            Self::Status(_) => MessageType::Status,
            Self::Error(_) => MessageType::Error,
        }
    }

    fn from_value(kind: MessageType, data: serde_json::Value) -> Result<Self> {
        fn shape<T: serde::de::DeserializeOwned>(
            kind: &str,
            data: serde_json::Value,
        ) -> Result<T> {
            serde_json::from_value(data)
                .map_err(|e| GatewayError::Protocol(format!("invalid {kind} payload: {e}")))
        }
        match kind {
            MessageType::AudioStream => Ok(Self::Audio(shape("audio_stream", data)?)),
            MessageType::Command => Ok(Self::Command(shape("command", data)?)),
            MessageType::Response => Ok(Self::Response(shape("response", data)?)),
            MessageType::Status => Ok(Self::Status(shape("status", data)?)),
            MessageType::Error => Ok(Self::Error(shape("error", data)?)),
        }
    }

    fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Self::Audio(p) => serde_json::to_value(p),
            Self::Command(p) => serde_json::to_value(p),
            Self::Response(p) => serde_json::to_value(p),
            Self::Status(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
        };
        value.map_err(|e| GatewayError::Internal(format!("payload serialization failed: {e}")))
    }
}

/// A fully decoded inbound frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Session the frame belongs to.
    pub session_id: String,
    /// Sender timestamp in Unix milliseconds (0 when absent).
    pub timestamp: i64,
    /// The typed payload.
    pub payload: Payload,
}

/// Decode one text frame.
///
/// Validates envelope fields and payload shape together; a frame either
/// decodes completely or yields a classified [`GatewayError::Protocol`].
///
/// # Errors
///
/// Returns `Protocol` on malformed JSON, a missing `type` or `session_id`,
/// an unknown type, or a payload that does not match its type.
pub fn decode(text: &str) -> Result<Frame> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::Protocol(format!("malformed frame: {e}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| GatewayError::Protocol("frame must be a JSON object".to_owned()))?;

    let kind_name = obj
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| GatewayError::Protocol("missing field `type`".to_owned()))?;
    let kind = MessageType::parse(kind_name)
        .ok_or_else(|| GatewayError::Protocol(format!("unknown message type `{kind_name}`")))?;

    let session_id = obj
        .get("session_id")
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Protocol("missing field `session_id`".to_owned()))?
        .to_owned();

    let timestamp = obj
        .get("timestamp")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(0);

    let data = obj
        .get("data")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    let payload = Payload::from_value(kind, data)?;

    Ok(Frame {
        session_id,
        timestamp,
        payload,
    })
}

/// Encode one payload into a text frame, stamped with the current time.
///
/// # Errors
///
/// Returns `Internal` if serialization fails.
pub fn encode(session_id: &str, payload: &Payload) -> Result<String> {
    let envelope = serde_json::json!({
        "type": payload.kind(),
        "session_id": session_id,
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "data": payload.to_value()?,
    });
    serde_json::to_string(&envelope)
        .map_err(|e| GatewayError::Internal(format!("frame serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn roundtrip(payload: Payload) -> Frame {
        let text = encode("s1", &payload).unwrap();
        decode(&text).unwrap()
    }

    #[test]
    fn audio_roundtrip_is_identity() {
        let frame = roundtrip(Payload::Audio(AudioStreamPayload {
            format: AudioFormat::Pcm16k16bit,
            chunk_id: 3,
            is_final: true,
            audio_data: vec![0, 1, 2, 250, 255],
        }));
        assert_eq!(frame.session_id, "s1");
        let Payload::Audio(audio) = frame.payload else {
            panic!("expected audio payload");
        };
        assert_eq!(audio.chunk_id, 3);
        assert!(audio.is_final);
        assert_eq!(audio.audio_data, vec![0, 1, 2, 250, 255]);
    }

    #[test]
    fn command_roundtrip_is_identity() {
        let frame = roundtrip(Payload::Command(CommandPayload {
            command: CommandKind::StartSession,
            mode: Some("continuous".to_owned()),
            parameters: None,
        }));
        let Payload::Command(cmd) = frame.payload else {
            panic!("expected command payload");
        };
        assert_eq!(cmd.command, CommandKind::StartSession);
        assert_eq!(cmd.mode.as_deref(), Some("continuous"));
    }

    #[test]
    fn response_roundtrip_is_identity() {
        let frame = roundtrip(Payload::Response(ResponsePayload {
            stage: Stage::Tts,
            content: String::new(),
            confidence: None,
            is_delta: false,
            is_final: true,
            audio_data: Some(vec![9, 8, 7]),
            metadata: None,
        }));
        let Payload::Response(resp) = frame.payload else {
            panic!("expected response payload");
        };
        assert_eq!(resp.stage, Stage::Tts);
        assert!(resp.is_final);
        assert_eq!(resp.audio_data, Some(vec![9, 8, 7]));
    }

    #[test]
    fn status_and_error_roundtrip() {
        let frame = roundtrip(Payload::Status(StatusPayload {
            state: StatusState::Listening,
            mode: SessionMode::Continuous,
            concurrent_streams: 2,
            session_info: Some(SessionInfo {
                conversation_id: "c1".to_owned(),
                turns: 4,
            }),
        }));
        let Payload::Status(status) = frame.payload else {
            panic!("expected status payload");
        };
        assert_eq!(status.state, StatusState::Listening);
        assert_eq!(status.session_info.unwrap().turns, 4);

        let frame = roundtrip(Payload::Error(ErrorPayload {
            code: "LLM_FAILED".to_owned(),
            message: "llm stage timed out".to_owned(),
            recoverable: true,
            details: None,
        }));
        let Payload::Error(err) = frame.payload else {
            panic!("expected error payload");
        };
        assert_eq!(err.code, "LLM_FAILED");
        assert!(err.recoverable);
    }

    #[test]
    fn missing_type_is_protocol_error() {
        let err = decode(r#"{"session_id":"s1","data":{}}"#).unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert!(err.to_string().contains("`type`"));
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = decode(r#"{"type":"video_stream","session_id":"s1","data":{}}"#).unwrap_err();
        assert!(err.to_string().contains("video_stream"));
    }

    #[test]
    fn missing_session_id_is_protocol_error() {
        let err = decode(r#"{"type":"command","data":{"command":"get_status"}}"#).unwrap_err();
        assert!(err.to_string().contains("`session_id`"));
    }

    #[test]
    fn empty_session_id_is_protocol_error() {
        let err =
            decode(r#"{"type":"command","session_id":"","data":{"command":"get_status"}}"#)
                .unwrap_err();
        assert!(err.to_string().contains("`session_id`"));
    }

    #[test]
    fn payload_shape_mismatch_is_protocol_error() {
        // A command payload under an audio_stream type must not decode.
        let err = decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"command":"start_session"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn audio_data_must_be_base64_string() {
        let err = decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":"$$$not-base64$$$"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("base64"));

        // Byte arrays are rejected: the canonical form is a base64 string.
        let err = decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":[1,2,3]}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let err = decode(
            r#"{"type":"command","session_id":"s1","data":{"command":"reboot"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn timestamp_defaults_to_zero() {
        let frame =
            decode(r#"{"type":"command","session_id":"s1","data":{"command":"get_status"}}"#)
                .unwrap();
        assert_eq!(frame.timestamp, 0);
    }

    #[test]
    fn audio_format_default_is_pcm16k() {
        let frame = decode(
            r#"{"type":"audio_stream","session_id":"s1","data":{"chunk_id":1,"audio_data":"AAA="}}"#,
        )
        .unwrap();
        let Payload::Audio(audio) = frame.payload else {
            panic!("expected audio payload");
        };
        assert_eq!(audio.format, AudioFormat::Pcm16k16bit);
    }
}
