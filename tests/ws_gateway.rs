//! End-to-end gateway tests over real WebSockets.
//!
//! Each test boots a gateway on an ephemeral port with scripted mock engines
//! and drives it with a tokio-tungstenite client, asserting on the exact
//! frame sequences a production client would see.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use voxgate::{GatewayConfig, GatewayServer};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Gateway {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Boot a gateway with the given TOML fragment merged over the defaults.
async fn spawn_gateway(overrides: &str) -> Gateway {
    let mut config: GatewayConfig = toml::from_str(overrides).unwrap();
    config.server.host = "127.0.0.1".to_owned();
    config.server.port = 0;

    let server = GatewayServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let run_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(run_shutdown).await;
    });
    Gateway { addr, shutdown }
}

async fn connect(addr: SocketAddr, session_id: &str) -> (WsSink, WsRead) {
    let url = format!("ws://{addr}/ws?session_id={session_id}");
    let (ws, _) = connect_async(url).await.expect("connect");
    ws.split()
}

async fn send_frame(sink: &mut WsSink, value: Value) {
    sink.send(Message::Text(value.to_string())).await.unwrap();
}

fn command(session_id: &str, command: &str, mode: Option<&str>) -> Value {
    let mut data = json!({ "command": command });
    if let Some(mode) = mode {
        data["mode"] = mode.into();
    }
    json!({
        "type": "command",
        "session_id": session_id,
        "timestamp": 1_700_000_000_000_i64,
        "data": data,
    })
}

fn audio_chunk(session_id: &str, chunk_id: u64, is_final: bool, bytes: &[u8]) -> Value {
    json!({
        "type": "audio_stream",
        "session_id": session_id,
        "timestamp": 1_700_000_000_000_i64,
        "data": {
            "format": "pcm_16khz_16bit",
            "chunk_id": chunk_id,
            "is_final": is_final,
            "audio_data": BASE64.encode(bytes),
        },
    })
}

/// Next JSON frame, skipping transport control messages.
async fn next_frame(read: &mut WsRead) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), read.next())
            .await
            .expect("timed out waiting for frame")?;
        match message.expect("read error") {
            Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
            Message::Close(_) => return None,
            _ => {}
        }
    }
}

/// Collect frames until a `status` frame with the given state arrives
/// (inclusive), or panic on timeout.
async fn frames_until_status(read: &mut WsRead, state: &str) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(read).await.expect("channel closed early");
        let done = frame["type"] == "status" && frame["data"]["state"] == state;
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

fn responses_of<'a>(frames: &'a [Value], stage: &str) -> Vec<&'a Value> {
    frames
        .iter()
        .filter(|f| f["type"] == "response" && f["data"]["stage"] == stage)
        .collect()
}

const SPEECH: [u8; 1024] = [7; 1024];
const SILENCE: [u8; 1024] = [0; 1024];

#[tokio::test]
async fn happy_path_single_turn() {
    let gw = spawn_gateway(
        r#"
        [engines.asr]
        provider = "mock"
        transcript = "你好"

        [engines.llm]
        provider = "mock"
        reply = "你好，我是助手"

        [engines.tts]
        provider = "mock"
        "#,
    )
    .await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let connected = next_frame(&mut read).await.unwrap();
    assert_eq!(connected["type"], "status");
    assert_eq!(connected["data"]["state"], "connected");

    send_frame(&mut sink, command("s1", "start_session", Some("continuous"))).await;
    let listening = next_frame(&mut read).await.unwrap();
    assert_eq!(listening["data"]["state"], "listening");

    send_frame(&mut sink, audio_chunk("s1", 1, false, &SPEECH)).await;
    send_frame(&mut sink, audio_chunk("s1", 2, false, &SPEECH)).await;
    send_frame(&mut sink, audio_chunk("s1", 3, true, &SPEECH)).await;

    let frames = frames_until_status(&mut read, "listening").await;

    // ASR: terminal transcript.
    let asr = responses_of(&frames, "asr");
    let asr_final = asr.iter().find(|f| f["data"]["is_final"] == true).unwrap();
    assert_eq!(asr_final["data"]["content"], "你好");

    // LLM: at least one delta, then the full reply.
    let llm = responses_of(&frames, "llm");
    assert!(llm.iter().any(|f| f["data"]["is_delta"] == true));
    let llm_final = llm.iter().find(|f| f["data"]["is_final"] == true).unwrap();
    assert_eq!(llm_final["data"]["content"], "你好，我是助手");

    // TTS: terminal frame with non-empty audio.
    let tts = responses_of(&frames, "tts");
    let tts_final = tts.iter().find(|f| f["data"]["is_final"] == true).unwrap();
    let audio = BASE64
        .decode(tts_final["data"]["audio_data"].as_str().unwrap())
        .unwrap();
    assert!(!audio.is_empty());

    // Ordering: all asr before the first llm, all llm before the first tts.
    let stages: Vec<&str> = frames
        .iter()
        .filter(|f| f["type"] == "response")
        .map(|f| f["data"]["stage"].as_str().unwrap())
        .collect();
    let first_llm = stages.iter().position(|s| *s == "llm").unwrap();
    let first_tts = stages.iter().position(|s| *s == "tts").unwrap();
    assert!(stages[..first_llm].iter().all(|s| *s == "asr"));
    assert!(stages[first_llm..first_tts].iter().all(|s| *s == "llm"));
    assert!(stages[first_tts..].iter().all(|s| *s == "tts"));

    // Trailing status returned the session to listening (continuous mode).
    assert_eq!(frames.last().unwrap()["data"]["state"], "listening");
}

#[tokio::test]
async fn interrupt_during_speak_starts_fresh_turn() {
    let gw = spawn_gateway(
        r#"
        [session]
        enable_interrupt = true

        [engines.asr]
        provider = "mock"
        transcript = "第一句"

        [engines.llm]
        provider = "mock"
        reply = "这是一个比较长的回答，方便打断"

        [engines.tts]
        provider = "mock"
        chunks = 12
        chunk_delay_ms = 40
        "#,
    )
    .await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await; // connected
    send_frame(&mut sink, command("s1", "start_session", Some("continuous"))).await;
    let _ = next_frame(&mut read).await; // listening

    send_frame(&mut sink, audio_chunk("s1", 1, true, &SPEECH)).await;

    // Wait for TTS audio to start flowing.
    loop {
        let frame = next_frame(&mut read).await.unwrap();
        if frame["type"] == "response" && frame["data"]["stage"] == "tts" {
            break;
        }
    }

    // Barge in with a fresh utterance.
    send_frame(&mut sink, audio_chunk("s1", 1, true, &SPEECH)).await;

    let frames = frames_until_status(&mut read, "listening").await;

    // The interruption was acknowledged with a processing status.
    assert!(
        frames
            .iter()
            .any(|f| f["type"] == "status" && f["data"]["state"] == "processing")
    );
    // A fresh ASR→LLM→TTS sequence ran for the new utterance.
    assert!(
        responses_of(&frames, "asr")
            .iter()
            .any(|f| f["data"]["is_final"] == true)
    );
    assert!(
        responses_of(&frames, "tts")
            .iter()
            .any(|f| f["data"]["is_final"] == true)
    );
}

#[tokio::test]
async fn empty_asr_result_skips_llm_and_tts() {
    let gw = spawn_gateway(
        r#"
        [engines.asr]
        provider = "mock"
        transcript = "unused"
        "#,
    )
    .await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await; // connected
    send_frame(&mut sink, command("s1", "start_session", Some("continuous"))).await;
    let _ = next_frame(&mut read).await; // listening

    // All-zero audio resolves to an empty transcript.
    send_frame(&mut sink, audio_chunk("s1", 1, true, &SILENCE)).await;

    let frames = frames_until_status(&mut read, "listening").await;
    let asr = responses_of(&frames, "asr");
    let asr_final = asr.iter().find(|f| f["data"]["is_final"] == true).unwrap();
    assert_eq!(asr_final["data"]["content"], "");
    assert!(responses_of(&frames, "llm").is_empty());
    assert!(responses_of(&frames, "tts").is_empty());
}

#[tokio::test]
async fn llm_timeout_mid_stream_recovers_to_listening() {
    let gw = spawn_gateway(
        r#"
        [engines.asr]
        provider = "mock"
        transcript = "hi"

        [engines.llm]
        provider = "mock"
        reply = "abcdefghijklmnop"
        delta_chars = 2
        fail_after_deltas = 2
        "#,
    )
    .await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await; // connected
    send_frame(&mut sink, command("s1", "start_session", Some("continuous"))).await;
    let _ = next_frame(&mut read).await; // listening

    send_frame(&mut sink, audio_chunk("s1", 1, true, &SPEECH)).await;

    // Collect until the error frame.
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(&mut read).await.unwrap();
        let is_error = frame["type"] == "error";
        frames.push(frame);
        if is_error {
            break;
        }
    }

    let deltas = responses_of(&frames, "llm")
        .iter()
        .filter(|f| f["data"]["is_delta"] == true)
        .count();
    assert_eq!(deltas, 2);
    let error = frames.last().unwrap();
    assert_eq!(error["data"]["code"], "LLM_FAILED");
    assert_eq!(error["data"]["recoverable"], true);
    assert!(responses_of(&frames, "tts").is_empty());

    // The session is observable and back to listening.
    send_frame(&mut sink, command("s1", "get_status", None)).await;
    let status = next_frame(&mut read).await.unwrap();
    assert_eq!(status["data"]["state"], "listening");
}

#[tokio::test]
async fn session_cap_evicts_oldest() {
    let gw = spawn_gateway(
        r#"
        [session]
        max_concurrent_sessions = 2
        "#,
    )
    .await;

    let (_sink_a, mut read_a) = connect(gw.addr, "a").await;
    let _ = next_frame(&mut read_a).await; // connected
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (mut sink_b, mut read_b) = connect(gw.addr, "b").await;
    let _ = next_frame(&mut read_b).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // C's handshake pushes the registry over the cap; A is the stalest.
    let (mut sink_c, mut read_c) = connect(gw.addr, "c").await;
    let _ = next_frame(&mut read_c).await;

    // A receives a teardown status and its channel closes.
    let mut saw_disconnected = false;
    while let Some(frame) = next_frame(&mut read_a).await {
        if frame["type"] == "status" && frame["data"]["state"] == "disconnected" {
            saw_disconnected = true;
        }
    }
    assert!(saw_disconnected);

    // B and C remain operational.
    send_frame(&mut sink_b, command("b", "get_status", None)).await;
    assert_eq!(next_frame(&mut read_b).await.unwrap()["type"], "status");
    send_frame(&mut sink_c, command("c", "get_status", None)).await;
    assert_eq!(next_frame(&mut read_c).await.unwrap()["type"], "status");
}

#[tokio::test]
async fn reconnect_preserves_conversation() {
    let gw = spawn_gateway(
        r#"
        [engines.asr]
        provider = "mock"
        transcript = "hello"

        [engines.llm]
        provider = "mock"
        reply = "hi there"
        "#,
    )
    .await;

    // First connection: one full turn.
    let (mut sink, mut read) = connect(gw.addr, "s-reconnect").await;
    let connected = next_frame(&mut read).await.unwrap();
    let conversation_id = connected["data"]["session_info"]["conversation_id"]
        .as_str()
        .unwrap()
        .to_owned();
    send_frame(&mut sink, command("s-reconnect", "start_session", Some("continuous"))).await;
    let _ = next_frame(&mut read).await;
    send_frame(&mut sink, audio_chunk("s-reconnect", 1, true, &SPEECH)).await;
    let _ = frames_until_status(&mut read, "listening").await;

    // Drop the channel entirely.
    drop(sink);
    drop(read);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Reconnect with the same session id.
    let (mut sink, mut read) = connect(gw.addr, "s-reconnect").await;
    let connected = next_frame(&mut read).await.unwrap();
    assert_eq!(
        connected["data"]["session_info"]["conversation_id"],
        conversation_id.as_str()
    );

    send_frame(&mut sink, command("s-reconnect", "get_status", None)).await;
    let status = next_frame(&mut read).await.unwrap();
    // system + user + assistant from the first turn are still there.
    assert_eq!(status["data"]["session_info"]["turns"], 3);
}

#[tokio::test]
async fn malformed_frame_yields_protocol_error() {
    let gw = spawn_gateway("").await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await; // connected

    sink.send(Message::Text("{not json".to_owned())).await.unwrap();
    let error = next_frame(&mut read).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "PROTOCOL_ERROR");
    assert_eq!(error["data"]["recoverable"], true);

    // The session is still usable.
    send_frame(&mut sink, command("s1", "get_status", None)).await;
    assert_eq!(next_frame(&mut read).await.unwrap()["type"], "status");
}

#[tokio::test]
async fn chunk_reordering_yields_protocol_error() {
    let gw = spawn_gateway("").await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await;
    send_frame(&mut sink, command("s1", "start_session", Some("continuous"))).await;
    let _ = next_frame(&mut read).await;

    send_frame(&mut sink, audio_chunk("s1", 2, false, &SPEECH)).await;
    send_frame(&mut sink, audio_chunk("s1", 1, false, &SPEECH)).await;

    let error = next_frame(&mut read).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "PROTOCOL_ERROR");
}

#[tokio::test]
async fn health_endpoint_reports_active_sessions() {
    let gw = spawn_gateway("").await;

    let (_sink, mut read) = connect(gw.addr, "s1").await;
    let _ = next_frame(&mut read).await;

    let body: Value = reqwest::get(format!("http://{}/health", gw.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 1);
}

#[tokio::test]
async fn start_session_is_idempotent_over_the_wire() {
    let gw = spawn_gateway("").await;

    let (mut sink, mut read) = connect(gw.addr, "s1").await;
    let connected = next_frame(&mut read).await.unwrap();
    let conversation_id = connected["data"]["session_info"]["conversation_id"].clone();

    send_frame(&mut sink, command("s1", "start_session", None)).await;
    let first = next_frame(&mut read).await.unwrap();
    assert_eq!(first["data"]["state"], "listening");

    send_frame(&mut sink, command("s1", "start_session", None)).await;
    let second = next_frame(&mut read).await.unwrap();
    assert_eq!(second["data"]["state"], "listening");
    assert_eq!(
        second["data"]["session_info"]["conversation_id"],
        conversation_id
    );
}
