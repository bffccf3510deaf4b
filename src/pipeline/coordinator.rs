//! Runs one utterance through the ASR → LLM → TTS composition.
//!
//! The coordinator owns everything turn-scoped: stage sequencing, per-stage
//! deadlines, cancellation, frame forwarding, and the backpressure policy on
//! the session's bounded outbound queue. The owning session spawns one
//! coordinator task per turn and applies the resulting [`TurnOutcome`] to its
//! state machine.

use crate::config::EnginesConfig;
use crate::dialogue::{ConversationStore, Turn};
use crate::engine::{ArtifactStream, AudioInput, EngineSet};
use crate::error::{GatewayError, Result, Stage};
use crate::pipeline::messages::{StageArtifact, TurnOutcome};
use crate::protocol::{ErrorPayload, Payload};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-stage call deadlines.
#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    /// ASR deadline.
    pub asr: Duration,
    /// LLM deadline, applied per artifact await.
    pub llm: Duration,
    /// TTS deadline, applied per artifact await.
    pub tts: Duration,
}

impl StageTimeouts {
    /// Read the deadlines out of the engine configuration.
    #[must_use]
    pub fn from_config(config: &EnginesConfig) -> Self {
        Self {
            asr: Duration::from_secs(config.asr.timeout_secs),
            llm: Duration::from_secs(config.llm.timeout_secs),
            tts: Duration::from_secs(config.tts.timeout_secs),
        }
    }
}

/// Everything one turn needs, captured at flush time.
pub struct TurnInput {
    /// Owning session id (log context only).
    pub session_id: String,
    /// Conversation to read and append to.
    pub conversation_id: String,
    /// The accumulated utterance.
    pub audio: AudioInput,
    /// Process-wide engine adapters.
    pub engines: EngineSet,
    /// Dialogue store.
    pub store: Arc<dyn ConversationStore>,
    /// Bounded outbound frame queue (single producer: this turn).
    pub outbound: mpsc::Sender<Payload>,
    /// Per-stage deadlines.
    pub timeouts: StageTimeouts,
    /// Deadline for enqueueing an audio frame before the connection is
    /// declared stalled.
    pub write_timeout: Duration,
    /// Fired once when the first TTS audio artifact arrives, so the session
    /// can move `Processing → Speaking`.
    pub speaking_tx: Option<oneshot::Sender<()>>,
}

/// Run one turn to completion, cancellation, or failure.
///
/// Failures (except a dead outbound channel) have already been surfaced as
/// an `error` frame by the time this returns.
pub async fn run_turn(input: TurnInput, cancel: CancellationToken) -> TurnOutcome {
    // A concurrently-arrived stop command wins: the pipeline never launches.
    if cancel.is_cancelled() {
        return TurnOutcome::Cancelled;
    }
    let session_id = input.session_id.clone();
    let outbound = input.outbound.clone();
    match run_stages(input, &cancel).await {
        Ok(outcome) => outcome,
        Err(GatewayError::Cancelled) => {
            debug!(session_id = %session_id, "pipeline cancelled");
            TurnOutcome::Cancelled
        }
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "pipeline failed");
            if !matches!(err, GatewayError::Channel(_)) {
                let _ = send_meta(&outbound, Payload::Error(ErrorPayload::from(&err)));
            }
            TurnOutcome::Failed(err)
        }
    }
}

async fn run_stages(mut input: TurnInput, cancel: &CancellationToken) -> Result<TurnOutcome> {
    // -- ASR --
    let stream = stage_call(
        cancel,
        input.timeouts.asr,
        Stage::Asr,
        input
            .engines
            .asr
            .transcribe_stream(input.audio.clone(), cancel.child_token()),
    )
    .await?;
    let transcript = drive_asr(&input, stream, cancel).await?;

    // ASR gate: an empty utterance ends the turn without invoking LLM/TTS.
    if transcript.trim().is_empty() {
        info!(session_id = %input.session_id, "empty transcript, skipping LLM/TTS");
        return Ok(TurnOutcome::EmptyUtterance);
    }

    input
        .store
        .append(&input.conversation_id, Turn::user(transcript))
        .await?;
    let history = input.store.history(&input.conversation_id).await;
    if cancel.is_cancelled() {
        return Err(GatewayError::Cancelled);
    }

    // -- LLM --
    let stream = stage_call(
        cancel,
        input.timeouts.llm,
        Stage::Llm,
        input
            .engines
            .llm
            .generate_stream(history, cancel.child_token()),
    )
    .await?;
    let reply = drive_llm(&input, stream, cancel).await?;

    // -- TTS --
    // Baseline handoff: the full reply, not delta-by-delta.
    let stream = stage_call(
        cancel,
        input.timeouts.tts,
        Stage::Tts,
        input
            .engines
            .tts
            .synthesize_stream(reply.clone(), cancel.child_token()),
    )
    .await?;
    drive_tts(&mut input, stream, cancel).await?;

    // The assistant turn is recorded only now: TTS reached its terminal
    // artifact without cancellation, so no partial reply can persist.
    input
        .store
        .append(&input.conversation_id, Turn::assistant(reply))
        .await?;

    Ok(TurnOutcome::Completed)
}

/// Forward ASR artifacts and return the final transcript.
async fn drive_asr(
    input: &TurnInput,
    mut stream: ArtifactStream,
    cancel: &CancellationToken,
) -> Result<String> {
    while let Some(artifact) =
        stage_next(&mut stream, input.timeouts.asr, cancel, Stage::Asr).await?
    {
        send_meta(&input.outbound, Payload::Response(artifact.to_response()))?;
        if artifact.is_complete {
            return Ok(artifact.content);
        }
    }
    Err(stream_ended(cancel, Stage::Asr))
}

/// Forward LLM deltas and return the full reply.
async fn drive_llm(
    input: &TurnInput,
    mut stream: ArtifactStream,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut accumulated = String::new();
    while let Some(artifact) =
        stage_next(&mut stream, input.timeouts.llm, cancel, Stage::Llm).await?
    {
        if artifact.is_complete {
            let reply = if artifact.content.is_empty() {
                accumulated
            } else {
                artifact.content.clone()
            };
            let mut terminal = artifact;
            terminal.content = reply.clone();
            send_meta(&input.outbound, Payload::Response(terminal.to_response()))?;
            return Ok(reply);
        }
        accumulated.push_str(&artifact.content);
        send_meta(&input.outbound, Payload::Response(artifact.to_response()))?;
    }
    Err(stream_ended(cancel, Stage::Llm))
}

/// Forward TTS artifacts, signalling `Speaking` on the first audio.
async fn drive_tts(
    input: &mut TurnInput,
    mut stream: ArtifactStream,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut saw_terminal = false;
    while let Some(artifact) =
        stage_next(&mut stream, input.timeouts.tts, cancel, Stage::Tts).await?
    {
        if artifact.audio.is_some()
            && let Some(tx) = input.speaking_tx.take()
        {
            let _ = tx.send(());
        }
        let terminal = artifact.is_complete;
        let payload = Payload::Response(artifact.to_response());
        if artifact.audio.is_some() {
            // Audio is never dropped silently: block up to the write
            // deadline, then escalate to connection shutdown.
            send_audio(&input.outbound, payload, input.write_timeout, cancel).await?;
        } else {
            send_meta(&input.outbound, payload)?;
        }
        if terminal {
            saw_terminal = true;
            break;
        }
    }
    if saw_terminal {
        Ok(())
    } else {
        Err(stream_ended(cancel, Stage::Tts))
    }
}

/// Classify a stream that ended without a terminal artifact: under an active
/// cancellation that is the adapter honoring the token, otherwise it is a
/// broken streaming contract.
fn stream_ended(cancel: &CancellationToken, stage: Stage) -> GatewayError {
    if cancel.is_cancelled() {
        GatewayError::Cancelled
    } else {
        GatewayError::Stage {
            stage,
            message: "stream ended without a terminal artifact".to_owned(),
        }
    }
}

/// Await a stage-scoped future under the cancellation token and deadline.
async fn stage_call<T>(
    cancel: &CancellationToken,
    deadline: Duration,
    stage: Stage,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(GatewayError::Cancelled),
        res = tokio::time::timeout(deadline, fut) => match res {
            Err(_) => Err(GatewayError::ProviderTimeout(stage)),
            Ok(inner) => inner.map_err(|e| tag_stage(e, stage)),
        },
    }
}

/// Await the next artifact under the cancellation token and deadline.
async fn stage_next(
    stream: &mut ArtifactStream,
    deadline: Duration,
    cancel: &CancellationToken,
    stage: Stage,
) -> Result<Option<StageArtifact>> {
    tokio::select! {
        () = cancel.cancelled() => Err(GatewayError::Cancelled),
        item = tokio::time::timeout(deadline, stream.next()) => match item {
            Err(_) => Err(GatewayError::ProviderTimeout(stage)),
            Ok(None) => Ok(None),
            Ok(Some(Ok(artifact))) => Ok(Some(artifact)),
            Ok(Some(Err(e))) => Err(tag_stage(e, stage)),
        },
    }
}

/// Attribute an untagged engine error to its stage.
fn tag_stage(err: GatewayError, stage: Stage) -> GatewayError {
    match err {
        GatewayError::Cancelled
        | GatewayError::Channel(_)
        | GatewayError::ProviderUnreachable { .. }
        | GatewayError::ProviderTimeout(_)
        | GatewayError::Stage { .. } => err,
        other => GatewayError::Stage {
            stage,
            message: other.to_string(),
        },
    }
}

/// Best-effort metadata send: drop on a full queue, fail on a closed one.
pub(crate) fn send_meta(outbound: &mpsc::Sender<Payload>, payload: Payload) -> Result<()> {
    match outbound.try_send(payload) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            debug!(kind = ?dropped.kind(), "outbound queue full, dropping metadata frame");
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(GatewayError::Channel("outbound queue closed".to_owned()))
        }
    }
}

/// Bounded audio send: stall up to the write deadline, never drop.
async fn send_audio(
    outbound: &mpsc::Sender<Payload>,
    payload: Payload,
    write_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        () = cancel.cancelled() => Err(GatewayError::Cancelled),
        res = tokio::time::timeout(write_timeout, outbound.send(payload)) => match res {
            Err(_) => Err(GatewayError::Channel(
                "outbound queue stalled past write timeout".to_owned(),
            )),
            Ok(Err(_)) => Err(GatewayError::Channel("outbound queue closed".to_owned())),
            Ok(Ok(())) => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::config::{DialogueConfig, EngineConfig};
    use crate::dialogue::{InMemoryDialogueStore, Role};
    use crate::engine::EngineRegistry;
    use crate::protocol::AudioFormat;

    fn engine_config(extra: &str) -> EngineConfig {
        toml::from_str(&format!("provider = \"mock\"\n{extra}")).unwrap()
    }

    fn mock_engines(asr: &str, llm: &str, tts: &str) -> EngineSet {
        let registry = EngineRegistry::with_builtins();
        EngineSet {
            asr: registry.build_asr(&engine_config(asr)).unwrap(),
            llm: registry.build_llm(&engine_config(llm)).unwrap(),
            tts: registry.build_tts(&engine_config(tts)).unwrap(),
        }
    }

    struct Fixture {
        store: Arc<InMemoryDialogueStore>,
        rx: mpsc::Receiver<Payload>,
        input: TurnInput,
    }

    fn fixture(engines: EngineSet, audio: Vec<u8>) -> Fixture {
        let store = Arc::new(InMemoryDialogueStore::new(DialogueConfig::default()));
        let (tx, rx) = mpsc::channel(64);
        let input = TurnInput {
            session_id: "s1".to_owned(),
            conversation_id: "c1".to_owned(),
            audio: AudioInput {
                format: AudioFormat::Pcm16k16bit,
                data: audio,
            },
            engines,
            store: store.clone(),
            outbound: tx,
            timeouts: StageTimeouts {
                asr: Duration::from_secs(5),
                llm: Duration::from_secs(5),
                tts: Duration::from_secs(5),
            },
            write_timeout: Duration::from_millis(500),
            speaking_tx: None,
        };
        Fixture { store, rx, input }
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Payload> {
        let mut frames = Vec::new();
        while let Ok(p) = rx.try_recv() {
            frames.push(p);
        }
        frames
    }

    #[tokio::test]
    async fn happy_path_orders_stages_and_records_turns() {
        let engines = mock_engines("transcript = \"hi\"", "reply = \"hello there\"", "");
        let mut fx = fixture(engines, vec![1, 2, 3]);

        let outcome = run_turn(fx.input, CancellationToken::new()).await;
        assert!(matches!(outcome, TurnOutcome::Completed));

        let frames = drain(&mut fx.rx);
        let stages: Vec<Stage> = frames
            .iter()
            .filter_map(|p| match p {
                Payload::Response(r) => Some(r.stage),
                _ => None,
            })
            .collect();
        // asr* llm* tts*: strictly non-interleaved stage ordering.
        let first_llm = stages.iter().position(|s| *s == Stage::Llm).unwrap();
        let first_tts = stages.iter().position(|s| *s == Stage::Tts).unwrap();
        assert!(stages[..first_llm].iter().all(|s| *s == Stage::Asr));
        assert!(stages[first_llm..first_tts].iter().all(|s| *s == Stage::Llm));
        assert!(stages[first_tts..].iter().all(|s| *s == Stage::Tts));

        let history = fx.store.history("c1").await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, Role::User);
        assert_eq!(history[1].content, "hi");
        assert_eq!(history[2].role, Role::Assistant);
        assert_eq!(history[2].content, "hello there");
    }

    #[tokio::test]
    async fn empty_transcript_skips_llm_and_tts() {
        let engines = mock_engines("", "", "");
        let mut fx = fixture(engines, vec![0; 32]);

        let outcome = run_turn(fx.input, CancellationToken::new()).await;
        assert!(matches!(outcome, TurnOutcome::EmptyUtterance));

        let frames = drain(&mut fx.rx);
        assert!(frames.iter().all(|p| matches!(
            p,
            Payload::Response(r) if r.stage == Stage::Asr
        )));
        // Nothing was recorded: the empty utterance never reached the store.
        assert_eq!(fx.store.turn_count("c1").await, 0);
    }

    #[tokio::test]
    async fn llm_failure_emits_error_and_keeps_deltas() {
        let engines = mock_engines(
            "transcript = \"hi\"",
            "reply = \"abcdefghijkl\"\ndelta_chars = 2\nfail_after_deltas = 2",
            "",
        );
        let mut fx = fixture(engines, vec![1, 2, 3]);

        let outcome = run_turn(fx.input, CancellationToken::new()).await;
        let TurnOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.code(), "LLM_FAILED");
        assert!(err.recoverable());

        let frames = drain(&mut fx.rx);
        let llm_deltas = frames
            .iter()
            .filter(|p| matches!(p, Payload::Response(r) if r.stage == Stage::Llm && r.is_delta))
            .count();
        assert_eq!(llm_deltas, 2);
        let errors: Vec<&ErrorPayload> = frames
            .iter()
            .filter_map(|p| match p {
                Payload::Error(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "LLM_FAILED");
        assert!(errors[0].recoverable);
        assert!(frames
            .iter()
            .all(|p| !matches!(p, Payload::Response(r) if r.stage == Stage::Tts)));

        // No assistant turn was appended; the user turn stays.
        let history = fx.store.history("c1").await;
        assert_eq!(history.last().unwrap().role, Role::User);
    }

    #[tokio::test]
    async fn cancellation_leaves_no_assistant_turn() {
        let engines = mock_engines(
            "transcript = \"hi\"",
            "reply = \"a slow reply streaming out\"\ndelta_chars = 2\ndelta_delay_ms = 30",
            "",
        );
        let fx = fixture(engines, vec![1, 2, 3]);
        let store = fx.store.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_turn(fx.input, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Cancelled));

        let history = store.history("c1").await;
        assert!(history.iter().all(|t| t.role != Role::Assistant));
    }

    #[tokio::test]
    async fn pre_cancelled_turn_never_launches() {
        let engines = mock_engines("transcript = \"hi\"", "", "");
        let fx = fixture(engines, vec![1, 2, 3]);
        let store = fx.store.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run_turn(fx.input, cancel).await;
        assert!(matches!(outcome, TurnOutcome::Cancelled));
        assert_eq!(store.turn_count("c1").await, 0);
    }

    #[tokio::test]
    async fn speaking_signal_fires_on_first_audio() {
        let engines = mock_engines("transcript = \"hi\"", "", "");
        let mut fx = fixture(engines, vec![1, 2, 3]);
        let (tx, rx) = oneshot::channel();
        fx.input.speaking_tx = Some(tx);

        let outcome = run_turn(fx.input, CancellationToken::new()).await;
        assert!(matches!(outcome, TurnOutcome::Completed));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn stage_timeout_is_stage_tagged() {
        let engines = mock_engines(
            "transcript = \"hi\"",
            "reply = \"slow\"\ndelta_delay_ms = 5000",
            "",
        );
        let mut fx = fixture(engines, vec![1, 2, 3]);
        fx.input.timeouts.llm = Duration::from_millis(50);

        let outcome = run_turn(fx.input, CancellationToken::new()).await;
        let TurnOutcome::Failed(err) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(err.code(), "LLM_FAILED");
    }
}
