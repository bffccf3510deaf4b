//! Per-client session: the listen → process → speak state machine.
//!
//! A session owns its accumulation buffer, the handle to its in-flight
//! pipeline, and a pointer to its conversation. All state mutations go
//! through the session mutex, so inbound frames are applied in receive order
//! and at most one pipeline is ever in flight. A pipeline generation counter
//! guards against a superseded turn's completion clobbering newer state.

pub mod registry;

use crate::config::{GatewayConfig, SessionMode};
use crate::dialogue::ConversationStore;
use crate::engine::{AudioInput, EngineSet};
use crate::error::GatewayError;
use crate::pipeline::coordinator::{StageTimeouts, TurnInput, run_turn};
use crate::pipeline::messages::TurnOutcome;
use crate::protocol::{
    AudioFormat, AudioStreamPayload, CommandKind, CommandPayload, ErrorPayload, Frame, Payload,
    SessionInfo, StatusPayload, StatusState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use registry::SessionRegistry;

/// FSM states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not accepting utterances.
    Idle,
    /// Accumulating audio.
    Listening,
    /// A pipeline is running (or a fresh utterance is being collected right
    /// after an interruption).
    Processing,
    /// TTS audio is streaming out.
    Speaking,
    /// A non-recoverable failure; only `stop_session`/`start_session` revive.
    Error,
}

impl SessionState {
    /// Wire representation for `status` frames.
    #[must_use]
    pub fn wire(self) -> StatusState {
        match self {
            Self::Idle => StatusState::Idle,
            Self::Listening => StatusState::Listening,
            Self::Processing => StatusState::Processing,
            Self::Speaking => StatusState::Speaking,
            Self::Error => StatusState::Error,
        }
    }
}

/// Where a session rests between turns.
fn resting_state(mode: SessionMode) -> SessionState {
    match mode {
        SessionMode::Single => SessionState::Idle,
        SessionMode::Continuous | SessionMode::Wakeword => SessionState::Listening,
    }
}

/// Dependencies shared by every session, owned by the registry.
pub struct SessionDeps {
    /// Process-wide engine adapters.
    pub engines: EngineSet,
    /// Dialogue store.
    pub store: Arc<dyn ConversationStore>,
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Live-session gauge, reported in `status` frames.
    pub active_sessions: Arc<AtomicUsize>,
}

struct PipelineHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionCore {
    state: SessionState,
    mode: SessionMode,
    allow_interrupt: bool,
    conversation_id: String,
    buffer: Vec<u8>,
    buffer_format: AudioFormat,
    /// Highest chunk id seen in the current utterance.
    last_chunk_id: Option<u64>,
    /// An `is_final` chunk arrived while a pipeline was in flight.
    pending_final: bool,
    last_activity: Instant,
    outbound: Option<mpsc::Sender<Payload>>,
    pipeline: Option<PipelineHandle>,
    generation: u64,
}

/// One client execution context.
pub struct Session {
    id: String,
    deps: Arc<SessionDeps>,
    /// Self-handle for the tasks a session spawns (pipeline, speaking waiter).
    weak: Weak<Session>,
    core: Mutex<SessionCore>,
}

impl Session {
    /// Create a session in `Idle` with a freshly minted conversation.
    #[must_use]
    pub fn new(id: String, deps: Arc<SessionDeps>) -> Arc<Self> {
        let session_config = &deps.config.session;
        let core = SessionCore {
            state: SessionState::Idle,
            mode: session_config.default_mode,
            allow_interrupt: session_config.enable_interrupt,
            conversation_id: uuid::Uuid::new_v4().to_string(),
            buffer: Vec::new(),
            buffer_format: AudioFormat::default(),
            last_chunk_id: None,
            pending_final: false,
            last_activity: Instant::now(),
            outbound: None,
            pipeline: None,
            generation: 0,
        };
        Arc::new_cyclic(|weak| Self {
            id,
            deps,
            weak: weak.clone(),
            core: Mutex::new(core),
        })
    }

    /// Opaque session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Timestamp of the last inbound frame.
    pub async fn last_activity(&self) -> Instant {
        self.core.lock().await.last_activity
    }

    /// Current conversation identifier.
    pub async fn conversation_id(&self) -> String {
        self.core.lock().await.conversation_id.clone()
    }

    /// Attach (or re-attach) a connection's outbound queue and greet it with
    /// a `connected` status. Rebinding drops the previous connection's
    /// sender, which closes that connection.
    pub async fn bind(&self, outbound: mpsc::Sender<Payload>) {
        {
            let mut core = self.core.lock().await;
            core.outbound = Some(outbound);
            core.last_activity = Instant::now();
        }
        self.emit_status(Some(StatusState::Connected)).await;
    }

    /// Dispatch one decoded inbound frame.
    pub async fn handle_frame(&self, frame: Frame) {
        match frame.payload {
            Payload::Audio(chunk) => self.handle_audio(chunk).await,
            Payload::Command(command) => self.handle_command(command).await,
            other => {
                let err = GatewayError::Protocol(format!(
                    "unexpected {:?} frame from client",
                    other.kind()
                ));
                let core = self.core.lock().await;
                Self::send_frame(&core, Payload::Error(ErrorPayload::from(&err)));
            }
        }
    }

    // -- audio path --

    async fn handle_audio(&self, chunk: AudioStreamPayload) {
        let mut core = self.core.lock().await;
        core.last_activity = Instant::now();

        // Chunk ordering is validated before anything else touches an engine.
        if let Some(last) = core.last_chunk_id
            && chunk.chunk_id <= last
        {
            let err = GatewayError::Protocol(format!(
                "audio chunk_id {} arrived after {last}",
                chunk.chunk_id
            ));
            warn!(session_id = %self.id, "{err}");
            Self::send_frame(&core, Payload::Error(ErrorPayload::from(&err)));
            return;
        }
        core.last_chunk_id = Some(chunk.chunk_id);

        match core.state {
            SessionState::Idle => {
                if core.mode == SessionMode::Continuous {
                    core.state = SessionState::Listening;
                } else {
                    // Single and wakeword sessions wait for `start_session`.
                    debug!(session_id = %self.id, mode = core.mode.name(), "dropping audio in idle");
                    return;
                }
            }
            SessionState::Error => {
                debug!(session_id = %self.id, "dropping audio in error state");
                return;
            }
            SessionState::Speaking if core.allow_interrupt => {
                // Barge-in: cancel the current turn, then treat this chunk
                // as the start of a fresh utterance.
                let waiter = Self::begin_cancel(&mut core);
                core.buffer.clear();
                core.pending_final = false;
                core.state = SessionState::Processing;
                let status = StatusPayload {
                    state: StatusState::Processing,
                    mode: core.mode,
                    concurrent_streams: self.deps.active_sessions.load(Ordering::Relaxed),
                    session_info: None,
                };
                Self::send_frame(&core, Payload::Status(status));
                drop(core);
                if !self.await_cancel(waiter).await {
                    self.teardown("pipeline did not acknowledge cancellation").await;
                    return;
                }
                core = self.core.lock().await;
            }
            SessionState::Listening | SessionState::Processing | SessionState::Speaking => {}
        }

        let deferring = core.pipeline.is_some();
        let hi_watermark = self.deps.config.session.audio_buffer_size;
        if deferring && core.buffer.len() + chunk.audio_data.len() > hi_watermark {
            warn!(session_id = %self.id, "accumulation buffer full, dropping deferred audio chunk");
            if chunk.is_final {
                core.pending_final = true;
            }
            return;
        }

        core.buffer.extend_from_slice(&chunk.audio_data);
        core.buffer_format = chunk.format;
        if chunk.is_final && deferring {
            core.pending_final = true;
        }

        let should_flush = chunk.is_final || core.buffer.len() >= hi_watermark;
        if should_flush && !deferring {
            self.flush(&mut core);
        }
    }

    /// Hand the accumulated utterance to a fresh pipeline.
    fn flush(&self, core: &mut SessionCore) {
        let audio = AudioInput {
            format: core.buffer_format,
            data: std::mem::take(&mut core.buffer),
        };
        core.last_chunk_id = None;
        core.pending_final = false;

        let Some(outbound) = core.outbound.clone() else {
            // No connection to stream to; drop the utterance and keep
            // listening for the reconnect.
            debug!(session_id = %self.id, "no outbound channel, dropping utterance");
            core.state = resting_state(core.mode);
            return;
        };

        core.state = SessionState::Processing;
        core.generation += 1;
        let generation = core.generation;
        let cancel = CancellationToken::new();
        let (speaking_tx, speaking_rx) = oneshot::channel();

        let Some(strong) = self.weak.upgrade() else {
            // Session already dropped by the registry; nothing to run for.
            return;
        };

        let config = &self.deps.config;
        let input = TurnInput {
            session_id: self.id.clone(),
            conversation_id: core.conversation_id.clone(),
            audio,
            engines: self.deps.engines.clone(),
            store: Arc::clone(&self.deps.store),
            outbound,
            timeouts: StageTimeouts::from_config(&config.engines),
            write_timeout: Duration::from_millis(config.server.write_timeout_ms),
            speaking_tx: Some(speaking_tx),
        };

        let session = Arc::clone(&strong);
        tokio::spawn(async move {
            if speaking_rx.await.is_ok() {
                session.mark_speaking(generation).await;
            }
        });

        let session = strong;
        let turn_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = run_turn(input, turn_cancel).await;
            session.finish_turn(generation, outcome).await;
        });
        core.pipeline = Some(PipelineHandle { cancel, task });
    }

    /// First TTS audio arrived for the given turn.
    async fn mark_speaking(&self, generation: u64) {
        let mut core = self.core.lock().await;
        if core.generation == generation && core.state == SessionState::Processing {
            core.state = SessionState::Speaking;
        }
    }

    /// Apply a finished turn to the FSM, unless it was superseded.
    async fn finish_turn(&self, generation: u64, outcome: TurnOutcome) {
        let mut emit_status = false;
        {
            let mut core = self.core.lock().await;
            if core.generation != generation {
                return;
            }
            core.pipeline = None;
            let resting = resting_state(core.mode);
            match outcome {
                TurnOutcome::Completed | TurnOutcome::EmptyUtterance => {
                    core.state = resting;
                    emit_status = true;
                }
                TurnOutcome::Cancelled => {
                    core.state = resting;
                }
                TurnOutcome::Failed(err) => {
                    if matches!(err, GatewayError::Channel(_)) {
                        // The link stalled or closed: shut the connection,
                        // keep the session for the grace window.
                        core.outbound = None;
                        core.state = resting;
                    } else if err.recoverable() {
                        core.state = resting;
                    } else {
                        core.state = SessionState::Error;
                    }
                }
            }

            // Audio deferred during the turn becomes the next utterance.
            if core.state == SessionState::Listening
                && (core.pending_final
                    || core.buffer.len() >= self.deps.config.session.audio_buffer_size)
            {
                emit_status = false;
                self.flush(&mut core);
            }
        }
        if emit_status {
            self.emit_status(None).await;
        }
    }

    // -- command path --

    async fn handle_command(&self, command: CommandPayload) {
        match command.command {
            CommandKind::StartSession => {
                let mut core = self.core.lock().await;
                core.last_activity = Instant::now();
                if let Some(mode) = &command.mode
                    && let Err(err) = Self::apply_mode(&mut core, mode)
                {
                    Self::send_frame(&core, Payload::Error(ErrorPayload::from(&err)));
                    return;
                }
                let waiter = Self::begin_cancel(&mut core);
                core.buffer.clear();
                core.last_chunk_id = None;
                core.pending_final = false;
                core.state = SessionState::Listening;
                drop(core);
                if !self.await_cancel(waiter).await {
                    self.teardown("pipeline did not acknowledge cancellation").await;
                    return;
                }
                self.emit_status(None).await;
            }
            CommandKind::StopSession => {
                let mut core = self.core.lock().await;
                core.last_activity = Instant::now();
                let waiter = Self::begin_cancel(&mut core);
                core.buffer.clear();
                core.last_chunk_id = None;
                core.pending_final = false;
                core.state = SessionState::Idle;
                drop(core);
                if !self.await_cancel(waiter).await {
                    self.teardown("pipeline did not acknowledge cancellation").await;
                    return;
                }
                self.emit_status(None).await;
            }
            CommandKind::Pause => {
                {
                    let mut core = self.core.lock().await;
                    core.last_activity = Instant::now();
                    if core.state == SessionState::Listening {
                        // Intake freezes; the buffer is retained for resume.
                        core.state = SessionState::Idle;
                    }
                }
                self.emit_status(None).await;
            }
            CommandKind::Resume => {
                {
                    let mut core = self.core.lock().await;
                    core.last_activity = Instant::now();
                    if core.state == SessionState::Idle {
                        core.state = SessionState::Listening;
                    }
                }
                self.emit_status(None).await;
            }
            CommandKind::SetMode => {
                {
                    let mut core = self.core.lock().await;
                    core.last_activity = Instant::now();
                    let Some(mode) = &command.mode else {
                        let err =
                            GatewayError::Protocol("set_mode requires a `mode`".to_owned());
                        Self::send_frame(&core, Payload::Error(ErrorPayload::from(&err)));
                        return;
                    };
                    if let Err(err) = Self::apply_mode(&mut core, mode) {
                        Self::send_frame(&core, Payload::Error(ErrorPayload::from(&err)));
                        return;
                    }
                }
                self.emit_status(None).await;
            }
            CommandKind::GetStatus => {
                {
                    let mut core = self.core.lock().await;
                    core.last_activity = Instant::now();
                }
                self.emit_status(None).await;
            }
            CommandKind::Interrupt => {
                // Explicit barge-in applies regardless of the interrupt gate.
                let mut core = self.core.lock().await;
                core.last_activity = Instant::now();
                let waiter = Self::begin_cancel(&mut core);
                if !matches!(core.state, SessionState::Error) {
                    core.state = resting_state(core.mode);
                }
                drop(core);
                if !self.await_cancel(waiter).await {
                    self.teardown("pipeline did not acknowledge cancellation").await;
                    return;
                }
                self.emit_status(None).await;
            }
            CommandKind::ClearContext => {
                let conversation_id = {
                    let mut core = self.core.lock().await;
                    core.last_activity = Instant::now();
                    core.conversation_id.clone()
                };
                self.deps.store.clear(&conversation_id).await;
                debug!(session_id = %self.id, conversation_id = %conversation_id, "context cleared");
            }
        }
    }

    fn apply_mode(core: &mut SessionCore, mode: &str) -> crate::error::Result<()> {
        match mode {
            "continuous" => core.mode = SessionMode::Continuous,
            "single" => core.mode = SessionMode::Single,
            "wakeword" => core.mode = SessionMode::Wakeword,
            // Per-session override layered over the configured gate.
            "interrupt" => core.allow_interrupt = true,
            other => {
                return Err(GatewayError::Protocol(format!("unknown mode `{other}`")));
            }
        }
        Ok(())
    }

    // -- cancellation & teardown --

    /// Cancel the in-flight pipeline (if any) and supersede its generation.
    fn begin_cancel(core: &mut SessionCore) -> Option<JoinHandle<()>> {
        core.generation += 1;
        core.pipeline.take().map(|handle| {
            handle.cancel.cancel();
            handle.task
        })
    }

    /// Wait for a cancelled pipeline to acknowledge. `false` means the
    /// deadline elapsed and the session must be torn down.
    async fn await_cancel(&self, waiter: Option<JoinHandle<()>>) -> bool {
        let Some(task) = waiter else { return true };
        let wait = Duration::from_millis(self.deps.config.session.cancel_wait_ms);
        tokio::time::timeout(wait, task).await.is_ok()
    }

    /// Cancel everything, notify the client, and drop the connection. The
    /// session entry itself is removed by the registry.
    pub async fn teardown(&self, reason: &str) {
        let mut core = self.core.lock().await;
        info!(session_id = %self.id, reason, "tearing down session");
        let _ = Self::begin_cancel(&mut core);
        if let Some(outbound) = core.outbound.take() {
            let status = StatusPayload {
                state: StatusState::Disconnected,
                mode: core.mode,
                concurrent_streams: self.deps.active_sessions.load(Ordering::Relaxed),
                session_info: None,
            };
            let _ = outbound.try_send(Payload::Status(status));
        }
        core.state = SessionState::Idle;
    }

    // -- status & frame plumbing --

    fn status_of(&self, core: &SessionCore) -> StatusPayload {
        StatusPayload {
            state: core.state.wire(),
            mode: core.mode,
            concurrent_streams: self.deps.active_sessions.load(Ordering::Relaxed),
            session_info: Some(SessionInfo {
                conversation_id: core.conversation_id.clone(),
                turns: 0,
            }),
        }
    }

    /// Emit a `status` frame reflecting the current state (or an override
    /// such as `connected`).
    pub async fn emit_status(&self, state_override: Option<StatusState>) {
        let (sender, mut status) = {
            let core = self.core.lock().await;
            let Some(sender) = core.outbound.clone() else { return };
            (sender, self.status_of(&core))
        };
        if let Some(state) = state_override {
            status.state = state;
        }
        if let Some(info) = &mut status.session_info {
            info.turns = self.deps.store.turn_count(&info.conversation_id).await;
        }
        let _ = sender.try_send(Payload::Status(status));
    }

    /// Surface a classified error to the client without touching the FSM.
    pub async fn report_error(&self, err: &GatewayError) {
        let core = self.core.lock().await;
        Self::send_frame(&core, Payload::Error(ErrorPayload::from(err)));
    }

    /// Best-effort frame send under the core lock.
    fn send_frame(core: &SessionCore, payload: Payload) {
        if let Some(outbound) = &core.outbound
            && outbound.try_send(payload).is_err()
        {
            debug!("outbound queue unavailable, dropping frame");
        }
    }

    #[cfg(test)]
    pub(crate) async fn state(&self) -> SessionState {
        self.core.lock().await.state
    }

    #[cfg(test)]
    pub(crate) async fn set_last_activity(&self, at: Instant) {
        self.core.lock().await.last_activity = at;
    }

    #[cfg(test)]
    pub(crate) async fn has_pipeline(&self) -> bool {
        self.core.lock().await.pipeline.is_some()
    }
}
