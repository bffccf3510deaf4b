//! Voxgate: a realtime voice-interaction gateway.
//!
//! Clients stream microphone audio over a persistent WebSocket; the server
//! runs a three-stage pipeline and streams responses back:
//! Client audio → ASR → LLM → TTS → client audio
//!
//! # Architecture
//!
//! - **Wire codec** (`protocol`): JSON frame envelope with typed payloads
//! - **Engine adapters** (`engine`): pluggable ASR/LLM/TTS providers behind a
//!   uniform streaming contract
//! - **Dialogue store** (`dialogue`): per-conversation turn history with
//!   trimming and LRU eviction
//! - **Session FSM** (`session`): per-client listen → process → speak state
//!   machine with safe interruption
//! - **Pipeline coordinator** (`pipeline`): one cancellable ASR→LLM→TTS run
//!   per utterance
//! - **Connection manager** (`server`): WebSocket lifecycle, heartbeat, caps

pub mod config;
pub mod dialogue;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::{GatewayConfig, SessionMode};
pub use engine::{EngineRegistry, EngineSet};
pub use error::{GatewayError, Result, Stage};
pub use server::GatewayServer;
pub use session::{Session, SessionRegistry, SessionState};
