//! Session registry: allocation, caps, idle eviction, reconnect rebinding.

use crate::config::GatewayConfig;
use crate::dialogue::ConversationStore;
use crate::engine::EngineSet;
use crate::protocol::Payload;
use crate::session::{Session, SessionDeps};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Thread-safe `session_id → session` map.
///
/// Mutated only on create, evict, and rebind; everything else reads through
/// the shared `Arc<Session>` handles. Sessions outlive their connections: a
/// dropped channel leaves the session in place until the idle sweeper or the
/// cap eviction removes it, and a reconnect with the same id rebinds without
/// losing the conversation reference.
pub struct SessionRegistry {
    deps: Arc<SessionDeps>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry sharing one engine set and dialogue store.
    #[must_use]
    pub fn new(
        engines: EngineSet,
        store: Arc<dyn ConversationStore>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let deps = Arc::new(SessionDeps {
            engines,
            store,
            config,
            active_sessions: Arc::new(AtomicUsize::new(0)),
        });
        Self {
            deps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn active(&self) -> usize {
        self.deps.active_sessions.load(Ordering::Relaxed)
    }

    /// Bind a connection to its session, creating or rebinding as needed.
    ///
    /// Returns the session and whether this was a reconnect. When creating
    /// would exceed `max_concurrent_sessions`, the session with the oldest
    /// last-activity is evicted first.
    pub async fn bind(
        &self,
        requested_id: Option<String>,
        outbound: mpsc::Sender<Payload>,
    ) -> (Arc<Session>, bool) {
        let id = requested_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (session, rebound) = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&id) {
                (Arc::clone(existing), true)
            } else {
                let cap = self.deps.config.session.max_concurrent_sessions;
                while sessions.len() >= cap {
                    let Some(oldest) = Self::oldest(&sessions).await else { break };
                    info!(session_id = %oldest, "session cap reached, evicting oldest");
                    if let Some(evicted) = sessions.remove(&oldest) {
                        evicted.teardown("session cap reached").await;
                    }
                }
                let session = Session::new(id.clone(), Arc::clone(&self.deps));
                sessions.insert(id.clone(), Arc::clone(&session));
                self.deps
                    .active_sessions
                    .store(sessions.len(), Ordering::Relaxed);
                (session, false)
            }
        };

        session.bind(outbound).await;
        if rebound {
            debug!(session_id = %id, "reconnected, session rebound");
        }
        (session, rebound)
    }

    async fn oldest(sessions: &HashMap<String, Arc<Session>>) -> Option<String> {
        let mut oldest: Option<(String, Instant)> = None;
        for (id, session) in sessions {
            let at = session.last_activity().await;
            let replace = oldest.as_ref().is_none_or(|(_, best)| at < *best);
            if replace {
                oldest = Some((id.clone(), at));
            }
        }
        oldest.map(|(id, _)| id)
    }

    /// Evict sessions idle longer than the configured timeout.
    pub async fn sweep(&self) {
        let timeout = Duration::from_secs(self.deps.config.session.session_timeout_secs);
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, session) in sessions.iter() {
            if session.last_activity().await.elapsed() > timeout {
                expired.push(id.clone());
            }
        }
        for id in expired {
            info!(session_id = %id, "evicting idle session");
            if let Some(session) = sessions.remove(&id) {
                session.teardown("idle timeout").await;
            }
        }
        self.deps
            .active_sessions
            .store(sessions.len(), Ordering::Relaxed);
    }

    /// Run the idle sweeper until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.deps.config.session.sweep_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Tear down every session and release engine handles (server shutdown).
    pub async fn shutdown(&self) {
        {
            let mut sessions = self.sessions.lock().await;
            for (_, session) in sessions.drain() {
                session.teardown("server shutting down").await;
            }
            self.deps.active_sessions.store(0, Ordering::Relaxed);
        }
        self.deps.engines.close().await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::dialogue::InMemoryDialogueStore;
    use crate::engine::EngineRegistry;
    use crate::protocol::{Payload, StatusState};

    fn registry_with(max_sessions: usize, timeout_secs: u64) -> SessionRegistry {
        let mut config = GatewayConfig::default();
        config.session.max_concurrent_sessions = max_sessions;
        config.session.session_timeout_secs = timeout_secs;
        let engines = EngineRegistry::with_builtins()
            .build(&config.engines)
            .unwrap();
        let store = Arc::new(InMemoryDialogueStore::new(config.dialogue.clone()));
        SessionRegistry::new(engines, store, Arc::new(config))
    }

    fn channel() -> (mpsc::Sender<Payload>, mpsc::Receiver<Payload>) {
        mpsc::channel(16)
    }

    #[tokio::test]
    async fn bind_mints_id_when_absent() {
        let registry = registry_with(4, 300);
        let (tx, _rx) = channel();
        let (session, rebound) = registry.bind(None, tx).await;
        assert!(!rebound);
        assert!(!session.id().is_empty());
        assert_eq!(registry.active(), 1);
    }

    #[tokio::test]
    async fn reconnect_rebinds_same_session() {
        let registry = registry_with(4, 300);
        let (tx1, _rx1) = channel();
        let (first, _) = registry.bind(Some("s1".to_owned()), tx1).await;
        let conv = first.conversation_id().await;

        let (tx2, mut rx2) = channel();
        let (second, rebound) = registry.bind(Some("s1".to_owned()), tx2).await;
        assert!(rebound);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.conversation_id().await, conv);
        assert_eq!(registry.active(), 1);

        // The new channel got the connected greeting.
        let frame = rx2.recv().await.unwrap();
        assert!(matches!(
            frame,
            Payload::Status(s) if s.state == StatusState::Connected
        ));
    }

    #[tokio::test]
    async fn cap_evicts_exactly_the_oldest() {
        let registry = registry_with(2, 300);
        let (tx_a, mut rx_a) = channel();
        let (a, _) = registry.bind(Some("a".to_owned()), tx_a).await;
        let (tx_b, _rx_b) = channel();
        let (_b, _) = registry.bind(Some("b".to_owned()), tx_b).await;

        // Make A the stalest.
        a.set_last_activity(Instant::now() - Duration::from_secs(60)).await;

        let (tx_c, _rx_c) = channel();
        let (_c, _) = registry.bind(Some("c".to_owned()), tx_c).await;
        assert_eq!(registry.active(), 2);

        // A got a teardown status; its sender side is gone.
        let mut saw_disconnected = false;
        while let Ok(frame) = rx_a.try_recv() {
            if matches!(&frame, Payload::Status(s) if s.state == StatusState::Disconnected) {
                saw_disconnected = true;
            }
        }
        assert!(saw_disconnected);

        // B and C remain bound.
        let (tx_b2, _rx_b2) = channel();
        let (_, rebound) = registry.bind(Some("b".to_owned()), tx_b2).await;
        assert!(rebound);
    }

    #[tokio::test]
    async fn sweep_removes_idle_sessions() {
        let registry = registry_with(8, 30);
        let (tx, _rx) = channel();
        let (session, _) = registry.bind(Some("stale".to_owned()), tx).await;
        session
            .set_last_activity(Instant::now() - Duration::from_secs(120))
            .await;

        let (tx2, _rx2) = channel();
        let (_fresh, _) = registry.bind(Some("fresh".to_owned()), tx2).await;

        registry.sweep().await;
        assert_eq!(registry.active(), 1);

        let (tx3, _rx3) = channel();
        let (_, rebound) = registry.bind(Some("stale".to_owned()), tx3).await;
        assert!(!rebound, "swept session must be recreated, not rebound");
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let registry = registry_with(8, 300);
        let (tx, _rx) = channel();
        let _ = registry.bind(Some("x".to_owned()), tx).await;
        registry.shutdown().await;
        assert_eq!(registry.active(), 0);
    }
}
