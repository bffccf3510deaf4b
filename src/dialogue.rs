//! Per-conversation turn history with trimming and LRU eviction.
//!
//! Conversations are keyed independently from sessions so that history
//! survives session re-binding. The store is held behind the
//! [`ConversationStore`] trait so an external backend can be swapped in
//! without touching the pipeline.

use crate::config::DialogueConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One `(role, content)` pair within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Author role.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// When the turn was recorded.
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// A system turn.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Provider-hint-agnostic token estimate: ~4 characters per token.
    #[must_use]
    pub fn approx_tokens(&self) -> usize {
        self.content.len() / 4
    }
}

/// Ordered turn history for one conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Stable identifier.
    pub id: String,
    /// Turns, oldest first. The system turn (if present) is always first.
    pub turns: Vec<Turn>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last append or clear.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn new(id: &str, system_prompt: &str) -> Self {
        let now = Utc::now();
        let turns = if system_prompt.is_empty() {
            Vec::new()
        } else {
            vec![Turn::system(system_prompt)]
        };
        Self {
            id: id.to_owned(),
            turns,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of per-turn token estimates.
    #[must_use]
    pub fn approx_tokens(&self) -> usize {
        self.turns.iter().map(Turn::approx_tokens).sum()
    }
}

/// Dialogue-store contract consumed by the pipeline coordinator.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Ensure a conversation exists, creating it with the configured system
    /// prompt if needed.
    async fn get_or_create(&self, conversation_id: &str);

    /// Append a turn, trimming the history afterwards. Creates the
    /// conversation if it does not exist (including after eviction).
    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<()>;

    /// A trimmed snapshot of the conversation, system turn first. Empty when
    /// the conversation does not exist.
    async fn history(&self, conversation_id: &str) -> Vec<Turn>;

    /// Number of retained turns, zero when the conversation does not exist.
    async fn turn_count(&self, conversation_id: &str) -> usize;

    /// Destroy the conversation. Returns whether it existed. The next append
    /// re-creates it with the retained system prompt.
    async fn clear(&self, conversation_id: &str) -> bool;

    /// Number of conversations currently held.
    async fn len(&self) -> usize;
}

/// Drop oldest non-system turns until both the turn-count and token budgets
/// hold. The leading system turn and the newest turn are always retained.
fn trim(turns: &mut Vec<Turn>, config: &DialogueConfig) {
    loop {
        let within_count = turns.len() <= config.max_history_turns;
        let within_tokens =
            turns.iter().map(Turn::approx_tokens).sum::<usize>() <= config.max_context_length;
        if within_count && within_tokens {
            return;
        }
        let oldest = turns.iter().position(|t| t.role != Role::System);
        match oldest {
            // Never drop the turn that was just appended.
            Some(idx) if idx + 1 < turns.len() => {
                turns.remove(idx);
            }
            _ => return,
        }
    }
}

/// Process-local dialogue store.
pub struct InMemoryDialogueStore {
    config: DialogueConfig,
    inner: Mutex<HashMap<String, Conversation>>,
}

impl InMemoryDialogueStore {
    /// Create an empty store with the given policy.
    #[must_use]
    pub fn new(config: DialogueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Create or fetch under an already-held lock, evicting the LRU
    /// conversation first when the store is at capacity.
    fn entry<'a>(
        &self,
        map: &'a mut HashMap<String, Conversation>,
        conversation_id: &str,
    ) -> &'a mut Conversation {
        if !map.contains_key(conversation_id) && map.len() >= self.config.max_conversations {
            let lru = map
                .iter()
                .min_by_key(|(_, c)| c.updated_at)
                .map(|(id, _)| id.clone());
            if let Some(id) = lru {
                debug!(conversation_id = %id, "evicting LRU conversation");
                map.remove(&id);
            }
        }
        map.entry(conversation_id.to_owned())
            .or_insert_with(|| Conversation::new(conversation_id, &self.config.system_prompt))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Conversation>> {
        // A poisoned dialogue lock means a panic mid-append; the map itself
        // is still structurally valid, so keep serving.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ConversationStore for InMemoryDialogueStore {
    async fn get_or_create(&self, conversation_id: &str) {
        let mut map = self.lock();
        let _ = self.entry(&mut map, conversation_id);
    }

    async fn append(&self, conversation_id: &str, turn: Turn) -> Result<()> {
        let mut map = self.lock();
        let conversation = self.entry(&mut map, conversation_id);
        conversation.turns.push(turn);
        trim(&mut conversation.turns, &self.config);
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn history(&self, conversation_id: &str) -> Vec<Turn> {
        self.lock()
            .get(conversation_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    async fn turn_count(&self, conversation_id: &str) -> usize {
        self.lock().get(conversation_id).map_or(0, |c| c.turns.len())
    }

    async fn clear(&self, conversation_id: &str) -> bool {
        self.lock().remove(conversation_id).is_some()
    }

    async fn len(&self) -> usize {
        self.lock().len()
    }
}
