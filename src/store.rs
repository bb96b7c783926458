//! Process-wide conversation registry. Keyed by conversation id with
//! per-key locking, plus a TTL sweep so idle sessions do not accumulate for
//! the life of the process.

use crate::state::ConversationState;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
pub struct ConversationStore {
    sessions: DashMap<String, ConversationState>,
}

impl ConversationStore {
    pub fn new() -> Self {
        ConversationStore {
            sessions: DashMap::new(),
        }
    }

    /// Run `f` against the conversation's state, creating it empty on first
    /// reference. The entry stays locked for the duration of `f`, so two
    /// turns on the same conversation cannot interleave their mutations.
    pub fn with_state<R>(&self, id: &str, f: impl FnOnce(&mut ConversationState) -> R) -> R {
        let mut entry = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(ConversationState::new);
        entry.touch();
        f(entry.value_mut())
    }

    pub fn snapshot(&self, id: &str) -> Option<ConversationState> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than `ttl`; returns how many were
    /// evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, state| state.last_active.elapsed() < ttl);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!("evicted {} idle conversation(s)", evicted);
        }
        evicted
    }
}
