//! In-process registry of running generations, used by the stop endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct ActiveGeneration {
    generation_id: String,
    user_id: String,
    token: CancellationToken,
}

/// Running generations keyed by chat id. At most one per chat is tracked;
/// a newer generation replaces the entry of an older one.
#[derive(Debug, Clone, Default)]
pub struct ActiveGenerations {
    inner: Arc<DashMap<String, ActiveGeneration>>,
}

impl ActiveGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a generation and return the token that stops it.
    pub fn register(&self, chat_id: &str, user_id: &str, generation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner.insert(
            chat_id.to_string(),
            ActiveGeneration {
                generation_id: generation_id.to_string(),
                user_id: user_id.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    /// Forget a generation. A newer generation for the same chat is left alone.
    pub fn finish(&self, chat_id: &str, generation_id: &str) {
        self.inner
            .remove_if(chat_id, |_, active| active.generation_id == generation_id);
    }

    /// Cancel the generation running for `chat_id` if `user_id` started it.
    pub fn cancel(&self, chat_id: &str, user_id: &str) -> bool {
        match self.inner.get(chat_id) {
            Some(active) if active.user_id == user_id => {
                active.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, chat_id: &str) -> bool {
        self.inner.contains_key(chat_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_requires_owner() {
        let active = ActiveGenerations::new();
        let token = active.register("c1", "alice", "g1");

        assert!(!active.cancel("c1", "bob"));
        assert!(!token.is_cancelled());

        assert!(active.cancel("c1", "alice"));
        assert!(token.is_cancelled());
        assert!(!active.cancel("c2", "alice"));
    }

    #[test]
    fn test_finish_keeps_newer_generation() {
        let active = ActiveGenerations::new();
        active.register("c1", "alice", "g1");
        let newer = active.register("c1", "alice", "g2");

        active.finish("c1", "g1");
        assert!(active.is_active("c1"));

        active.cancel("c1", "alice");
        assert!(newer.is_cancelled());

        active.finish("c1", "g2");
        assert!(active.is_empty());
    }
}
