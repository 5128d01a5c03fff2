//! History cache.
//!
//! Read-only snapshots of recently viewed conversation windows, so
//! re-selecting a conversation renders instantly while a background tail
//! refresh runs. Capacity is a global message budget; when it overflows,
//! the least-recently-accessed conversation's window is dropped whole.
//! The window of the currently active conversation is never evicted.

use std::collections::HashMap;

use crate::nabo::message::Message;
use crate::types::ConversationId;

pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

/// One conversation's cached page window.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    pub messages: Vec<Message>,
    /// Whether older pages exist beyond the start of this window.
    pub has_more_before: bool,
}

#[derive(Debug)]
struct CachedWindow {
    window: HistoryWindow,
    last_access: u64,
}

#[derive(Debug)]
pub struct HistoryCache {
    capacity: usize,
    windows: HashMap<ConversationId, CachedWindow>,
    tick: u64,
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn total_messages(&self) -> usize {
        self.windows.values().map(|c| c.window.messages.len()).sum()
    }

    /// Cached window, if any. Counts as an access.
    pub fn get(&mut self, conversation_id: &ConversationId) -> Option<&HistoryWindow> {
        let tick = self.next_tick();
        let cached = self.windows.get_mut(conversation_id)?;
        cached.last_access = tick;
        Some(&cached.window)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.windows.contains_key(conversation_id)
    }

    pub fn has_more_before(&self, conversation_id: &ConversationId) -> bool {
        self.windows
            .get(conversation_id)
            .map_or(true, |c| c.window.has_more_before)
    }

    /// Store or overwrite a conversation's window, then evict down to
    /// budget. `active` is exempt from eviction.
    pub fn put(
        &mut self,
        conversation_id: ConversationId,
        window: HistoryWindow,
        active: Option<&ConversationId>,
    ) -> Vec<ConversationId> {
        let tick = self.next_tick();
        self.windows.insert(
            conversation_id,
            CachedWindow {
                window,
                last_access: tick,
            },
        );
        self.evict(active)
    }

    /// Append a live message to a cached window, if one exists for the
    /// conversation. A miss is fine; the window will be rebuilt on the
    /// next selection.
    pub fn append_live(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
        active: Option<&ConversationId>,
    ) -> Vec<ConversationId> {
        let tick = self.next_tick();
        let Some(cached) = self.windows.get_mut(conversation_id) else {
            return Vec::new();
        };
        cached.last_access = tick;
        if !cached.window.messages.iter().any(|m| m.id == message.id) {
            cached.window.messages.push(message);
        }
        self.evict(active)
    }

    /// Refresh a cached window in place from the store's view.
    pub fn refresh(
        &mut self,
        conversation_id: &ConversationId,
        messages: Vec<Message>,
        has_more_before: bool,
    ) {
        let tick = self.next_tick();
        if let Some(cached) = self.windows.get_mut(conversation_id) {
            cached.window.messages = messages;
            cached.window.has_more_before = has_more_before;
            cached.last_access = tick;
        }
    }

    /// Conversations that currently have a cached window. Used to pick
    /// resync targets after a reconnect.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.windows.keys().cloned().collect()
    }

    /// Mark a conversation as recently used without reading it.
    pub fn touch(&mut self, conversation_id: &ConversationId) {
        let tick = self.next_tick();
        if let Some(cached) = self.windows.get_mut(conversation_id) {
            cached.last_access = tick;
        }
    }

    pub fn invalidate(&mut self, conversation_id: &ConversationId) {
        self.windows.remove(conversation_id);
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }

    /// Evict least-recently-accessed windows whole until the global
    /// message count fits the budget. Returns the evicted conversation
    /// ids so callers can release related state.
    fn evict(&mut self, active: Option<&ConversationId>) -> Vec<ConversationId> {
        let mut evicted = Vec::new();
        while self.total_messages() > self.capacity {
            let victim = self
                .windows
                .iter()
                .filter(|(id, _)| Some(*id) != active)
                .min_by_key(|(_, c)| c.last_access)
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                // Only the active window remains; it stays even when
                // over budget.
                break;
            };
            self.windows.remove(&victim);
            tracing::debug!(
                target: "nabo::history",
                "Evicted history window for conversation {}",
                victim
            );
            evicted.push(victim);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nabo::message::test_message;

    fn window_of(n: usize, prefix: &str) -> HistoryWindow {
        HistoryWindow {
            messages: (0..n).map(|i| test_message(&format!("{prefix}-{i}"))).collect(),
            has_more_before: false,
        }
    }

    #[test]
    fn test_get_hits_and_misses() {
        let mut cache = HistoryCache::new(10);
        cache.put("c1".to_string(), window_of(3, "m"), None);

        assert!(cache.get(&"c1".to_string()).is_some());
        assert!(cache.get(&"c2".to_string()).is_none());
    }

    #[test]
    fn test_eviction_is_whole_conversation_lru() {
        let mut cache = HistoryCache::new(6);
        cache.put("c1".to_string(), window_of(3, "a"), None);
        cache.put("c2".to_string(), window_of(3, "b"), None);

        // c1 becomes most recently accessed
        cache.get(&"c1".to_string());

        let evicted = cache.put("c3".to_string(), window_of(3, "c"), None);
        assert_eq!(evicted, vec!["c2".to_string()]);
        assert!(cache.contains(&"c1".to_string()));
        assert!(!cache.contains(&"c2".to_string()));
        assert!(cache.contains(&"c3".to_string()));
    }

    #[test]
    fn test_active_window_is_never_evicted() {
        let mut cache = HistoryCache::new(4);
        let active = "c1".to_string();
        cache.put(active.clone(), window_of(3, "a"), Some(&active));

        let evicted = cache.put("c2".to_string(), window_of(3, "b"), Some(&active));
        assert_eq!(evicted, vec!["c2".to_string()]);
        assert!(cache.contains(&active));
    }

    #[test]
    fn test_append_live_dedupes() {
        let mut cache = HistoryCache::new(10);
        cache.put("c1".to_string(), window_of(2, "m"), None);

        cache.append_live(&"c1".to_string(), test_message("m-1"), None);
        cache.append_live(&"c1".to_string(), test_message("m-9"), None);

        let window = cache.get(&"c1".to_string()).unwrap();
        assert_eq!(window.messages.len(), 3);
    }

    #[test]
    fn test_append_live_on_uncached_conversation_is_noop() {
        let mut cache = HistoryCache::new(10);
        let evicted = cache.append_live(&"c9".to_string(), test_message("m1"), None);
        assert!(evicted.is_empty());
        assert!(!cache.contains(&"c9".to_string()));
    }

    #[test]
    fn test_unknown_conversation_reports_more_before() {
        let cache = HistoryCache::new(10);
        assert!(cache.has_more_before(&"c1".to_string()));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let mut cache = HistoryCache::new(10);
        cache.put("c1".to_string(), window_of(1, "a"), None);
        cache.put("c2".to_string(), window_of(1, "b"), None);

        cache.invalidate(&"c1".to_string());
        assert!(!cache.contains(&"c1".to_string()));

        cache.clear();
        assert!(!cache.contains(&"c2".to_string()));
    }
}
