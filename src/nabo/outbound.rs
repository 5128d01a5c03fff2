//! Outbound queue.
//!
//! Pure data structure behind the optimistic send pipeline; dispatch
//! scheduling and persistence live with the core. Per conversation the
//! queue is strict FIFO with at most one record in flight, so one
//! sender's messages never reorder. Correlation tokens already matched
//! to a server record are remembered so a late REST reply or duplicate
//! echo becomes a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::nabo::conversation::ConversationKind;
use crate::transport::MessageDraft;
use crate::types::{ConversationId, MessageId, RetryInfo};

/// One pending or failed outbound send. Serializable so the queue can
/// survive reloads via an injected storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub temp_id: MessageId,
    pub correlation: String,
    pub conversation_id: ConversationId,
    pub conversation_kind: ConversationKind,
    pub draft: MessageDraft,
    pub retry: RetryInfo,
    /// True once the record moved to the failed set; used to route
    /// records on reload.
    #[serde(default)]
    pub failed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    queues: HashMap<ConversationId, VecDeque<OutboundRecord>>,
    in_flight: HashSet<ConversationId>,
    /// Correlation tokens already reconciled into the store.
    reconciled: HashSet<String>,
    /// temp id -> record, awaiting user retry or removal.
    failed: HashMap<MessageId, OutboundRecord>,
    /// Set on auth expiry; no dispatches start while paused.
    paused: bool,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the queue from persisted records. Failed records go to
    /// the failed set; the rest keep their FIFO order.
    pub fn load(&mut self, records: Vec<OutboundRecord>) {
        for record in records {
            if record.failed {
                self.failed.insert(record.temp_id.clone(), record);
            } else {
                self.queues
                    .entry(record.conversation_id.clone())
                    .or_default()
                    .push_back(record);
            }
        }
    }

    pub fn enqueue(&mut self, record: OutboundRecord) {
        self.queues
            .entry(record.conversation_id.clone())
            .or_default()
            .push_back(record);
    }

    /// Claim the head record for dispatch. Returns None while paused,
    /// while another dispatch for this conversation is in flight, or
    /// when the queue is empty.
    pub fn start(&mut self, conversation_id: &ConversationId) -> Option<OutboundRecord> {
        if self.paused || self.in_flight.contains(conversation_id) {
            return None;
        }
        let head = self.queues.get(conversation_id)?.front()?.clone();
        self.in_flight.insert(conversation_id.clone());
        Some(head)
    }

    /// The in-flight head succeeded; drop it and remember its
    /// correlation token.
    pub fn succeed(&mut self, conversation_id: &ConversationId) -> Option<OutboundRecord> {
        self.in_flight.remove(conversation_id);
        let record = self.queues.get_mut(conversation_id)?.pop_front()?;
        self.reconciled.insert(record.correlation.clone());
        Some(record)
    }

    /// The claimed record hit a transient error. Bumps its retry
    /// envelope in place and returns it, or None when attempts are
    /// exhausted (the record stays at the head; callers then `fail`).
    /// The head must still be the claimed record; an echo may have
    /// dropped it mid-flight, in which case this is a no-op.
    pub fn retry_later(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Option<RetryInfo> {
        self.in_flight.remove(conversation_id);
        let head = self.queues.get_mut(conversation_id)?.front_mut()?;
        if &head.temp_id != temp_id {
            return None;
        }
        let next = head.retry.next_attempt()?;
        head.retry = next.clone();
        Some(next)
    }

    /// The claimed record failed permanently; move it to the failed
    /// set. No-op when the head is no longer the claimed record.
    pub fn fail(
        &mut self,
        conversation_id: &ConversationId,
        temp_id: &MessageId,
    ) -> Option<OutboundRecord> {
        self.in_flight.remove(conversation_id);
        let queue = self.queues.get_mut(conversation_id)?;
        if queue.front()?.temp_id != *temp_id {
            return None;
        }
        let mut record = queue.pop_front()?;
        record.failed = true;
        self.failed.insert(record.temp_id.clone(), record.clone());
        Some(record)
    }

    /// Release the in-flight claim without consuming the head. Used on
    /// auth expiry, where the queue must survive intact.
    pub fn release(&mut self, conversation_id: &ConversationId) {
        self.in_flight.remove(conversation_id);
    }

    /// Record that a correlation token was matched to a server record.
    /// Returns false if it had been matched before (duplicate echo).
    pub fn mark_reconciled(&mut self, correlation: &str) -> bool {
        self.reconciled.insert(correlation.to_string())
    }

    pub fn is_reconciled(&self, correlation: &str) -> bool {
        self.reconciled.contains(correlation)
    }

    /// Drop a queued record whose correlation got matched by an echo
    /// before its REST dispatch finished.
    pub fn drop_by_correlation(&mut self, correlation: &str) -> Option<OutboundRecord> {
        for queue in self.queues.values_mut() {
            if let Some(position) = queue.iter().position(|r| r.correlation == correlation) {
                return queue.remove(position);
            }
        }
        None
    }

    /// Fallback correlation matching for servers that do not echo the
    /// token: match a queued record by content and send-time proximity.
    /// Known degradation; identical texts sent in quick succession can
    /// mismatch.
    pub fn find_queued_by_content(
        &self,
        conversation_id: &ConversationId,
        content: &str,
        created_at: DateTime<Utc>,
        window_secs: i64,
    ) -> Option<String> {
        let queue = self.queues.get(conversation_id)?;
        queue
            .iter()
            .find(|r| {
                r.draft.content == content
                    && (r.created_at - created_at).num_seconds().abs() <= window_secs
            })
            .map(|r| r.correlation.clone())
    }

    /// Move a failed record back to the tail of its queue with a fresh
    /// retry envelope. Re-enqueueing at the tail keeps later messages
    /// that already succeeded from reordering.
    pub fn retry_failed(&mut self, temp_id: &MessageId) -> Option<&OutboundRecord> {
        let mut record = self.failed.remove(temp_id)?;
        record.failed = false;
        record.retry = RetryInfo::new(record.retry.max_attempts);
        let conversation_id = record.conversation_id.clone();
        self.queues
            .entry(conversation_id.clone())
            .or_default()
            .push_back(record);
        self.queues
            .get(&conversation_id)
            .and_then(|queue| queue.back())
    }

    pub fn remove_failed(&mut self, temp_id: &MessageId) -> Option<OutboundRecord> {
        self.failed.remove(temp_id)
    }

    /// Drop every failed record for one conversation.
    pub fn clear_failed(&mut self, conversation_id: &ConversationId) -> Vec<OutboundRecord> {
        let (clear, keep): (Vec<_>, Vec<_>) = self
            .failed
            .drain()
            .partition(|(_, r)| &r.conversation_id == conversation_id);
        self.failed = keep.into_iter().collect();
        clear.into_iter().map(|(_, r)| r).collect()
    }

    pub fn failed_record(&self, temp_id: &MessageId) -> Option<&OutboundRecord> {
        self.failed.get(temp_id)
    }

    /// Stop starting new dispatches. In-flight claims must be released
    /// by their owners.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pending_len(&self, conversation_id: &ConversationId) -> usize {
        self.queues.get(conversation_id).map_or(0, VecDeque::len)
    }

    /// Conversations that have queued records, for draining after a
    /// reconnect.
    pub fn conversations_with_pending(&self) -> Vec<ConversationId> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Conversations that have failed records.
    pub fn conversations_with_failed(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self
            .failed
            .values()
            .map(|r| r.conversation_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Snapshot of everything belonging to one conversation (queued
    /// plus failed), for persistence.
    pub fn records_for(&self, conversation_id: &ConversationId) -> Vec<OutboundRecord> {
        let mut records: Vec<OutboundRecord> = self
            .queues
            .get(conversation_id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default();
        records.extend(
            self.failed
                .values()
                .filter(|r| &r.conversation_id == conversation_id)
                .cloned(),
        );
        records
    }
}

#[cfg(test)]
pub(crate) fn test_record(temp_id: &str, conversation_id: &str) -> OutboundRecord {
    OutboundRecord {
        temp_id: temp_id.to_string(),
        correlation: format!("k-{temp_id}"),
        conversation_id: conversation_id.to_string(),
        conversation_kind: ConversationKind::Group,
        draft: MessageDraft::text("test"),
        retry: RetryInfo::new(3),
        failed: false,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid() -> ConversationId {
        "c1".to_string()
    }

    #[test]
    fn test_fifo_per_conversation() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));

        let first = queue.start(&cid()).unwrap();
        assert_eq!(first.temp_id, "t1");
        queue.succeed(&cid());

        let second = queue.start(&cid()).unwrap();
        assert_eq!(second.temp_id, "t2");
    }

    #[test]
    fn test_single_in_flight_per_conversation() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));

        assert!(queue.start(&cid()).is_some());
        assert!(queue.start(&cid()).is_none());

        // A different conversation is unaffected
        queue.enqueue(test_record("t3", "c2"));
        assert!(queue.start(&"c2".to_string()).is_some());
    }

    #[test]
    fn test_retry_later_bumps_attempt_in_place() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));

        queue.start(&cid()).unwrap();
        let retry = queue.retry_later(&cid(), &"t1".to_string()).unwrap();
        assert_eq!(retry.attempt, 1);

        // The record stays at the head for the next dispatch
        let head = queue.start(&cid()).unwrap();
        assert_eq!(head.temp_id, "t1");
        assert_eq!(head.retry.attempt, 1);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut queue = OutboundQueue::new();
        let mut record = test_record("t1", "c1");
        record.retry = RetryInfo {
            attempt: 3,
            max_attempts: 3,
            base_delay_ms: 500,
        };
        queue.enqueue(record);

        queue.start(&cid()).unwrap();
        assert!(queue.retry_later(&cid(), &"t1".to_string()).is_none());

        let failed = queue.fail(&cid(), &"t1".to_string()).unwrap();
        assert_eq!(failed.temp_id, "t1");
        assert!(queue.failed_record(&"t1".to_string()).is_some());
        assert_eq!(queue.pending_len(&cid()), 0);
    }

    #[test]
    fn test_failure_of_head_does_not_block_tail() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));

        queue.start(&cid()).unwrap();
        queue.fail(&cid(), &"t1".to_string());

        let next = queue.start(&cid()).unwrap();
        assert_eq!(next.temp_id, "t2");
    }

    #[test]
    fn test_retry_failed_goes_to_tail() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));

        queue.start(&cid()).unwrap();
        queue.fail(&cid(), &"t1".to_string());

        // t2 is now the head; retrying t1 must not displace it
        let requeued = queue.retry_failed(&"t1".to_string()).unwrap();
        assert_eq!(requeued.retry.attempt, 0);
        assert!(!requeued.failed);

        let head = queue.start(&cid()).unwrap();
        assert_eq!(head.temp_id, "t2");
    }

    #[test]
    fn test_echo_during_flight_never_fails_next_record() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));

        let claimed = queue.start(&cid()).unwrap();
        // The echo lands while the REST call is still out
        queue.mark_reconciled(&claimed.correlation);
        queue.drop_by_correlation(&claimed.correlation);

        // A late error for t1 must not touch t2, now at the head
        assert!(queue.fail(&cid(), &claimed.temp_id).is_none());
        assert!(queue.retry_later(&cid(), &claimed.temp_id).is_none());
        assert!(queue.failed_record(&"t2".to_string()).is_none());
        let head = queue.start(&cid()).unwrap();
        assert_eq!(head.temp_id, "t2");
        assert_eq!(head.retry.attempt, 0);
    }

    #[test]
    fn test_correlation_dedupe() {
        let mut queue = OutboundQueue::new();
        assert!(queue.mark_reconciled("k1"));
        assert!(!queue.mark_reconciled("k1"));
        assert!(queue.is_reconciled("k1"));
    }

    #[test]
    fn test_drop_by_correlation() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));

        let dropped = queue.drop_by_correlation("k-t1").unwrap();
        assert_eq!(dropped.temp_id, "t1");
        assert_eq!(queue.pending_len(&cid()), 0);
    }

    #[test]
    fn test_pause_blocks_start_but_keeps_queue() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));

        queue.pause();
        assert!(queue.start(&cid()).is_none());
        assert_eq!(queue.pending_len(&cid()), 1);

        queue.resume();
        assert!(queue.start(&cid()).is_some());
    }

    #[test]
    fn test_release_keeps_head() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));

        queue.start(&cid()).unwrap();
        queue.release(&cid());

        let head = queue.start(&cid()).unwrap();
        assert_eq!(head.temp_id, "t1");
    }

    #[test]
    fn test_load_routes_failed_records() {
        let mut queue = OutboundQueue::new();
        let mut failed = test_record("t1", "c1");
        failed.failed = true;
        let queued = test_record("t2", "c1");

        queue.load(vec![failed, queued]);

        assert!(queue.failed_record(&"t1".to_string()).is_some());
        assert_eq!(queue.pending_len(&cid()), 1);
    }

    #[test]
    fn test_records_for_includes_failed() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.enqueue(test_record("t2", "c1"));
        queue.start(&cid());
        queue.fail(&cid(), &"t1".to_string());

        let records = queue.records_for(&cid());
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.failed));
    }

    #[test]
    fn test_clear_failed_scoped_to_conversation() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(test_record("t1", "c1"));
        queue.start(&cid());
        queue.fail(&cid(), &"t1".to_string());
        queue.enqueue(test_record("t9", "c2"));
        queue.start(&"c2".to_string());
        queue.fail(&"c2".to_string(), &"t9".to_string());

        let cleared = queue.clear_failed(&cid());
        assert_eq!(cleared.len(), 1);
        assert!(queue.failed_record(&"t9".to_string()).is_some());
    }
}
