//! Durable event store contract and the in-memory implementation.
//!
//! The store is the sequencer: `append` reads the scope's current head and
//! writes `head + 1` as one atomic unit, so concurrent writers can never race
//! to the same seq and a failed write never burns one.

use async_trait::async_trait;
use chrono::Utc;
use smartspace_core::{Event, EventPayload, ScopeId, Seq, SpaceResult, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Append-only, per-scope event log with gapless sequencing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new event at the next seq of `scope`.
    async fn append(&self, scope: ScopeId, payload: EventPayload) -> SpaceResult<Event>;

    /// Events of `scope` with `seq > after`, ascending, at most `limit`.
    async fn read_from(&self, scope: ScopeId, after: Seq, limit: usize)
        -> SpaceResult<Vec<Event>>;

    /// Highest persisted seq of `scope`, 0 when empty.
    async fn head(&self, scope: ScopeId) -> SpaceResult<Seq>;
}

/// In-memory event store.
///
/// A single `RwLock` arbitrates all writers, which is what makes the
/// read-max-then-insert step atomic. Suitable for tests and single-process
/// development.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    scopes: Arc<RwLock<HashMap<ScopeId, Vec<Event>>>>,
    failures: Arc<AtomicU32>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail with `StorageError::Unavailable`.
    pub fn fail_next_appends(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total events across all scopes.
    pub fn len(&self) -> SpaceResult<usize> {
        let scopes = self.scopes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(scopes.values().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> SpaceResult<bool> {
        Ok(self.len()? == 0)
    }

    fn take_injected_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, scope: ScopeId, payload: EventPayload) -> SpaceResult<Event> {
        if self.take_injected_failure() {
            return Err(StorageError::Unavailable {
                reason: "injected failure".to_string(),
            }
            .into());
        }

        let mut scopes = self.scopes.write().map_err(|_| StorageError::LockPoisoned)?;
        let log = scopes.entry(scope).or_default();
        // Events are never removed, so the length is the head.
        let event = Event {
            scope,
            seq: log.len() as Seq + 1,
            timestamp: Utc::now(),
            payload,
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn read_from(
        &self,
        scope: ScopeId,
        after: Seq,
        limit: usize,
    ) -> SpaceResult<Vec<Event>> {
        let scopes = self.scopes.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(log) = scopes.get(&scope) else {
            return Ok(Vec::new());
        };
        let start = (after as usize).min(log.len());
        Ok(log[start..].iter().take(limit).cloned().collect())
    }

    async fn head(&self, scope: ScopeId) -> SpaceResult<Seq> {
        let scopes = self.scopes.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(scopes.get(&scope).map(|log| log.len() as Seq).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartspace_core::{EntityIdType, IdentityId, SpaceId};

    fn message(content: &str) -> EventPayload {
        EventPayload::UserMessage {
            sender: IdentityId::now_v7(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_seq_from_one() {
        let store = InMemoryEventStore::new();
        let scope = ScopeId::Space(SpaceId::now_v7());
        assert_eq!(store.head(scope).await.unwrap(), 0);

        let first = store.append(scope, message("a")).await.unwrap();
        let second = store.append(scope, message("b")).await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(store.head(scope).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scopes_are_sequenced_independently() {
        let store = InMemoryEventStore::new();
        let a = ScopeId::Space(SpaceId::now_v7());
        let b = ScopeId::Space(SpaceId::now_v7());
        store.append(a, message("a1")).await.unwrap();
        store.append(a, message("a2")).await.unwrap();
        let b1 = store.append(b, message("b1")).await.unwrap();
        assert_eq!(b1.seq, 1);
    }

    #[tokio::test]
    async fn test_failed_append_does_not_burn_seq() {
        let store = InMemoryEventStore::new();
        let scope = ScopeId::Space(SpaceId::now_v7());
        store.append(scope, message("a")).await.unwrap();

        store.fail_next_appends(1);
        let err = store.append(scope, message("lost")).await.unwrap_err();
        assert!(err.is_transient());

        let next = store.append(scope, message("b")).await.unwrap();
        assert_eq!(next.seq, 2);
    }

    #[tokio::test]
    async fn test_read_from_pages() {
        let store = InMemoryEventStore::new();
        let scope = ScopeId::Space(SpaceId::now_v7());
        for i in 0..10 {
            store.append(scope, message(&i.to_string())).await.unwrap();
        }
        let page = store.read_from(scope, 3, 4).await.unwrap();
        let seqs: Vec<Seq> = page.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6, 7]);

        assert!(store.read_from(scope, 10, 5).await.unwrap().is_empty());
        assert!(store.read_from(scope, 99, 5).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_are_gapless() {
        let store = InMemoryEventStore::new();
        let scope = ScopeId::Space(SpaceId::now_v7());

        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store
                        .append(scope, message(&format!("{}-{}", w, i)))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = store.read_from(scope, 0, 1000).await.unwrap();
        let seqs: Vec<Seq> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<_>>());
    }
}
