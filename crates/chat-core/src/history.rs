//! Bounded, newest-first history per scope key.
//!
//! Each scope is a list in the backing store capped at `max_len` entries.
//! Appends and reads on the same scope are serialised through a per-scope
//! lock, so a reader never observes the list between the push and the trim.
//! A scope's lock only lives in the map while some caller holds it.

use crate::codec::{decode_envelope_bytes, encode_envelope};
use crate::envelope::Envelope;
use crate::error::ChatResult;
use crate::store::ListStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Default number of entries kept per scope.
pub const DEFAULT_HISTORY_LEN: usize = 300;

pub struct HistoryStore {
    store: Arc<dyn ListStore>,
    max_len: usize,
    scope_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl HistoryStore {
    /// Create a history store capped at `max_len` entries per scope.
    pub fn new(store: Arc<dyn ListStore>, max_len: usize) -> Self {
        Self {
            store,
            max_len: max_len.max(1),
            scope_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    async fn scope_lock(&self, scope: &str) -> Arc<RwLock<()>> {
        let mut locks = self.scope_locks.lock().await;
        locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop the map's entry for `scope` if `lock` is the last outside handle.
    async fn release_scope(&self, scope: &str, lock: Arc<RwLock<()>>) {
        let mut locks = self.scope_locks.lock().await;
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(scope);
        }
    }

    /// Prepend an envelope to the scope, then trim the scope to `max_len`.
    pub async fn append(&self, scope: &str, envelope: &Envelope) -> ChatResult<()> {
        let encoded = encode_envelope(envelope)?.into_bytes();
        let lock = self.scope_lock(scope).await;
        let result = {
            let _guard = lock.write().await;
            self.store
                .push_front_trimmed(scope, encoded, self.max_len)
                .await
        };
        self.release_scope(scope, lock).await;
        result?;
        debug!(scope, id = %envelope.id, "history appended");
        Ok(())
    }

    /// Read up to `limit` envelopes newest-first, skipping `offset`.
    ///
    /// A missing scope yields an empty list. Entries that no longer decode
    /// are skipped with a warning.
    pub async fn range(&self, scope: &str, offset: usize, limit: usize) -> ChatResult<Vec<Envelope>> {
        let lock = self.scope_lock(scope).await;
        let raw = {
            let _guard = lock.read().await;
            self.store
                .range(scope, offset, limit.min(self.max_len))
                .await
        };
        self.release_scope(scope, lock).await;
        let raw = raw?;
        let mut envelopes = Vec::with_capacity(raw.len());
        for entry in raw {
            match decode_envelope_bytes(&entry) {
                Ok(env) => envelopes.push(env),
                Err(e) => warn!(scope, error = %e, "skipping undecodable history entry"),
            }
        }
        Ok(envelopes)
    }

    /// Number of entries stored for the scope.
    pub async fn len(&self, scope: &str) -> ChatResult<usize> {
        let lock = self.scope_lock(scope).await;
        let len = {
            let _guard = lock.read().await;
            self.store.len(scope).await
        };
        self.release_scope(scope, lock).await;
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn history(max_len: usize) -> (Arc<MemoryStore>, HistoryStore) {
        let backing = Arc::new(MemoryStore::new());
        let history = HistoryStore::new(backing.clone(), max_len);
        (backing, history)
    }

    #[tokio::test]
    async fn range_is_newest_first() {
        let (_, history) = history(10);
        history.append("s", &Envelope::chat("a", "b", "first")).await.unwrap();
        history.append("s", &Envelope::chat("a", "b", "second")).await.unwrap();
        let items = history.range("s", 0, 10).await.unwrap();
        let texts: Vec<_> = items.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn missing_scope_is_empty() {
        let (_, history) = history(10);
        assert!(history.range("nobody", 0, 10).await.unwrap().is_empty());
        assert_eq!(history.len("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_scope_evicts_oldest() {
        let (_, history) = history(DEFAULT_HISTORY_LEN);
        for i in 0..DEFAULT_HISTORY_LEN {
            history
                .append("messages:bob", &Envelope::chat("a", "bob", &format!("m{i}")))
                .await
                .unwrap();
        }
        history
            .append("messages:bob", &Envelope::chat("a", "bob", "newest"))
            .await
            .unwrap();

        assert_eq!(history.len("messages:bob").await.unwrap(), DEFAULT_HISTORY_LEN);
        let items = history.range("messages:bob", 0, DEFAULT_HISTORY_LEN).await.unwrap();
        assert_eq!(items.len(), DEFAULT_HISTORY_LEN);
        assert_eq!(items[0].text, "newest");
        assert!(items.iter().all(|e| e.text != "m0"));
        assert_eq!(items[DEFAULT_HISTORY_LEN - 1].text, "m1");
    }

    #[tokio::test]
    async fn reads_never_exceed_cap() {
        let (_, history) = history(5);
        for i in 0..20 {
            history.append("s", &Envelope::chat("a", "b", &i.to_string())).await.unwrap();
            let items = history.range("s", 0, usize::MAX).await.unwrap();
            assert!(items.len() <= 5);
        }
    }

    #[tokio::test]
    async fn concurrent_writers_keep_cap() {
        let (_, history) = history(50);
        let history = Arc::new(history);
        let mut tasks = Vec::new();
        for writer in 0..8 {
            let history = history.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..40 {
                    let env = Envelope::chat(&format!("w{writer}"), "room", &i.to_string());
                    history.append("s", &env).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(history.len("s").await.unwrap(), 50);
    }

    #[tokio::test]
    async fn idle_scopes_hold_no_lock() {
        let (_, history) = history(10);
        for i in 0..100 {
            let receiver = format!("user{i}");
            let scope = format!("messages:{receiver}");
            history.append(&scope, &Envelope::chat("a", &receiver, "hi")).await.unwrap();
            history.range(&scope, 0, 10).await.unwrap();
            history.len(&scope).await.unwrap();
        }
        assert!(history.scope_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped() {
        let (backing, history) = history(10);
        history.append("s", &Envelope::chat("a", "b", "ok")).await.unwrap();
        backing.push_front("s", b"garbage".to_vec()).await.unwrap();
        let items = history.range("s", 0, 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].text, "ok");
    }
}
