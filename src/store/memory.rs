use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{SharedStore, StoreError, StoreResult, WindowCount};

const INITIAL_PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
enum Slot {
    Text(String),
    Counter(u64),
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug)]
struct State {
    entries: HashMap<String, Entry>,
    prune_at: usize,
}

impl State {
    /// Insert an entry, dropping expired ones first once the map has grown
    /// past the prune threshold. Expiry itself is lazy, so no sweeper task is
    /// needed for correctness.
    fn insert(&mut self, key: &str, entry: Entry, now: Instant) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.prune_at {
            self.entries.retain(|_, entry| entry.is_live(now));
            self.prune_at = (self.entries.len() * 2).max(INITIAL_PRUNE_THRESHOLD);
        }
        self.entries.insert(key.to_string(), entry);
    }

    fn live(&self, key: &str, now: Instant) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| entry.is_live(now))
    }
}

/// In-process [`SharedStore`].
///
/// All operations take one mutex, so increments and conditional sets are
/// atomic with respect to each other. Time comes from `tokio::time`, which
/// lets tests drive windows with a paused clock.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                prune_at: INITIAL_PRUNE_THRESHOLD,
            }),
        }
    }

    /// Number of unexpired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.live(key, now).map(|entry| match &entry.slot {
            Slot::Text(value) => value.clone(),
            Slot::Counter(count) => count.to_string(),
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let entry = Entry {
            slot: Slot::Text(value.to_string()),
            expires_at: ttl.map(|ttl| now + ttl),
        };
        self.state.lock().insert(key, entry, now);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live(key, now).is_some() {
            return Ok(false);
        }
        let entry = Entry {
            slot: Slot::Text(value.to_string()),
            expires_at: Some(now + ttl),
        };
        state.insert(key, entry, now);
        Ok(true)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(entry) = state
            .entries
            .get_mut(key)
            .filter(|entry| entry.is_live(now))
        {
            let Slot::Counter(count) = &mut entry.slot else {
                return Err(StoreError::Backend(format!("key {key} does not hold a counter")));
            };
            *count += 1;
            let expires_in = entry
                .expires_at
                .map_or(window, |at| at.saturating_duration_since(now));
            return Ok(WindowCount {
                count: *count,
                expires_in,
            });
        }

        let entry = Entry {
            slot: Slot::Counter(1),
            expires_at: Some(now + window),
        };
        state.insert(key, entry, now);
        Ok(WindowCount {
            count: 1,
            expires_in: window,
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.state.lock().entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() -> Result<()> {
        let store = MemoryStore::new();
        store.set("k", "v", Some(Duration::from_secs(5))).await?;
        assert_eq!(store.get("k").await?, Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await?, None);
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_only_wins_once_until_expiry() -> Result<()> {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("jti", "rotated", Duration::from_secs(2)).await?);
        assert!(!store.set_if_absent("jti", "rotated", Duration::from_secs(2)).await?);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.set_if_absent("jti", "rotated", Duration::from_secs(2)).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn counter_resets_when_window_closes() -> Result<()> {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);
        assert_eq!(store.incr_with_expiry("c", window).await?.count, 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        let second = store.incr_with_expiry("c", window).await?;
        assert_eq!(second.count, 2);
        assert_eq!(second.expires_in, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.incr_with_expiry("c", window).await?.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn incr_on_text_entry_is_an_error() -> Result<()> {
        let store = MemoryStore::new();
        store.set("k", "v", None).await?;
        let err = store.incr_with_expiry("k", Duration::from_secs(1)).await.err();
        assert!(matches!(err, Some(StoreError::Backend(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_conditional_sets_have_one_winner() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", "x", Duration::from_secs(60))
                    .await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await?? {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_pruned_on_growth() -> Result<()> {
        let store = MemoryStore::new();
        for i in 0..INITIAL_PRUNE_THRESHOLD {
            store
                .set(&format!("old-{i}"), "v", Some(Duration::from_secs(1)))
                .await?;
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        store.set("fresh", "v", None).await?;
        assert_eq!(store.state.lock().entries.len(), 1);
        Ok(())
    }
}
