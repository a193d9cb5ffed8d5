//! Memory store that can be switched off, or made to stall right after it
//! has applied a claim.

use async_trait::async_trait;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use super::{MemoryStore, SharedStore, StoreError, StoreResult, WindowCount};

#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    down: AtomicBool,
    stall_after_claim: AtomicBool,
}

impl FaultyStore {
    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// `set_if_absent` still writes, but its reply never arrives.
    pub(crate) fn set_stall_after_claim(&self, stall: bool) {
        self.stall_after_claim.store(stall, Ordering::SeqCst);
    }

    pub(crate) fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for FaultyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        let created = self.inner.set_if_absent(key, value, ttl).await?;
        if self.stall_after_claim.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(created)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> StoreResult<WindowCount> {
        self.check()?;
        self.inner.incr_with_expiry(key, window).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}
