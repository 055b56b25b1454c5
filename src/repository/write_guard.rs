//! Serialization of storage writes.
//!
//! Handlers wrap every storage access in [`WriteGuard::run`]. In
//! [`GuardMode::PerAggregate`] writers only wait for other writers of the same
//! aggregate key; [`GuardMode::Global`] serializes everything through one lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{CrawlError, Result};

const GLOBAL_KEY: &str = "*";

type LockMap = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardMode {
    #[default]
    PerAggregate,
    Global,
}

impl GuardMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardMode::PerAggregate => "per_aggregate",
            GuardMode::Global => "global",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "per_aggregate" | "aggregate" | "keyed" => Some(GuardMode::PerAggregate),
            "global" => Some(GuardMode::Global),
            _ => None,
        }
    }
}

/// Keyed async locks for storage writes.
#[derive(Clone, Default)]
pub struct WriteGuard {
    mode: GuardMode,
    locks: LockMap,
}

/// Held while a write runs; releases the key on drop.
pub struct WritePermit {
    guard: Option<OwnedMutexGuard<()>>,
    key: String,
    lock: Arc<Mutex<()>>,
    locks: LockMap,
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.guard.take();
        let Ok(mut map) = self.locks.lock() else {
            return;
        };
        // Only the map and this permit still reference the lock: nobody waits.
        if Arc::strong_count(&self.lock) <= 2 {
            map.remove(&self.key);
        }
    }
}

impl WriteGuard {
    pub fn new(mode: GuardMode) -> Self {
        Self {
            mode,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<WritePermit> {
        let key = match self.mode {
            GuardMode::PerAggregate => key.to_string(),
            GuardMode::Global => GLOBAL_KEY.to_string(),
        };

        let lock = {
            let mut map = self
                .locks
                .lock()
                .map_err(|_| CrawlError::Client("write guard poisoned".to_string()))?;
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = lock.clone().lock_owned() => Some(guard),
        };

        let permit = WritePermit {
            guard,
            key,
            lock,
            locks: self.locks.clone(),
        };
        if permit.guard.is_none() {
            // Dropping the permit prunes the entry if we were the last user.
            return Err(CrawlError::Cancelled);
        }
        trace!(key = %permit.key, "write guard acquired");
        Ok(permit)
    }

    /// Run `fut` while holding the lock for `key`.
    pub async fn run<F, T>(&self, key: &str, cancel: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire(key, cancel).await?;
        fut.await
    }

    /// Keys currently held or waited on.
    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Source row, its job launches and its manga catalog.
    pub fn source_key(source_id: &str) -> String {
        format!("source:{source_id}")
    }

    pub fn job_key(job_id: &str) -> String {
        format!("job:{job_id}")
    }

    pub fn manga_key(source_id: &str, source_manga_id: &str) -> String {
        format!("manga:{source_id}:{source_manga_id}")
    }

    pub fn chapter_key(manga_id: &str, source_chapter_id: &str) -> String {
        format!("chapter:{manga_id}:{source_chapter_id}")
    }

    pub fn pages_key(chapter_id: &str) -> String {
        format!("pages:{chapter_id}")
    }
}
