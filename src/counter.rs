//! Filename counter allocation.
//!
//! The next free suffix for a `(folder, stem)` scope is derived by scanning the
//! folder, so two batches that scan before either writes would collide. Each
//! scope therefore gets its own async mutex; a [`CounterLease`] holds it from
//! the scan until the batch's last write, and unrelated scopes never wait on
//! each other.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{SinkError, SinkResult};

type ScopeKey = (PathBuf, String);
type Registry = Arc<Mutex<HashMap<ScopeKey, Arc<AsyncMutex<()>>>>>;

#[derive(Default, Clone)]
pub struct CounterAllocator {
    scopes: Registry,
}

impl CounterAllocator {
    pub fn new() -> Self { Self::default() }

    /// Lock the scope and scan it. Waits while another lease on the same scope is alive.
    ///
    /// There is no one-shot allocation: a number is only collision-free while the
    /// lease that handed it out is alive, so keep the lease until the file is written.
    pub async fn reserve(&self, folder: &Path, stem: &str) -> SinkResult<CounterLease> {
        let key: ScopeKey = (folder.to_path_buf(), stem.to_string());
        let lock = {
            let mut scopes = self.scopes.lock();
            scopes.entry(key.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        let mut lease = CounterLease { next: 0, last: None, key, lock, guard: Some(guard), scopes: self.scopes.clone() };
        lease.next = scan_next(folder, stem).await?;
        tracing::debug!(folder = %folder.display(), stem, next = lease.next, "counter scope reserved");
        Ok(lease)
    }

    #[cfg(test)]
    pub(crate) fn active_scopes(&self) -> usize { self.scopes.lock().len() }
}

/// Exclusive hold on one counter scope. Successive [`next`](Self::next) calls
/// return a contiguous increasing run.
pub struct CounterLease {
    next: u64,
    last: Option<u64>,
    key: ScopeKey,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    scopes: Registry,
}

impl CounterLease {
    /// Hand out the current number and move past it.
    pub fn next(&mut self) -> SinkResult<u64> {
        let n = self.next;
        self.next = n.checked_add(1).ok_or_else(|| exhausted(&self.key))?;
        self.last = Some(n);
        Ok(n)
    }

    /// Give back the number from the last [`next`](Self::next) after its write failed.
    pub fn rewind(&mut self) {
        if let Some(n) = self.last.take() {
            self.next = n;
        }
    }

    pub fn peek(&self) -> u64 { self.next }
}

impl Drop for CounterLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut scopes = self.scopes.lock();
        // registry + this lease; anyone else waiting holds another clone
        if Arc::strong_count(&self.lock) == 2 {
            scopes.remove(&self.key);
        }
    }
}

/// One past the highest `{stem}_{digits}` suffix in `folder`, or 1.
pub async fn scan_next(folder: &Path, stem: &str) -> SinkResult<u64> {
    let mut rd = match tokio::fs::read_dir(folder).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(SinkError::write(folder, e)),
    };
    let mut max = 0u64;
    while let Some(ent) = rd.next_entry().await.map_err(|e| SinkError::write(folder, e))? {
        let name = ent.file_name();
        if let Some(n) = name.to_str().and_then(|n| parse_counter(n, stem)) {
            max = max.max(n);
        }
    }
    max.checked_add(1).ok_or_else(|| exhausted(&(folder.to_path_buf(), stem.to_string())))
}

fn exhausted((folder, stem): &ScopeKey) -> SinkError {
    SinkError::CounterExhausted { folder: folder.clone(), stem: stem.clone() }
}

/// Accepts `{stem}_{digits}.{ext}` and the host sink's `{stem}_{digits}_.{ext}`.
fn parse_counter(name: &str, stem: &str) -> Option<u64> {
    let rest = name.strip_prefix(stem)?.strip_prefix('_')?;
    let base = rest.split('.').next()?;
    let digits = base.strip_suffix('_').unwrap_or(base);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
