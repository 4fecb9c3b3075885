//! Component D: the LIFO worker cache.
//!
//! Every operation that touches the deque is a single, non-suspending
//! critical section behind a plain [`std::sync::Mutex`] -- never a
//! `tokio::sync::Mutex`, so holding it across an `.await` is a compile
//! error rather than a latent bug.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::BrokenWorker;
use crate::handle::WorkerHandle;

/// How long [`WorkerCache::clear`] waits for each worker to exit on its own
/// before escalating to a kill.
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// LIFO pool of idle worker handles.
#[derive(Default)]
pub struct WorkerCache {
    handles: Mutex<VecDeque<WorkerHandle>>,
}

impl WorkerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the most recently pushed *live* handle, discarding any dead ones
    /// found along the way. Returns `None` on a clean miss.
    pub fn pop(&self) -> Option<WorkerHandle> {
        let mut handles = self.handles.lock().unwrap();
        while let Some(mut candidate) = handles.pop_back() {
            if candidate.is_alive() {
                return Some(candidate);
            }
            log::debug!("cache.pop: discarding dead handle");
        }
        None
    }

    /// Push a handle onto the hot end. Caller must only push handles that
    /// are idle and believed alive.
    pub fn push(&self, handle: WorkerHandle) {
        self.handles.lock().unwrap().push_back(handle);
    }

    /// Remove dead handles from the cold end until a live one is seen or
    /// the cache empties. O(number of reaped handles).
    pub fn prune(&self) {
        let mut handles = self.handles.lock().unwrap();
        while let Some(front) = handles.front_mut() {
            if front.is_alive() {
                break;
            }
            handles.pop_front();
            log::debug!("cache.prune: discarded dead handle");
        }
    }

    /// Number of idle handles currently cached. Exposed mainly for tests.
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<WorkerHandle> {
        self.handles.lock().unwrap().drain(..).collect()
    }

    /// Ask every cached handle to exit. The wire protocol has no distinct
    /// "please exit" message, so this always kills outright (shutting the
    /// channel down releases a blocked `poll()` immediately) and waits up
    /// to [`DEFAULT_SHUTDOWN_GRACE_PERIOD`] per handle for the exit to be
    /// observed. Empty afterward regardless of outcome.
    pub async fn clear(&self) -> Result<(), BrokenWorker> {
        let drained = self.drain();
        let mut failures = 0usize;
        for mut handle in drained {
            handle.kill().await;
            if tokio::time::timeout(DEFAULT_SHUTDOWN_GRACE_PERIOD, handle.wait())
                .await
                .is_err()
            {
                log::warn!("cache.clear: worker didn't report exit within grace period");
                failures += 1;
            }
        }
        if failures > 0 {
            Err(BrokenWorker::ClearFailed(failures))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cache_is_empty() {
        let cache = WorkerCache::new();
        assert!(cache.is_empty());
        assert!(cache.pop().is_none());
    }
}
