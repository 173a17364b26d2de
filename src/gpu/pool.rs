use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::debug;

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

/// Explicit handle over accelerator caches. `release` runs every registered
/// cache-clearing hook; callers decide when, the evaluation path does it
/// exactly once per call.
#[derive(Clone, Default)]
pub struct AcceleratorPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    hooks: RwLock<Vec<(String, ReleaseHook)>>,
    releases: AtomicUsize,
}

impl AcceleratorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook run on every release, e.g. dropping a KV cache.
    pub fn register(&self, name: impl Into<String>, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.hooks.write().push((name.into(), Box::new(hook)));
    }

    pub fn release(&self) {
        let started = Instant::now();
        let hooks = self.inner.hooks.read();
        for (name, hook) in hooks.iter() {
            debug!(hook = %name, "Running accelerator release hook");
            hook();
        }
        let count = self.inner.releases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            hooks = hooks.len(),
            releases = count,
            elapsed = ?started.elapsed(),
            "Released accelerator caches"
        );
    }

    /// Number of `release` calls so far.
    pub fn release_count(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Release when the returned guard goes out of scope.
    pub fn guard(&self) -> ReleaseGuard {
        ReleaseGuard {
            pool: self.clone(),
            released: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl fmt::Debug for AcceleratorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorPool")
            .field("hooks", &self.inner.hooks.read().len())
            .field("releases", &self.release_count())
            .finish()
    }
}

/// Releases its pool at most once across all clones. The first clone to
/// call `release` or to be dropped performs the release.
#[derive(Debug, Clone)]
pub struct ReleaseGuard {
    pool: AcceleratorPool,
    released: Arc<AtomicBool>,
}

impl ReleaseGuard {
    /// Release now. Returns `false` if some clone already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.pool.release();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.release();
    }
}
