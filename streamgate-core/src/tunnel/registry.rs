//! Upstream connection handles and their registry.
//!
//! Every tunnel acquires one handle per upstream URL and releases it from
//! its shutdown path, exactly once. The registry seam keeps the delivery
//! engine independent of how upstream connections are actually tracked.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::debug;

/// An opaque handle to one upstream connection.
///
/// Release is idempotent: shutdown paths may race and the handle absorbs
/// the duplicates.
pub trait UpstreamHandle: Send + Sync {
    /// The upstream URL this handle tracks.
    fn url(&self) -> &str;

    /// Releases the handle's resources. Safe to call repeatedly.
    fn release(&self);
}

/// Hands out upstream handles for tunnel inputs.
pub trait UpstreamRegistry: Send + Sync {
    fn acquire(&self, url: &str) -> Arc<dyn UpstreamHandle>;

    /// Number of handles currently held, for diagnostics.
    fn active(&self) -> usize;
}

struct TrackedHandle {
    url: String,
    released: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl UpstreamHandle for TrackedHandle {
    fn url(&self) -> &str {
        &self.url
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            debug!(url = %self.url, "upstream handle released");
        }
    }
}

impl Drop for TrackedHandle {
    fn drop(&mut self) {
        // Leaked handles still come off the active count.
        self.release();
    }
}

/// Production registry: tracks the number of live upstream connections.
#[derive(Default)]
pub struct TunnelRegistry {
    active: Arc<AtomicUsize>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpstreamRegistry for TunnelRegistry {
    fn acquire(&self, url: &str) -> Arc<dyn UpstreamHandle> {
        self.active.fetch_add(1, Ordering::SeqCst);
        Arc::new(TrackedHandle {
            url: url.to_string(),
            released: AtomicBool::new(false),
            active: Arc::clone(&self.active),
        })
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Test registry counting every release call, duplicates included.
#[derive(Default)]
pub struct CountingRegistry {
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl CountingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Total release side effects that actually fired.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct CountingHandle {
    url: String,
    released: AtomicBool,
    counter: Arc<AtomicUsize>,
}

impl UpstreamHandle for CountingHandle {
    fn url(&self) -> &str {
        &self.url
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl UpstreamRegistry for CountingRegistry {
    fn acquire(&self, url: &str) -> Arc<dyn UpstreamHandle> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Arc::new(CountingHandle {
            url: url.to_string(),
            released: AtomicBool::new(false),
            counter: Arc::clone(&self.released),
        })
    }

    fn active(&self) -> usize {
        self.acquired() - self.released()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_handle_release_is_idempotent() {
        let registry = TunnelRegistry::new();
        let handle = registry.acquire("https://example.com/a");
        assert_eq!(registry.active(), 1);

        handle.release();
        handle.release();
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_dropping_unreleased_handle_decrements() {
        let registry = TunnelRegistry::new();
        {
            let _handle = registry.acquire("https://example.com/a");
            assert_eq!(registry.active(), 1);
        }
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_counting_registry_counts_once_per_handle() {
        let registry = CountingRegistry::new();
        let a = registry.acquire("a");
        let b = registry.acquire("b");
        a.release();
        a.release();
        b.release();
        assert_eq!(registry.acquired(), 2);
        assert_eq!(registry.released(), 2);
    }
}
