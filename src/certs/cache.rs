//! Atomically swappable holder for the current serving bundle.
//!
//! Readers load an `Arc` snapshot without locking; writers replace the whole
//! bundle with a single store. Subscribers receive a generation counter over a
//! watch channel, which never blocks the writer.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;

use crate::certs::bundle::CertificateBundle;

/// Shared handle to the bundle cell. Clones refer to the same cell.
#[derive(Clone)]
pub struct BundleCache {
    inner: Arc<Inner>,
}

struct Inner {
    current: ArcSwapOption<CertificateBundle>,
    generation: watch::Sender<u64>,
}

impl BundleCache {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                current: ArcSwapOption::empty(),
                generation,
            }),
        }
    }

    /// The current bundle, if one has been installed.
    pub fn get(&self) -> Option<Arc<CertificateBundle>> {
        self.inner.current.load_full()
    }

    /// Replace the current bundle and notify subscribers.
    pub fn set(&self, bundle: Arc<CertificateBundle>) {
        self.inner.current.store(Some(bundle));
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Number of `set` calls so far.
    pub fn generation(&self) -> u64 {
        *self.inner.generation.borrow()
    }

    /// Receive the generation counter after every `set`.
    ///
    /// Slow subscribers only ever see the latest generation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }
}

impl Default for BundleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BundleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleCache")
            .field("generation", &self.generation())
            .field("loaded", &self.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::bundle::tests::self_signed;

    fn bundle(host: &str) -> Arc<CertificateBundle> {
        let pair = self_signed(host);
        Arc::new(
            CertificateBundle::from_pem(pair.cert_pem.as_bytes(), pair.key_pem.as_bytes(), None)
                .unwrap(),
        )
    }

    #[test]
    fn starts_empty() {
        let cache = BundleCache::new();
        assert!(cache.get().is_none());
        assert_eq!(cache.generation(), 0);
    }

    #[test]
    fn set_replaces_whole_bundle() {
        let cache = BundleCache::new();
        let a = bundle("a.example");
        let b = bundle("b.example");

        cache.set(a.clone());
        let snapshot = cache.get().unwrap();
        assert!(Arc::ptr_eq(&snapshot, &a));

        cache.set(b.clone());
        assert!(Arc::ptr_eq(&cache.get().unwrap(), &b));
        // A reader holding the old snapshot keeps a consistent pair.
        assert_eq!(snapshot.leaf(), a.leaf());
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn set_without_subscribers_does_not_block() {
        let cache = BundleCache::new();
        for _ in 0..3 {
            cache.set(bundle("localhost"));
        }
        assert_eq!(cache.generation(), 3);
    }

    #[tokio::test]
    async fn subscribers_observe_generations() {
        let cache = BundleCache::new();
        let mut rx = cache.subscribe();
        let clone = cache.clone();

        tokio::spawn(async move {
            clone.set(bundle("localhost"));
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(cache.get().is_some());
    }
}
