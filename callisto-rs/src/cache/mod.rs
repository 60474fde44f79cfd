//! Provides cache namespaces - the main entry point of callisto.
//!
//! A **namespace** is a named, independently budgeted cache scope. It answers
//! [get](Namespace::get) by consulting, in this order:
//!
//! 1. its local byte-budget [store](crate::lru::ByteStore) (hit: done),
//! 2. the peer owning the key on the consistent hash ring (if a
//!    [picker](crate::peers::ConsistentPicker) is configured),
//! 3. the host supplied [Loader](Loader), i.e. the origin.
//!
//! Misses are coalesced per key via [single flight](crate::singleflight), so any
//! number of concurrent readers cause at most one upstream load. Peer failures
//! are never surfaced - the namespace silently falls back to the origin within
//! the same coalesced load. Origin failures are surfaced to every waiting caller.
//!
//! Values fetched from a peer are intentionally **not** cached locally: the peer
//! owns the key, and caching its values here would duplicate working sets across
//! the cluster and undermine the per-namespace byte budgets.
//!
//! Namespaces are registered in a process-wide directory, which is what the wire
//! servers use to resolve incoming requests. They live for the lifetime of the
//! process.
//!
//! # Example
//! ```
//! # use callisto::cache::{LoaderFn, Namespace};
//! # #[tokio::main]
//! # async fn main() {
//! let namespace = Namespace::create(
//!     "doc_example",
//!     1024 * 1024,
//!     LoaderFn(|key: &str| Ok(format!("content of {}", key).into_bytes())),
//! );
//!
//! let view = namespace.get("index.html").await.unwrap();
//! assert_eq!(view.as_slice(), b"content of index.html");
//!
//! // The directory resolves registered namespaces by name...
//! assert_eq!(Namespace::find("doc_example").is_some(), true);
//! assert_eq!(Namespace::find("unknown").is_none(), true);
//! # }
//! ```
mod view;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::lru::{ByteStore, StoreStats};
use crate::peers::ConsistentPicker;
use crate::singleflight::SingleFlight;

pub use view::ByteView;

lazy_static::lazy_static! {
    /// The process-wide namespace directory. Registration takes the write lock,
    /// lookups the read lock.
    static ref DIRECTORY: RwLock<HashMap<String, Arc<Namespace>>> = RwLock::new(HashMap::new());
}

/// The origin data source of a namespace, supplied by the host.
///
/// The loader is consulted when both the local store and the owning peer miss
/// (or no peer topology is configured). The returned buffer becomes the cached
/// value; ownership passes to the namespace, which guarantees it is never
/// mutated afterwards.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the value for the given key from the origin.
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a plain closure into a [Loader](Loader).
///
/// # Example
/// ```
/// # use callisto::cache::{Loader, LoaderFn};
/// let loader = LoaderFn(|key: &str| Ok(key.as_bytes().to_vec()));
/// ```
pub struct LoaderFn<F>(pub F);

#[async_trait]
impl<F> Loader for LoaderFn<F>
where
    F: Fn(&str) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.0)(key)
    }
}

/// A named, independently budgeted, read-through cache scope.
///
/// See the [module docs](crate::cache) for the lookup protocol.
pub struct Namespace {
    name: String,
    limit: i64,
    store: ByteStore,
    loader: Box<dyn Loader>,
    picker: ArcSwapOption<ConsistentPicker>,
    flights: SingleFlight<ByteView>,
}

impl Namespace {
    /// Creates a namespace and registers it in the process-wide directory.
    ///
    /// **limit** is the byte budget of the local store: after every insertion,
    /// the least recently used entries are evicted until the occupancy is back
    /// under this limit.
    ///
    /// # Panics
    /// Panics if a namespace with the same name is already registered. Namespace
    /// names are wired into peer requests, so a silent double registration would
    /// mix two data sources under one name - we rather fail loudly at startup.
    pub fn create(name: &str, limit: i64, loader: impl Loader + 'static) -> Arc<Namespace> {
        let mut directory = DIRECTORY.write().unwrap();

        if directory.contains_key(name) {
            panic!("Duplicate registration of cache namespace: {}", name);
        }

        let namespace = Arc::new(Namespace {
            name: name.to_owned(),
            limit,
            store: ByteStore::new(),
            loader: Box::new(loader),
            picker: ArcSwapOption::empty(),
            flights: SingleFlight::new(),
        });

        let _ = directory.insert(name.to_owned(), namespace.clone());
        log::info!("Created cache namespace {} ({} bytes).", name, limit);

        namespace
    }

    /// Resolves a registered namespace by name.
    pub fn find(name: &str) -> Option<Arc<Namespace>> {
        DIRECTORY.read().unwrap().get(name).cloned()
    }

    /// Resolves a registered namespace by name.
    ///
    /// # Panics
    /// Panics if no namespace with the given name is registered.
    pub fn require(name: &str) -> Arc<Namespace> {
        match Namespace::find(name) {
            Some(namespace) => namespace,
            None => panic!("The required cache namespace {} is not registered!", name),
        }
    }

    /// Lists all registered namespaces, sorted by name.
    pub fn all() -> Vec<Arc<Namespace>> {
        let directory = DIRECTORY.read().unwrap();
        let mut namespaces: Vec<_> = directory.values().cloned().collect();
        namespaces.sort_by(|left, right| left.name.cmp(&right.name));

        namespaces
    }

    /// Returns the name of this namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the byte budget of the local store.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// Installs (or replaces) the peer picker of this namespace.
    ///
    /// Without a picker, every miss goes straight to the loader.
    pub fn set_picker(&self, picker: Arc<ConsistentPicker>) {
        self.picker.store(Some(picker));
    }

    /// Returns the value for the given key.
    ///
    /// On a local store hit the cached view is returned directly (sharing the
    /// buffer - views are immutable). Otherwise the load is coalesced per key:
    /// if the key is owned by a remote peer, it is fetched from there (and not
    /// cached locally); if the peer fails or the key is owned locally, the
    /// origin loader is consulted and its value is cached.
    ///
    /// # Errors
    /// Fails if and only if the origin loader fails. Peer errors are handled by
    /// falling back to the origin.
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if let Some(view) = self.store.get(key) {
            return Ok(view);
        }

        self.flights
            .throttle(key, || self.load(key))
            .await
            .map_err(anyhow::Error::new)
    }

    /// Performs the actual (coalesced) load of a missing key.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        if let Some(picker) = self.picker.load_full() {
            if let Some(peer) = picker.pick_server(key) {
                match peer.fetch(&self.name, key).await {
                    // The owning peer answered - serve its bytes without caching
                    // them here (the value stays accounted to its owner)...
                    Ok(data) => return Ok(ByteView::from(data)),
                    Err(error) => log::warn!(
                        "Peer {} failed to deliver {}/{}: {:#}. Falling back to the origin...",
                        peer.name(),
                        self.name,
                        key,
                        error
                    ),
                }
            }
        }

        let data = self.loader.load(key).await?;
        let view = ByteView::from(data);
        self.populate(key, view.clone());

        Ok(view)
    }

    /// Inserts a freshly loaded value and enforces the byte budget.
    fn populate(&self, key: &str, view: ByteView) {
        self.store.add(key.to_owned(), view);

        while self.store.bytes() > self.limit {
            self.store.remove_oldest();
        }
    }

    /// Returns a snapshot of the local store counters.
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::{Loader, LoaderFn, Namespace};
    use crate::peers::{CachePeer, ConsistentPicker};
    use crate::ring::HashFn;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    /// A loader which counts its invocations and answers `<key>-value`.
    struct CountingLoader {
        invocations: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(invocations: Arc<AtomicUsize>, delay: Duration) -> Self {
            CountingLoader { invocations, delay }
        }
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.invocations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("{}-value", key).into_bytes())
        }
    }

    /// A peer stub which either serves `<key>@<name>` or fails, counting fetches.
    struct StubPeer {
        name: String,
        healthy: bool,
        fetches: Arc<AtomicUsize>,
    }

    impl StubPeer {
        fn new(name: &str, healthy: bool, fetches: Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(StubPeer {
                name: name.to_owned(),
                healthy,
                fetches,
            })
        }
    }

    #[async_trait]
    impl CachePeer for StubPeer {
        async fn fetch(&self, _namespace: &str, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.healthy {
                Ok(format!("{}@{}", key, self.name).into_bytes())
            } else {
                Err(anyhow::anyhow!("peer unreachable"))
            }
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn scheme(&self) -> &str {
            "stub"
        }
    }

    fn decimal_hash() -> HashFn {
        Arc::new(|data: &[u8]| std::str::from_utf8(data).unwrap().parse().unwrap())
    }

    /// Builds a picker in which the local member "1" owns the positions around 10
    /// and the given remote member "2" owns the positions around 20.
    fn two_member_picker(remote: Arc<StubPeer>) -> Arc<ConsistentPicker> {
        let mut picker = ConsistentPicker::new()
            .with_replicas(1)
            .with_hash_fn(decimal_hash());
        let remotes: Vec<Arc<dyn CachePeer>> = vec![remote];
        picker.set_servers(
            StubPeer::new("1", true, Arc::new(AtomicUsize::new(0))),
            remotes,
        );

        Arc::new(picker)
    }

    #[test]
    fn concurrent_misses_invoke_the_loader_once() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let namespace = Namespace::create(
                "ns_read_through",
                1024 * 1024,
                CountingLoader::new(invocations.clone(), Duration::from_millis(20)),
            );

            let mut handles = Vec::new();
            for _ in 0..20 {
                let namespace = namespace.clone();
                handles.push(tokio::spawn(async move {
                    namespace.get("index.html").await.unwrap()
                }));
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap().as_slice(), b"index.html-value");
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // The value is cached now - another read must not hit the loader...
            let view = namespace.get("index.html").await.unwrap();
            assert_eq!(view.as_slice(), b"index.html-value");
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn peer_failures_fall_back_to_the_origin() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let fetches = Arc::new(AtomicUsize::new(0));
            let namespace = Namespace::create(
                "ns_peer_fallback",
                1024 * 1024,
                CountingLoader::new(invocations.clone(), Duration::from_millis(1)),
            );
            namespace.set_picker(two_member_picker(StubPeer::new(
                "2",
                false,
                fetches.clone(),
            )));

            // "15" is owned by the (broken) remote member: the fetch fails and the
            // origin answers within the same coalesced load...
            let view = namespace.get("15").await.unwrap();
            assert_eq!(view.as_slice(), b"15-value");
            assert_eq!(fetches.load(Ordering::SeqCst), 1);
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            // ...and the origin value is cached: the second read hits neither the
            // peer nor the loader.
            let view = namespace.get("15").await.unwrap();
            assert_eq!(view.as_slice(), b"15-value");
            assert_eq!(fetches.load(Ordering::SeqCst), 1);
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn self_owned_keys_skip_the_peer_path() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let fetches = Arc::new(AtomicUsize::new(0));
            let namespace = Namespace::create(
                "ns_self_owned",
                1024 * 1024,
                CountingLoader::new(invocations.clone(), Duration::from_millis(1)),
            );
            namespace.set_picker(two_member_picker(StubPeer::new(
                "2",
                true,
                fetches.clone(),
            )));

            // "5" is owned by the local member: the remote peer is never asked.
            let view = namespace.get("5").await.unwrap();
            assert_eq!(view.as_slice(), b"5-value");
            assert_eq!(fetches.load(Ordering::SeqCst), 0);
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn peer_values_are_served_but_not_cached() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            let fetches = Arc::new(AtomicUsize::new(0));
            let namespace = Namespace::create(
                "ns_peer_bypass",
                1024 * 1024,
                CountingLoader::new(invocations.clone(), Duration::from_millis(1)),
            );
            namespace.set_picker(two_member_picker(StubPeer::new(
                "2",
                true,
                fetches.clone(),
            )));

            // "15" is owned by the healthy remote member...
            let view = namespace.get("15").await.unwrap();
            assert_eq!(view.as_slice(), b"15@2");
            assert_eq!(invocations.load(Ordering::SeqCst), 0);

            // ...and its value is not cached locally: the store stays empty and a
            // second read asks the peer again.
            assert_eq!(namespace.stats().entries, 0);
            let view = namespace.get("15").await.unwrap();
            assert_eq!(view.as_slice(), b"15@2");
            assert_eq!(fetches.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn the_byte_budget_is_enforced() {
        test_async(async {
            let invocations = Arc::new(AtomicUsize::new(0));
            // Each entry occupies key (2 bytes) + value (8 bytes) = 10 bytes, the
            // budget fits three of them...
            let namespace = Namespace::create(
                "ns_budget",
                30,
                CountingLoader::new(invocations.clone(), Duration::from_millis(1)),
            );

            for key in &["k0", "k1", "k2", "k3", "k4"] {
                let _ = namespace.get(key).await.unwrap();
            }

            let stats = namespace.stats();
            assert_eq!(stats.bytes <= 30, true);
            assert_eq!(stats.entries, 3);

            // The oldest keys were evicted, so reading them loads again...
            assert_eq!(invocations.load(Ordering::SeqCst), 5);
            let _ = namespace.get("k0").await.unwrap();
            assert_eq!(invocations.load(Ordering::SeqCst), 6);

            // ...while the most recent one is still cached.
            let _ = namespace.get("k4").await.unwrap();
            assert_eq!(invocations.load(Ordering::SeqCst), 6);
        });
    }

    #[test]
    fn loader_errors_are_surfaced() {
        test_async(async {
            let namespace = Namespace::create(
                "ns_loader_error",
                1024,
                LoaderFn(|key: &str| Err(anyhow::anyhow!("no origin for {}", key))),
            );

            let error = namespace.get("broken").await.unwrap_err();
            assert_eq!(format!("{:#}", error).contains("no origin for broken"), true);

            // Nothing was cached...
            assert_eq!(namespace.stats().entries, 0);
        });
    }

    #[test]
    #[should_panic]
    fn duplicate_registration_panics() {
        let _ = Namespace::create(
            "ns_duplicate",
            1024,
            LoaderFn(|_key: &str| Ok(Vec::new())),
        );
        let _ = Namespace::create(
            "ns_duplicate",
            1024,
            LoaderFn(|_key: &str| Ok(Vec::new())),
        );
    }
}
