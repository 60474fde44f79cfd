//! Callisto is a library for running distributed read-through caches for immutable
//! ("static") resources.
//!
//! # Introduction
//! **Callisto** keeps byte-valued resources (rendered templates, compiled assets,
//! semi-constant master data) in memory, close to the applications which need them.
//! A process hosts one or more named cache **namespaces**. Each namespace answers
//! `get(key)` by consulting, in order, a local size-constrained LRU store, the peer
//! which owns the key on a consistent-hash ring, and finally a host-supplied origin
//! loader. Concurrent misses for the same key collapse into a single upstream load,
//! so an origin is asked at most once per key no matter how many clients stampede.
//!
//! Values are immutable once cached. This buys us a lot: views can be shared without
//! copying, peers can answer for each other without invalidation traffic, and the
//! eviction story reduces to a byte budget per namespace.
//!
//! # Features
//! * **Byte-budget LRU store** - each namespace evicts its least recently used
//!   entries once the configured memory budget is exceeded.
//! * **Single-flight loads** - duplicate concurrent misses for a key share one
//!   upstream load and observe the same result or error.
//! * **Consistent-hash peer routing** - keys are owned by exactly one member of the
//!   cluster; non-owners fetch from the owner instead of hitting the origin. Peers
//!   never forward keys they own themselves, so requests cannot ping-pong.
//! * **100% Async/Await** - everything builds upon [tokio](https://tokio.rs/) and
//!   the async/await primitives provided by Rust.
//! * **Reload-aware config facility** which permits to update the configuration
//!   (server address, peer topology) during operation without a restart. This
//!   matters for an in-memory application with an expensive warm-up.
//! * **Pluggable transports** - a compact TCP wire protocol (RESP framing, so any
//!   Redis client can poke a node) and an HTTP adapter for environments where
//!   plain HTTP is easier to route.
//!
//! # Modules
//! * **lru**: The generic recency cache and the thread-safe byte-budget store used
//!   by every namespace. See [crate::lru].
//! * **cache**: The namespace orchestrator and the process-wide namespace
//!   directory. This is the main entry point for hosts. See [crate::cache].
//! * **ring** / **peers**: Consistent hashing and peer selection. See
//!   [crate::peers].
//! * **server** / **transport**: The wire surface - the TCP server and the peer
//!   client adapters. See [crate::server] and [crate::transport].
//!
//! # Example
//! A complete runnable node can be found in the `callisto-io` crate of this
//! workspace. The short version:
//!
//! ```no_run
//! use callisto::builder::Builder;
//! use callisto::cache::{LoaderFn, Namespace};
//! use callisto::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Serve rendered greetings, at most 64 MiB of them...
//!     let _greetings = Namespace::create(
//!         "greetings",
//!         64 * 1024 * 1024,
//!         LoaderFn(|key: &str| Ok(format!("Hello {}!", key).into_bytes())),
//!     );
//!
//!     // Run the main event loop...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod lru;
pub mod peers;
pub mod platform;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod signals;
pub mod singleflight;
pub mod transport;

/// Contains the version of the callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the callisto build being used.
pub const CALLISTO_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder)
/// to set up the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Guarded by a Once as the integration tests would otherwise initialize the
    // logging system several times and crash...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use redis::{Connection, RedisError};
    use std::sync::Mutex;
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on
        /// shared resources. These are our test ports (1611 for the TCP server,
        /// 1612 for the HTTP adapter) and the process-wide namespace directory.
        /// Using this lock, all other tests still execute in parallel and only
        /// block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query in an async fashion.
    ///
    /// Our wire protocol uses RESP framing, therefore a stock Redis client is a
    /// perfectly fine integration test driver. We must not block tokio in any way,
    /// hence the query runs via spawn_blocking.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open("redis://127.0.0.1:1611").unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
