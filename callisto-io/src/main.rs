//! A runnable callisto node which serves static resources from disk.
//!
//! Each configured namespace maps to a directory; a cache miss reads the
//! requested file from there. Combined with the peer topology from the config,
//! a handful of these nodes form a distributed read-through cache for a shared
//! (e.g. NFS or object-storage mounted) resource tree.
//!
//! # Configuration
//! ```yaml
//! server:
//!     port: 2511
//! http:
//!     port: 8080
//! namespaces:
//!     assets:
//!         limit: 64m
//!         root: /data/assets
//! peers:
//!     this: cache-1
//!     members:
//!         - name: cache-1
//!           address: 10.0.0.1:2511
//!         - name: cache-2
//!           address: 10.0.0.2:2511
//! ```
use std::panic::{set_hook, take_hook};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use callisto::builder::Builder;
use callisto::cache::{Loader, Namespace};
use callisto::config::Config;
use callisto::fmt::parse_size;
use callisto::server::Server;
use callisto::spawn;

/// Loads resources from files below a fixed root directory.
struct FileLoader {
    root: PathBuf,
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let relative = Path::new(key);

        // Keys must stay below the configured root...
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            anyhow::bail!("Invalid resource key: {}", key);
        }

        let path = self.root.join(relative);
        tokio::fs::read(&path).await.map_err(|error| {
            anyhow::anyhow!("Cannot read {}: {}", path.to_string_lossy(), error)
        })
    }
}

/// Creates the namespaces listed in the `namespaces` section of the config.
fn install_namespaces(config: &Arc<Config>) {
    let handle = config.current();
    let namespaces = match handle.lookup("namespaces").as_hash() {
        Some(namespaces) => namespaces,
        None => {
            log::warn!("Config contains no 'namespaces' section - nothing to serve.");
            return;
        }
    };

    for (name, settings) in namespaces {
        let name = match name.as_str() {
            Some(name) => name,
            None => continue,
        };

        let limit = match parse_size(settings["limit"].as_str().unwrap_or("64m")) {
            Ok(limit) => limit as i64,
            Err(error) => {
                log::error!("Skipping namespace {}: {:#}", name, error);
                continue;
            }
        };

        let root = match settings["root"].as_str() {
            Some(root) => PathBuf::from(root),
            None => {
                log::error!("Skipping namespace {}: no 'root' directory given.", name);
                continue;
            }
        };

        let _ = Namespace::create(name, limit, FileLoader { root });
    }
}

/// Starts the optional HTTP endpoint if an `http.port` is configured.
fn install_http_endpoint(platform: Arc<callisto::platform::Platform>, config: &Arc<Config>) {
    let handle = config.current();
    if let Some(port) = handle.lookup("http.port").as_i64() {
        let host = handle
            .lookup("http.host")
            .as_str()
            .unwrap_or("0.0.0.0")
            .to_owned();
        spawn!(async move {
            if let Err(error) = callisto::transport::http::serve(
                platform,
                &format!("{}:{}", host, port),
                callisto::transport::http::DEFAULT_BASE_PATH,
            )
            .await
            {
                log::error!("The HTTP endpoint failed: {:#}", error);
            }
        });
    }
}

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying
    // to survive with a missing tokio background thread. Having a panic in a tokio
    // thread is quite ugly, as the server seems to be healthy from the outside but
    // won't handle any incoming commands.
    //
    // Therefore we crash the whole process on purpose and hope for an external
    // watchdog like docker-compose to create a new container which is in a sane
    // and consistent state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;
    let config = platform.require::<Config>();

    // Create the configured file backed namespaces...
    install_namespaces(&config);

    // Hand the peer topology to the namespaces created above (the watcher
    // installed by the builder keeps it up to date on config changes)...
    callisto::peers::apply(&config.current());

    // Optionally expose the HTTP endpoint...
    install_http_endpoint(platform.clone(), &config);

    // Run the main event loop...
    platform.require::<Server>().event_loop().await;
}
