//! Provides a builder which can be used to set up and initialize the framework.
//!
//! This can be used to create and configure the central parts of a cache node. As
//! callisto provides some optional components, a builder permits to selectively
//! enable or disable them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use callisto::builder::Builder;
//! # use callisto::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register namespaces and peer topology here...
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, CALLISTO_REVISION, CALLISTO_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As callisto provides a bunch of components of which some are optional, the
/// actual setup can be configured here.
///
/// # Example
/// Setting up the framework with all features enabled:
/// ```no_run
/// # use callisto::builder::Builder;
/// # use callisto::server::Server;
/// #[tokio::main]
/// async fn main() {
///     // Enable all features and build the platform...
///     let platform = Builder::new().enable_all().build().await;
///
///     // Start the main event loop of the server...
///     platform.require::<Server>().event_loop().await;
/// }
/// ```
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_server: bool,
    setup_peers: bool,
}

impl Builder {
    /// Creates a new builder with everything disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components)
    /// is quite convenient, but be aware that new components which might be added
    /// in a library update will then also be enabled by default. This might or
    /// might not be the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_server = true;
        self.setup_peers = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we
    /// intend callisto nodes to be run in docker containers, this is all that is
    /// needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C**
    /// or **SIGTERM** is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the
    /// **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server) instance.
    ///
    /// Note that the main event loop still has to be invoked manually via:
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up a **Server** instance after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Installs the config driven peer topology watcher.
    ///
    /// For more details see: [peers::install](crate::peers::install)
    pub fn enable_peers(mut self) -> Self {
        self.setup_peers = true;
        self
    }

    /// Disables installing the peer topology watcher after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_peers(mut self) -> Self {
        self.setup_peers = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the
    /// enabled components being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "|)) CALLISTO (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            CALLISTO_VERSION,
            CALLISTO_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        if self.setup_peers && self.setup_config {
            crate::peers::install(platform.clone());
        }

        platform
    }
}
