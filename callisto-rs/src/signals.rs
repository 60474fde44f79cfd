//! Installs a signal handler which terminates the platform on CTRL+C or SIGTERM.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGTERM** and then
//! invokes [Platform::terminate](crate::platform::Platform::terminate) on the given
//! platform. As a cache node holds no durable state, terminating simply means
//! letting the event loops drain and exit.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::platform::Platform;

/// Installs a signal handler for the given platform which awaits either a
/// **CTRL+C** or **SIGTERM**.
///
/// Note that this is automatically called by the [Builder](crate::builder::Builder)
/// unless it is disabled.
pub fn install(platform: Arc<Platform>) {
    let _ = tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate()).unwrap();

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
                platform.terminate();
            },
            _ = sig_term.recv() => {
                log::info!("Received SIGTERM. Shutting down...");
                platform.terminate();
            }
        }
    });
}
