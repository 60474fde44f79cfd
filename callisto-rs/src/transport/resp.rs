//! Provides the peer client for the native TCP protocol.
//!
//! A [RespPeer](RespPeer) fetches values from a remote node by sending a
//! `CACHE.GET` over a fresh TCP connection and reading the RESP framed response.
//! Peer fetches are rare (only misses for remotely owned keys get here) and a
//! failed peer must not poison subsequent fetches, therefore we dial per call
//! instead of maintaining a pool.
use anyhow::Context;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::peers::CachePeer;
use crate::protocol::{encode_command, Reply};

/// A peer client speaking the native TCP protocol.
///
/// # Examples
/// ```no_run
/// # use callisto::peers::CachePeer;
/// # use callisto::transport::resp::RespPeer;
/// # #[tokio::main]
/// # async fn main() {
/// let peer = RespPeer::new("10.0.0.2:2511").with_name("cache-2");
///
/// let value = peer.fetch("assets", "logo.png").await.unwrap();
/// # }
/// ```
pub struct RespPeer {
    address: String,
    name: String,
}

impl RespPeer {
    /// Creates a peer client for the given `host:port` address.
    ///
    /// Unless overridden via [with_name](RespPeer::with_name), the address doubles
    /// as the member name on the ring.
    pub fn new(address: &str) -> Self {
        RespPeer {
            address: address.to_owned(),
            name: address.to_owned(),
        }
    }

    /// Specifies the member name under which this peer appears on the ring.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_owned();
        self
    }

    /// Returns the address this client connects to.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl CachePeer for RespPeer {
    async fn fetch(&self, namespace: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        if namespace.is_empty() || key.is_empty() {
            anyhow::bail!("A namespace and a key are required");
        }

        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to peer {}", self.address))?;

        let mut request = BytesMut::new();
        encode_command(
            &[b"CACHE.GET", namespace.as_bytes(), key.as_bytes()],
            &mut request,
        );
        stream.write_all(request.as_ref()).await?;
        stream.flush().await?;

        // Read until a complete reply is buffered...
        let mut buffer = BytesMut::new();
        loop {
            if let Some((reply, _)) = Reply::parse(&buffer)? {
                return match reply {
                    Reply::Bulk(data) => Ok(data.to_vec()),
                    Reply::Error(message) => Err(anyhow::anyhow!(
                        "Remote server error from {}: {}",
                        self.address,
                        message
                    )),
                    Reply::Simple(message) => Err(anyhow::anyhow!(
                        "Unexpected reply from {}: {}",
                        self.address,
                        message
                    )),
                };
            }

            if stream.read_buf(&mut buffer).await? == 0 {
                anyhow::bail!(
                    "Peer {} closed the connection before a complete reply was received",
                    self.address
                );
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> &str {
        "resp"
    }
}

#[cfg(test)]
mod tests {
    use super::RespPeer;
    use crate::builder::Builder;
    use crate::cache::{LoaderFn, Namespace};
    use crate::config::Config;
    use crate::peers::CachePeer;
    use crate::server::Server;
    use crate::testing::test_async;

    #[test]
    fn values_are_fetched_over_the_wire() {
        // The test server binds our shared test port...
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let platform = Builder::new().enable_all().build().await;
            platform
                .require::<Config>()
                .load_from_string(
                    "
                server:
                    port: 1611
            ",
                    None,
                )
                .unwrap();

            let _ = Namespace::create(
                "resp_peer_it",
                1024 * 1024,
                LoaderFn(|key: &str| Ok(format!("<{}>", key).into_bytes())),
            );

            Server::fork_and_await(&platform.require::<Server>()).await;

            let peer = RespPeer::new("127.0.0.1:1611").with_name("cache-test");
            assert_eq!(peer.name(), "cache-test");
            assert_eq!(peer.scheme(), "resp");

            // A fetch delivers exactly the loader's bytes...
            let value = peer.fetch("resp_peer_it", "style.css").await.unwrap();
            assert_eq!(value, b"<style.css>");

            // Errors of the remote node are reported as errors...
            let error = peer.fetch("no_such_ns", "style.css").await.unwrap_err();
            assert_eq!(format!("{:#}", error).contains("NOTFOUND"), true);

            // Empty namespaces or keys are rejected before hitting the wire...
            assert_eq!(peer.fetch("", "style.css").await.is_err(), true);
            assert_eq!(peer.fetch("resp_peer_it", "").await.is_err(), true);

            platform.terminate();
        });
    }
}
