//! Provides peer selection for distributed namespaces.
//!
//! A cluster consists of **members**, each identified by a stable, unique name.
//! The [ConsistentPicker](ConsistentPicker) places all members on a consistent
//! hash ring and resolves, for every key, which peer owns it. The one rule that
//! keeps the cluster sane: a picker never returns the local member. Keys owned by
//! the local member are loaded from the origin directly, therefore requests can
//! never bounce between peers.
//!
//! Peers are reached through [CachePeer](CachePeer) implementations - see
//! [crate::transport] for the bundled TCP and HTTP clients.
//!
//! [install](install) wires the whole thing to the system config: the `peers`
//! section describes the topology and is re-applied on every config change, so
//! members can be added or drained without restarting warm nodes.
//!
//! # Configuration
//! ```yaml
//! peers:
//!     # The name under which this node appears on the ring.
//!     this: cache-1
//!     # Optional: the number of virtual nodes per member (defaults to 50).
//!     replicas: 50
//!     members:
//!         - name: cache-1
//!           address: 10.0.0.1:2511
//!         - name: cache-2
//!           address: 10.0.0.2:2511
//!         - name: cache-3
//!           transport: http
//!           url: http://10.0.0.3:8080
//! ```
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::Yaml;

use crate::cache::Namespace;
use crate::config::{Config, Handle};
use crate::platform::Platform;
use crate::ring::{HashFn, HashRing};
use crate::spawn;
use crate::transport::http::HttpPeer;
use crate::transport::resp::RespPeer;

/// The default number of virtual nodes per member.
pub const DEFAULT_REPLICAS: usize = 50;

/// A client for one member of the cluster.
///
/// Implementations wrap a concrete transport. The [name](CachePeer::name) is used
/// as the member's identity on the hash ring and MUST therefore be stable and
/// unique within the cluster. The [scheme](CachePeer::scheme) is informational
/// and only shows up in logs.
#[async_trait]
pub trait CachePeer: Send + Sync {
    /// Fetches the value for the given key from the given namespace of this peer.
    async fn fetch(&self, namespace: &str, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Returns the stable, unique member name of this peer.
    fn name(&self) -> &str;

    /// Returns the transport scheme, for logging purposes.
    fn scheme(&self) -> &str;
}

/// Resolves the owning peer for a key via a consistent hash ring.
///
/// # Examples
/// ```
/// # use callisto::peers::{CachePeer, ConsistentPicker};
/// # use callisto::transport::resp::RespPeer;
/// # use std::sync::Arc;
/// let local = Arc::new(RespPeer::new("10.0.0.1:2511"));
/// let remotes: Vec<Arc<dyn CachePeer>> = vec![Arc::new(RespPeer::new("10.0.0.2:2511"))];
///
/// let mut picker = ConsistentPicker::new();
/// picker.set_servers(local, remotes);
///
/// // Whatever the key, the picker never answers with the local member...
/// if let Some(peer) = picker.pick_server("some-key") {
///     assert_ne!(peer.name(), "10.0.0.1:2511");
/// }
/// ```
pub struct ConsistentPicker {
    replicas: usize,
    hash_fn: Option<HashFn>,
    ring: HashRing,
    peers: HashMap<String, Arc<dyn CachePeer>>,
    local_name: String,
}

impl Default for ConsistentPicker {
    fn default() -> Self {
        ConsistentPicker::new()
    }
}

impl ConsistentPicker {
    /// Creates a picker with default settings (50 replicas, CRC32-IEEE).
    ///
    /// Note that [set_servers](ConsistentPicker::set_servers) has to be called
    /// before the picker is of any use.
    pub fn new() -> Self {
        ConsistentPicker {
            replicas: DEFAULT_REPLICAS,
            hash_fn: None,
            ring: HashRing::new(DEFAULT_REPLICAS, None),
            peers: HashMap::new(),
            local_name: String::new(),
        }
    }

    /// Specifies the number of virtual nodes per member.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Specifies a custom hash function for the ring.
    pub fn with_hash_fn(mut self, hash_fn: HashFn) -> Self {
        self.hash_fn = Some(hash_fn);
        self
    }

    /// Builds a fresh ring and peer directory from the given local peer and the
    /// given remotes.
    ///
    /// The local peer participates on the ring like everybody else (so that all
    /// members agree on ownership), but is never returned by
    /// [pick_server](ConsistentPicker::pick_server).
    ///
    /// # Panics
    /// Panics if two peers share a name - a misconfiguration which would make
    /// ownership ambiguous, hence we fail loudly instead of limping along.
    pub fn set_servers(&mut self, local: Arc<dyn CachePeer>, remotes: Vec<Arc<dyn CachePeer>>) {
        self.local_name = local.name().to_owned();
        self.ring = HashRing::new(self.replicas, self.hash_fn.clone());
        self.peers = HashMap::new();

        for peer in remotes.into_iter().chain(std::iter::once(local)) {
            let name = peer.name().to_owned();
            self.ring.add(&name);
            if self.peers.insert(name.clone(), peer).is_some() {
                panic!("Duplicate cache peer: {}", name);
            }
        }
    }

    /// Returns the peer owning the given key, or **None** if the key is owned by
    /// the local member (or no topology has been configured).
    ///
    /// A **None** therefore always means: handle the key locally.
    pub fn pick_server(&self, key: &str) -> Option<Arc<dyn CachePeer>> {
        match self.ring.get(key) {
            Some(owner) if owner != self.local_name => {
                let peer = self.peers.get(owner).cloned();
                if let Some(peer) = &peer {
                    log::debug!("[{}][{}] picked for key {}.", peer.scheme(), owner, key);
                }
                peer
            }
            _ => None,
        }
    }

    /// Returns the name of the local member.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }
}

/// Installs a task which applies the `peers` section of the system config to all
/// registered namespaces, now and on every config change.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless
/// disabled. Namespaces created *after* the initial application pick the topology
/// up with the next config change, or immediately via
/// [Namespace::set_picker](crate::cache::Namespace::set_picker).
pub fn install(platform: Arc<Platform>) {
    spawn!(async move {
        let config = platform.require::<Config>();
        let mut config_changed = config.notifier();

        apply(&config.current());

        while platform.is_running() {
            match config_changed.recv().await {
                // A lagged receiver only means we missed intermediate updates -
                // the current config is still the one to apply...
                Ok(_) | Err(RecvError::Lagged(_)) => apply(&config.current()),
                Err(RecvError::Closed) => return,
            }
        }
    });
}

/// Builds a picker from the given config handle and hands it to every registered
/// namespace.
///
/// Hosts which create their namespaces *after* building the platform should call
/// this once all namespaces are registered - the watcher installed by
/// [install](install) only re-applies the topology on config changes.
pub fn apply(handle: &Handle) {
    match picker_from_config(handle) {
        Some(picker) => {
            let picker = Arc::new(picker);
            for namespace in Namespace::all() {
                namespace.set_picker(picker.clone());
            }
            log::info!(
                "Applied peer topology ({} members, local: {}).",
                picker.ring.members(),
                picker.local_name()
            );
        }
        None => {
            log::info!("Config contains no usable 'peers' section. Leaving topology untouched.");
        }
    }
}

/// Reads the `peers` config section into a picker.
///
/// Returns **None** if the section is absent or unusable; a partially broken
/// member list is an error (we rather keep the old topology than run a wrong
/// one).
fn picker_from_config(handle: &Handle) -> Option<ConsistentPicker> {
    let local_name = handle.lookup("peers.this").as_str()?;

    let mut picker = ConsistentPicker::new();
    if let Some(replicas) = handle.lookup("peers.replicas").as_i64() {
        if replicas > 0 {
            picker = picker.with_replicas(replicas as usize);
        }
    }

    let mut local: Option<Arc<dyn CachePeer>> = None;
    let mut remotes: Vec<Arc<dyn CachePeer>> = Vec::new();

    for member in handle.lookup("peers.members").as_vec()? {
        let peer = match peer_from_config(member) {
            Ok(peer) => peer,
            Err(error) => {
                log::error!("Not going to apply the peer topology: {:#}", error);
                return None;
            }
        };

        if peer.name() == local_name {
            local = Some(peer);
        } else {
            remotes.push(peer);
        }
    }

    match local {
        Some(local) => {
            picker.set_servers(local, remotes);
            Some(picker)
        }
        None => {
            log::error!(
                "The peer topology does not list the local member '{}'. Not going to apply it.",
                local_name
            );
            None
        }
    }
}

/// Builds a single peer client from its config element.
fn peer_from_config(member: &Yaml) -> anyhow::Result<Arc<dyn CachePeer>> {
    let name = member["name"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("A peer is missing its 'name'."))?;

    match member["transport"].as_str().unwrap_or("resp") {
        "resp" => {
            let address = member["address"].as_str().ok_or_else(|| {
                anyhow::anyhow!("Peer '{}' is missing its 'address'.", name)
            })?;
            Ok(Arc::new(RespPeer::new(address).with_name(name)))
        }
        "http" => {
            let url = member["url"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Peer '{}' is missing its 'url'.", name))?;
            Ok(Arc::new(HttpPeer::new(url).with_name(name)))
        }
        other => Err(anyhow::anyhow!(
            "Peer '{}' uses the unknown transport '{}'.",
            name,
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{picker_from_config, CachePeer, ConsistentPicker};
    use crate::config::Config;
    use crate::ring::HashFn;
    use async_trait::async_trait;
    use std::sync::Arc;

    pub struct StaticPeer {
        name: String,
    }

    impl StaticPeer {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(StaticPeer {
                name: name.to_owned(),
            })
        }
    }

    #[async_trait]
    impl CachePeer for StaticPeer {
        async fn fetch(&self, _namespace: &str, _key: &str) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn scheme(&self) -> &str {
            "static"
        }
    }

    fn decimal_hash() -> HashFn {
        Arc::new(|data: &[u8]| std::str::from_utf8(data).unwrap().parse().unwrap())
    }

    #[test]
    fn the_local_member_is_never_picked() {
        let mut picker = ConsistentPicker::new();
        picker.set_servers(StaticPeer::new("local"), Vec::new());

        for i in 0..256 {
            assert_eq!(picker.pick_server(&format!("key-{}", i)).is_none(), true);
        }
    }

    #[test]
    fn remote_keys_resolve_to_their_owner() {
        // With the decimal hash and a single replica, member "1" sits at position
        // 10 and member "2" at position 20...
        let mut picker = ConsistentPicker::new()
            .with_replicas(1)
            .with_hash_fn(decimal_hash());
        let remotes: Vec<Arc<dyn CachePeer>> = vec![StaticPeer::new("2")];
        picker.set_servers(StaticPeer::new("1"), remotes);

        // ...therefore 15 belongs to "2" (a remote)...
        assert_eq!(picker.pick_server("15").unwrap().name(), "2");

        // ...while 5 and 25 (wrapping) belong to the local member.
        assert_eq!(picker.pick_server("5").is_none(), true);
        assert_eq!(picker.pick_server("25").is_none(), true);
    }

    #[test]
    #[should_panic]
    fn duplicate_peer_names_are_rejected() {
        let mut picker = ConsistentPicker::new();
        let remotes: Vec<Arc<dyn CachePeer>> = vec![StaticPeer::new("twin")];
        picker.set_servers(StaticPeer::new("twin"), remotes);
    }

    #[test]
    fn topologies_are_read_from_the_config() {
        let config = Config::new("somefile.yml");
        config
            .load_from_string(
                "
peers:
    this: cache-1
    replicas: 7
    members:
        - name: cache-1
          address: 127.0.0.1:2511
        - name: cache-2
          address: 127.0.0.2:2511
        - name: cache-3
          transport: http
          url: http://127.0.0.3:8080
",
                None,
            )
            .unwrap();

        let picker = picker_from_config(&config.current()).unwrap();
        assert_eq!(picker.local_name(), "cache-1");
        assert_eq!(picker.ring.members(), 3);
    }

    #[test]
    fn a_topology_without_the_local_member_is_rejected() {
        let config = Config::new("somefile.yml");
        config
            .load_from_string(
                "
peers:
    this: cache-1
    members:
        - name: cache-2
          address: 127.0.0.2:2511
",
                None,
            )
            .unwrap();

        assert_eq!(picker_from_config(&config.current()).is_none(), true);
    }
}
