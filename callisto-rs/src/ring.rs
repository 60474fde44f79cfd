//! Provides a consistent-hash ring which maps string keys to member names.
//!
//! Every member is represented by a configurable number of **virtual nodes**
//! (replicas) on the ring, which smooths the key distribution and keeps the
//! movement of keys small when members join or leave. A key belongs to the member
//! owning the first virtual node at or after the key's hash position, wrapping
//! around at the end of the ring.
//!
//! The ring itself performs no locking - membership changes are expected to happen
//! during (re)configuration, not under concurrent traffic. The
//! [ConsistentPicker](crate::peers::ConsistentPicker) builds a fresh ring per
//! topology change and swaps it in atomically.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A hash function mapping arbitrary bytes to a position on the ring.
///
/// Stored behind an `Arc` so that a configured function survives topology
/// rebuilds. The default is CRC32-IEEE.
pub type HashFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// A single hash position representing a member on the ring.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct VirtualNode {
    name: String,
    hash: u32,
}

/// Maps string keys to member names via hashed virtual nodes.
///
/// # Examples
/// ```
/// # use callisto::ring::HashRing;
/// let mut ring = HashRing::new(50, None);
/// ring.add("cache-1");
/// ring.add("cache-2");
///
/// // Every key is owned by exactly one member...
/// let owner = ring.get("some/resource.css").unwrap();
/// assert_eq!(owner == "cache-1" || owner == "cache-2", true);
///
/// // ...and lookups are stable.
/// assert_eq!(ring.get("some/resource.css").unwrap(), owner);
/// ```
pub struct HashRing {
    replicas: usize,
    hash_fn: HashFn,
    vnodes: Vec<VirtualNode>,
    owners: HashMap<VirtualNode, String>,
    members: HashSet<String>,
}

impl HashRing {
    /// Creates a new ring with the given number of virtual nodes per member.
    ///
    /// If no hash function is given, CRC32-IEEE is used.
    ///
    /// # Panics
    /// Panics if **replicas** is zero, as an empty virtual node set per member
    /// cannot represent anybody.
    pub fn new(replicas: usize, hash_fn: Option<HashFn>) -> Self {
        if replicas == 0 {
            panic!("A hash ring needs at least one replica per member!");
        }

        HashRing {
            replicas,
            hash_fn: hash_fn.unwrap_or_else(|| Arc::new(|data: &[u8]| crc32fast::hash(data))),
            vnodes: Vec::new(),
            owners: HashMap::new(),
            members: HashSet::new(),
        }
    }

    /// Adds a member to the ring.
    ///
    /// Adding an already registered member is a no-op. Otherwise one virtual node
    /// per replica is created, named `member` followed by the decimal replica
    /// index, and the ring is re-sorted by hash position (the sort is stable, so
    /// colliding nodes keep their insertion order).
    pub fn add(&mut self, member: &str) {
        if !self.members.insert(member.to_owned()) {
            return;
        }

        for replica in 0..self.replicas {
            let replica_name = format!("{}{}", member, replica);
            let hash = (self.hash_fn)(replica_name.as_bytes());
            let vnode = VirtualNode {
                name: replica_name,
                hash,
            };

            self.vnodes.push(vnode.clone());
            let _ = self.owners.insert(vnode, member.to_owned());
        }

        self.vnodes.sort_by_key(|vnode| vnode.hash);
    }

    /// Returns the member owning the given key, or **None** if the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.vnodes.is_empty() {
            return None;
        }

        let hash = (self.hash_fn)(key.as_bytes());
        let index = self
            .vnodes
            .partition_point(|vnode| vnode.hash < hash)
            % self.vnodes.len();

        self.owners.get(&self.vnodes[index]).map(String::as_str)
    }

    /// Removes a member and all its virtual nodes from the ring.
    ///
    /// Removing an unregistered member is a no-op. Each virtual node is located by
    /// recomputing its hash and scanning from the first matching position until
    /// the replica name matches.
    ///
    /// TODO: if two distinct members collide on a replica hash and one of them is
    /// removed first, lookups for the surviving colliding replica can point at a
    /// stale member until that member is removed as well. Turn `owners` into a
    /// hash -> members multimap if such collisions ever show up in practice.
    pub fn remove(&mut self, member: &str) {
        if !self.members.remove(member) {
            return;
        }

        for replica in 0..self.replicas {
            let replica_name = format!("{}{}", member, replica);
            let hash = (self.hash_fn)(replica_name.as_bytes());

            let mut index = self.vnodes.partition_point(|vnode| vnode.hash < hash);
            while index < self.vnodes.len()
                && self.vnodes[index].hash == hash
                && self.vnodes[index].name != replica_name
            {
                index += 1;
            }

            if index < self.vnodes.len() && self.vnodes[index].hash == hash {
                let vnode = self.vnodes.remove(index);
                let _ = self.owners.remove(&vnode);
            }
        }
    }

    /// Returns the number of registered members.
    pub fn members(&self) -> usize {
        self.members.len()
    }

    /// Determines if no members are registered.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
