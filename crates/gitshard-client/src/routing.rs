//! Repository to shard routing.
//!
//! A [`ShardDirectory`] is an immutable view of the fleet: ordered addresses
//! plus pins. Routing hashes the normalized repository name with MD5 and
//! takes the first eight bytes (big-endian) modulo the number of addresses.
//! The placement is stable across processes but moves most repositories
//! when the address list changes.

use crate::config::FleetConfig;
use gitshard_core::RepoName;
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};

/// Immutable snapshot of shard addresses and pins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardDirectory {
    addresses: Vec<String>,
    pinned: HashMap<RepoName, String>,
}

impl ShardDirectory {
    /// Build a directory. Duplicate addresses are dropped keeping the first
    /// occurrence; pin keys are normalized.
    pub fn new(addresses: Vec<String>, pinned: HashMap<String, String>) -> Self {
        let mut seen = HashSet::new();
        let addresses = addresses
            .into_iter()
            .filter(|addr| seen.insert(addr.clone()))
            .collect();

        let pinned = pinned
            .into_iter()
            .map(|(repo, addr)| (RepoName::from(repo).normalize(), addr))
            .collect();

        Self { addresses, pinned }
    }

    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(config.addresses.clone(), config.pinned.clone())
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn pinned(&self) -> &HashMap<RepoName, String> {
        &self.pinned
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Shard owning `repo`. Pins win over hashing. `None` only when no
    /// address is configured.
    pub fn resolve(&self, repo: &RepoName) -> Option<&str> {
        let normalized = repo.normalize();
        if let Some(addr) = self.pinned.get(&normalized) {
            return Some(addr);
        }
        addr_for_key(normalized.as_str(), &self.addresses)
    }
}

/// Hash an arbitrary key onto `addresses`.
pub fn addr_for_key<'a>(key: &str, addresses: &'a [String]) -> Option<&'a str> {
    if addresses.is_empty() {
        return None;
    }
    let index = hash_key(key) % addresses.len() as u64;
    Some(addresses[index as usize].as_str())
}

/// First eight bytes of the MD5 digest, big-endian.
fn hash_key(key: &str) -> u64 {
    let digest = Md5::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
