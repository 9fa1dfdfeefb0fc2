use std::path::PathBuf;

use crate::hash::ADDRESS_HASH_SIZE;
use crate::identity::PUBLIC_KEY_LENGTH;

/// Link-layer MTU a packet's ciphertext must fit within once framed.
pub const MTU: usize = 500;
/// Truncated hash length used for destination and link addressing, in bits.
pub const TRUNCATED_HASHLENGTH_BITS: usize = ADDRESS_HASH_SIZE * 8;
/// Length of the name hash embedded in announces, in bits.
pub const NAME_HASH_LENGTH_BITS: usize = 80;
/// X25519/Ed25519 key length carried in announces and link requests, in bits.
pub const KEYSIZE_BITS: usize = PUBLIC_KEY_LENGTH as usize * 8;
/// Ed25519 signature length, in bits.
pub const SIGLENGTH_BITS: usize = 512;
/// Length of a ratchet public key, in bytes.
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
/// Default size of the known-destinations pool.
pub const KNOWN_DESTINATIONS_SIZE: usize = 2048;
/// How long a path table entry is considered valid without a refresh.
pub const PATH_EXPIRES_SECS: u64 = 7 * 24 * 60 * 60;
/// How often a destination should roll to a fresh ratchet key.
pub const RATCHET_INTERVAL_SECS: u64 = 30 * 60;

/// Node-wide configuration: storage locations and the identity the node
/// announces under. A `Config` is turned into a `TransportConfig` once,
/// at startup; runtime tuning happens through the transport's own setters.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub storage_dir: PathBuf,
    pub known_destinations_capacity: usize,
    pub ratchet_interval_secs: u64,
}

impl Config {
    pub fn new<T: Into<String>>(name: T, storage_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            storage_dir,
            known_destinations_capacity: KNOWN_DESTINATIONS_SIZE,
            ratchet_interval_secs: RATCHET_INTERVAL_SECS,
        }
    }

    pub fn ratchet_store_path(&self) -> PathBuf {
        self.storage_dir.join("ratchets")
    }

    pub fn known_destinations_path(&self) -> PathBuf {
        self.storage_dir.join("known_destinations.kdst")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("node", PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_are_scoped_under_storage_dir() {
        let config = Config::new("node", PathBuf::from("/tmp/rnscore"));
        assert_eq!(config.ratchet_store_path(), PathBuf::from("/tmp/rnscore/ratchets"));
        assert_eq!(
            config.known_destinations_path(),
            PathBuf::from("/tmp/rnscore/known_destinations.kdst")
        );
    }
}
