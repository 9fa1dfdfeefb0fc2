use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RnsError;
use crate::hash::{AddressHash, Hash, ADDRESS_HASH_SIZE, HASH_SIZE};
use crate::identity::{Identity, PUBLIC_KEY_LENGTH};

const MAGIC: &[u8; 4] = b"KDST";
const VERSION: u8 = 1;
const DEFAULT_CAPACITY: usize = 2048;

/// A single entry in the known-destinations pool: the last announce heard
/// for a destination, enough to re-derive its identity and recognise
/// duplicate announces without re-requesting a path.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDestination {
    pub destination: AddressHash,
    pub timestamp: f64,
    pub packet_hash: Hash,
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    pub verifying_key: [u8; PUBLIC_KEY_LENGTH],
    pub app_data: Vec<u8>,
}

impl KnownDestination {
    pub fn identity(&self) -> Identity {
        Identity::new_from_slices(&self.public_key, &self.verifying_key)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.destination.as_slice());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.packet_hash.as_slice());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.verifying_key);
        out.extend_from_slice(&(self.app_data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.app_data);
    }

    fn decode(data: &[u8]) -> Result<(Self, usize), RnsError> {
        const FIXED_LEN: usize = ADDRESS_HASH_SIZE + 8 + HASH_SIZE + PUBLIC_KEY_LENGTH * 2 + 2;
        if data.len() < FIXED_LEN {
            return Err(RnsError::MalformedInput);
        }

        let mut offset = 0;
        let mut dest_bytes = [0u8; ADDRESS_HASH_SIZE];
        dest_bytes.copy_from_slice(&data[offset..offset + ADDRESS_HASH_SIZE]);
        offset += ADDRESS_HASH_SIZE;

        let timestamp = f64::from_le_bytes(
            data[offset..offset + 8].try_into().map_err(|_| RnsError::MalformedInput)?,
        );
        offset += 8;

        let mut hash_bytes = [0u8; HASH_SIZE];
        hash_bytes.copy_from_slice(&data[offset..offset + HASH_SIZE]);
        let packet_hash = Hash::new(hash_bytes);
        offset += HASH_SIZE;

        let mut public_key = [0u8; PUBLIC_KEY_LENGTH];
        public_key.copy_from_slice(&data[offset..offset + PUBLIC_KEY_LENGTH]);
        offset += PUBLIC_KEY_LENGTH;

        let mut verifying_key = [0u8; PUBLIC_KEY_LENGTH];
        verifying_key.copy_from_slice(&data[offset..offset + PUBLIC_KEY_LENGTH]);
        offset += PUBLIC_KEY_LENGTH;

        let app_data_len = u16::from_le_bytes(
            data[offset..offset + 2].try_into().map_err(|_| RnsError::MalformedInput)?,
        ) as usize;
        offset += 2;

        if data.len() < offset + app_data_len {
            return Err(RnsError::MalformedInput);
        }
        let app_data = data[offset..offset + app_data_len].to_vec();
        offset += app_data_len;

        Ok((
            Self {
                destination: AddressHash::new(dest_bytes),
                timestamp,
                packet_hash,
                public_key,
                verifying_key,
                app_data,
            },
            offset,
        ))
    }
}

/// Fixed-capacity, LRU-evicted pool of known destinations, persisted to disk
/// between restarts with the same atomic tmp-then-rename write pattern used
/// for ratchet records.
pub struct KnownDestinations {
    path: PathBuf,
    capacity: usize,
    order: VecDeque<AddressHash>,
    entries: std::collections::HashMap<AddressHash, KnownDestination>,
}

impl KnownDestinations {
    pub fn new(path: PathBuf) -> Self {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            capacity,
            order: VecDeque::with_capacity(capacity.min(4096)),
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, destination: &AddressHash) -> Option<&KnownDestination> {
        self.entries.get(destination)
    }

    /// Insert or refresh a destination, evicting the oldest entry if the
    /// pool is already at capacity.
    pub fn remember(&mut self, record: KnownDestination) {
        let destination = record.destination;
        if self.entries.insert(destination, record).is_none() {
            self.order.push_back(destination);
        }

        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn load(path: PathBuf) -> Result<Self, RnsError> {
        Self::load_with_capacity(path, DEFAULT_CAPACITY)
    }

    pub fn load_with_capacity(path: PathBuf, capacity: usize) -> Result<Self, RnsError> {
        let mut store = Self::with_capacity(path.clone(), capacity);
        if !path.exists() {
            return Ok(store);
        }

        let data = fs::read(&path).map_err(|_| RnsError::PacketError)?;
        if data.len() < MAGIC.len() + 1 + 2 || &data[..MAGIC.len()] != MAGIC {
            return Err(RnsError::MalformedInput);
        }

        let version = data[MAGIC.len()];
        if version != VERSION {
            return Err(RnsError::MalformedInput);
        }

        let mut offset = MAGIC.len() + 1;
        let count = u16::from_le_bytes(
            data[offset..offset + 2].try_into().map_err(|_| RnsError::MalformedInput)?,
        ) as usize;
        offset += 2;

        for _ in 0..count {
            let (record, consumed) = KnownDestination::decode(&data[offset..])?;
            offset += consumed;
            store.remember(record);
        }

        Ok(store)
    }

    pub fn persist(&self) -> Result<(), RnsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|_| RnsError::PacketError)?;
        }

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for destination in &self.order {
            if let Some(record) = self.entries.get(destination) {
                record.encode(&mut out);
            }
        }

        let tmp_path = self.path.with_extension("out");
        fs::write(&tmp_path, &out).map_err(|_| RnsError::PacketError)?;
        fs::rename(&tmp_path, &self.path).map_err(|_| RnsError::PacketError)?;
        Ok(())
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), RnsError> {
    fs::create_dir_all(path).map_err(|_| RnsError::PacketError)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn sample_record(seed: u8) -> KnownDestination {
        KnownDestination {
            destination: AddressHash::new([seed; ADDRESS_HASH_SIZE]),
            timestamp: 1_700_000_000.0 + seed as f64,
            packet_hash: Hash::new_from_rand(OsRng),
            public_key: [seed; PUBLIC_KEY_LENGTH],
            verifying_key: [seed.wrapping_add(1); PUBLIC_KEY_LENGTH],
            app_data: vec![seed; 3],
        }
    }

    #[test]
    fn persist_and_reload_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_destinations.kdst");

        let mut store = KnownDestinations::new(path.clone());
        store.remember(sample_record(1));
        store.remember(sample_record(2));
        store.persist().expect("persist");

        let reloaded = KnownDestinations::load(path).expect("load");
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.get(&AddressHash::new([1; ADDRESS_HASH_SIZE])).expect("entry").app_data,
            vec![1, 1, 1]
        );
    }

    #[test]
    fn eviction_drops_oldest_entry_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("known_destinations.kdst");
        let mut store = KnownDestinations::with_capacity(path, 2);

        store.remember(sample_record(1));
        store.remember(sample_record(2));
        store.remember(sample_record(3));

        assert_eq!(store.len(), 2);
        assert!(store.get(&AddressHash::new([1; ADDRESS_HASH_SIZE])).is_none());
        assert!(store.get(&AddressHash::new([3; ADDRESS_HASH_SIZE])).is_some());
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.kdst");
        fs::write(&path, b"NOPE").expect("write");

        assert!(matches!(KnownDestinations::load(path), Err(RnsError::MalformedInput)));
    }
}
