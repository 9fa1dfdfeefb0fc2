use std::{
    cmp::min,
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::{hash::Hash, packet::Packet};

pub struct PacketTrack {
    pub time: Instant,
    pub min_hops: u8,
}

pub struct PacketCache {
    map: HashMap<Hash, PacketTrack>,
    remove_cache: Vec<Hash>,
}

impl PacketCache {
    pub fn new() -> Self {
        Self { map: HashMap::new(), remove_cache: Vec::new() }
    }

    pub fn release(&mut self, duration: Duration) {
        for entry in &self.map {
            if entry.1.time.elapsed() > duration {
                self.remove_cache.push(*entry.0);
            }
        }

        for hash in &self.remove_cache {
            self.map.remove(hash);
        }

        self.remove_cache.clear();
    }

    pub fn update(&mut self, packet: &Packet) -> bool {
        let hash = packet.hash();

        let mut is_new_packet = false;

        let track = self.map.get_mut(&hash);
        if let Some(track) = track {
            track.time = Instant::now();
            track.min_hops = min(packet.header.hops, track.min_hops);
        } else {
            is_new_packet = true;

            self.map
                .insert(hash, PacketTrack { time: Instant::now(), min_hops: packet.header.hops });
        }

        is_new_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::AddressHash;
    use crate::packet::{
        ContextFlag, DestinationType, Header, HeaderType, IfacFlag, PacketContext, PacketType,
        PropagationType,
    };

    fn test_packet(hops: u8) -> Packet {
        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                context_flag: ContextFlag::Unset,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Data,
                hops,
            },
            ifac: None,
            destination: AddressHash::new_from_slice(b"packet-cache-test"),
            transport: None,
            context: PacketContext::None,
            data: Default::default(),
        }
    }

    #[test]
    fn first_sighting_of_a_packet_is_new() {
        let mut cache = PacketCache::new();

        assert!(cache.update(&test_packet(0)));
    }

    #[test]
    fn repeat_sighting_of_same_hash_is_not_new_and_tracks_min_hops() {
        let mut cache = PacketCache::new();
        let packet = test_packet(3);

        assert!(cache.update(&packet));
        assert!(!cache.update(&test_packet(1)));
    }

    #[test]
    fn release_evicts_entries_older_than_duration() {
        let mut cache = PacketCache::new();
        cache.update(&test_packet(0));

        cache.release(Duration::from_secs(0));

        assert!(cache.update(&test_packet(0)));
    }
}
