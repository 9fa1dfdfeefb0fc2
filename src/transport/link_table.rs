use std::collections::HashMap;
use tokio::time::{Duration, Instant};

use crate::destination::link::LinkId;
use crate::hash::AddressHash;
use crate::packet::{Header, HeaderType, IfacFlag, Packet};

#[allow(dead_code)]
pub struct LinkEntry {
    pub timestamp: Instant,
    pub proof_timeout: Instant,
    pub next_hop: AddressHash,
    pub next_hop_iface: AddressHash,
    pub received_from: AddressHash,
    pub original_destination: AddressHash,
    pub taken_hops: u8,
    pub remaining_hops: u8,
    pub validated: bool,
}

fn send_backwards(packet: &Packet, entry: &LinkEntry) -> (Packet, AddressHash) {
    let propagated = Packet {
        header: Header {
            ifac_flag: IfacFlag::Authenticated,
            header_type: HeaderType::Type2,
            context_flag: packet.header.context_flag,
            propagation_type: packet.header.propagation_type,
            destination_type: packet.header.destination_type,
            packet_type: packet.header.packet_type,
            hops: packet.header.hops + 1,
        },
        ifac: None,
        destination: packet.destination,
        transport: Some(entry.next_hop),
        context: packet.context,
        data: packet.data,
    };

    (propagated, entry.received_from)
}

pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    proof_timeout: Duration,
    idle_timeout: Duration,
}

impl LinkTable {
    pub fn new(proof_timeout: Duration, idle_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), proof_timeout, idle_timeout }
    }

    pub fn add(
        &mut self,
        link_request: &Packet,
        destination: AddressHash,
        received_from: AddressHash,
        next_hop: AddressHash,
        iface: AddressHash,
    ) {
        let link_id = LinkId::from(link_request);

        if self.entries.contains_key(&link_id) {
            return;
        }

        let now = Instant::now();
        let taken_hops = link_request.header.hops + 1;

        let entry = LinkEntry {
            timestamp: now,
            proof_timeout: now + self.proof_timeout,
            next_hop,
            next_hop_iface: iface,
            received_from,
            original_destination: destination,
            taken_hops,
            remaining_hops: 0,
            validated: false,
        };

        self.entries.insert(link_id, entry);
    }

    pub fn original_destination(&self, link_id: &LinkId) -> Option<AddressHash> {
        self.entries.get(link_id).filter(|e| e.validated).map(|e| e.original_destination)
    }

    pub fn handle_keepalive(&mut self, packet: &Packet) -> Option<(Packet, AddressHash)> {
        if let Some(entry) = self.entries.get_mut(&packet.destination) {
            entry.timestamp = Instant::now();
            return Some(send_backwards(packet, entry));
        }
        None
    }

    pub fn handle_proof(&mut self, proof: &Packet) -> Option<(Packet, AddressHash)> {
        match self.entries.get_mut(&proof.destination) {
            Some(entry) => {
                entry.remaining_hops = proof.header.hops;
                entry.validated = true;
                entry.timestamp = Instant::now();

                Some(send_backwards(proof, entry))
            }
            None => None,
        }
    }

    pub fn remove_stale(&mut self) {
        let mut stale = vec![];
        let now = Instant::now();

        for (link_id, entry) in &self.entries {
            if entry.validated {
                if entry.timestamp + self.idle_timeout <= now {
                    stale.push(*link_id);
                }
            } else if entry.proof_timeout <= now {
                stale.push(*link_id);
            }
        }

        for link_id in stale {
            self.entries.remove(&link_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ContextFlag, DestinationType, PacketContext, PacketType, PropagationType};

    fn link_request(hops: u8) -> Packet {
        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type2,
                context_flag: ContextFlag::Unset,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Link,
                packet_type: PacketType::LinkRequest,
                hops,
            },
            ifac: None,
            destination: AddressHash::new_from_slice(b"link-table-test-dest"),
            transport: None,
            context: PacketContext::None,
            data: crate::packet::PacketDataBuffer::new_from_slice(&[1, 2, 3, 4]),
        }
    }

    #[test]
    fn unvalidated_link_is_not_resolvable() {
        let mut table = LinkTable::new(Duration::from_secs(10), Duration::from_secs(60));
        let request = link_request(1);
        let link_id = LinkId::from(&request);
        let original = AddressHash::new_from_slice(b"original");

        table.add(
            &request,
            original,
            AddressHash::new_from_slice(b"prev-hop"),
            AddressHash::new_from_slice(b"next-hop"),
            AddressHash::new_from_slice(b"iface"),
        );

        assert_eq!(table.original_destination(&link_id), None);
    }

    #[test]
    fn proof_validates_entry_and_forwards_backwards() {
        let mut table = LinkTable::new(Duration::from_secs(10), Duration::from_secs(60));
        let request = link_request(1);
        let link_id = LinkId::from(&request);
        let original = AddressHash::new_from_slice(b"original");
        let received_from = AddressHash::new_from_slice(b"prev-hop");

        table.add(
            &request,
            original,
            received_from,
            AddressHash::new_from_slice(b"next-hop"),
            AddressHash::new_from_slice(b"iface"),
        );

        let mut proof = link_request(0);
        proof.header.packet_type = PacketType::Proof;
        proof.destination = link_id;

        let (forwarded, backward_iface) = table.handle_proof(&proof).expect("entry exists");

        assert_eq!(backward_iface, received_from);
        assert_eq!(forwarded.header.hops, proof.header.hops + 1);
        assert_eq!(table.original_destination(&link_id), Some(original));
    }

    #[test]
    fn remove_stale_drops_unvalidated_entries_past_proof_timeout() {
        let mut table = LinkTable::new(Duration::from_secs(0), Duration::from_secs(60));
        let request = link_request(0);

        table.add(
            &request,
            AddressHash::new_from_slice(b"original"),
            AddressHash::new_from_slice(b"prev-hop"),
            AddressHash::new_from_slice(b"next-hop"),
            AddressHash::new_from_slice(b"iface"),
        );

        table.remove_stale();

        let link_id = LinkId::from(&request);
        let mut proof = link_request(0);
        proof.header.packet_type = PacketType::Proof;
        proof.destination = link_id;
        assert!(table.handle_proof(&proof).is_none());
    }
}
