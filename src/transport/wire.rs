use super::path::send_to_next_hop;
use super::*;

/// Opportunistic single-destination data packets are encrypted to the
/// recipient's identity right before send; link traffic is already
/// encrypted by the link itself and skips this path.
pub(super) fn should_encrypt_packet(packet: &Packet) -> bool {
    packet.header.packet_type == PacketType::Data
        && packet.header.destination_type == crate::packet::DestinationType::Single
        && matches!(
            packet.context,
            PacketContext::None | PacketContext::Request | PacketContext::Response
        )
}

async fn handle_link_data<'a>(
    packet: &Packet,
    link: &Arc<Mutex<Link>>,
    handler: &mut MutexGuard<'a, TransportHandler>,
) {
    let resource_replies = {
        let mut link_guard = link.lock().await;
        handler.resource_manager.handle_packet(packet, &mut link_guard)
    };
    let result = link.lock().await.handle_packet(packet);

    for reply in resource_replies {
        handler.send_packet(reply).await;
    }

    match result {
        LinkHandleResult::Proof(proof) => handler.send_packet(proof).await,
        LinkHandleResult::KeepAlive => {
            let response = link.lock().await.keep_alive_packet(0xFE);
            handler.send_packet(response).await;
        }
        LinkHandleResult::Activated | LinkHandleResult::None => {}
    }
}

pub(super) async fn handle_data<'a>(
    packet: &Packet,
    iface: AddressHash,
    mut handler: MutexGuard<'a, TransportHandler>,
) {
    if let Some(link) = handler.in_links.get(&packet.destination).cloned() {
        handle_link_data(packet, &link, &mut handler).await;
        return;
    }

    if let Some(link) = handler.out_links.get(&packet.destination).cloned() {
        handle_link_data(packet, &link, &mut handler).await;
        return;
    }

    if let Some((forwarded, next_iface)) = handler.link_table.handle_keepalive(packet) {
        handler
            .send(TxMessage { tx_type: TxMessageType::Direct(next_iface), packet: forwarded })
            .await;
        return;
    }

    if packet.header.destination_type == crate::packet::DestinationType::Single
        && handler.has_destination(&packet.destination)
    {
        let destination = handler.single_in_destinations.get(&packet.destination).cloned();
        if let Some(destination) = destination {
            let decrypted = destination.lock().await.decrypt_with_ratchets(packet.data.as_slice());
            match decrypted {
                Ok((plaintext, ratchet_used)) => {
                    let _ = handler.received_data_tx.send(ReceivedData {
                        destination: packet.destination,
                        data: PacketDataBuffer::new_from_slice(&plaintext),
                        payload_mode: ReceivedPayloadMode::Decrypted,
                        ratchet_used,
                        context: Some(packet.context),
                        request_id: None,
                        hops: Some(packet.header.hops),
                        interface: Some(iface),
                    });
                }
                Err(err) => {
                    log::warn!(
                        "tp({}): decrypt failed for {}: {:?}",
                        handler.config.name,
                        packet.destination,
                        err
                    );
                }
            }
        }
        return;
    }

    send_to_next_hop(packet, &handler, None).await;
}

pub(super) async fn handle_proof(packet: Packet, handler_arc: Arc<Mutex<TransportHandler>>) {
    let mut handler = handler_arc.lock().await;

    if let Some(link) = handler.out_links.get(&packet.destination).cloned() {
        let result = link.lock().await.handle_packet(&packet);
        if matches!(result, LinkHandleResult::Activated) {
            let (address_hash, rtt) = {
                let link_guard = link.lock().await;
                (link_guard.destination().address_hash, link_guard.elapsed())
            };
            if let Some(receipt_handler) = handler.receipt_handler.clone() {
                drop(handler);
                receipt_handler.on_receipt(&DeliveryReceipt {
                    destination: address_hash,
                    packet_hash: packet.hash(),
                    rtt,
                });
            }
        }
        return;
    }

    if let Some(link) = handler.in_links.get(&packet.destination).cloned() {
        let _ = link.lock().await.handle_packet(&packet);
        return;
    }

    if let Some((forwarded, next_iface)) = handler.link_table.handle_proof(&packet) {
        handler
            .send(TxMessage { tx_type: TxMessageType::Direct(next_iface), packet: forwarded })
            .await;
    }
}

/// Synchronous shortcut used by tests to feed a packet straight into link
/// state without spinning up the job loop.
pub(super) fn handle_inbound_packet_for_test(
    packet: &Packet,
    handler: &mut TransportHandler,
) -> Option<DeliveryReceipt> {
    if packet.header.packet_type != PacketType::Proof {
        return None;
    }

    let link = handler.out_links.get(&packet.destination)?.clone();
    let mut link_guard = link.try_lock().ok()?;
    let result = link_guard.handle_packet(packet);
    if !matches!(result, LinkHandleResult::Activated) {
        return None;
    }

    Some(DeliveryReceipt {
        destination: link_guard.destination().address_hash,
        packet_hash: packet.hash(),
        rtt: link_guard.elapsed(),
    })
}
