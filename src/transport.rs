pub mod announce;
pub mod announce_limits;
pub mod announce_table;
pub mod config;
pub mod handler;
pub mod jobs;
pub mod link_table;
pub mod path;
pub mod path_requests;
pub mod path_table;
pub mod packet_cache;
mod core;
mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use rand_core::OsRng;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use x25519_dalek::PublicKey;

use crate::destination::link::{
    Link, LinkEvent, LinkEventData, LinkHandleResult, LinkId, LinkStatus,
};
use crate::destination::{
    DestinationAnnounce, DestinationHandleStatus, SingleInputDestination, SingleOutputDestination,
};
use crate::hash::AddressHash;
use crate::iface::{
    InterfaceManager, InterfaceRxReceiver, RxMessage, TxDispatchTrace, TxMessage, TxMessageType,
};
use crate::identity::PrivateIdentity;
use crate::packet::{
    Packet, PacketContext, PacketDataBuffer, PacketType,
};
use crate::ratchets::{encrypt_for_public_key, now_secs, RatchetStore};
use crate::resource::{build_resource_request_packet, ResourceEvent, ResourceManager};

use announce_limits::AnnounceLimits;
use announce_table::AnnounceTable;
use link_table::LinkTable;
use path_requests::{create_path_request_destination, PathRequests, TagBytes};
use path_table::PathTable;
use packet_cache::PacketCache;

const INTERVAL_INPUT_LINK_CLEANUP: Duration = Duration::from_secs(60 * 15);
const INTERVAL_OUTPUT_LINK_RESTART: Duration = Duration::from_secs(60 * 10);
const INTERVAL_OUTPUT_LINK_REPEAT: Duration = Duration::from_secs(5);
const INTERVAL_LINKS_CHECK: Duration = Duration::from_secs(5);
const INTERVAL_OUTPUT_LINK_KEEP: Duration = Duration::from_secs(30);
const INTERVAL_IFACE_CLEANUP: Duration = Duration::from_secs(60);
const INTERVAL_ANNOUNCES_RETRANSMIT: Duration = Duration::from_secs(5);
const INTERVAL_PACKET_CACHE_CLEANUP: Duration = Duration::from_secs(30);
const INTERVAL_KEEP_PACKET_CACHED: Duration = Duration::from_secs(60 * 10);
const KEEP_ALIVE_REQUEST: u8 = 0xFF;
const PACKET_TRACE: bool = false;

/// What happened to the wire payload of `ReceivedData`: whether the caller
/// gets the fully-decrypted application bytes or the still-framed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedPayloadMode {
    FullWire,
    Decrypted,
}

/// A link payload delivered up to the application, tagged with enough
/// context to correlate it with an outstanding request.
#[derive(Debug, Clone)]
pub struct ReceivedData {
    pub destination: AddressHash,
    pub data: PacketDataBuffer,
    pub payload_mode: ReceivedPayloadMode,
    pub ratchet_used: bool,
    pub context: Option<PacketContext>,
    pub request_id: Option<[u8; crate::hash::ADDRESS_HASH_SIZE]>,
    pub hops: Option<u8>,
    pub interface: Option<AddressHash>,
}

/// A freshly validated announce, ready to hand to whoever is listening on
/// `Transport::recv_announces`.
#[derive(Clone)]
pub struct AnnounceEvent {
    pub destination: Arc<Mutex<SingleOutputDestination>>,
    pub app_data: PacketDataBuffer,
    pub ratchet: Option<[u8; crate::destination::RATCHET_LENGTH]>,
    pub name_hash: [u8; crate::destination::NAME_HASH_LENGTH],
    pub hops: u8,
    pub interface: Vec<u8>,
}

/// Confirmation that a previously sent packet was proved by its recipient.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryReceipt {
    pub destination: AddressHash,
    pub packet_hash: crate::hash::Hash,
    pub rtt: StdDuration,
}

/// Callback surface for delivery receipts; kept as a trait object so callers
/// can plug in whatever bookkeeping (retry queues, metrics) they need
/// without the transport depending on it.
pub trait ReceiptHandler: Send + Sync {
    fn on_receipt(&self, receipt: &DeliveryReceipt);
}

/// Outcome of a single `send_packet` call, returned to callers that want to
/// know precisely why a packet did or didn't go out instead of just firing
/// and forgetting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPacketOutcome {
    DroppedMissingDestinationIdentity,
    DroppedCiphertextTooLarge,
    DroppedEncryptFailed,
    SentDirect,
    DroppedNoRoute,
    SentBroadcast,
}

/// Full diagnostic trail for a `send_packet` call: what was decided and
/// which interfaces actually accepted the frame.
#[derive(Debug, Clone, Copy)]
pub struct SendPacketTrace {
    pub outcome: SendPacketOutcome,
    pub direct_iface: Option<AddressHash>,
    pub broadcast: bool,
    pub dispatch: TxDispatchTrace,
}

/// Tuning knobs for a `Transport` instance. Constructed once at startup from
/// a node-wide [`crate::config::Config`] and the node's [`PrivateIdentity`].
pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    pub broadcast: bool,
    pub retransmit: bool,
    pub announce_cache_capacity: usize,
    pub announce_retry_limit: u8,
    pub announce_queue_len: usize,
    pub announce_cap: usize,
    pub path_request_timeout_secs: u64,
    pub link_proof_timeout_secs: u64,
    pub link_idle_timeout_secs: u64,
    pub resource_retry_interval_secs: u64,
    pub resource_retry_limit: u8,
    pub ratchet_store_path: Option<PathBuf>,
}

/// All mutable routing state behind a single mutex: path table, announce
/// table, link table, known destinations and in-flight links. `Transport`
/// hands out clones of the `Arc<Mutex<...>>` and otherwise only talks to
/// this through the job loops in [`jobs`].
pub struct TransportHandler {
    pub(crate) config: TransportConfig,
    pub(crate) iface_manager: Arc<Mutex<InterfaceManager>>,
    pub(crate) announce_table: AnnounceTable,
    pub(crate) link_table: LinkTable,
    pub(crate) path_table: PathTable,
    pub(crate) single_in_destinations: HashMap<AddressHash, Arc<Mutex<SingleInputDestination>>>,
    pub(crate) single_out_destinations: HashMap<AddressHash, Arc<Mutex<SingleOutputDestination>>>,
    pub(crate) announce_limits: AnnounceLimits,
    pub(crate) out_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    pub(crate) in_links: HashMap<AddressHash, Arc<Mutex<Link>>>,
    pub(crate) packet_cache: Mutex<PacketCache>,
    pub(crate) path_requests: PathRequests,
    pub(crate) announce_tx: broadcast::Sender<AnnounceEvent>,
    pub(crate) link_in_event_tx: broadcast::Sender<LinkEventData>,
    pub(crate) received_data_tx: broadcast::Sender<ReceivedData>,
    pub(crate) ratchet_store: Option<RatchetStore>,
    pub(crate) resource_manager: ResourceManager,
    pub(crate) resource_events_tx: broadcast::Sender<ResourceEvent>,
    pub(crate) fixed_dest_path_requests: AddressHash,
    pub(crate) cancel: CancellationToken,
    pub(crate) receipt_handler: Option<Arc<dyn ReceiptHandler>>,
}

/// Handle to a running transport instance: destinations are registered and
/// packets sent through this, while [`jobs::manage_transport`] drives the
/// packet loop and periodic maintenance tasks in the background.
pub struct Transport {
    name: String,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    link_in_event_tx: broadcast::Sender<LinkEventData>,
    link_out_event_tx: broadcast::Sender<LinkEventData>,
    received_data_tx: broadcast::Sender<ReceivedData>,
    iface_messages_tx: broadcast::Sender<RxMessage>,
    resource_events_tx: broadcast::Sender<ResourceEvent>,
    handler: Arc<Mutex<TransportHandler>>,
    cancel: CancellationToken,
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

