extern crate alloc;

pub mod buffer;
pub mod channel;
pub mod config;
pub mod crypt;
pub mod destination;
mod error;
pub mod hash;
pub mod iface;
pub mod identity;
pub mod packet;
pub mod ratchets;
pub mod resource;
pub mod storage;
pub mod time;
pub mod transport;

pub use destination::{group_decrypt, group_encrypt};
pub use error::RnsError;
pub use packet::{Packet, LXMF_MAX_PAYLOAD};
