//! Peer discovery over a Kademlia DHT using shared, optionally rotating, rendezvous keys.

pub mod discovery;
pub mod error;
pub mod network;
pub mod shutdown;
pub mod types;
pub mod utils;
