use async_trait::async_trait;
use futures::stream::BoxStream;
use libp2p::{Multiaddr, PeerId};
use mockall::automock;
use std::fmt::{self, Display, Formatter};

use crate::{error::Result, types::PeerAddress};

pub mod p2p;

/// Discovered or configured peer, with the addresses it can be dialed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
	pub peer_id: PeerId,
	pub addresses: Vec<Multiaddr>,
}

impl Display for PeerInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{} {:?}", self.peer_id, self.addresses)
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
	Connected,
	NotConnected,
}

/// Lazy sequence of peers providing a rendezvous key.
///
/// Dropping the stream stops the underlying lookup.
pub type ProviderStream = BoxStream<'static, PeerInfo>;

/// Content routing substrate used to meet peers under a shared key.
#[async_trait]
#[automock]
pub trait Routing {
	/// Populates the routing table from the peers already known to the node.
	async fn bootstrap(&self) -> Result<()>;
	/// Registers the local node as a provider of the key.
	async fn advertise(&self, key: &str) -> Result<()>;
	async fn find_providers(&self, key: &str) -> Result<ProviderStream>;
	/// Well-known peers used when no bootstrap peers are configured.
	fn default_bootstrap_peers(&self) -> Vec<PeerAddress>;
}

/// Local participant of the overlay network.
#[async_trait]
#[automock]
pub trait Host {
	fn local_peer_id(&self) -> PeerId;
	async fn connectedness(&self, peer_id: PeerId) -> Connectedness;
	async fn connect(&self, peer: PeerInfo) -> Result<()>;
}
