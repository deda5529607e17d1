use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::{
	network::{Connectedness, Host, PeerInfo},
	types::PeerAddress,
};

/// Connects to well-known peers to gain entry into the network.
pub struct BootstrapConnector<H> {
	host: Arc<H>,
	bootstraps: Vec<PeerAddress>,
}

impl<H: Host + Send + Sync> BootstrapConnector<H> {
	pub fn new(host: Arc<H>, bootstraps: Vec<PeerAddress>) -> Self {
		Self { host, bootstraps }
	}

	pub fn bootstraps(&self) -> &[PeerAddress] {
		&self.bootstraps
	}

	/// Dials all bootstrap peers concurrently and waits for every attempt to finish.
	///
	/// Failures are logged and never returned. Returns the number of newly established connections.
	pub async fn connect(&self) -> usize {
		let attempts = self
			.bootstraps
			.iter()
			.filter_map(|address| match address.peer_info() {
				Ok(peer) => Some(peer),
				Err(error) => {
					warn!("Skipping bootstrap peer: {error}");
					None
				},
			})
			.map(|peer| self.connect_peer(peer));

		let connected = join_all(attempts)
			.await
			.into_iter()
			.filter(|connected| *connected)
			.count();
		debug!(connected, "Bootstrap peers dialed");
		connected
	}

	async fn connect_peer(&self, peer: PeerInfo) -> bool {
		let peer_id = peer.peer_id;
		if self.host.connectedness(peer_id).await == Connectedness::Connected {
			trace!(%peer_id, "Bootstrap peer already connected");
			return false;
		}

		match self.host.connect(peer).await {
			Ok(()) => {
				debug!(%peer_id, "Connection established with bootstrap node");
				true
			},
			Err(error) => {
				debug!("{error}");
				false
			},
		}
	}
}
