use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

use crate::{
	error::Result,
	network::{Connectedness, Host, Routing},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnnounceStats {
	/// Providers other than the local node, with at least one address
	pub discovered: usize,
	pub already_connected: usize,
	pub connected: usize,
	pub failed: usize,
}

/// Advertises the local node under a rendezvous key and connects to the other providers of it.
pub struct AnnounceCycle<R, H> {
	routing: Arc<R>,
	host: Arc<H>,
}

impl<R, H> AnnounceCycle<R, H>
where
	R: Routing + Send + Sync,
	H: Host + Send + Sync,
{
	pub fn new(routing: Arc<R>, host: Arc<H>) -> Self {
		Self { routing, host }
	}

	/// Fails only if advertising or starting the provider lookup fails.
	/// Discovered peers are dialed one after another, dial failures are logged.
	pub async fn run_once(&self, rendezvous: &str) -> Result<AnnounceStats> {
		debug!(rendezvous, "Announcing ourselves...");
		self.routing.advertise(rendezvous).await?;
		debug!(rendezvous, "Successfully announced!");

		debug!(rendezvous, "Searching for other peers...");
		let mut providers = self.routing.find_providers(rendezvous).await?;
		let local_peer_id = self.host.local_peer_id();
		let mut stats = AnnounceStats::default();

		while let Some(peer) = providers.next().await {
			// Don't dial ourselves or peers without address
			if peer.peer_id == local_peer_id || peer.addresses.is_empty() {
				continue;
			}
			stats.discovered += 1;

			if self.host.connectedness(peer.peer_id).await == Connectedness::Connected {
				debug!("Known peer (already connected): {peer}");
				stats.already_connected += 1;
				continue;
			}

			debug!("Found peer: {peer}");
			let peer_id = peer.peer_id;
			match self.host.connect(peer).await {
				Ok(()) => {
					debug!(%peer_id, "Connected to peer");
					stats.connected += 1;
				},
				Err(error) => {
					debug!(%peer_id, "Failed connecting to peer: {error}");
					stats.failed += 1;
				},
			}
		}

		Ok(stats)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		error::DiscoveryError,
		network::{MockHost, MockRouting, PeerInfo},
	};
	use futures::stream;
	use libp2p::{Multiaddr, PeerId};

	fn peer(peer_id: PeerId, addresses: &[&str]) -> PeerInfo {
		PeerInfo {
			peer_id,
			addresses: addresses
				.iter()
				.map(|address| address.parse::<Multiaddr>().unwrap())
				.collect(),
		}
	}

	fn routing_with_providers(providers: Vec<PeerInfo>) -> MockRouting {
		let mut routing = MockRouting::new();
		routing
			.expect_advertise()
			.times(1)
			.returning(|_| Box::pin(async { Ok(()) }));
		routing.expect_find_providers().times(1).returning(move |_| {
			let providers = stream::iter(providers.clone()).boxed();
			Box::pin(async move { Ok(providers) })
		});
		routing
	}

	#[tokio::test]
	async fn skips_self_and_peers_without_addresses() {
		let local = PeerId::random();
		let no_address = PeerId::random();
		let remote = PeerId::random();

		let routing = routing_with_providers(vec![
			peer(local, &["/ip4/10.0.0.1/tcp/4001"]),
			peer(no_address, &[]),
			peer(remote, &["/ip4/10.0.0.2/tcp/4001"]),
		]);

		let mut host = MockHost::new();
		host.expect_local_peer_id().return_const(local);
		host.expect_connectedness()
			.withf(move |peer_id| *peer_id == remote)
			.times(1)
			.returning(|_| Box::pin(async { Connectedness::NotConnected }));
		host.expect_connect()
			.withf(move |peer| peer.peer_id == remote)
			.times(1)
			.returning(|_| Box::pin(async { Ok(()) }));

		let cycle = AnnounceCycle::new(Arc::new(routing), Arc::new(host));
		let stats = cycle.run_once("rendezvous").await.unwrap();
		assert_eq!(
			stats,
			AnnounceStats {
				discovered: 1,
				connected: 1,
				..Default::default()
			}
		);
	}

	#[tokio::test]
	async fn connection_failures_are_not_propagated() {
		let connected = PeerId::random();
		let failing = PeerId::random();
		let reachable = PeerId::random();

		let routing = routing_with_providers(vec![
			peer(connected, &["/ip4/10.0.0.1/tcp/4001"]),
			peer(failing, &["/ip4/10.0.0.2/tcp/4001"]),
			peer(reachable, &["/ip4/10.0.0.3/tcp/4001"]),
		]);

		let mut host = MockHost::new();
		host.expect_local_peer_id().return_const(PeerId::random());
		host.expect_connectedness().returning(move |peer_id| {
			let connectedness = if peer_id == connected {
				Connectedness::Connected
			} else {
				Connectedness::NotConnected
			};
			Box::pin(async move { connectedness })
		});
		host.expect_connect().times(2).returning(move |peer| {
			let result = if peer.peer_id == failing {
				Err(DiscoveryError::connection(peer.peer_id, "dial timed out"))
			} else {
				Ok(())
			};
			Box::pin(async move { result })
		});

		let cycle = AnnounceCycle::new(Arc::new(routing), Arc::new(host));
		let stats = cycle.run_once("rendezvous").await.unwrap();
		assert_eq!(
			stats,
			AnnounceStats {
				discovered: 3,
				already_connected: 1,
				connected: 1,
				failed: 1,
			}
		);
	}

	#[tokio::test]
	async fn lookup_start_failure_is_routing_error() {
		let mut routing = MockRouting::new();
		routing
			.expect_advertise()
			.returning(|_| Box::pin(async { Ok(()) }));
		routing.expect_find_providers().returning(|_| {
			Box::pin(async { Err(DiscoveryError::routing("no peers in routing table")) })
		});

		let mut host = MockHost::new();
		host.expect_connect().never();

		let cycle = AnnounceCycle::new(Arc::new(routing), Arc::new(host));
		let result = cycle.run_once("rendezvous").await;
		assert!(matches!(result, Err(DiscoveryError::Routing(_))));
	}

	#[tokio::test]
	async fn advertise_failure_skips_lookup() {
		let mut routing = MockRouting::new();
		routing
			.expect_advertise()
			.returning(|_| Box::pin(async { Err(DiscoveryError::routing("store full")) }));
		routing.expect_find_providers().never();

		let cycle = AnnounceCycle::new(Arc::new(routing), Arc::new(MockHost::new()));
		assert!(cycle.run_once("rendezvous").await.is_err());
	}

	#[tokio::test]
	async fn empty_provider_stream_is_fine() {
		let routing = routing_with_providers(vec![]);
		let mut host = MockHost::new();
		host.expect_local_peer_id().return_const(PeerId::random());

		let cycle = AnnounceCycle::new(Arc::new(routing), Arc::new(host));
		let stats = cycle.run_once("rendezvous").await.unwrap();
		assert_eq!(stats, AnnounceStats::default());
	}
}
