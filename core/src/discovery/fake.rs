//! In-memory network for timing tests, with configurable delays.
use async_trait::async_trait;
use futures::{stream, StreamExt};
use libp2p::{Multiaddr, PeerId};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::time::{sleep, Instant};

use crate::{
	error::{DiscoveryError, Result},
	network::{Connectedness, Host, PeerInfo, ProviderStream, Routing},
	types::PeerAddress,
};

pub fn peer_address(peer_id: PeerId) -> PeerAddress {
	let address: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
	PeerAddress::PeerIdAndMultiaddr((peer_id, address))
}

pub struct FakeNetwork {
	local_peer_id: PeerId,
	connect_delays: HashMap<PeerId, Duration>,
	find_delay: Duration,
	fail_find: bool,
	default_bootstraps: Vec<PeerAddress>,
	dialed: Mutex<Vec<PeerId>>,
	advertised: Mutex<Vec<(Instant, String)>>,
}

impl Default for FakeNetwork {
	fn default() -> Self {
		Self {
			local_peer_id: PeerId::random(),
			connect_delays: HashMap::new(),
			find_delay: Duration::ZERO,
			fail_find: false,
			default_bootstraps: vec![],
			dialed: Mutex::new(vec![]),
			advertised: Mutex::new(vec![]),
		}
	}
}

impl FakeNetwork {
	pub fn with_connect_delays(
		mut self,
		delays: impl IntoIterator<Item = (PeerId, Duration)>,
	) -> Self {
		self.connect_delays.extend(delays);
		self
	}

	pub fn with_find_delay(mut self, delay: Duration) -> Self {
		self.find_delay = delay;
		self
	}

	pub fn with_failing_find(mut self) -> Self {
		self.fail_find = true;
		self
	}

	pub fn with_default_bootstraps(mut self, bootstraps: Vec<PeerAddress>) -> Self {
		self.default_bootstraps = bootstraps;
		self
	}

	pub fn dialed(&self) -> Vec<PeerId> {
		self.dialed.lock().unwrap().clone()
	}

	pub fn advertised(&self) -> Vec<(Instant, String)> {
		self.advertised.lock().unwrap().clone()
	}
}

#[async_trait]
impl Routing for FakeNetwork {
	async fn bootstrap(&self) -> Result<()> {
		Ok(())
	}

	async fn advertise(&self, key: &str) -> Result<()> {
		self.advertised
			.lock()
			.unwrap()
			.push((Instant::now(), key.to_string()));
		Ok(())
	}

	async fn find_providers(&self, _key: &str) -> Result<ProviderStream> {
		sleep(self.find_delay).await;
		if self.fail_find {
			return Err(DiscoveryError::routing("lookup unavailable"));
		}
		Ok(stream::empty::<PeerInfo>().boxed())
	}

	fn default_bootstrap_peers(&self) -> Vec<PeerAddress> {
		self.default_bootstraps.clone()
	}
}

#[async_trait]
impl Host for FakeNetwork {
	fn local_peer_id(&self) -> PeerId {
		self.local_peer_id
	}

	async fn connectedness(&self, _peer_id: PeerId) -> Connectedness {
		Connectedness::NotConnected
	}

	async fn connect(&self, peer: PeerInfo) -> Result<()> {
		let delay = self
			.connect_delays
			.get(&peer.peer_id)
			.copied()
			.unwrap_or_default();
		sleep(delay).await;
		self.dialed.lock().unwrap().push(peer.peer_id);
		Ok(())
	}
}
