use async_trait::async_trait;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use futures::StreamExt;
use libp2p::{
	core::transport::ListenerId,
	kad::RecordKey,
	swarm::{
		dial_opts::{DialOpts, PeerCondition},
		DialError,
	},
	Multiaddr, PeerId,
};
use std::{collections::HashSet, time::Duration};
use tokio::sync::{
	mpsc::{self, UnboundedReceiver, UnboundedSender},
	oneshot,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{default_bootstrap_peers, Command, EventLoop, QueryChannel};
use crate::{
	error::DiscoveryError,
	network::{Connectedness, Host, PeerInfo, ProviderStream, Routing},
	types::PeerAddress,
};

/// Handle to the network event loop, cheap to clone.
#[derive(Clone)]
pub struct Client {
	command_sender: UnboundedSender<Command>,
	local_peer_id: PeerId,
	/// Upper bound for a single dial attempt
	dial_timeout: Duration,
}

impl Client {
	pub fn new(
		sender: UnboundedSender<Command>,
		local_peer_id: PeerId,
		dial_timeout: Duration,
	) -> Self {
		Self {
			command_sender: sender,
			local_peer_id,
			dial_timeout,
		}
	}

	async fn execute_sync<F, T>(&self, command_creator: F) -> Result<T>
	where
		F: FnOnce(oneshot::Sender<Result<T>>) -> Command,
	{
		let (response_sender, response_receiver) = oneshot::channel();
		let command = command_creator(response_sender);
		self.command_sender
			.send(command)
			.map_err(|_| eyre!("receiver should not be dropped"))?;
		response_receiver
			.await
			.wrap_err("sender should not be dropped")?
	}

	/// Starts listening on provided multiaddresses
	pub async fn start_listening(&self, addrs: Vec<Multiaddr>) -> Result<Vec<ListenerId>> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				let results: Result<Vec<ListenerId>, _> = addrs
					.into_iter()
					.map(|addr| context.swarm.listen_on(addr))
					.collect();
				response_sender
					.send(results.map_err(Into::into))
					.map_err(|e| {
						eyre!("Encountered error while sending Start Listening response: {e:?}")
					})?;
				Ok(())
			})
		})
		.await
	}

	pub fn add_addresses(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> Result<()> {
		self.command_sender
			.send(Box::new(move |context: &mut EventLoop| {
				let kademlia = &mut context.swarm.behaviour_mut().kademlia;
				for address in addresses {
					kademlia.add_address(&peer_id, address);
				}
				Ok(())
			}))
			.map_err(|_| eyre!("Failed to send the Add Address Command to the EventLoop"))
	}

	async fn dial_peer(&self, peer_id: PeerId, addresses: Vec<Multiaddr>) -> Result<()> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				if context.swarm.is_connected(&peer_id) {
					_ = response_sender.send(Ok(()));
					return Ok(());
				}

				let opts = DialOpts::peer_id(peer_id)
					.addresses(addresses)
					.condition(PeerCondition::DisconnectedAndNotDialing)
					.build();
				match context.swarm.dial(opts) {
					// a dial already in flight resolves this sender as well
					Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => context
						.pending_swarm_events
						.entry(peer_id)
						.or_default()
						.push(response_sender),
					Err(error) => {
						_ = response_sender.send(Err(error.into()));
					},
				}
				Ok(())
			})
		})
		.await
	}

	async fn start_providing(&self, key: RecordKey) -> Result<()> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				let result = context
					.swarm
					.behaviour_mut()
					.kademlia
					.start_providing(key)
					.map(|query_id| debug!("Providing started, query {query_id:?}"))
					.wrap_err("Unable to store the local provider record");
				response_sender
					.send(result)
					.map_err(|_| eyre!("Failed to send the Start Providing response"))?;
				Ok(())
			})
		})
		.await
	}

	async fn get_providers(&self, key: RecordKey) -> Result<UnboundedReceiver<PeerInfo>> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				let (sender, receiver) = mpsc::unbounded_channel();
				let query_id = context.swarm.behaviour_mut().kademlia.get_providers(key);
				context.pending_kad_queries.insert(
					query_id,
					QueryChannel::GetProviders {
						sender,
						seen: HashSet::new(),
					},
				);
				response_sender
					.send(Ok(receiver))
					.map_err(|_| eyre!("Failed to send the Get Providers response"))?;
				Ok(())
			})
		})
		.await
	}

	async fn bootstrap_routing_table(&self) -> Result<()> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				match context.swarm.behaviour_mut().kademlia.bootstrap() {
					Ok(query_id) => debug!("Kademlia bootstrap started, query {query_id:?}"),
					// Kademlia bootstraps on its own once the first peer is added
					Err(error) => debug!("Kademlia bootstrap deferred: {error}"),
				}
				response_sender
					.send(Ok(()))
					.map_err(|_| eyre!("Failed to send the Bootstrap response"))?;
				Ok(())
			})
		})
		.await
	}

	async fn is_connected(&self, peer_id: PeerId) -> Result<bool> {
		self.execute_sync(|response_sender| {
			Box::new(move |context: &mut EventLoop| {
				response_sender
					.send(Ok(context.swarm.is_connected(&peer_id)))
					.map_err(|_| eyre!("Failed to send the Is Connected response"))?;
				Ok(())
			})
		})
		.await
	}
}

#[async_trait]
impl Routing for Client {
	async fn bootstrap(&self) -> Result<(), DiscoveryError> {
		self.bootstrap_routing_table()
			.await
			.map_err(DiscoveryError::routing)
	}

	async fn advertise(&self, key: &str) -> Result<(), DiscoveryError> {
		self.start_providing(RecordKey::new(&key))
			.await
			.map_err(DiscoveryError::routing)
	}

	async fn find_providers(&self, key: &str) -> Result<ProviderStream, DiscoveryError> {
		let receiver = self
			.get_providers(RecordKey::new(&key))
			.await
			.map_err(DiscoveryError::routing)?;
		Ok(UnboundedReceiverStream::new(receiver).boxed())
	}

	fn default_bootstrap_peers(&self) -> Vec<PeerAddress> {
		default_bootstrap_peers()
	}
}

#[async_trait]
impl Host for Client {
	fn local_peer_id(&self) -> PeerId {
		self.local_peer_id
	}

	async fn connectedness(&self, peer_id: PeerId) -> Connectedness {
		match self.is_connected(peer_id).await {
			Ok(true) => Connectedness::Connected,
			Ok(false) => Connectedness::NotConnected,
			Err(error) => {
				debug!("Unable to check connection to {peer_id}: {error:#}");
				Connectedness::NotConnected
			},
		}
	}

	async fn connect(&self, peer: PeerInfo) -> Result<(), DiscoveryError> {
		let PeerInfo { peer_id, addresses } = peer;
		tokio::time::timeout(self.dial_timeout, self.dial_peer(peer_id, addresses.clone()))
			.await
			.map_err(|_| DiscoveryError::connection(peer_id, "dial timed out"))?
			.map_err(|error| DiscoveryError::connection(peer_id, error))?;

		self.add_addresses(peer_id, addresses)
			.map_err(|error| DiscoveryError::connection(peer_id, error))
	}
}
