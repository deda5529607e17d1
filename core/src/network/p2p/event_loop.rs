use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use libp2p::{
	core::Endpoint,
	identify::{self, Info},
	kad::{self, AddProviderOk, BootstrapOk, GetProvidersOk, QueryId, QueryResult},
	multiaddr::Protocol,
	ping,
	swarm::{ConnectionId, DialError, NetworkBehaviour, SwarmEvent},
	Multiaddr, PeerId, Swarm,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, info, trace, warn};

use super::{Behaviour, BehaviourEvent, Command, QueryChannel};
use crate::{network::PeerInfo, shutdown::Controller};

pub struct EventLoop {
	pub swarm: Swarm<Behaviour>,
	command_receiver: UnboundedReceiver<Command>,
	// Tracking Kademlia events
	pub pending_kad_queries: HashMap<QueryId, QueryChannel>,
	// Tracking swarm events (i.e. peer dialing), several callers may wait on the same dial
	pub pending_swarm_events: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
	// Addresses of connected peers and of routing table peers, learned from Kademlia and identify
	address_book: HashMap<PeerId, HashSet<Multiaddr>>,
	shutdown: Controller<String>,
}

impl EventLoop {
	pub(crate) fn new(
		swarm: Swarm<Behaviour>,
		command_receiver: UnboundedReceiver<Command>,
		shutdown: Controller<String>,
	) -> Self {
		Self {
			swarm,
			command_receiver,
			pending_kad_queries: Default::default(),
			pending_swarm_events: Default::default(),
			address_book: Default::default(),
			shutdown,
		}
	}

	pub async fn run(mut self) {
		// shutdown will wait as long as this token is not dropped
		let Ok(_delay_token) = self.shutdown.delay_token() else {
			warn!("Shutdown already completed, network event loop not started");
			return;
		};

		loop {
			tokio::select! {
				event = self.swarm.next() => match event {
					Some(event) => self.handle_event(event),
					None => {
						warn!("Swarm stream ended, exiting the network event loop");
						break;
					},
				},
				command = self.command_receiver.recv() => match command {
					Some(command) => {
						if let Err(error) = command(&mut self) {
							debug!("Network command failed: {error:#}");
						}
					},
					None => {
						warn!("Command channel closed, exiting the network event loop");
						break;
					},
				},
				// if the shutdown was triggered,
				// break the loop immediately, proceed to the cleanup phase
				_ = self.shutdown.triggered_shutdown() => {
					info!("Shutdown triggered, exiting the network event loop");
					break;
				}
			}
		}
		self.disconnect_peers();
	}

	fn disconnect_peers(&mut self) {
		let connected_peers: Vec<PeerId> = self.swarm.connected_peers().cloned().collect();
		// close all active connections with other peers
		for peer in connected_peers {
			_ = self.swarm.disconnect_peer_id(peer);
		}
	}

	fn remember_addresses(
		&mut self,
		peer_id: PeerId,
		addresses: impl IntoIterator<Item = Multiaddr>,
	) {
		self.address_book
			.entry(peer_id)
			.or_default()
			.extend(addresses);
	}

	/// Drops the addresses of a peer that is neither connected nor in the routing table.
	fn forget_if_unreachable(&mut self, peer_id: PeerId) {
		if self.swarm.is_connected(&peer_id) || in_routing_table(&mut self.swarm, &peer_id) {
			return;
		}
		if self.address_book.remove(&peer_id).is_some() {
			trace!("Removed {peer_id} from the address book");
		}
	}

	fn send_providers(&mut self, id: QueryId, providers: HashSet<PeerId>) {
		let Some(QueryChannel::GetProviders { sender, seen }) =
			self.pending_kad_queries.get_mut(&id)
		else {
			return;
		};

		let mut receiver_dropped = sender.is_closed();
		for peer_id in providers {
			if receiver_dropped || !seen.insert(peer_id) {
				continue;
			}
			let addresses = known_addresses(&mut self.swarm, &self.address_book, &peer_id);
			trace!("Found provider {peer_id} with addresses {addresses:?}");
			receiver_dropped = sender.send(PeerInfo { peer_id, addresses }).is_err();
		}

		if receiver_dropped {
			trace!("Provider stream dropped, finishing query {id:?}");
			self.finish_query(id);
		}
	}

	fn finish_query(&mut self, id: QueryId) {
		self.pending_kad_queries.remove(&id);
		if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
			query.finish();
		}
	}

	fn resolve_dial(&mut self, peer_id: &PeerId, result: impl Fn() -> Result<()>) {
		for sender in self.pending_swarm_events.remove(peer_id).unwrap_or_default() {
			_ = sender.send(result());
		}
	}

	#[tracing::instrument(level = "trace", skip(self))]
	fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
		match event {
			SwarmEvent::Behaviour(BehaviourEvent::Kademlia(event)) => match event {
				kad::Event::RoutingUpdated {
					peer,
					is_new_peer,
					addresses,
					old_peer,
					..
				} => {
					trace!("Routing updated. Peer: {peer:?}. is_new_peer: {is_new_peer:?}. Addresses: {addresses:?}");
					self.remember_addresses(peer, addresses.into_vec());
					if let Some(evicted) = old_peer {
						trace!("Peer {evicted} evicted from the routing table");
						self.forget_if_unreachable(evicted);
					}
				},
				kad::Event::UnroutablePeer { peer } => {
					trace!("Unroutable peer: {peer}");
				},
				kad::Event::OutboundQueryProgressed {
					id, result, step, ..
				} => {
					match result {
						QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
							providers,
							..
						})) => self.send_providers(id, providers),
						QueryResult::GetProviders(Ok(
							GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
						)) => {
							trace!("Providers query {id:?} finished");
						},
						QueryResult::GetProviders(Err(error)) => {
							debug!("Providers query {id:?} failed: {error}");
						},
						QueryResult::StartProviding(Ok(AddProviderOk { key })) => {
							debug!("Provider record published for key {key:?}");
						},
						QueryResult::StartProviding(Err(error)) => {
							debug!("Publishing provider record failed: {error}");
						},
						QueryResult::Bootstrap(Ok(BootstrapOk {
							peer,
							num_remaining,
						})) => {
							debug!("BootstrapOK event. PeerID: {peer:?}. Num remaining: {num_remaining:?}.");
							if num_remaining == 0 {
								info!("Bootstrap completed.");
							}
						},
						QueryResult::Bootstrap(Err(error)) => {
							debug!("Bootstrap error event. Error: {error:?}.");
						},
						_ => {},
					}

					// the result channel is dropped with the entry, which ends the provider stream
					if step.last {
						self.pending_kad_queries.remove(&id);
					}
				},
				kad::Event::ModeChanged { new_mode } => {
					debug!("Kademlia mode changed: {new_mode:?}");
				},
				_ => {},
			},
			SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => match event {
				identify::Event::Received {
					peer_id,
					info:
						Info {
							listen_addrs,
							protocols,
							agent_version,
							..
						},
					..
				} => {
					trace!("Identity Received from: {peer_id:?} ({agent_version}) on listen address: {listen_addrs:?}");
					let addresses: Vec<Multiaddr> = listen_addrs
						.into_iter()
						// Filter out the loopback addresses
						.filter(|addr| !is_localhost(addr))
						.collect();

					let kad = &mut self.swarm.behaviour_mut().kademlia;
					let speaks_kad = kad
						.protocol_names()
						.first()
						.is_some_and(|protocol| protocols.contains(protocol));
					if speaks_kad {
						for address in &addresses {
							trace!("Adding peer {peer_id} to routing table.");
							kad.add_address(&peer_id, address.clone());
						}
					}
					self.remember_addresses(peer_id, addresses);
				},
				identify::Event::Error { peer_id, error, .. } => {
					trace!("Identify Error event. PeerId: {peer_id:?}. Error: {error:?}");
				},
				_ => {},
			},
			SwarmEvent::Behaviour(BehaviourEvent::Ping(ping::Event { peer, result, .. })) => {
				if let Ok(rtt) = result {
					trace!("Ping to {peer} took {rtt:?}");
				}
			},
			SwarmEvent::NewListenAddr { address, .. } => {
				info!("Local node is listening on {address}");
			},
			SwarmEvent::NewExternalAddrOfPeer { peer_id, address } => {
				self.remember_addresses(peer_id, [address]);
			},
			SwarmEvent::ConnectionEstablished {
				peer_id, endpoint, ..
			} => {
				trace!(
					"Connection established. PeerID: {peer_id}. Address: {:?}",
					endpoint.get_remote_address()
				);
				// Notify the connections we're waiting on that we've connected successfully
				self.resolve_dial(&peer_id, || Ok(()));
			},
			SwarmEvent::ConnectionClosed {
				peer_id,
				num_established,
				cause,
				..
			} => {
				trace!("Connection closed. PeerID: {peer_id:?}. Num established: {num_established:?}. Cause: {cause:?}");
				if num_established == 0 {
					self.forget_if_unreachable(peer_id);
				}
			},
			SwarmEvent::OutgoingConnectionError {
				peer_id: Some(peer_id),
				error,
				..
			} => {
				if let DialError::WrongPeerId { .. } = &error {
					if self
						.swarm
						.behaviour_mut()
						.kademlia
						.remove_peer(&peer_id)
						.is_some()
					{
						debug!("Removed peer {peer_id} from the routing table. Cause: {error}");
					}
				}
				// Notify the connections we're waiting on an error has occurred
				let reason = error.to_string();
				self.resolve_dial(&peer_id, || Err(eyre!("{reason}")));
			},
			SwarmEvent::Dialing {
				peer_id: Some(peer),
				connection_id,
			} => {
				trace!("Dialing: {}, on connection: {}", peer, connection_id);
			},
			_ => {},
		}
	}
}

/// Addresses of a peer known to the address book or to Kademlia.
///
/// Kademlia answers with the routing table entry and with the addresses reported to its running
/// queries, which holds the provider record addresses while a providers lookup is in progress.
fn known_addresses(
	swarm: &mut Swarm<Behaviour>,
	address_book: &HashMap<PeerId, HashSet<Multiaddr>>,
	peer_id: &PeerId,
) -> Vec<Multiaddr> {
	let mut addresses = address_book.get(peer_id).cloned().unwrap_or_default();
	match swarm.behaviour_mut().kademlia.handle_pending_outbound_connection(
		ConnectionId::new_unchecked(0),
		Some(*peer_id),
		&[],
		Endpoint::Dialer,
	) {
		Ok(resolved) => addresses.extend(resolved),
		Err(error) => trace!("Kademlia has no addresses for {peer_id}: {error}"),
	}
	addresses.into_iter().collect()
}

fn in_routing_table(swarm: &mut Swarm<Behaviour>, peer_id: &PeerId) -> bool {
	swarm
		.behaviour_mut()
		.kademlia
		.kbucket(*peer_id)
		.is_some_and(|bucket| bucket.iter().any(|entry| entry.node.key.preimage() == peer_id))
}

pub(crate) fn is_localhost(addr: &Multiaddr) -> bool {
	addr.iter().any(|protocol| match protocol {
		Protocol::Ip4(ip) => ip.is_loopback(),
		Protocol::Ip6(ip) => ip.is_loopback(),
		Protocol::Dns(host)
		| Protocol::Dns4(host)
		| Protocol::Dns6(host)
		| Protocol::Dnsaddr(host) => host.eq_ignore_ascii_case("localhost"),
		_ => false,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::network::p2p::{configuration::LibP2PConfig, identity, init};
	use libp2p::{
		core::{transport::PortUse, ConnectedPoint},
		kad::{Addresses, ProgressStep, QueryStats, RecordKey},
	};
	use std::num::NonZeroUsize;
	use test_case::test_case;
	use tokio::sync::mpsc;

	const KEY: &str = "rendezvous";

	fn event_loop() -> EventLoop {
		let cfg = LibP2PConfig::default();
		let (id_keys, _) = identity(&cfg).unwrap();
		let (_, event_loop) = init(cfg, id_keys, Controller::new()).unwrap();
		event_loop
	}

	fn providers_query(
		event_loop: &mut EventLoop,
	) -> (QueryId, mpsc::UnboundedReceiver<PeerInfo>) {
		let query_id = event_loop
			.swarm
			.behaviour_mut()
			.kademlia
			.get_providers(RecordKey::new(&KEY));
		let (sender, receiver) = mpsc::unbounded_channel();
		event_loop.pending_kad_queries.insert(
			query_id,
			QueryChannel::GetProviders {
				sender,
				seen: HashSet::new(),
			},
		);
		(query_id, receiver)
	}

	fn progressed(
		id: QueryId,
		result: GetProvidersOk,
		count: usize,
		last: bool,
	) -> SwarmEvent<BehaviourEvent> {
		SwarmEvent::Behaviour(BehaviourEvent::Kademlia(
			kad::Event::OutboundQueryProgressed {
				id,
				result: QueryResult::GetProviders(Ok(result)),
				stats: QueryStats::empty(),
				step: ProgressStep {
					count: NonZeroUsize::new(count).unwrap(),
					last,
				},
			},
		))
	}

	fn found(id: QueryId, providers: &[PeerId], count: usize) -> SwarmEvent<BehaviourEvent> {
		let providers = providers.iter().copied().collect();
		let result = GetProvidersOk::FoundProviders {
			key: RecordKey::new(&KEY),
			providers,
		};
		progressed(id, result, count, false)
	}

	fn routing_updated(
		peer: PeerId,
		address: Multiaddr,
		old_peer: Option<PeerId>,
	) -> SwarmEvent<BehaviourEvent> {
		SwarmEvent::Behaviour(BehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
			peer,
			is_new_peer: true,
			addresses: Addresses::new(address),
			bucket_range: Default::default(),
			old_peer,
		}))
	}

	fn drain(receiver: &mut mpsc::UnboundedReceiver<PeerInfo>) -> Vec<PeerInfo> {
		let mut received = vec![];
		while let Ok(peer) = receiver.try_recv() {
			received.push(peer);
		}
		received
	}

	#[tokio::test]
	async fn providers_are_sent_once_across_steps() {
		let mut event_loop = event_loop();
		let (id, mut receiver) = providers_query(&mut event_loop);
		let (first, second, third) = (PeerId::random(), PeerId::random(), PeerId::random());

		event_loop.handle_event(found(id, &[first, second], 1));
		event_loop.handle_event(found(id, &[second, third], 2));

		let mut received: Vec<PeerId> = drain(&mut receiver)
			.into_iter()
			.map(|peer| peer.peer_id)
			.collect();
		received.sort();
		let mut expected = vec![first, second, third];
		expected.sort();
		assert_eq!(received, expected);
	}

	#[tokio::test]
	async fn dropped_stream_finishes_query() {
		let mut event_loop = event_loop();
		let (id, receiver) = providers_query(&mut event_loop);
		drop(receiver);

		event_loop.handle_event(found(id, &[PeerId::random()], 1));
		assert!(!event_loop.pending_kad_queries.contains_key(&id));
	}

	#[tokio::test]
	async fn last_step_ends_stream() {
		let mut event_loop = event_loop();
		let (id, mut receiver) = providers_query(&mut event_loop);
		let provider = PeerId::random();

		event_loop.handle_event(found(id, &[provider], 1));
		let finished = GetProvidersOk::FinishedWithNoAdditionalRecord {
			closest_peers: vec![],
		};
		event_loop.handle_event(progressed(id, finished, 2, true));

		assert!(!event_loop.pending_kad_queries.contains_key(&id));
		assert_eq!(receiver.recv().await.map(|peer| peer.peer_id), Some(provider));
		assert_eq!(receiver.recv().await, None);
	}

	#[tokio::test]
	async fn provider_addresses_come_from_routing_table() {
		let mut event_loop = event_loop();
		let (id, mut receiver) = providers_query(&mut event_loop);
		let provider = PeerId::random();
		let address: Multiaddr = "/ip4/10.0.0.7/tcp/4001".parse().unwrap();
		event_loop
			.swarm
			.behaviour_mut()
			.kademlia
			.add_address(&provider, address.clone());

		event_loop.handle_event(found(id, &[provider], 1));

		let received = drain(&mut receiver);
		assert_eq!(received.len(), 1);
		assert_eq!(received[0].addresses, vec![address]);
	}

	#[tokio::test]
	async fn evicted_peer_is_removed_from_address_book() {
		let mut event_loop = event_loop();
		let (evicted, newcomer) = (PeerId::random(), PeerId::random());

		event_loop.handle_event(routing_updated(
			evicted,
			"/ip4/10.0.0.1/tcp/4001".parse().unwrap(),
			None,
		));
		assert!(event_loop.address_book.contains_key(&evicted));

		event_loop.handle_event(routing_updated(
			newcomer,
			"/ip4/10.0.0.2/tcp/4001".parse().unwrap(),
			Some(evicted),
		));
		assert!(!event_loop.address_book.contains_key(&evicted));
		assert!(event_loop.address_book.contains_key(&newcomer));
	}

	#[tokio::test]
	async fn closed_peer_outside_routing_table_is_forgotten() {
		let mut event_loop = event_loop();
		let (routed, transient) = (PeerId::random(), PeerId::random());
		let routed_address: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
		let transient_address: Multiaddr = "/ip4/10.0.0.2/tcp/4001".parse().unwrap();
		event_loop
			.swarm
			.behaviour_mut()
			.kademlia
			.add_address(&routed, routed_address.clone());

		for (peer_id, address) in [(routed, routed_address), (transient, transient_address)] {
			event_loop.handle_event(SwarmEvent::NewExternalAddrOfPeer {
				peer_id,
				address: address.clone(),
			});
			event_loop.handle_event(SwarmEvent::ConnectionClosed {
				peer_id,
				connection_id: ConnectionId::new_unchecked(1),
				endpoint: ConnectedPoint::Dialer {
					address,
					role_override: Endpoint::Dialer,
					port_use: PortUse::Reuse,
				},
				num_established: 0,
				cause: None,
			});
		}

		assert!(event_loop.address_book.contains_key(&routed));
		assert!(!event_loop.address_book.contains_key(&transient));
	}

	#[test_case("/ip4/127.0.0.1/tcp/4001" => true ; "IPv4 loopback")]
	#[test_case("/ip4/127.1.2.3/udp/53" => true ; "IPv4 loopback range")]
	#[test_case("/ip6/::1/tcp/4001" => true ; "IPv6 loopback")]
	#[test_case("/dns4/LocalHost/tcp/4001" => true ; "DNS localhost")]
	#[test_case("/ip4/0.0.0.0/tcp/4001" => false ; "Unspecified IPv4")]
	#[test_case("/ip4/192.168.1.1/tcp/4001" => false ; "Private IPv4")]
	#[test_case("/ip6/fe80::1/tcp/4001" => false ; "Link-local IPv6")]
	#[test_case("/dnsaddr/bootstrap.libp2p.io" => false ; "Public DNS")]
	fn localhost_detection(address: &str) -> bool {
		is_localhost(&address.parse().unwrap())
	}
}
