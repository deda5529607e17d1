use color_eyre::{eyre::WrapErr, Report, Result};
use configuration::{identify_config, kad_config, kad_store_config, LibP2PConfig};
use libp2p::{
	identify,
	identity::{self, Keypair},
	kad::{self, store::MemoryStore, QueryId},
	noise, ping,
	swarm::NetworkBehaviour,
	tcp, yamux, PeerId, Swarm, SwarmBuilder,
};
use multihash::{self, Hasher};
use std::collections::HashSet;
use tokio::sync::{
	mpsc::{self, UnboundedSender},
	oneshot,
};
use tracing::info;

mod client;
pub mod configuration;
mod event_loop;

use super::PeerInfo;
use crate::{
	shutdown::Controller,
	types::{PeerAddress, SecretKey},
};
pub use client::Client;
pub use event_loop::EventLoop;

/// Public IPFS bootstrap nodes, used when no bootstrap peers are configured.
pub const DEFAULT_BOOTSTRAP_PEERS: [&str; 5] = [
	"/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
	"/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
	"/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUTqLzfYeGz",
	"/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
	"/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

pub fn default_bootstrap_peers() -> Vec<PeerAddress> {
	DEFAULT_BOOTSTRAP_PEERS
		.iter()
		.filter_map(|address| address.parse().ok())
		.collect()
}

#[derive(Debug)]
pub enum QueryChannel {
	/// Streams providers of a key, each provider is sent at most once
	GetProviders {
		sender: UnboundedSender<PeerInfo>,
		seen: HashSet<PeerId>,
	},
}

type Command = Box<dyn FnOnce(&mut EventLoop) -> Result<(), Report> + Send>;

// Behaviour struct is used to derive delegated Libp2p behaviour implementation
#[derive(NetworkBehaviour)]
pub struct Behaviour {
	kademlia: kad::Behaviour<MemoryStore>,
	identify: identify::Behaviour,
	ping: ping::Behaviour,
}

pub fn init(
	cfg: LibP2PConfig,
	id_keys: Keypair,
	shutdown: Controller<String>,
) -> Result<(Client, EventLoop)> {
	// create sender channel for P2P event loop commands
	let (command_sender, command_receiver) = mpsc::unbounded_channel();
	let local_peer_id = id_keys.public().to_peer_id();
	let client = Client::new(command_sender, local_peer_id, cfg.dial_timeout);
	let swarm = build_swarm(&cfg, &id_keys).wrap_err("Unable to build swarm")?;
	let event_loop = EventLoop::new(swarm, command_receiver, shutdown);

	Ok((client, event_loop))
}

fn build_swarm(cfg: &LibP2PConfig, id_keys: &Keypair) -> Result<Swarm<Behaviour>> {
	let identify_cfg = identify_config(cfg, id_keys.public());
	let kad_cfg = kad_config(cfg)?;
	let store_cfg = kad_store_config(cfg);

	let mut swarm = SwarmBuilder::with_existing_identity(id_keys.clone())
		.with_tokio()
		.with_tcp(
			tcp::Config::default().nodelay(false),
			noise::Config::new,
			yamux::Config::default,
		)?
		.with_dns()?
		.with_behaviour(|key| {
			let peer_id = key.public().to_peer_id();
			Behaviour {
				kademlia: kad::Behaviour::with_config(
					peer_id,
					MemoryStore::with_config(peer_id, store_cfg),
					kad_cfg,
				),
				identify: identify::Behaviour::new(identify_cfg),
				ping: ping::Behaviour::new(ping::Config::new()),
			}
		})?
		.with_swarm_config(|c| c.with_idle_connection_timeout(cfg.connection_idle_timeout))
		.build();

	info!("Local peerID: {}", swarm.local_peer_id());

	// Static mode disables automatic mode changes based on confirmed external addresses
	swarm
		.behaviour_mut()
		.kademlia
		.set_mode(Some(cfg.kademlia.operation_mode.into()));

	Ok(swarm)
}

// Keypair function creates identity Keypair for a local node.
// From such generated keypair it derives multihash identifier of the local peer.
fn keypair(secret_key: &SecretKey) -> Result<identity::Keypair> {
	let keypair = match secret_key {
		// If seed is provided, generate secret key from seed
		SecretKey::Seed { seed } => {
			let seed_digest = multihash::Sha3_256::digest(seed.as_bytes());
			identity::Keypair::ed25519_from_bytes(seed_digest)
				.wrap_err("error generating secret key from seed")?
		},
		// Import secret key if provided
		SecretKey::Key { key } => {
			let mut decoded_key = [0u8; 32];
			hex::decode_to_slice(key.clone().into_bytes(), &mut decoded_key)
				.wrap_err("error decoding secret key from config")?;
			identity::Keypair::ed25519_from_bytes(decoded_key)
				.wrap_err("error importing secret key")?
		},
	};
	Ok(keypair)
}

/// Loads the configured keypair, or generates a fresh one for this run.
pub fn identity(cfg: &LibP2PConfig) -> Result<(identity::Keypair, PeerId)> {
	let keypair = match cfg.secret_key.as_ref() {
		Some(secret_key) => keypair(secret_key)?,
		None => identity::Keypair::generate_ed25519(),
	};
	let peer_id = PeerId::from(keypair.public());
	Ok((keypair, peer_id))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_bootstrap_peers_resolve() {
		let peers = default_bootstrap_peers();
		assert_eq!(peers.len(), DEFAULT_BOOTSTRAP_PEERS.len());
		assert!(peers.iter().all(|peer| peer.peer_info().is_ok()));
	}

	#[test]
	fn seed_identity_is_deterministic() {
		let cfg = LibP2PConfig {
			secret_key: Some(SecretKey::Seed {
				seed: "rendezvous".to_string(),
			}),
			..Default::default()
		};
		let (_, first) = identity(&cfg).unwrap();
		let (_, second) = identity(&cfg).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn invalid_hex_key_is_rejected() {
		let cfg = LibP2PConfig {
			secret_key: Some(SecretKey::Key {
				key: "not hex".to_string(),
			}),
			..Default::default()
		};
		assert!(identity(&cfg).is_err());
	}
}
