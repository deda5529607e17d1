use crate::types::{duration_seconds_format, KademliaMode, SecretKey};
use color_eyre::{eyre::WrapErr, Result};
use libp2p::{identify, kad, multiaddr::Protocol, Multiaddr, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, num::NonZeroUsize, time::Duration};

/// Identify configuration for libp2p identify protocol
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct IdentifyConfig {
	/// Protocol name/version to use for the identify protocol (default: "/ipfs/id/1.0.0")
	pub identify_protocol: String,
	/// Agent version advertised to other peers (default: "peer-rendezvous/<version>")
	pub agent_version: String,
	/// Cache size for peer addresses (default: 100)
	pub cache_size: Option<usize>,
	/// The delay between identification requests (default: 5 min)
	#[serde(with = "duration_seconds_format")]
	pub interval: Duration,
}

impl Default for IdentifyConfig {
	fn default() -> Self {
		Self {
			identify_protocol: "/ipfs/id/1.0.0".to_string(),
			agent_version: format!("peer-rendezvous/{}", env!("CARGO_PKG_VERSION")),
			cache_size: Some(100),
			interval: Duration::from_secs(5 * 60),
		}
	}
}

/// Kademlia configuration
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct KademliaConfig {
	/// Kademlia protocol name, peers must share it to route for each other (default: "/ipfs/kad/1.0.0")
	pub kad_protocol: String,
	/// Defines a period of time in which periodic bootstraps will be repeated in seconds. (default: 5 min)
	#[serde(with = "duration_seconds_format")]
	pub bootstrap_period: Duration,
	/// Time-to-live of provider records in seconds (default: 48h).
	#[serde(with = "duration_seconds_format")]
	pub provider_record_ttl: Duration,
	/// Interval in which provider records of the local node are republished in seconds (default: 12h).
	#[serde(with = "duration_seconds_format")]
	pub provider_publication_interval: Duration,
	/// The replication factor determines to how many closest peers a record is replicated. (default: 20).
	pub record_replication_factor: NonZeroUsize,
	/// Sets the timeout for a single Kademlia query. (default: 60s).
	#[serde(with = "duration_seconds_format")]
	pub query_timeout: Duration,
	/// Sets the allowed level of parallelism for iterative Kademlia queries. (default: 3).
	pub query_parallelism: NonZeroUsize,
	/// Require iterative queries to use disjoint paths for increased resiliency in the presence of potentially adversarial nodes. (default: false).
	pub disjoint_query_paths: bool,
	/// The maximum number of provider records for which the local node is the provider. (default: 1024).
	pub max_kad_provided_keys: usize,
	/// Sets Kademlia mode (server/client, default server)
	pub operation_mode: KademliaMode,
}

impl Default for KademliaConfig {
	fn default() -> Self {
		Self {
			kad_protocol: "/ipfs/kad/1.0.0".to_string(),
			bootstrap_period: Duration::from_secs(5 * 60),
			provider_record_ttl: Duration::from_secs(48 * 60 * 60),
			provider_publication_interval: Duration::from_secs(12 * 60 * 60),
			record_replication_factor: kad::K_VALUE,
			query_timeout: Duration::from_secs(60),
			query_parallelism: kad::ALPHA_VALUE,
			disjoint_query_paths: false,
			max_kad_provided_keys: 1024,
			operation_mode: KademliaMode::Server,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibP2PConfig {
	/// Secret key for libp2p keypair. Can be either set to `seed` or to `key`.
	/// If set to seed, keypair will be generated from that seed.
	/// If set to key, a valid ed25519 private key must be provided, else the node will fail
	/// If `secret_key` is not set, random keypair will be used.
	pub secret_key: Option<SecretKey>,
	/// P2P TCP listener port (default: 37000).
	pub port: u16,
	/// Kademlia configuration
	#[serde(flatten)]
	pub kademlia: KademliaConfig,
	/// Identify configuration
	#[serde(flatten)]
	pub identify: IdentifyConfig,
	/// Sets the amount of time to keep connections alive when they're idle. (default: 30s).
	#[serde(with = "duration_seconds_format")]
	pub connection_idle_timeout: Duration,
	/// Upper bound for a single dial attempt. (default: 15s).
	#[serde(with = "duration_seconds_format")]
	pub dial_timeout: Duration,
}

impl Default for LibP2PConfig {
	fn default() -> Self {
		Self {
			secret_key: None,
			port: 37000,
			kademlia: Default::default(),
			identify: Default::default(),
			connection_idle_timeout: Duration::from_secs(30),
			dial_timeout: Duration::from_secs(15),
		}
	}
}

impl LibP2PConfig {
	pub fn tcp_multiaddress(&self) -> Multiaddr {
		Multiaddr::empty()
			.with(Protocol::from(Ipv4Addr::UNSPECIFIED))
			.with(Protocol::Tcp(self.port))
	}
}

pub fn identify_config(
	cfg: &LibP2PConfig,
	public_key: libp2p::identity::PublicKey,
) -> identify::Config {
	let mut identify_cfg =
		identify::Config::new(cfg.identify.identify_protocol.clone(), public_key)
			.with_agent_version(cfg.identify.agent_version.clone())
			.with_interval(cfg.identify.interval);

	if let Some(cache_size) = cfg.identify.cache_size {
		identify_cfg = identify_cfg.with_cache_size(cache_size);
	}

	identify_cfg
}

pub fn kad_config(cfg: &LibP2PConfig) -> Result<kad::Config> {
	let protocol = StreamProtocol::try_from_owned(cfg.kademlia.kad_protocol.clone())
		.wrap_err("Invalid Kademlia protocol name")?;

	let mut kad_cfg = kad::Config::new(protocol);
	kad_cfg
		.set_provider_record_ttl(Some(cfg.kademlia.provider_record_ttl))
		.set_provider_publication_interval(Some(cfg.kademlia.provider_publication_interval))
		.set_replication_factor(cfg.kademlia.record_replication_factor)
		.set_query_timeout(cfg.kademlia.query_timeout)
		.set_parallelism(cfg.kademlia.query_parallelism)
		.disjoint_query_paths(cfg.kademlia.disjoint_query_paths)
		.set_periodic_bootstrap_interval(Some(cfg.kademlia.bootstrap_period));
	Ok(kad_cfg)
}

pub fn kad_store_config(cfg: &LibP2PConfig) -> kad::store::MemoryStoreConfig {
	kad::store::MemoryStoreConfig {
		// Needs to match the replication factor, per libp2p docs
		max_providers_per_key: usize::from(cfg.kademlia.record_replication_factor),
		max_provided_keys: cfg.kademlia.max_kad_provided_keys,
		..Default::default()
	}
}
