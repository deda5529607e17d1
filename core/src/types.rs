//! Shared configuration types and serde helpers.
use clap::ValueEnum;
use color_eyre::{eyre::eyre, Report};
use libp2p::{kad::Mode as KadMode, multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::{
	fmt::{self, Display, Formatter},
	str::FromStr,
	time::Duration,
};

use crate::{error::DiscoveryError, network::PeerInfo};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, ValueEnum)]
#[serde(try_from = "String")]
pub enum KademliaMode {
	Client,
	Server,
}

impl From<KademliaMode> for KadMode {
	fn from(value: KademliaMode) -> Self {
		match value {
			KademliaMode::Client => KadMode::Client,
			KademliaMode::Server => KadMode::Server,
		}
	}
}

impl Display for KademliaMode {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			KademliaMode::Client => write!(f, "client"),
			KademliaMode::Server => write!(f, "server"),
		}
	}
}

impl TryFrom<String> for KademliaMode {
	type Error = Report;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		match value.to_lowercase().as_str() {
			"client" => Ok(KademliaMode::Client),
			"server" => Ok(KademliaMode::Server),
			_ => Err(eyre!(
				"Wrong Kademlia mode. Expecting 'client' or 'server'."
			)),
		}
	}
}

/// Address of a well-known peer.
///
/// Either a full multiaddress ending with `/p2p/<peer id>`, or a `(peer id, multiaddress)` tuple.
/// The compact form is only resolved to a peer identity when dialed, so a missing
/// peer id does not reject the whole configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(
	untagged,
	expecting = "Valid multiaddress/peer_id string or a tuple (peer_id, multiaddress) expected"
)]
pub enum PeerAddress {
	Compact(Multiaddr),
	PeerIdAndMultiaddr((PeerId, Multiaddr)),
}

impl PeerAddress {
	/// Splits the address into a dialable peer identity and its transport address.
	pub fn peer_info(&self) -> Result<PeerInfo, DiscoveryError> {
		match self {
			PeerAddress::PeerIdAndMultiaddr((peer_id, address)) => Ok(PeerInfo {
				peer_id: *peer_id,
				addresses: vec![address.clone()],
			}),
			PeerAddress::Compact(address) => {
				let mut transport = address.clone();
				let Some(Protocol::P2p(peer_id)) = transport.pop() else {
					return Err(DiscoveryError::parse(
						address,
						"missing trailing /p2p/<peer id> component",
					));
				};
				let addresses = if transport.is_empty() {
					vec![]
				} else {
					vec![transport]
				};
				Ok(PeerInfo { peer_id, addresses })
			},
		}
	}
}

impl FromStr for PeerAddress {
	type Err = DiscoveryError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		Multiaddr::from_str(value)
			.map(PeerAddress::Compact)
			.map_err(|error| DiscoveryError::parse(value, error.to_string()))
	}
}

impl Display for PeerAddress {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			PeerAddress::Compact(address) => write!(f, "{address}"),
			PeerAddress::PeerIdAndMultiaddr((peer_id, address)) => {
				write!(f, "{address}/p2p/{peer_id}")
			},
		}
	}
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum SecretKey {
	Seed { seed: String },
	Key { key: String },
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	const PEER: &str = "12D3KooWStAKPADXqJ7cngPYXd2mSANpdgh1xQ34aouufHA2xShz";

	#[test_case(&format!("/ip4/127.0.0.1/tcp/4001/p2p/{PEER}") => Some(1) ; "Address with transport")]
	#[test_case(&format!("/p2p/{PEER}") => Some(0) ; "Peer id only")]
	#[test_case("/ip4/127.0.0.1/tcp/4001" => None ; "Missing peer id")]
	fn compact_peer_address_resolution(address: &str) -> Option<usize> {
		let address: PeerAddress = address.parse().unwrap();
		address
			.peer_info()
			.ok()
			.map(|PeerInfo { peer_id, addresses }| {
				assert_eq!(peer_id.to_string(), PEER);
				addresses.len()
			})
	}

	#[test]
	fn peer_address_deserialize_both_forms() {
		let json = format!(
			r#"["/ip4/10.0.0.1/tcp/4001/p2p/{PEER}", ["{PEER}", "/ip4/10.0.0.2/tcp/4001"]]"#
		);
		let addresses: Vec<PeerAddress> = serde_json::from_str(&json).unwrap();
		assert!(matches!(addresses[0], PeerAddress::Compact(_)));
		assert!(matches!(addresses[1], PeerAddress::PeerIdAndMultiaddr(_)));

		let info = addresses[1].peer_info().unwrap();
		assert_eq!(info.peer_id.to_string(), PEER);
		assert_eq!(info.addresses[0].to_string(), "/ip4/10.0.0.2/tcp/4001");
	}

	#[test]
	fn invalid_multiaddress_does_not_parse() {
		let result = "not a multiaddress".parse::<PeerAddress>();
		assert!(matches!(result, Err(DiscoveryError::Parse { .. })));
	}

	#[test]
	fn kademlia_mode_from_string() {
		assert_eq!(
			KademliaMode::try_from("SERVER".to_string()).unwrap(),
			KademliaMode::Server
		);
		assert!(KademliaMode::try_from("relay".to_string()).is_err());
	}
}
