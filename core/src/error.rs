use libp2p::PeerId;
use std::fmt::Display;
use thiserror::Error;

/// Errors surfaced by the discovery core
#[derive(Debug, Error)]
pub enum DiscoveryError {
	/// Routing substrate failed to bootstrap, advertise or start a lookup
	#[error("Routing error: {0}")]
	Routing(String),

	/// Dialing a single peer failed
	#[error("Connection to {peer_id} failed: {reason}")]
	Connection { peer_id: PeerId, reason: String },

	/// Bootstrap address cannot be resolved to a peer identity
	#[error("Invalid peer address {address}: {reason}")]
	Parse { address: String, reason: String },

	#[error("Invalid configuration: {0}")]
	Config(String),

	#[error("Discovery session has already been started")]
	AlreadyStarted,
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;

impl DiscoveryError {
	pub fn routing(error: impl Display) -> Self {
		Self::Routing(format!("{error:#}"))
	}

	pub fn connection(peer_id: PeerId, error: impl Display) -> Self {
		Self::Connection {
			peer_id,
			reason: format!("{error:#}"),
		}
	}

	pub fn parse(address: impl Display, reason: impl Into<String>) -> Self {
		Self::Parse {
			address: address.to_string(),
			reason: reason.into(),
		}
	}

	pub fn config(msg: impl Into<String>) -> Self {
		Self::Config(msg.into())
	}
}
