use clap::{command, Parser};
use peer_rendezvous_core::types::{KademliaMode, PeerAddress};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// P2P TCP port
	#[arg(short, long)]
	pub port: Option<u16>,
	/// Seed string for libp2p keypair generation
	#[arg(long)]
	pub seed: Option<String>,
	/// ed25519 private key for libp2p keypair generation
	#[arg(long)]
	pub private_key: Option<String>,
	/// Shared base32 secret, enables rotating rendezvous keys
	#[arg(long)]
	pub otp_secret: Option<String>,
	/// Number of digits of the rotating rendezvous key
	#[arg(long)]
	pub otp_digits: Option<u32>,
	/// Rotation period of the rendezvous key in seconds
	#[arg(long)]
	pub otp_interval: Option<u64>,
	/// Static rendezvous key, used when no OTP secret is set
	#[arg(long)]
	pub rendezvous: Option<String>,
	/// Bootstrap peer multiaddress ending with /p2p/<peer id>, can be repeated
	#[arg(long = "bootstrap", value_name = "MULTIADDR")]
	pub bootstraps: Vec<PeerAddress>,
	/// Seconds between the end of a discovery cycle and the start of the next one
	#[arg(long)]
	pub refresh_interval: Option<u64>,
	/// Kademlia operation mode
	#[arg(long, value_enum)]
	pub kademlia_mode: Option<KademliaMode>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
}
