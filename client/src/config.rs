use crate::cli::CliOpts;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use peer_rendezvous_core::{
	discovery::DiscoveryConfig,
	network::p2p::configuration::LibP2PConfig,
	types::{tracing_level_format, SecretKey},
};
use serde::{Deserialize, Serialize};
use std::{fs, time::Duration};
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	#[serde(flatten)]
	pub libp2p: LibP2PConfig,
	#[serde(flatten)]
	pub discovery: DiscoveryConfig,
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			libp2p: Default::default(),
			discovery: Default::default(),
			log_level: Level::INFO,
			log_format_json: false,
		}
	}
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {}", config_path))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(port) = opts.port {
		cfg.libp2p.port = port;
	}
	if let Some(mode) = opts.kademlia_mode {
		cfg.libp2p.kademlia.operation_mode = mode;
	}
	if let Some(secret_key) = &opts.private_key {
		cfg.libp2p.secret_key = Some(SecretKey::Key {
			key: secret_key.to_string(),
		});
	}
	if let Some(seed) = &opts.seed {
		cfg.libp2p.secret_key = Some(SecretKey::Seed {
			seed: seed.to_string(),
		})
	}

	if let Some(secret) = &opts.otp_secret {
		cfg.discovery.otp_secret = Some(secret.clone());
	}
	if let Some(digits) = opts.otp_digits {
		cfg.discovery.otp_digits = digits;
	}
	if let Some(interval) = opts.otp_interval {
		cfg.discovery.otp_interval = Duration::from_secs(interval);
	}
	if let Some(rendezvous) = &opts.rendezvous {
		cfg.discovery.rendezvous = rendezvous.clone();
	}
	if !opts.bootstraps.is_empty() {
		cfg.discovery.bootstraps = opts.bootstraps.clone();
	}
	if let Some(interval) = opts.refresh_interval {
		cfg.discovery.refresh_interval = Duration::from_secs(interval);
	}

	Ok(cfg)
}
