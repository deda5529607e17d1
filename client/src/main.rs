//! Peer Rendezvous node: joins the DHT and keeps meeting peers that share the rendezvous key.

use crate::{cli::CliOpts, config::load_runtime_config};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use config::RuntimeConfig;
use peer_rendezvous_core::{
	discovery::Session,
	network::p2p,
	shutdown::Controller,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
};
use std::sync::Arc;
use tracing::{error, info, span, Level};

mod cli;
mod config;

async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	let version = clap::crate_version!();
	info!("Running Peer Rendezvous version: {version}.");
	info!("Using config: {cfg:?}");

	let (id_keys, peer_id) = p2p::identity(&cfg.libp2p)?;
	let (p2p_client, p2p_event_loop) = p2p::init(cfg.libp2p.clone(), id_keys, shutdown.clone())
		.wrap_err("Unable to initialize P2P network")?;

	spawn_in_span(p2p_event_loop.run());

	p2p_client
		.start_listening(vec![cfg.libp2p.tcp_multiaddress()])
		.await
		.wrap_err("Listening on TCP not to fail.")?;
	info!("TCP listener started on port {}.", cfg.libp2p.port);

	let session = Session::new(cfg.discovery.clone()).wrap_err("Invalid discovery configuration")?;
	info!(%peer_id, rotating = session.is_rotating(), "Starting discovery session");

	let host = Arc::new(p2p_client.clone());
	session
		.start(host, || async move { Ok(p2p_client) }, shutdown.clone())
		.await
		.wrap_err("Discovery session failed to start")?;

	Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	let span = span!(Level::INFO, "run", port = cfg.libp2p.port);
	// Do not enter span if logs format is not JSON
	let _enter = if cfg.log_format_json {
		Some(span.enter())
	} else {
		None
	};

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	let user_signal_shutdown = shutdown.clone();
	spawn_in_span(async move {
		user_signal_shutdown
			.on_user_signal("User signaled shutdown".to_string())
			.await
	});

	if let Err(error) = run(cfg, shutdown.clone()).await {
		error!("{error:#}");
		return Err(error.wrap_err("Starting Peer Rendezvous failed"));
	};

	let reason = shutdown.completed_shutdown().await;

	// we are not logging error here since expectation is
	// to log terminating condition before sending message to this channel
	Err(eyre!(reason).wrap_err("Running Peer Rendezvous encountered an error"))
}
