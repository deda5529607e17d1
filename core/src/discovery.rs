//! Rendezvous discovery session.
//!
//! A [`Session`] periodically connects the bootstrap peers, advertises the local node under the
//! shared rendezvous key, and dials the other peers advertising the same key.
use serde::{Deserialize, Serialize};
use std::{
	future::Future,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};
use tokio::{
	sync::{watch, OnceCell},
	task::JoinHandle,
};
use tracing::info;

use crate::{
	error::{DiscoveryError, Result},
	network::{Host, Routing},
	shutdown::Controller,
	types::{duration_seconds_format, PeerAddress},
	utils::spawn_in_span,
};

pub mod announce;
pub mod bootstrap;
#[cfg(test)]
mod fake;
pub mod rendezvous;
pub mod scheduler;

use announce::AnnounceCycle;
use bootstrap::BootstrapConnector;
use rendezvous::{RendezvousGenerator, RendezvousMode, Totp, DEFAULT_DIGITS};
use scheduler::{RefreshScheduler, SchedulerStatus};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
	/// Shared secret of the rotating rendezvous key. If not set, the static `rendezvous` is used.
	pub otp_secret: Option<String>,
	/// Number of digits of the rotating rendezvous key (default: 12).
	pub otp_digits: u32,
	/// Rotation period of the rendezvous key in seconds (default: 9000).
	#[serde(with = "duration_seconds_format")]
	pub otp_interval: Duration,
	/// Static rendezvous key (default: "peer-rendezvous").
	pub rendezvous: String,
	/// Well-known peers used to join the network. Substrate defaults are used if empty (default: empty).
	pub bootstraps: Vec<PeerAddress>,
	/// Delay between the end of a discovery cycle and the start of the next one in seconds (default: 120).
	#[serde(with = "duration_seconds_format")]
	pub refresh_interval: Duration,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			otp_secret: None,
			otp_digits: DEFAULT_DIGITS,
			otp_interval: Duration::from_secs(9000),
			rendezvous: "peer-rendezvous".to_string(),
			bootstraps: vec![],
			refresh_interval: Duration::from_secs(120),
		}
	}
}

impl DiscoveryConfig {
	pub fn rendezvous_mode(&self) -> Result<RendezvousMode> {
		match self.otp_secret.as_deref().filter(|secret| !secret.is_empty()) {
			Some(secret) => {
				Totp::new(secret, self.otp_digits, self.otp_interval).map(RendezvousMode::Rotating)
			},
			None if self.rendezvous.is_empty() => Err(DiscoveryError::config(
				"Either an OTP secret or a static rendezvous must be set",
			)),
			None => Ok(RendezvousMode::Static(self.rendezvous.clone())),
		}
	}
}

/// Discovery session, started once and stopped by its shutdown controller.
pub struct Session<R> {
	config: DiscoveryConfig,
	generator: Arc<RendezvousGenerator>,
	routing: OnceCell<Arc<R>>,
	started: AtomicBool,
	status: Arc<watch::Sender<SchedulerStatus>>,
}

impl<R> Session<R>
where
	R: Routing + Send + Sync + 'static,
{
	pub fn new(config: DiscoveryConfig) -> Result<Self> {
		if config.refresh_interval.is_zero() {
			return Err(DiscoveryError::config("Refresh interval must not be zero"));
		}
		let generator = RendezvousGenerator::new(config.rendezvous_mode()?);
		let (status, _) = watch::channel(SchedulerStatus::default());

		Ok(Self {
			config,
			generator: Arc::new(generator),
			routing: OnceCell::new(),
			started: AtomicBool::new(false),
			status: Arc::new(status),
		})
	}

	/// Current rendezvous key. A rotating key is remembered and re-announced on the next cycle.
	pub fn rendezvous(&self) -> String {
		self.generator.current()
	}

	pub fn is_rotating(&self) -> bool {
		self.generator.is_rotating()
	}

	pub fn status(&self) -> watch::Receiver<SchedulerStatus> {
		self.status.subscribe()
	}

	/// Returns the routing handle, creating it with `init` on first use.
	///
	/// Concurrent callers wait for the same initialization, `init` runs at most once successfully.
	pub async fn routing<F, Fut>(&self, init: F) -> Result<Arc<R>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<R>>,
	{
		self.routing
			.get_or_try_init(|| async move { init().await.map(Arc::new) })
			.await
			.cloned()
	}

	/// Creates the routing handle, bootstraps the routing table and spawns the discovery loop.
	///
	/// Fails if the session was already started, or if the routing handle cannot be created or bootstrapped.
	pub async fn start<H, F, Fut>(
		&self,
		host: Arc<H>,
		init: F,
		shutdown: Controller<String>,
	) -> Result<JoinHandle<()>>
	where
		H: Host + Send + Sync + 'static,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<R>>,
	{
		if self.started.swap(true, Ordering::SeqCst) {
			return Err(DiscoveryError::AlreadyStarted);
		}

		let scheduler = match self.scheduler(host, init).await {
			Ok(scheduler) => scheduler,
			Err(error) => {
				self.started.store(false, Ordering::SeqCst);
				return Err(error);
			},
		};
		Ok(spawn_in_span(scheduler.run(shutdown)))
	}

	async fn scheduler<H, F, Fut>(&self, host: Arc<H>, init: F) -> Result<RefreshScheduler<R, H>>
	where
		H: Host + Send + Sync,
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<R>>,
	{
		let routing = self.routing(init).await?;

		let bootstraps = if self.config.bootstraps.is_empty() {
			info!("No bootstrap peers configured, using defaults");
			routing.default_bootstrap_peers()
		} else {
			self.config.bootstraps.clone()
		};

		info!("Bootstrapping DHT");
		routing.bootstrap().await?;

		Ok(RefreshScheduler::new(
			BootstrapConnector::new(host.clone(), bootstraps),
			AnnounceCycle::new(routing, host),
			self.generator.clone(),
			self.config.refresh_interval,
			self.status.clone(),
		))
	}
}
