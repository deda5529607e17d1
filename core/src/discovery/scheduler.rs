use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info, warn};

use super::{
	announce::AnnounceCycle, bootstrap::BootstrapConnector, rendezvous::RendezvousGenerator,
};
use crate::{
	network::{Host, Routing},
	shutdown::Controller,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleState {
	Idle,
	Bootstrapping,
	/// Announcing under the previous rotating key, for peers that have not rotated yet
	ReannouncingPrevious,
	Rotating,
	Announcing,
	Waiting,
	Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerStatus {
	pub state: CycleState,
	/// Number of completed discovery cycles
	pub cycles: u64,
}

impl Default for SchedulerStatus {
	fn default() -> Self {
		Self {
			state: CycleState::Idle,
			cycles: 0,
		}
	}
}

/// Runs discovery cycles back to back, separated by a fresh refresh delay.
///
/// The delay starts when a cycle completes, so slow cycles never overlap or queue up.
pub struct RefreshScheduler<R, H> {
	bootstrap: BootstrapConnector<H>,
	announce: AnnounceCycle<R, H>,
	generator: Arc<RendezvousGenerator>,
	refresh_interval: Duration,
	status: Arc<watch::Sender<SchedulerStatus>>,
}

impl<R, H> RefreshScheduler<R, H>
where
	R: Routing + Send + Sync,
	H: Host + Send + Sync,
{
	pub fn new(
		bootstrap: BootstrapConnector<H>,
		announce: AnnounceCycle<R, H>,
		generator: Arc<RendezvousGenerator>,
		refresh_interval: Duration,
		status: Arc<watch::Sender<SchedulerStatus>>,
	) -> Self {
		Self {
			bootstrap,
			announce,
			generator,
			refresh_interval,
			status,
		}
	}

	fn set_state(&self, state: CycleState) {
		self.status.send_modify(|status| status.state = state);
	}

	/// Runs until shutdown is triggered, the first cycle starts immediately.
	pub async fn run(self, shutdown: Controller<String>) {
		info!(
			refresh_interval = ?self.refresh_interval,
			rotating = self.generator.is_rotating(),
			"Starting peer discovery"
		);
		// in-flight routing calls are dropped if shutdown is triggered mid-cycle
		if let Err(reason) = shutdown.with_cancel(self.run_cycles(&shutdown)).await {
			info!("Peer discovery cancelled: {reason}");
		}
		self.set_state(CycleState::Stopped);
		info!("Peer discovery stopped");
	}

	async fn run_cycles(&self, shutdown: &Controller<String>) {
		loop {
			self.run_cycle().await;

			self.set_state(CycleState::Waiting);
			tokio::select! {
				_ = shutdown.triggered_shutdown() => break,
				_ = sleep(self.refresh_interval) => {},
			}
		}
	}

	/// Connects bootstrap peers, then announces under the previous key (if any) and the current one.
	pub async fn run_cycle(&self) {
		let cycle = self.status.borrow().cycles + 1;
		debug!(cycle, "Discovery cycle started");

		self.set_state(CycleState::Bootstrapping);
		self.bootstrap.connect().await;

		if let Some(previous) = self.generator.previous() {
			self.set_state(CycleState::ReannouncingPrevious);
			self.announce_under(&previous).await;
		}

		self.set_state(CycleState::Rotating);
		let rendezvous = self.generator.current();

		self.set_state(CycleState::Announcing);
		self.announce_under(&rendezvous).await;

		self.status.send_modify(|status| status.cycles = cycle);
		debug!(cycle, "Discovery cycle completed");
	}

	async fn announce_under(&self, rendezvous: &str) {
		match self.announce.run_once(rendezvous).await {
			Ok(stats) => debug!(
				rendezvous,
				discovered = stats.discovered,
				connected = stats.connected,
				failed = stats.failed,
				"Announce completed"
			),
			Err(error) => {
				warn!(rendezvous, "Announce failed, retrying on next refresh: {error}")
			},
		}
	}
}
