use crate::shutdown::Controller;
use color_eyre::Result;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{error, Instrument, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt::format, layer::SubscriberExt, EnvFilter, FmtSubscriber};

/// Spawns a task attached to the caller's span, so logs from the task keep the parent context.
pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

pub fn install_panic_hooks(shutdown: Controller<String>) -> Result<()> {
	// initialize color-eyre hooks
	let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
		.display_location_section(true)
		.display_env_section(true)
		.into_hooks();

	// install hook as global handler
	eyre_hook.install()?;

	std::panic::set_hook(Box::new(move |panic_info| {
		// trigger shutdown to stop other tasks if panic occurs
		let _ = shutdown.trigger_shutdown("Panic occurred, shutting down".to_string());

		let msg = format!("{}", panic_hook.panic_report(panic_info));
		error!("Error: {}", strip_ansi_escapes::strip_str(msg));

		#[cfg(debug_assertions)]
		{
			// better-panic stacktrace that is only enabled when debugging
			better_panic::Settings::auto()
				.most_recent_first(false)
				.lineno_suffix(true)
				.verbosity(better_panic::Verbosity::Medium)
				.create_panic_handler()(panic_info);
		}
	}));
	Ok(())
}

fn env_filter(log_level: Level) -> EnvFilter {
	EnvFilter::new(format!("peer_rendezvous={log_level},warn"))
}

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}
