//! Graceful shutdown coordination for async tasks.
//!
//! A [`Controller`] is cloned into every task that must react to a shutdown. Triggering it
//! resolves all [`Signal`] futures and cancels futures wrapped with [`Controller::with_cancel`].
//! Completion is postponed while any [`DelayToken`] is alive.
use std::{
	fmt::{self, Debug, Display, Formatter},
	future::Future,
	mem,
	pin::Pin,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	task::{Context, Poll, Waker},
};

#[derive(Clone)]
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

fn lock<T>(inner: &Mutex<ControllerInner<T>>) -> MutexGuard<'_, ControllerInner<T>> {
	inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(ControllerInner::new())),
		}
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		lock(&self.inner).reason.is_some()
	}

	/// Returns [`None`] if the shutdown has not been triggered yet.
	pub fn shutdown_reason(&self) -> Option<T> {
		lock(&self.inner).reason.clone()
	}

	pub fn is_shutdown_completed(&self) -> bool {
		let inner = lock(&self.inner);
		inner.reason.is_some() && inner.delay_tokens == 0
	}

	/// Triggers the shutdown. Fails if it was already triggered, keeping the first reason.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		lock(&self.inner).shutdown(reason)
	}

	/// Resolves with the reason once shutdown is triggered and every [`DelayToken`] is dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Resolves with the reason as soon as shutdown is triggered.
	pub fn triggered_shutdown(&self) -> Signal<T> {
		Signal {
			inner: self.inner.clone(),
		}
	}

	/// Wraps a future so it is dropped when the shutdown is triggered.
	///
	/// Yields `Ok(value)` if the future completes first and `Err(reason)` otherwise.
	pub fn with_cancel<F: Future>(&self, future: F) -> impl Future<Output = Result<F::Output, T>> {
		let signal = self.triggered_shutdown();
		async move {
			tokio::select! {
				biased;
				reason = signal => Err(reason),
				value = future => Ok(value),
			}
		}
	}

	/// Produces a token that delays shutdown completion while it exists.
	pub fn delay_token(&self) -> Result<DelayToken<T>, ShutdownHasCompleted<T>> {
		let mut inner = lock(&self.inner);
		if inner.delay_tokens == 0 {
			if let Some(reason) = &inner.reason {
				return Err(ShutdownHasCompleted::new(reason.clone()));
			}
		}

		inner.delay_tokens += 1;
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}

	/// Triggers the shutdown with given reason on Ctrl-C or SIGTERM.
	pub async fn on_user_signal(&self, reason: T) {
		user_signal().await;
		let _ = self.trigger_shutdown(reason);
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

struct ControllerInner<T> {
	reason: Option<T>,
	/// Must reach 0 before shutdown can complete.
	delay_tokens: usize,
	on_shutdown_trigger: Vec<Waker>,
	on_shutdown_complete: Vec<Waker>,
}

impl<T: Clone> ControllerInner<T> {
	fn new() -> Self {
		Self {
			reason: None,
			delay_tokens: 0,
			on_shutdown_trigger: Vec::new(),
			on_shutdown_complete: Vec::new(),
		}
	}

	fn decrement_delay_tokens(&mut self) {
		self.delay_tokens = self.delay_tokens.saturating_sub(1);
		if self.delay_tokens == 0 {
			self.notify_shutdown_complete();
		}
	}

	fn notify_shutdown_complete(&mut self) {
		for waker in mem::take(&mut self.on_shutdown_complete) {
			waker.wake()
		}
	}

	fn shutdown(&mut self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		if let Some(original) = &self.reason {
			return Err(ShutdownHasStarted::new(original.clone(), reason));
		}

		self.reason = Some(reason);
		for waker in mem::take(&mut self.on_shutdown_trigger) {
			waker.wake()
		}
		if self.delay_tokens == 0 {
			self.notify_shutdown_complete()
		}
		Ok(())
	}
}

/// Future that completes when the associated [`Controller`] triggers a shutdown.
#[derive(Clone)]
pub struct Signal<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Signal<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}

		inner
			.on_shutdown_trigger
			.retain(|waker| !waker.will_wake(cx.waker()));
		inner.on_shutdown_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

pub struct Completed<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}

		inner
			.on_shutdown_complete
			.retain(|waker| !waker.will_wake(cx.waker()));
		inner.on_shutdown_complete.push(cx.waker().clone());
		Poll::Pending
	}
}

/// Shutdown cannot complete while this token, or any of its clones, exists.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		lock(&self.inner).delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		lock(&self.inner).decrement_delay_tokens();
	}
}

#[derive(Debug, Clone)]
pub struct ShutdownHasStarted<T> {
	/// Reason of the shutdown already in progress.
	pub reason: T,
	pub ignored: T,
}

impl<T> ShutdownHasStarted<T> {
	pub const fn new(reason: T, ignored: T) -> Self {
		Self { reason, ignored }
	}
}

impl<T: Debug> std::error::Error for ShutdownHasStarted<T> {}

impl<T> Display for ShutdownHasStarted<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "shutdown has already been triggered")
	}
}

#[derive(Debug)]
pub struct ShutdownHasCompleted<T> {
	pub reason: T,
}

impl<T> ShutdownHasCompleted<T> {
	pub const fn new(reason: T) -> Self {
		Self { reason }
	}
}

impl<T: Debug> std::error::Error for ShutdownHasCompleted<T> {}

impl<T> Display for ShutdownHasCompleted<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "shutdown has been completed, can not delay any further")
	}
}

/// Completes on Ctrl-C, or on SIGTERM on Unix systems.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let sig = async {
			let mut os_sig =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			os_sig.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = sig => {}
		}
	}

	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
