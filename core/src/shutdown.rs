use std::{
	fmt::Debug,
	future::Future,
	mem,
	sync::{Arc, Mutex, MutexGuard},
	task::Waker,
};

pub use self::{
	completed::Completed, signal::Signal, with_cancel::WithCancel, with_delay::WithDelay,
};

mod completed;
mod signal;
mod with_cancel;
mod with_delay;

#[derive(Clone)]
/// Shutdown controller shared by every long running part of the light client.
///
/// The retrieval core uses it for:
/// * Stopping the distributor, value tracker and server pool loops.
/// * Resolving every pending retrieval once the client stops.
/// * Waiting for the persistence flushes that run on the way out.
///
/// The Controller can be cloned and is thread-safe.
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Controller<T> {
	#[inline]
	/// Instantiate new shutdown controller.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(ControllerInner::new())),
		}
	}

	fn lock(&self) -> MutexGuard<'_, ControllerInner<T>> {
		// a poisoned controller still holds a consistent reason and token count
		self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Checks if the shutdown has been triggered.
	pub fn is_shutdown_triggered(&self) -> bool {
		self.lock().reason.is_some()
	}

	/// Gets the shutdown reason, for the triggered shutdown.
	///
	/// Returns [`None`] if the shutdown has not been triggered yet.
	pub fn shutdown_reason(&self) -> Option<T> {
		self.lock().reason.clone()
	}

	/// Triggers the shutdown to begin.
	///
	/// Every [`Signal`] and [`WithCancel`] future resolves, the shutdown completes
	/// once every [`DelayToken`] has been dropped.
	///
	/// If the shutdown has already been started, this function returns an error.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		self.lock().shutdown(reason)
	}

	/// Returns a future that resolves when the shutdown is fully completed.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Returns a future that completes when the shutdown is initiated.
	///
	/// If the shutdown signal is already triggered, the returned future immediately resolves.
	pub fn triggered_shutdown(&self) -> Signal<T> {
		Signal {
			inner: self.inner.clone(),
		}
	}

	/// Wraps a future to cancel it upon a triggered shutdown.
	///
	/// The returned future completes with `Err(reason)` if the shutdown is triggered before the wrapped future.
	/// If the wrapped future completes before a shutdown, it yields `Ok(value)`.
	pub fn with_cancel<F: Future>(&self, future: F) -> WithCancel<T, F> {
		self.triggered_shutdown().with_cancel(future)
	}

	/// Wraps a future to defer shutdown completion until the wrapped future completes or is dropped.
	///
	/// If the shutdown has already been finalized, an error will be returned.
	pub fn with_delay<F: Future>(
		&self,
		future: F,
	) -> Result<WithDelay<T, F>, ShutdownHasCompleted<T>> {
		Ok(self.delay_token()?.with_future(future))
	}

	/// Produces a token that delays the shutdown as long as it exists.
	///
	/// If the shutdown has already completed, this function returns an error.
	pub fn delay_token(&self) -> Result<DelayToken<T>, ShutdownHasCompleted<T>> {
		let mut inner = self.lock();
		if inner.delay_tokens == 0 {
			if let Some(reason) = &inner.reason {
				return Err(ShutdownHasCompleted::new(reason.clone()));
			}
		}

		inner.increment_delay_tokens();
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

pub struct ControllerInner<T> {
	/// The reason why shutdown is happening.
	reason: Option<T>,

	/// Count of all delay tokens in existence.
	///
	/// Must reach 0 before shutdown can complete.
	delay_tokens: usize,

	/// Tasks that need to be awaken when shutdown is triggered.
	on_shutdown_trigger: Vec<Waker>,

	/// Tasks that need to be awaken when the shutdown is complete.
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

	fn increment_delay_tokens(&mut self) {
		self.delay_tokens += 1;
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
		match &self.reason {
			Some(original) => Err(ShutdownHasStarted::new(original.clone(), reason)),
			None => {
				self.reason = Some(reason);
				for abort in mem::take(&mut self.on_shutdown_trigger) {
					abort.wake()
				}
				if self.delay_tokens == 0 {
					self.notify_shutdown_complete()
				}
				Ok(())
			},
		}
	}
}

/// The shutdown is delayed as long as this token exists.
///
/// * Important: For shutdown to complete, all clones must be dropped.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> DelayToken<T> {
	/// Defers shutdown completion until the wrapped future resolves or is dropped.
	///
	/// Consumes the token, so an unused token can not postpone the shutdown forever.
	pub fn with_future<F: Future>(self, future: F) -> WithDelay<T, F> {
		WithDelay {
			delay_token: Some(self),
			future: Box::pin(future),
		}
	}
}

impl<T: Clone> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		lock_inner(&self.inner).increment_delay_tokens();
		DelayToken {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		lock_inner(&self.inner).decrement_delay_tokens();
	}
}

pub(crate) fn lock_inner<T>(inner: &Mutex<ControllerInner<T>>) -> MutexGuard<'_, ControllerInner<T>> {
	inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Error returned when [`Controller`] instance tries to trigger the shutdown
/// multiple times on the same controller instance.
#[derive(Debug, Clone)]
pub struct ShutdownHasStarted<T> {
	/// The shutdown reason of the already started shutdown.
	pub reason: T,

	/// The provided reason that was ignored because the shutdown was already started.
	pub ignored: T,
}

impl<T> ShutdownHasStarted<T> {
	pub const fn new(reason: T, ignored_reason: T) -> Self {
		Self {
			reason,
			ignored: ignored_reason,
		}
	}
}

impl<T: Debug> std::error::Error for ShutdownHasStarted<T> {}

impl<T> std::fmt::Display for ShutdownHasStarted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "shutdown has already commenced")
	}
}

/// Error returned when trying to delay a shutdown that has already been completed.
#[derive(Debug)]
pub struct ShutdownHasCompleted<T> {
	/// The shutdown reason of the already completed shutdown.
	pub reason: T,
}

impl<T> ShutdownHasCompleted<T> {
	pub const fn new(reason: T) -> Self {
		Self { reason }
	}
}

impl<T: Debug> std::error::Error for ShutdownHasCompleted<T> {}

impl<T> std::fmt::Display for ShutdownHasCompleted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "shutdown has been completed, can not delay any further")
	}
}

#[cfg(test)]
mod tests {
	use std::{
		future::{self, Future},
		time::Duration,
	};
	use tokio::{
		runtime,
		time::{sleep, timeout},
	};

	use crate::shutdown::{Controller, ShutdownHasCompleted, ShutdownHasStarted};

	// custom runtime with a hard timeout, so a missed wake-up fails instead of hanging
	#[track_caller]
	fn test_runtime(test: impl Future<Output = ()>) {
		let runtime = runtime::Builder::new_multi_thread()
			.enable_all()
			.build()
			.unwrap();
		runtime.block_on(async move {
			let test_with_timeout = timeout(Duration::from_millis(100), test);
			assert!(test_with_timeout.await.is_ok());
		});
	}

	#[test]
	fn shutdown_trigger() {
		test_runtime(async {
			let controller = Controller::new();
			assert!(controller.trigger_shutdown(1).is_ok());
			assert_eq!(controller.triggered_shutdown().await, 1);
			assert_eq!(controller.completed_shutdown().await, 1);
		});
	}

	#[test]
	fn shutdown_trigger_from_other_task() {
		test_runtime(async {
			let controller = Controller::new();

			tokio::spawn({
				let controller = controller.clone();
				async move {
					sleep(Duration::from_millis(20)).await;
					assert!(controller.trigger_shutdown("client stopped").is_ok());
				}
			});

			assert_eq!(controller.triggered_shutdown().await, "client stopped");
			assert_eq!(controller.completed_shutdown().await, "client stopped");
		});
	}

	#[test]
	fn shutdown_only_once() {
		let controller = Controller::new();

		assert!(controller.trigger_shutdown("server pool stopped").is_ok());

		match controller.trigger_shutdown("distributor closed") {
			Err(ShutdownHasStarted { reason, ignored }) => {
				assert_eq!(reason, "server pool stopped");
				assert_eq!(ignored, "distributor closed");
			},
			Ok(_) => panic!("Expected ShutdownHasStarted error"),
		}
	}

	#[test]
	fn delay_token_postpones_completion() {
		// a pending persistence flush keeps the shutdown from completing
		test_runtime(async {
			let controller = Controller::new();
			let token = controller.delay_token().unwrap();

			assert!(controller.trigger_shutdown(1).is_ok());
			controller.triggered_shutdown().await;
			assert!(timeout(Duration::from_millis(5), controller.completed_shutdown())
				.await
				.is_err());

			tokio::spawn(token.with_future(async move {
				sleep(Duration::from_millis(10)).await;
			}));

			assert_eq!(controller.completed_shutdown().await, 1);
		});
	}

	#[test]
	fn creating_delay_token_after_shutdown() {
		let controller = Controller::new();
		assert!(controller.trigger_shutdown("stopped").is_ok());

		match controller.delay_token() {
			Err(ShutdownHasCompleted { reason }) => assert_eq!(reason, "stopped"),
			Ok(_) => panic!("Expected ShutdownHasCompleted error"),
		}

		match controller.with_delay(future::pending::<()>()) {
			Err(ShutdownHasCompleted { reason }) => assert_eq!(reason, "stopped"),
			Ok(_) => panic!("Expected ShutdownHasCompleted error"),
		}
	}

	#[test]
	fn future_with_cancel() {
		// a never-ending scheduling loop is cancelled on shutdown
		test_runtime(async {
			let controller = Controller::new();
			let task = tokio::spawn(controller.with_cancel(future::pending::<()>()));

			assert!(controller.trigger_shutdown("stop").is_ok());
			match task.await {
				Ok(Err(reason)) => assert_eq!(reason, "stop"),
				_ => panic!("Expected `Err(reason)` result"),
			}
		})
	}

	#[test]
	fn future_with_cancel_finishes_without_shutdown() {
		test_runtime(async {
			let controller = Controller::<()>::new();
			let task = tokio::spawn(controller.with_cancel(async {
				sleep(Duration::from_millis(10)).await;
				"reply"
			}));

			match task.await {
				Ok(Ok(value)) => assert_eq!(value, "reply"),
				_ => panic!("Expected Ok(Ok(value)) result"),
			}
		})
	}
}
