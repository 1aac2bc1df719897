use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::{lock_inner, ControllerInner, WithCancel};

/// Resolves with the shutdown reason as soon as the shutdown is triggered.
///
/// Delay tokens are not taken into account, see [`super::Completed`] for that.
pub struct Signal<T: Clone> {
	pub(super) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Signal<T> {
	/// Races the given future against this signal.
	pub fn with_cancel<F: Future>(self, future: F) -> WithCancel<T, F> {
		WithCancel {
			signal: Some(self),
			future: Box::pin(future),
		}
	}
}

impl<T: Clone> Future for Signal<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock_inner(&self.inner);
		if let Some(reason) = inner.reason.as_ref() {
			return Poll::Ready(reason.clone());
		}

		inner.on_shutdown_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}
