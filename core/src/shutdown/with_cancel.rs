use std::{
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};

use super::Signal;

/// Wrapped future which yields `Err(reason)` when the shutdown is triggered first.
pub struct WithCancel<T: Clone, F: Future> {
	pub(super) signal: Option<Signal<T>>,
	pub(super) future: Pin<Box<F>>,
}

impl<T: Clone, F: Future> Future for WithCancel<T, F> {
	type Output = Result<F::Output, T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		// every field is Unpin, the wrapped future is pinned on the heap
		let this = self.get_mut();

		if let Some(signal) = this.signal.as_mut() {
			if let Poll::Ready(reason) = Pin::new(signal).poll(cx) {
				this.signal = None;
				return Poll::Ready(Err(reason));
			}
		}

		this.future.as_mut().poll(cx).map(Ok)
	}
}
