use std::{
	future::Future,
	pin::Pin,
	task::{Context, Poll},
};

use super::DelayToken;

/// Wrapped future that holds back shutdown completion until it resolves or is dropped.
pub struct WithDelay<T: Clone, F: Future> {
	pub(super) delay_token: Option<DelayToken<T>>,
	pub(super) future: Pin<Box<F>>,
}

impl<T: Clone, F: Future> Future for WithDelay<T, F> {
	type Output = F::Output;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = self.get_mut();
		match this.future.as_mut().poll(cx) {
			Poll::Ready(output) => {
				// release the shutdown as soon as the work is done
				this.delay_token = None;
				Poll::Ready(output)
			},
			Poll::Pending => Poll::Pending,
		}
	}
}
