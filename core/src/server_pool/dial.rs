use super::{NextDial, ServerPool};
use crate::{data::Database, types::NodeRecord};
use futures::Stream;
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};
use tokio::time::{self, Instant};

/// Longest time a consumer sleeps without being woken.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Pull based iterator of servers to dial.
///
/// Every returned candidate is marked as dialing until the dialer reports the
/// outcome through the peer set or [`ServerPool::dial_failed`].
pub struct DialCandidates<D: Database> {
	pool: Arc<ServerPool<D>>,
	closed: AtomicBool,
}

impl<D: Database> DialCandidates<D> {
	pub(super) fn new(pool: Arc<ServerPool<D>>) -> Self {
		Self {
			pool,
			closed: AtomicBool::new(false),
		}
	}

	/// Waits for the next dialable candidate.
	///
	/// Returns `None` once the iterator is closed or the pool stopped.
	pub async fn next(&self) -> Option<NodeRecord> {
		loop {
			let notified = self.pool.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if self.closed.load(Ordering::Acquire) {
				return None;
			}
			let wake_at = match self.pool.next_dial(Instant::now()) {
				NextDial::Ready(record) => return Some(record),
				NextDial::Stopped => return None,
				NextDial::Wait(wake_at) => wake_at.unwrap_or_else(|| Instant::now() + IDLE_WAIT),
			};

			tokio::select! {
				_ = notified => {},
				_ = time::sleep_until(wake_at) => {},
			}
		}
	}

	/// Ends this iterator, waking a suspended [`DialCandidates::next`].
	pub fn close(&self) {
		self.closed.store(true, Ordering::Release);
		self.pool.notify.notify_waiters();
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}
}

impl<D: Database + Send + Sync + 'static> DialCandidates<D> {
	pub fn into_stream(self) -> impl Stream<Item = NodeRecord> + Send + 'static {
		async_stream::stream! {
			while let Some(record) = self.next().await {
				yield record;
			}
		}
	}
}
