//! Assignment of pending requests to server peers.
//!
//! A single scheduling loop owns the dispatch decisions. Every pass it expires
//! attempt timeouts and deadlines, then hands each waiting request to the best
//! eligible peer. At most one attempt per request is in flight and a peer that
//! was already tried for a request is never tried again for it.
use crate::{
	config::DistributorConfig,
	peers::{Peer, PeerSubscriber},
	shutdown::Controller,
	types::{ChainHead, NodeId, RequestId, RequestType},
	utils::spawn_in_span,
};
use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use mockall::automock;
use std::{
	cmp::Ordering,
	collections::{BTreeMap, BTreeSet},
	panic::{self, AssertUnwindSafe},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};
use thiserror::Error;
use tokio::{
	sync::{oneshot, Notify},
	time::{self, Instant},
};
use tracing::{debug, info, trace};

/// Terminal outcome of a request, the only failure a caller sees.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	#[error("No server returned a valid reply")]
	NoReply,
	#[error("Request attempts exhausted")]
	NoPeers,
	#[error("Request cancelled")]
	Cancelled,
	#[error("Request deadline exceeded")]
	DeadlineExceeded,
}

/// Failure of a single attempt, absorbed by rescheduling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttemptError {
	#[error("Attempt timed out")]
	Timeout,
	#[error("Invalid reply: {0}")]
	InvalidReply(String),
	#[error("Sending request failed: {0}")]
	SendFailed(String),
	#[error("Peer disconnected")]
	PeerDropped,
}

/// Peer that can serve distributed requests.
#[async_trait]
pub trait DistPeer: Send + Sync {
	fn id(&self) -> NodeId;
	fn request_cost(&self, request_type: RequestType, amount: u64) -> u64;
	/// Maximum number of concurrent requests.
	fn capacity(&self) -> usize;
	fn can_send(&self) -> bool;
	fn head(&self) -> ChainHead;
	async fn send(
		&self,
		request_id: RequestId,
		request_type: RequestType,
		payload: Vec<u8>,
	) -> Result<()>;
}

/// Source of peer priorities and timeouts, and sink of attempt outcomes.
#[automock]
pub trait Scorer: Send + Sync {
	fn priority(&self, peer: &NodeId, request_type: RequestType) -> f64;
	fn expected_timeout(&self, peer: &NodeId, request_type: RequestType) -> Duration;
	fn observe(
		&self,
		peer: &NodeId,
		request_type: RequestType,
		sent_at: Instant,
		responded_at: Option<Instant>,
		served_value: f64,
	);
}

/// Checks a reply payload, runs outside of the distributor lock.
pub type Validator = Arc<dyn Fn(&NodeId, &[u8]) -> Result<()> + Send + Sync>;
/// Additional peer eligibility check of a request.
pub type PeerFilter = Arc<dyn Fn(&dyn DistPeer) -> bool + Send + Sync>;

pub struct DistRequest {
	pub request_type: RequestType,
	pub amount: u64,
	pub payload: Vec<u8>,
	pub deadline: Instant,
	/// Value reported to the scorer on a valid reply.
	pub served_value: f64,
	pub filter: Option<PeerFilter>,
	pub validator: Validator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
	pub peer: NodeId,
	pub payload: Vec<u8>,
}

/// Handle of a distributed request.
pub struct DistHandle {
	pub id: RequestId,
	result: oneshot::Receiver<Result<Reply, Error>>,
}

impl DistHandle {
	/// Waits for the terminal outcome.
	pub async fn result(&mut self) -> Result<Reply, Error> {
		(&mut self.result).await.unwrap_or(Err(Error::Cancelled))
	}
}

struct Attempt {
	peer: NodeId,
	sent_at: Instant,
	timeout_at: Instant,
	validating: bool,
}

struct PendingRequest {
	request: DistRequest,
	attempts: usize,
	tried: BTreeSet<NodeId>,
	in_flight: Option<Attempt>,
	sender: oneshot::Sender<Result<Reply, Error>>,
}

impl PendingRequest {
	fn resolve(self, id: RequestId, result: Result<Reply, Error>) {
		match &result {
			Ok(reply) => {
				debug!(request_id = %id, peer = %reply.peer.short(), attempts = self.attempts, "Request served")
			},
			Err(error) => {
				debug!(request_id = %id, %error, attempts = self.attempts, "Request failed")
			},
		}
		// receiver may be gone when the caller stopped waiting
		let _ = self.sender.send(result);
	}
}

struct PeerSlot {
	peer: Arc<dyn DistPeer>,
	in_flight: usize,
}

#[derive(Default)]
struct State {
	next_id: u64,
	pending: BTreeMap<RequestId, PendingRequest>,
	peers: BTreeMap<NodeId, PeerSlot>,
	closed: bool,
}

impl State {
	fn release(&mut self, peer: &NodeId) {
		if let Some(slot) = self.peers.get_mut(peer) {
			slot.in_flight = slot.in_flight.saturating_sub(1);
		}
	}
}

struct Dispatch {
	id: RequestId,
	peer: Arc<dyn DistPeer>,
	request_type: RequestType,
	payload: Vec<u8>,
}

struct Shared {
	config: DistributorConfig,
	scorer: Arc<dyn Scorer>,
	state: Mutex<State>,
	notify: Notify,
}

#[derive(Clone)]
pub struct RequestDistributor {
	shared: Arc<Shared>,
}

impl RequestDistributor {
	pub fn new(config: DistributorConfig, scorer: Arc<dyn Scorer>) -> Self {
		Self {
			shared: Arc::new(Shared {
				config,
				scorer,
				state: Mutex::new(State {
					next_id: 1,
					..Default::default()
				}),
				notify: Notify::new(),
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.shared
			.state
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn wake(&self) {
		self.shared.notify.notify_one();
	}

	/// Queues a request, the handle resolves exactly once.
	pub fn distribute(&self, request: DistRequest) -> DistHandle {
		let (sender, result) = oneshot::channel();
		let mut state = self.lock();
		let id = RequestId(state.next_id);
		state.next_id += 1;

		if state.closed {
			let _ = sender.send(Err(Error::Cancelled));
			return DistHandle { id, result };
		}

		trace!(request_id = %id, request_type = %request.request_type, "Request queued");
		state.pending.insert(
			id,
			PendingRequest {
				request,
				attempts: 0,
				tried: BTreeSet::new(),
				in_flight: None,
				sender,
			},
		);
		drop(state);
		self.wake();
		DistHandle { id, result }
	}

	/// Cancels a pending request, a reply of its in-flight attempt is discarded.
	///
	/// Returns `false` if the request is unknown or already resolved.
	pub fn cancel(&self, id: RequestId) -> bool {
		let mut state = self.lock();
		let Some(pending) = state.pending.remove(&id) else {
			return false;
		};
		if let Some(attempt) = &pending.in_flight {
			state.release(&attempt.peer);
		}
		drop(state);
		pending.resolve(id, Err(Error::Cancelled));
		self.wake();
		true
	}

	pub fn register_peer(&self, peer: Arc<dyn DistPeer>) {
		let id = peer.id();
		self.lock()
			.peers
			.insert(id, PeerSlot { peer, in_flight: 0 });
		self.wake();
	}

	/// Removes a peer, failing its in-flight attempts right away.
	pub fn unregister_peer(&self, id: &NodeId) {
		let mut state = self.lock();
		if state.peers.remove(id).is_none() {
			return;
		}
		let mut dropped = 0;
		for (request_id, pending) in state.pending.iter_mut() {
			let assigned = pending
				.in_flight
				.as_ref()
				.is_some_and(|attempt| attempt.peer == *id && !attempt.validating);
			if assigned {
				pending.in_flight = None;
				dropped += 1;
				debug!(request_id = %request_id, peer = %id.short(), error = %AttemptError::PeerDropped, "Request attempt failed");
			}
		}
		drop(state);
		if dropped > 0 {
			self.wake();
		}
	}

	/// Signals that a peer changed its head or flow control state.
	pub fn peer_updated(&self) {
		self.wake();
	}

	/// Handles a reply of the wire layer.
	///
	/// Returns `true` if the reply was valid and resolved the request. A panicking
	/// validator counts as an invalid reply, a reply still under validation when
	/// the deadline passes is discarded.
	pub fn deliver(&self, peer: &NodeId, id: RequestId, payload: Vec<u8>) -> bool {
		let validator = {
			let mut state = self.lock();
			let Some(pending) = state.pending.get_mut(&id) else {
				trace!(request_id = %id, peer = %peer.short(), "Reply for unknown request discarded");
				return false;
			};
			match pending.in_flight.as_mut() {
				Some(attempt) if attempt.peer == *peer && !attempt.validating => {
					attempt.validating = true;
				},
				_ => {
					trace!(request_id = %id, peer = %peer.short(), "Unexpected reply discarded");
					return false;
				},
			}
			pending.request.validator.clone()
		};

		let validation = panic::catch_unwind(AssertUnwindSafe(|| validator(peer, &payload)))
			.unwrap_or_else(|_| Err(eyre!("Reply validation panicked")));
		let responded_at = Instant::now();

		let mut state = self.lock();
		let still_assigned = state.pending.get(&id).is_some_and(|pending| {
			pending
				.in_flight
				.as_ref()
				.is_some_and(|attempt| attempt.peer == *peer && attempt.validating)
		});
		if !still_assigned {
			trace!(request_id = %id, peer = %peer.short(), "Request resolved during validation, reply discarded");
			return false;
		}

		match validation {
			Ok(()) => {
				let Some(pending) = state.pending.remove(&id) else {
					return false;
				};
				state.release(peer);
				drop(state);
				if let Some(attempt) = &pending.in_flight {
					self.shared.scorer.observe(
						peer,
						pending.request.request_type,
						attempt.sent_at,
						Some(responded_at),
						pending.request.served_value,
					);
				}
				pending.resolve(
					id,
					Ok(Reply {
						peer: *peer,
						payload,
					}),
				);
				self.wake();
				true
			},
			Err(error) => {
				self.fail_attempt(
					&mut state,
					id,
					peer,
					AttemptError::InvalidReply(error.to_string()),
				);
				drop(state);
				self.wake();
				false
			},
		}
	}

	fn fail_attempt(&self, state: &mut State, id: RequestId, peer: &NodeId, error: AttemptError) {
		let Some(pending) = state.pending.get_mut(&id) else {
			return;
		};
		let Some(attempt) = pending.in_flight.take() else {
			return;
		};
		let request_type = pending.request.request_type;
		state.release(peer);
		self.shared
			.scorer
			.observe(peer, request_type, attempt.sent_at, None, 0.0);
		debug!(request_id = %id, peer = %peer.short(), %error, "Request attempt failed");
	}

	fn send_failed(&self, id: RequestId, peer: &NodeId, error: AttemptError) {
		let mut state = self.lock();
		let assigned = state.pending.get(&id).is_some_and(|pending| {
			pending
				.in_flight
				.as_ref()
				.is_some_and(|attempt| attempt.peer == *peer && !attempt.validating)
		});
		if assigned {
			self.fail_attempt(&mut state, id, peer, error);
			drop(state);
			self.wake();
		}
	}

	fn select_peer(
		&self,
		peers: &BTreeMap<NodeId, PeerSlot>,
		pending: &PendingRequest,
	) -> Option<Arc<dyn DistPeer>> {
		let request = &pending.request;
		peers
			.iter()
			.filter(|(id, slot)| {
				!pending.tried.contains(*id)
					&& slot.in_flight < slot.peer.capacity()
					&& slot.peer.can_send()
					&& request
						.filter
						.as_ref()
						.map_or(true, |filter| filter(slot.peer.as_ref()))
			})
			.map(|(id, slot)| {
				let priority = self.shared.scorer.priority(id, request.request_type);
				(priority, slot)
			})
			// highest priority, then fewest in-flight attempts, then lowest id
			.max_by(|(a_priority, a), (b_priority, b)| {
				a_priority
					.partial_cmp(b_priority)
					.unwrap_or(Ordering::Equal)
					.then_with(|| b.in_flight.cmp(&a.in_flight))
					.then_with(|| b.peer.id().cmp(&a.peer.id()))
			})
			.map(|(_, slot)| slot.peer.clone())
	}

	/// One scheduling pass, returns the new dispatches and the next timer to wake on.
	fn schedule(&self) -> (Vec<Dispatch>, Option<Instant>) {
		let now = Instant::now();
		let mut state = self.lock();
		let mut dispatches = vec![];
		let mut resolved = vec![];
		let mut next_wake: Option<Instant> = None;
		let mut wake_at = |instant: Instant| {
			next_wake = Some(next_wake.map_or(instant, |current| current.min(instant)));
		};

		let ids: Vec<_> = state.pending.keys().copied().collect();
		for id in ids {
			let Some(request) = state.pending.get(&id) else {
				continue;
			};

			if let Some(attempt) = &request.in_flight {
				if attempt.validating {
					// validation may outlive the attempt timeout, never the deadline
					let (peer, deadline) = (attempt.peer, request.request.deadline);
					if now < deadline {
						wake_at(deadline);
					} else {
						state.release(&peer);
						resolved.push((id, Error::DeadlineExceeded));
					}
					continue;
				}
				if now < attempt.timeout_at {
					wake_at(attempt.timeout_at);
					continue;
				}
				let peer = attempt.peer;
				self.fail_attempt(&mut state, id, &peer, AttemptError::Timeout);
			}

			let State { pending, peers, .. } = &mut *state;
			let Some(request) = pending.get_mut(&id) else {
				continue;
			};

			if now >= request.request.deadline {
				resolved.push((id, Error::DeadlineExceeded));
				continue;
			}
			if request.attempts >= self.shared.config.max_attempts {
				resolved.push((id, Error::NoPeers));
				continue;
			}

			let Some(peer) = self.select_peer(peers, request) else {
				let exhausted = request.attempts > 0
					&& peers.keys().all(|peer| request.tried.contains(peer));
				if exhausted {
					resolved.push((id, Error::NoReply));
				} else {
					trace!(request_id = %id, "No eligible peer, request waits");
					wake_at(request.request.deadline);
				}
				continue;
			};

			let peer_id = peer.id();
			let request_type = request.request.request_type;
			let timeout = self.shared.scorer.expected_timeout(&peer_id, request_type);
			let timeout_at = (now + timeout).min(request.request.deadline);
			request.attempts += 1;
			request.tried.insert(peer_id);
			request.in_flight = Some(Attempt {
				peer: peer_id,
				sent_at: now,
				timeout_at,
				validating: false,
			});
			if let Some(slot) = peers.get_mut(&peer_id) {
				slot.in_flight += 1;
			}
			wake_at(timeout_at);

			debug!(
				request_id = %id,
				peer = %peer_id.short(),
				%request_type,
				attempt = request.attempts,
				timeout_ms = timeout.as_millis() as u64,
				"Request dispatched"
			);
			dispatches.push(Dispatch {
				id,
				peer,
				request_type,
				payload: request.request.payload.clone(),
			});
		}

		let resolved: Vec<_> = resolved
			.into_iter()
			.filter_map(|(id, error)| state.pending.remove(&id).map(|pending| (id, pending, error)))
			.collect();
		drop(state);
		for (id, pending, error) in resolved {
			pending.resolve(id, Err(error));
		}
		(dispatches, next_wake)
	}

	fn dispatch(&self, dispatch: Dispatch) {
		let distributor = self.clone();
		spawn_in_span(async move {
			let Dispatch {
				id,
				peer,
				request_type,
				payload,
			} = dispatch;
			if let Err(error) = peer.send(id, request_type, payload).await {
				distributor.send_failed(id, &peer.id(), AttemptError::SendFailed(error.to_string()));
			}
		});
	}

	/// Resolves every pending request as cancelled and rejects new ones.
	pub fn close(&self) {
		let mut state = self.lock();
		if state.closed {
			return;
		}
		state.closed = true;
		let pending = std::mem::take(&mut state.pending);
		state.peers.values_mut().for_each(|slot| slot.in_flight = 0);
		drop(state);

		if !pending.is_empty() {
			info!(count = pending.len(), "Cancelling pending requests");
		}
		for (id, request) in pending {
			request.resolve(id, Err(Error::Cancelled));
		}
		self.wake();
	}

	pub fn is_closed(&self) -> bool {
		self.lock().closed
	}

	pub fn pending_len(&self) -> usize {
		self.lock().pending.len()
	}

	/// Number of attempts in flight on the peer.
	pub fn in_flight(&self, peer: &NodeId) -> usize {
		self.lock()
			.peers
			.get(peer)
			.map(|slot| slot.in_flight)
			.unwrap_or(0)
	}

	/// Scheduling loop, runs until closed or shutdown.
	pub async fn run(self, shutdown: Controller<String>) {
		let _delay_token = shutdown.delay_token();
		info!("Request distributor started");
		loop {
			let (dispatches, next_wake) = self.schedule();
			for dispatch in dispatches {
				self.dispatch(dispatch);
			}
			if self.is_closed() {
				break;
			}

			let sleep = time::sleep_until(next_wake.unwrap_or_else(|| Instant::now() + IDLE_WAKE));
			tokio::select! {
				_ = self.shared.notify.notified() => {},
				_ = sleep => {},
				_ = shutdown.triggered_shutdown() => {
					self.close();
					break;
				},
			}
		}
		info!("Request distributor stopped");
	}
}

/// Wake up interval of an idle scheduling loop.
const IDLE_WAKE: Duration = Duration::from_secs(60);

impl PeerSubscriber for RequestDistributor {
	fn register_peer(&self, peer: &Arc<Peer>) {
		RequestDistributor::register_peer(self, peer.clone());
	}

	fn unregister_peer(&self, peer: &Arc<Peer>) {
		RequestDistributor::unregister_peer(self, &peer.id());
	}
}
