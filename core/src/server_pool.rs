//! Candidate servers and the decision whom to dial next.
//!
//! Candidates come from configured trusted servers, the persisted table and a
//! [`Discovery`] source. Connection outcomes feed a rolling score and an
//! exponential redial backoff; candidates failing too often are evicted.
//! Connected servers are periodically re-scored from the value tracker.
use crate::{
	config::ServerPoolConfig,
	data::{Database, ServerPoolKey},
	peers::{Peer, PeerSubscriber},
	shutdown::Controller,
	types::{NodeId, NodeRecord, RequestType},
	utils::spawn_in_span,
	value_tracker::ValueTracker,
};
use futures::{future, stream::BoxStream, StreamExt};
use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::Duration,
};
use tokio::{
	sync::Notify,
	time::{self, Instant},
};
use tracing::{debug, info, trace, warn};

pub mod candidate;
pub mod dial;
pub mod discovery;

pub use candidate::{Candidate, ConnectionState, FailureOutcome, StoredCandidate};
pub use dial::DialCandidates;
pub use discovery::{Discovery, StaticDiscovery};

enum NextDial {
	Ready(NodeRecord),
	/// Nothing dialable, the earliest redial time if any.
	Wait(Option<Instant>),
	Stopped,
}

#[derive(Default)]
struct Inner {
	candidates: BTreeMap<NodeId, Candidate>,
	/// Eviction time of recently evicted candidates.
	evicted: HashMap<NodeId, Instant>,
	started: bool,
	stopped: bool,
}

pub struct ServerPool<D: Database> {
	config: ServerPoolConfig,
	db: D,
	tracker: Arc<ValueTracker<D>>,
	discovery: Arc<dyn Discovery>,
	inner: Mutex<Inner>,
	notify: Notify,
	stop_signal: Controller<String>,
}

impl<D: Database> ServerPool<D> {
	/// Creates the pool from the persisted candidates and the trusted servers.
	pub fn new(
		config: ServerPoolConfig,
		db: D,
		tracker: Arc<ValueTracker<D>>,
		discovery: Arc<dyn Discovery>,
	) -> Self {
		let now = Instant::now();
		let mut candidates = BTreeMap::new();
		match db.get(ServerPoolKey) {
			Ok(Some(stored)) => {
				for candidate in stored {
					candidates.insert(candidate.id, candidate.into_candidate(now));
				}
				info!(count = candidates.len(), "Restored server candidates");
			},
			Ok(None) => {},
			Err(error) => warn!(%error, "Failed to load server candidates"),
		}
		for record in &config.trusted_servers {
			candidates.insert(record.id, Candidate::trusted(record.clone(), now));
		}

		Self {
			config,
			db,
			tracker,
			discovery,
			inner: Mutex::new(Inner {
				candidates,
				..Default::default()
			}),
			notify: Notify::new(),
			stop_signal: Controller::new(),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Restartable iterator of servers to dial.
	pub fn dial_candidates(self: &Arc<Self>) -> DialCandidates<D> {
		DialCandidates::new(self.clone())
	}

	fn next_dial(&self, now: Instant) -> NextDial {
		let mut inner = self.lock();
		if inner.stopped {
			return NextDial::Stopped;
		}

		let expired: Vec<_> = inner
			.candidates
			.values()
			.filter(|candidate| {
				candidate
					.dial_expires_at(&self.config)
					.is_some_and(|expires_at| expires_at <= now)
			})
			.map(Candidate::id)
			.collect();
		for id in expired {
			debug!(peer = %id.short(), "Dial outcome not reported in time, counting as failure");
			if let Some(candidate) = inner.candidates.get_mut(&id) {
				let outcome = candidate.failed(&self.config, now);
				self.apply(&mut inner, &id, outcome, now);
			}
		}

		let best = inner
			.candidates
			.values_mut()
			.filter(|candidate| candidate.is_dialable(now))
			.min_by(|a, b| a.dial_order(b));
		if let Some(candidate) = best {
			candidate.dialing(now);
			debug!(peer = %candidate.id().short(), address = %candidate.record.address, dials = candidate.dials, "Dialing server candidate");
			return NextDial::Ready(candidate.record.clone());
		}

		let wake_at = inner
			.candidates
			.values()
			.filter_map(|candidate| match candidate.state {
				ConnectionState::Idle => Some(candidate.redial_at),
				ConnectionState::Dialing { .. } => candidate.dial_expires_at(&self.config),
				ConnectionState::Connected { .. } => None,
			})
			.min();
		NextDial::Wait(wake_at)
	}

	fn evict(&self, inner: &mut Inner, id: &NodeId, now: Instant) {
		if let Some(candidate) = inner.candidates.remove(id) {
			info!(
				peer = %id.short(),
				failures = candidate.consecutive_failures,
				"Server candidate evicted"
			);
			inner.evicted.insert(*id, now);
		}
	}

	fn apply(&self, inner: &mut Inner, id: &NodeId, outcome: FailureOutcome, now: Instant) {
		match outcome {
			FailureOutcome::Backoff(delay) => {
				debug!(peer = %id.short(), delay_secs = delay.as_secs(), "Server candidate redial scheduled")
			},
			FailureOutcome::Evict => self.evict(inner, id, now),
		}
	}

	/// Reports a dial attempt that did not result in a connection.
	pub fn dial_failed(&self, id: &NodeId) {
		let now = Instant::now();
		let mut inner = self.lock();
		let Some(candidate) = inner.candidates.get_mut(id) else {
			return;
		};
		let outcome = candidate.failed(&self.config, now);
		self.apply(&mut inner, id, outcome, now);
		drop(inner);
		self.notify.notify_waiters();
	}

	/// Returns a handed out candidate that was never dialed or failed to register.
	pub fn dial_aborted(&self, id: &NodeId) {
		let mut inner = self.lock();
		let aborted = inner
			.candidates
			.get_mut(id)
			.is_some_and(Candidate::dial_aborted);
		drop(inner);
		if aborted {
			debug!(peer = %id.short(), "Server candidate dial aborted");
			self.notify.notify_waiters();
		}
	}

	/// Marks a server as connected, adding it if it wasn't a candidate.
	pub fn connected(&self, record: NodeRecord) {
		let now = Instant::now();
		let mut inner = self.lock();
		inner.evicted.remove(&record.id);
		if !inner.candidates.contains_key(&record.id) {
			let score = self.tracker.node_value(&record.id);
			inner
				.candidates
				.insert(record.id, Candidate::new(record.clone(), score, now));
		}
		if let Some(candidate) = inner.candidates.get_mut(&record.id) {
			candidate.connected(&self.config, now);
			debug!(peer = %record.id.short(), score = candidate.score, "Server candidate connected");
		}
	}

	/// Marks a server as disconnected, scheduling its redial.
	pub fn disconnected(&self, id: &NodeId) {
		let now = Instant::now();
		let mut inner = self.lock();
		let Some(candidate) = inner.candidates.get_mut(id) else {
			return;
		};
		let outcome = candidate.disconnected(&self.config, now);
		self.apply(&mut inner, id, outcome, now);
		drop(inner);
		self.notify.notify_waiters();
	}

	/// Adds a discovered server, unless it was evicted recently.
	pub fn add_discovered(&self, record: NodeRecord) {
		let now = Instant::now();
		let mut inner = self.lock();
		if inner.stopped {
			return;
		}
		if let Some(evicted_at) = inner.evicted.get(&record.id) {
			if now.saturating_duration_since(*evicted_at) < self.config.eviction_ttl {
				trace!(peer = %record.id.short(), "Ignoring recently evicted server");
				return;
			}
			inner.evicted.remove(&record.id);
		}

		if let Some(candidate) = inner.candidates.get_mut(&record.id) {
			candidate.last_seen = now;
			candidate.record.address = record.address;
			return;
		}

		let score = self.tracker.node_value(&record.id);
		debug!(peer = %record.id.short(), address = %record.address, score, "New server candidate");
		inner
			.candidates
			.insert(record.id, Candidate::new(record, score, now));
		drop(inner);
		self.notify.notify_waiters();
	}

	/// Re-scores connected servers, prunes stale candidates and persists the table.
	pub fn refresh(&self) {
		let now = Instant::now();
		let mut inner = self.lock();
		for candidate in inner.candidates.values_mut() {
			if let ConnectionState::Connected { .. } = candidate.state {
				candidate.score = self.tracker.node_value(&candidate.id());
				candidate.last_seen = now;
			}
		}

		let before = inner.candidates.len();
		inner
			.candidates
			.retain(|_, candidate| !candidate.is_stale(&self.config, now));
		let pruned = before - inner.candidates.len();

		let ttl = self.config.eviction_ttl;
		inner
			.evicted
			.retain(|_, evicted_at| now.saturating_duration_since(*evicted_at) < ttl);
		drop(inner);

		if pruned > 0 {
			debug!(pruned, "Pruned stale server candidates");
		}
		self.persist();
		self.notify.notify_waiters();
	}

	pub fn persist(&self) {
		let now = Instant::now();
		let stored: Vec<StoredCandidate> = self
			.lock()
			.candidates
			.values()
			.map(|candidate| candidate.to_stored(now))
			.collect();
		let count = stored.len();
		match self.db.put(ServerPoolKey, stored) {
			Ok(()) => trace!(count, "Server candidates saved"),
			Err(error) => warn!(%error, "Failed to save server candidates"),
		}
	}

	/// Expected timeout of a request to the server.
	pub fn timeout(&self, id: &NodeId, request_type: RequestType) -> Duration {
		self.tracker.expected_timeout(id, request_type)
	}

	pub fn candidate(&self, id: &NodeId) -> Option<Candidate> {
		self.lock().candidates.get(id).cloned()
	}

	pub fn candidates(&self) -> Vec<Candidate> {
		self.lock().candidates.values().cloned().collect()
	}

	pub fn is_evicted(&self, id: &NodeId) -> bool {
		self.lock().evicted.contains_key(id)
	}

	pub fn len(&self) -> usize {
		self.lock().candidates.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().candidates.is_empty()
	}

	pub fn is_stopped(&self) -> bool {
		self.lock().stopped
	}

	/// Stops discovery and wakes every waiting dial consumer, persisting the table.
	pub fn stop(&self) {
		{
			let mut inner = self.lock();
			if inner.stopped {
				return;
			}
			inner.stopped = true;
		}
		let _ = self
			.stop_signal
			.trigger_shutdown("Server pool stopped".to_string());
		self.persist();
		self.notify.notify_waiters();
		info!("Server pool stopped");
	}
}

async fn next_record(stream: Option<&mut BoxStream<'static, NodeRecord>>) -> Option<NodeRecord> {
	match stream {
		Some(stream) => stream.next().await,
		None => future::pending().await,
	}
}

impl<D: Database + Send + Sync + 'static> ServerPool<D> {
	/// Spawns the discovery and refresh loop.
	pub fn start(self: &Arc<Self>, shutdown: Controller<String>) {
		{
			let mut inner = self.lock();
			if inner.started || inner.stopped {
				return;
			}
			inner.started = true;
		}
		spawn_in_span(self.clone().run(shutdown));
	}

	async fn run(self: Arc<Self>, shutdown: Controller<String>) {
		let _delay_token = shutdown.delay_token();
		let mut refresh = time::interval_at(
			Instant::now() + self.config.refresh_interval,
			self.config.refresh_interval,
		);
		let mut discovered = Some(self.discovery.discover());
		let mut restart_at = Instant::now();
		info!("Server pool started");

		loop {
			tokio::select! {
				record = next_record(discovered.as_mut()), if discovered.is_some() => match record {
					Some(record) => self.add_discovered(record),
					None => {
						debug!("Discovery exhausted, restarting later");
						discovered = None;
						restart_at = Instant::now() + self.config.discovery_restart;
					},
				},
				_ = time::sleep_until(restart_at), if discovered.is_none() => {
					discovered = Some(self.discovery.discover());
				},
				_ = refresh.tick() => self.refresh(),
				_ = self.stop_signal.triggered_shutdown() => break,
				_ = shutdown.triggered_shutdown() => break,
			}
		}
		self.stop();
	}
}

impl<D: Database + Send + Sync> PeerSubscriber for ServerPool<D> {
	fn register_peer(&self, peer: &Arc<Peer>) {
		self.connected(NodeRecord::new(peer.id(), peer.address()));
	}

	fn unregister_peer(&self, peer: &Arc<Peer>) {
		self.disconnected(&peer.id());
	}
}
