//! Per server, per request type estimates of served value and response time.
//!
//! Every observation is added to a list of exponentially decaying bases with
//! different time constants. The fast bases follow recent behaviour, the slow
//! ones keep the long term record. [`decay::combine_bases`] turns them into a
//! single value-per-cost estimate, which is mapped into a bounded priority.
use crate::{
	config::ValueTrackerConfig,
	data::{Database, GlobalStatsKey, NodeStatsKey},
	distributor::Scorer,
	peers::{Peer, PeerSubscriber},
	shutdown::Controller,
	types::{NodeId, RequestCosts, RequestType},
};
use serde::{Deserialize, Serialize};
use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

pub mod decay;
pub mod response_time;

pub use decay::{combine_bases, Basis};

/// Neutral value-per-cost estimate of a server without observations.
const PRIOR_VALUE: f64 = 1.0;

/// Decayed statistics of a single request type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeStats {
	pub bases: Vec<Basis>,
	#[serde(skip, default = "Instant::now")]
	updated: Instant,
}

impl TypeStats {
	fn new(time_constants: &[Duration]) -> Self {
		Self {
			bases: time_constants.iter().copied().map(Basis::new).collect(),
			updated: Instant::now(),
		}
	}

	fn age_to(&mut self, now: Instant) {
		let elapsed = now.saturating_duration_since(self.updated);
		self.age(elapsed);
		self.updated = now;
	}

	fn age(&mut self, elapsed: Duration) {
		self.bases.iter_mut().for_each(|basis| basis.age(elapsed));
	}

	fn add(&mut self, now: Instant, value: f64, response_time: Duration) {
		self.age_to(now);
		self.bases
			.iter_mut()
			.for_each(|basis| basis.add(value, response_time));
	}

	/// Long term usage, the weight of the slowest basis.
	fn usage(&self) -> f64 {
		self.bases.last().map(|basis| basis.weight).unwrap_or(0.0)
	}

	fn matches(&self, time_constants: &[Duration]) -> bool {
		self.bases.len() == time_constants.len()
			&& self
				.bases
				.iter()
				.zip(time_constants)
				.all(|(basis, time_constant)| basis.time_constant == *time_constant)
	}
}

/// Statistics table, stored per server and once aggregated over all servers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatsTable {
	#[serde(default)]
	pub types: BTreeMap<RequestType, TypeStats>,
	/// Unix time in seconds of the last save, used to age the table on load.
	#[serde(default)]
	pub saved_at: u64,
}

pub type NodeStats = StatsTable;
pub type GlobalStats = StatsTable;

impl StatsTable {
	fn age_to(&mut self, now: Instant) {
		self.types.values_mut().for_each(|stats| stats.age_to(now));
	}

	fn entry(&mut self, request_type: RequestType, time_constants: &[Duration]) -> &mut TypeStats {
		self.types
			.entry(request_type)
			.or_insert_with(|| TypeStats::new(time_constants))
	}

	/// Prepares a loaded table for use, dropping entries with a different basis layout.
	fn restore(&mut self, time_constants: &[Duration], now: Instant) {
		let offline = Duration::from_secs(unix_now().saturating_sub(self.saved_at));
		self.types.retain(|_, stats| stats.matches(time_constants));
		for stats in self.types.values_mut() {
			stats.updated = now;
			stats.age(offline);
		}
	}

	fn snapshot(&mut self, now: Instant) -> StatsTable {
		self.age_to(now);
		self.saved_at = unix_now();
		self.clone()
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs())
		.unwrap_or_default()
}

struct NodeEntry {
	stats: NodeStats,
	costs: RequestCosts,
}

struct Inner {
	nodes: HashMap<NodeId, NodeEntry>,
	global: GlobalStats,
	/// Records loaded ahead of a registration.
	preloaded: HashMap<NodeId, NodeStats>,
}

/// Read only view of one server, see [`ValueTracker::stats`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeSummary {
	pub id: NodeId,
	/// Usage weighted priority, normalized into `[0, 1]`.
	pub node_value: f64,
	pub priorities: BTreeMap<RequestType, f64>,
	pub timeouts_ms: BTreeMap<RequestType, u64>,
}

pub struct ValueTracker<D: Database> {
	config: ValueTrackerConfig,
	db: D,
	inner: Mutex<Inner>,
}

impl<D: Database> ValueTracker<D> {
	/// Creates the tracker, restoring the global statistics from the database.
	pub fn new(config: ValueTrackerConfig, db: D) -> Self {
		let now = Instant::now();
		let global = match db.get(GlobalStatsKey) {
			Ok(Some(mut global)) => {
				StatsTable::restore(&mut global, &config.time_constants, now);
				global
			},
			Ok(None) => GlobalStats::default(),
			Err(error) => {
				warn!(%error, "Failed to load global value statistics, starting from neutral priors");
				GlobalStats::default()
			},
		};

		Self {
			config,
			db,
			inner: Mutex::new(Inner {
				nodes: HashMap::new(),
				global,
				preloaded: HashMap::new(),
			}),
		}
	}

	fn lock(&self) -> MutexGuard<'_, Inner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn load(&self, id: NodeId) -> NodeStats {
		match self.db.get(NodeStatsKey(id)) {
			Ok(Some(mut stats)) => {
				stats.restore(&self.config.time_constants, Instant::now());
				stats
			},
			Ok(None) => NodeStats::default(),
			Err(error) => {
				warn!(peer = %id.short(), %error, "Failed to load server value statistics, starting from neutral priors");
				NodeStats::default()
			},
		}
	}

	/// Loads the persisted record of a server about to register.
	///
	/// Registration runs under the peer set lock, a preloaded record keeps the
	/// database read out of it.
	pub fn preload(&self, id: NodeId) {
		let stats = self.load(id);
		self.lock().preloaded.insert(id, stats);
	}

	/// Drops a preloaded record whose registration did not happen.
	pub fn discard_preloaded(&self, id: &NodeId) {
		self.lock().preloaded.remove(id);
	}

	/// Creates the statistics slot of a connected server, loading its persisted record
	/// unless it was preloaded.
	pub fn register(&self, id: NodeId, costs: RequestCosts) {
		let preloaded = self.lock().preloaded.remove(&id);
		let stats = preloaded.unwrap_or_else(|| self.load(id));
		debug!(peer = %id.short(), types = stats.types.len(), "Value tracker registered server");
		self.lock().nodes.insert(id, NodeEntry { stats, costs });
	}

	/// Retires the statistics slot of a server, persisting it.
	pub fn unregister(&self, id: &NodeId) {
		let Some(mut entry) = self.lock().nodes.remove(id) else {
			return;
		};
		let stats = entry.stats.snapshot(Instant::now());
		if let Err(error) = self.db.put(NodeStatsKey(*id), stats) {
			warn!(peer = %id.short(), %error, "Failed to save server value statistics");
		}
	}

	/// Updates the cost table after a server re-announced its costs.
	pub fn set_costs(&self, id: &NodeId, costs: RequestCosts) {
		if let Some(entry) = self.lock().nodes.get_mut(id) {
			entry.costs = costs;
		}
	}

	/// Base cost the server declared for the request type.
	pub fn request_cost(&self, id: &NodeId, request_type: RequestType) -> Option<u64> {
		self.lock()
			.nodes
			.get(id)
			.map(|entry| entry.costs.base(request_type))
	}

	fn response_weight(&self, response_time: Duration) -> f64 {
		let soft = self.config.soft_response_time.as_secs_f64();
		let max = self.config.max_response_time.as_secs_f64();
		let response_time = response_time.as_secs_f64();
		if response_time <= soft {
			1.0
		} else if response_time >= max || max <= soft {
			0.0
		} else {
			(max - response_time) / (max - soft)
		}
	}

	/// Records one request outcome.
	///
	/// A missing reply is recorded as a zero value sample with the maximum response time.
	pub fn update_observation(
		&self,
		id: &NodeId,
		request_type: RequestType,
		sent_at: Instant,
		responded_at: Option<Instant>,
		served_value: f64,
	) {
		let now = Instant::now();
		let (value, response_time) = match responded_at {
			Some(responded_at) => {
				let response_time = responded_at.saturating_duration_since(sent_at);
				(served_value.max(0.0), response_time)
			},
			None => (0.0, self.config.max_response_time),
		};

		let time_constants = &self.config.time_constants;
		let mut inner = self.lock();
		let Some(entry) = inner.nodes.get_mut(id) else {
			trace!(peer = %id.short(), "Observation for unregistered server dropped");
			return;
		};
		let cost = entry.costs.base(request_type).max(1) as f64;
		let sample = value * self.response_weight(response_time) / cost;
		entry
			.stats
			.entry(request_type, time_constants)
			.add(now, sample, response_time);
		inner
			.global
			.entry(request_type, time_constants)
			.add(now, sample, response_time);

		trace!(
			peer = %id.short(),
			%request_type,
			sample,
			response_time_ms = response_time.as_millis() as u64,
			"Value observation recorded"
		);
	}

	fn value_to_priority(&self, value: f64) -> f64 {
		let (min, max) = (self.config.min_priority, self.config.max_priority);
		let value = value.max(0.0);
		min + (max - min) * value / (value + 1.0)
	}

	fn priority_of(&self, stats: Option<&mut TypeStats>, now: Instant) -> f64 {
		let value = match stats {
			Some(stats) => {
				stats.age_to(now);
				combine_bases(&stats.bases, PRIOR_VALUE, self.config.fallback_weight)
			},
			None => PRIOR_VALUE,
		};
		self.value_to_priority(value)
	}

	/// Priority of the server for the request type, strictly inside the configured bounds.
	pub fn priority(&self, id: &NodeId, request_type: RequestType) -> f64 {
		let now = Instant::now();
		let mut inner = self.lock();
		let stats = inner
			.nodes
			.get_mut(id)
			.and_then(|entry| entry.stats.types.get_mut(&request_type));
		self.priority_of(stats, now)
	}

	fn timeout_of(&self, stats: Option<&mut TypeStats>, now: Instant) -> Option<Duration> {
		let stats = stats?;
		stats.age_to(now);
		stats
			.bases
			.iter()
			.find(|basis| basis.weight >= self.config.timeout_min_weight)
			.and_then(|basis| {
				basis
					.response_times
					.percentile(self.config.timeout_percentile)
			})
	}

	/// High percentile of the observed response times, used as attempt timeout.
	///
	/// Falls back to the statistics of all servers, then to the configured default.
	pub fn expected_timeout(&self, id: &NodeId, request_type: RequestType) -> Duration {
		let now = Instant::now();
		let mut inner = self.lock();
		let Inner { nodes, global, .. } = &mut *inner;
		let peer_stats = nodes
			.get_mut(id)
			.and_then(|entry| entry.stats.types.get_mut(&request_type));
		let timeout = self
			.timeout_of(peer_stats, now)
			.or_else(|| self.timeout_of(global.types.get_mut(&request_type), now))
			.unwrap_or(self.config.default_timeout);
		timeout.clamp(self.config.min_timeout, self.config.max_timeout)
	}

	fn node_value_of(&self, inner: &mut Inner, id: &NodeId, now: Instant) -> f64 {
		let Inner { nodes, global, .. } = inner;
		let (min, max) = (self.config.min_priority, self.config.max_priority);
		let normalize = |priority: f64| (priority - min) / (max - min);

		let Some(entry) = nodes.get_mut(id) else {
			return normalize(self.value_to_priority(PRIOR_VALUE));
		};

		let mut weighted = 0.0;
		let mut total_usage = 0.0;
		for (request_type, global_stats) in global.types.iter_mut() {
			global_stats.age_to(now);
			let usage = global_stats.usage();
			if usage <= 0.0 {
				continue;
			}
			let priority = self.priority_of(entry.stats.types.get_mut(request_type), now);
			weighted += usage * normalize(priority);
			total_usage += usage;
		}

		if total_usage <= 0.0 {
			return normalize(self.value_to_priority(PRIOR_VALUE));
		}
		weighted / total_usage
	}

	/// Priority averaged over request types weighted by their global usage, in `[0, 1]`.
	pub fn node_value(&self, id: &NodeId) -> f64 {
		let now = Instant::now();
		let mut inner = self.lock();
		self.node_value_of(&mut inner, id, now)
	}

	/// Snapshot of the registered servers, ordered by id.
	pub fn stats(&self) -> Vec<NodeSummary> {
		let now = Instant::now();
		let mut inner = self.lock();
		let mut ids: Vec<_> = inner.nodes.keys().copied().collect();
		ids.sort();

		ids.into_iter()
			.map(|id| {
				let node_value = self.node_value_of(&mut inner, &id, now);
				let mut priorities = BTreeMap::new();
				let mut timeouts_ms = BTreeMap::new();
				if let Some(entry) = inner.nodes.get_mut(&id) {
					for (request_type, stats) in entry.stats.types.iter_mut() {
						priorities.insert(*request_type, self.priority_of(Some(stats), now));
						let timeout = self
							.timeout_of(Some(stats), now)
							.unwrap_or(self.config.default_timeout)
							.clamp(self.config.min_timeout, self.config.max_timeout);
						timeouts_ms.insert(*request_type, timeout.as_millis() as u64);
					}
				}
				NodeSummary {
					id,
					node_value,
					priorities,
					timeouts_ms,
				}
			})
			.collect()
	}

	/// Persists the statistics of every registered server and the global table.
	pub fn save(&self) {
		let now = Instant::now();
		let (nodes, global) = {
			let mut inner = self.lock();
			let nodes: Vec<_> = inner
				.nodes
				.iter_mut()
				.map(|(id, entry)| (*id, entry.stats.snapshot(now)))
				.collect();
			(nodes, inner.global.snapshot(now))
		};

		let count = nodes.len();
		for (id, stats) in nodes {
			if let Err(error) = self.db.put(NodeStatsKey(id), stats) {
				warn!(peer = %id.short(), %error, "Failed to save server value statistics");
			}
		}
		if let Err(error) = self.db.put(GlobalStatsKey, global) {
			warn!(%error, "Failed to save global value statistics");
		}
		debug!(servers = count, "Value statistics saved");
	}

	/// Periodically persists the statistics until shutdown.
	pub async fn run(self: Arc<Self>, shutdown: Controller<String>) {
		let _delay_token = shutdown.delay_token();
		let mut interval = time::interval_at(
			Instant::now() + self.config.save_interval,
			self.config.save_interval,
		);
		info!("Value tracker started");
		loop {
			tokio::select! {
				_ = interval.tick() => self.save(),
				_ = shutdown.triggered_shutdown() => break,
			}
		}
		self.save();
		info!("Value tracker stopped");
	}

	pub fn stop(&self) {
		self.save();
	}
}

impl<D: Database + Send + Sync> Scorer for ValueTracker<D> {
	fn priority(&self, peer: &NodeId, request_type: RequestType) -> f64 {
		ValueTracker::priority(self, peer, request_type)
	}

	fn expected_timeout(&self, peer: &NodeId, request_type: RequestType) -> Duration {
		ValueTracker::expected_timeout(self, peer, request_type)
	}

	fn observe(
		&self,
		peer: &NodeId,
		request_type: RequestType,
		sent_at: Instant,
		responded_at: Option<Instant>,
		served_value: f64,
	) {
		self.update_observation(peer, request_type, sent_at, responded_at, served_value)
	}
}

impl<D: Database + Send + Sync> PeerSubscriber for ValueTracker<D> {
	fn register_peer(&self, peer: &Arc<Peer>) {
		self.register(peer.id(), peer.costs());
	}

	fn unregister_peer(&self, peer: &Arc<Peer>) {
		self.unregister(&peer.id());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::{Database, MemoryDB},
		types::RequestCost,
	};

	fn node(byte: u8) -> NodeId {
		NodeId([byte; 32])
	}

	fn tracker() -> ValueTracker<MemoryDB> {
		ValueTracker::new(ValueTrackerConfig::default(), MemoryDB::default())
	}

	fn ok_reply(tracker: &ValueTracker<MemoryDB>, id: &NodeId, millis: u64, value: f64) {
		let sent_at = Instant::now();
		tracker.update_observation(
			id,
			RequestType::Receipts,
			sent_at,
			Some(sent_at + Duration::from_millis(millis)),
			value,
		);
	}

	#[tokio::test(start_paused = true)]
	async fn unobserved_priority_is_neutral() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());
		let priority = tracker.priority(&node(1), RequestType::Receipts);
		assert!(priority > 0.0 && priority < 100.0);
		assert_eq!(priority, 50.0);
		assert_eq!(tracker.node_value(&node(1)), 0.5);
	}

	#[tokio::test(start_paused = true)]
	async fn failures_decrease_priority_monotonically() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());

		let mut previous = tracker.priority(&node(1), RequestType::Receipts);
		for _ in 0..50 {
			tracker.update_observation(
				&node(1),
				RequestType::Receipts,
				Instant::now(),
				None,
				1.0,
			);
			let priority = tracker.priority(&node(1), RequestType::Receipts);
			assert!(priority < previous);
			assert!(priority > 0.0);
			previous = priority;
		}
		assert!(previous < 10.0);
	}

	#[tokio::test(start_paused = true)]
	async fn fast_valuable_replies_raise_priority() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());
		tracker.register(node(2), RequestCosts::default());

		for _ in 0..20 {
			ok_reply(&tracker, &node(1), 50, 4.0);
			// slower than the soft limit, so part of the value is lost
			ok_reply(&tracker, &node(2), 5_250, 4.0);
		}
		let fast = tracker.priority(&node(1), RequestType::Receipts);
		let slow = tracker.priority(&node(2), RequestType::Receipts);
		assert!(fast > 50.0);
		assert!(fast > slow);
		assert!(fast < 100.0);
	}

	#[tokio::test(start_paused = true)]
	async fn value_is_normalized_by_cost() {
		let tracker = tracker();
		let mut expensive = RequestCosts::default();
		expensive.0.insert(
			RequestType::Receipts,
			RequestCost {
				base: 8,
				per_item: 0,
			},
		);
		tracker.register(node(1), RequestCosts::default());
		tracker.register(node(2), expensive);
		assert_eq!(tracker.request_cost(&node(2), RequestType::Receipts), Some(8));
		assert_eq!(tracker.request_cost(&node(3), RequestType::Receipts), None);

		for _ in 0..20 {
			ok_reply(&tracker, &node(1), 50, 4.0);
			ok_reply(&tracker, &node(2), 50, 4.0);
		}
		assert!(
			tracker.priority(&node(1), RequestType::Receipts)
				> tracker.priority(&node(2), RequestType::Receipts)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn priority_recovers_toward_prior_over_time() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());
		for _ in 0..20 {
			tracker.update_observation(&node(1), RequestType::Code, Instant::now(), None, 1.0);
		}
		let bad = tracker.priority(&node(1), RequestType::Code);
		time::advance(Duration::from_secs(10 * 3600)).await;
		let later = tracker.priority(&node(1), RequestType::Code);
		assert!(later > bad);
		assert!(later < 50.0);
	}

	#[tokio::test(start_paused = true)]
	async fn expected_timeout_follows_response_times() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());
		tracker.register(node(2), RequestCosts::default());

		// nothing observed yet
		assert_eq!(
			tracker.expected_timeout(&node(1), RequestType::Receipts),
			Duration::from_secs(3)
		);

		for _ in 0..20 {
			ok_reply(&tracker, &node(1), 900, 1.0);
		}
		let timeout = tracker.expected_timeout(&node(1), RequestType::Receipts);
		assert!(timeout >= Duration::from_millis(900) && timeout < Duration::from_millis(1200));

		// no own history, the global statistics are used
		assert_eq!(
			tracker.expected_timeout(&node(2), RequestType::Receipts),
			timeout
		);

		for _ in 0..40 {
			tracker.update_observation(
				&node(1),
				RequestType::Receipts,
				Instant::now(),
				None,
				1.0,
			);
		}
		assert_eq!(
			tracker.expected_timeout(&node(1), RequestType::Receipts),
			Duration::from_secs(10)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn statistics_survive_reconnect() {
		let db = MemoryDB::default();
		let tracker = ValueTracker::new(ValueTrackerConfig::default(), db.clone());
		tracker.register(node(1), RequestCosts::default());
		for _ in 0..20 {
			tracker.update_observation(&node(1), RequestType::Code, Instant::now(), None, 1.0);
		}
		let before = tracker.priority(&node(1), RequestType::Code);
		tracker.unregister(&node(1));
		assert!(db.get(NodeStatsKey(node(1))).unwrap().is_some());

		// unknown servers get the neutral priority
		assert_eq!(tracker.priority(&node(1), RequestType::Code), 50.0);

		tracker.register(node(1), RequestCosts::default());
		let after = tracker.priority(&node(1), RequestType::Code);
		assert!((after - before).abs() < 0.01);
	}

	#[tokio::test(start_paused = true)]
	async fn preloaded_record_is_used_on_register() {
		let db = MemoryDB::default();
		let tracker = ValueTracker::new(ValueTrackerConfig::default(), db.clone());
		tracker.register(node(1), RequestCosts::default());
		for _ in 0..20 {
			tracker.update_observation(&node(1), RequestType::Code, Instant::now(), None, 1.0);
		}
		let before = tracker.priority(&node(1), RequestType::Code);
		tracker.unregister(&node(1));

		tracker.preload(node(1));
		// registration reads nothing from the database anymore
		db.put_raw(NodeStatsKey(node(1)), "\"garbage\"");
		tracker.register(node(1), RequestCosts::default());
		assert!((tracker.priority(&node(1), RequestType::Code) - before).abs() < 0.01);

		tracker.preload(node(2));
		tracker.discard_preloaded(&node(2));
		assert!(tracker.lock().preloaded.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn undecodable_record_starts_neutral() {
		let db = MemoryDB::default();
		db.put_raw(NodeStatsKey(node(1)), "\"garbage\"");
		let tracker = ValueTracker::new(ValueTrackerConfig::default(), db);
		tracker.register(node(1), RequestCosts::default());
		assert_eq!(tracker.priority(&node(1), RequestType::Code), 50.0);
	}

	#[tokio::test(start_paused = true)]
	async fn global_statistics_are_restored() {
		let db = MemoryDB::default();
		let tracker = ValueTracker::new(ValueTrackerConfig::default(), db.clone());
		tracker.register(node(1), RequestCosts::default());
		for _ in 0..10 {
			ok_reply(&tracker, &node(1), 900, 1.0);
		}
		tracker.stop();

		let restored = ValueTracker::new(ValueTrackerConfig::default(), db);
		restored.register(node(2), RequestCosts::default());
		let timeout = restored.expected_timeout(&node(2), RequestType::Receipts);
		assert!(timeout >= Duration::from_millis(900) && timeout < Duration::from_millis(1200));
	}

	#[tokio::test(start_paused = true)]
	async fn node_value_weights_by_usage() {
		let tracker = tracker();
		tracker.register(node(1), RequestCosts::default());
		tracker.register(node(2), RequestCosts::default());

		// node 1 is great at the common request type, bad at the rare one
		for _ in 0..30 {
			ok_reply(&tracker, &node(1), 50, 4.0);
			tracker.update_observation(&node(2), RequestType::Receipts, Instant::now(), None, 1.0);
		}
		tracker.update_observation(&node(1), RequestType::Code, Instant::now(), None, 1.0);

		assert!(tracker.node_value(&node(1)) > 0.5);
		assert!(tracker.node_value(&node(2)) < 0.5);

		let stats = tracker.stats();
		assert_eq!(stats.len(), 2);
		assert_eq!(stats[0].id, node(1));
		assert!(stats[0].priorities.contains_key(&RequestType::Code));
	}

	#[tokio::test(start_paused = true)]
	async fn run_saves_on_shutdown() {
		let db = MemoryDB::default();
		let tracker = Arc::new(ValueTracker::new(ValueTrackerConfig::default(), db.clone()));
		tracker.register(node(1), RequestCosts::default());

		let shutdown = Controller::new();
		let handle = tokio::spawn(tracker.clone().run(shutdown.clone()));
		tokio::task::yield_now().await;
		assert!(db.get(GlobalStatsKey).unwrap().is_none());

		shutdown.trigger_shutdown("stop".to_string()).unwrap();
		handle.await.unwrap();
		assert!(db.get(GlobalStatsKey).unwrap().is_some());
		assert!(db.get(NodeStatsKey(node(1))).unwrap().is_some());
	}
}
