use crate::{
	config::ServerPoolConfig,
	types::{NodeId, NodeRecord},
};
use serde::{Deserialize, Serialize};
use std::{
	cmp::Ordering,
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
	Idle,
	Dialing { since: Instant },
	Connected { since: Instant },
}

/// Result of reporting a failure on a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
	Backoff(Duration),
	Evict,
}

/// Server known to the pool, dialed or not.
#[derive(Clone, Debug)]
pub struct Candidate {
	pub record: NodeRecord,
	/// Rolling connection quality score in `[0, 1]`.
	pub score: f64,
	pub dials: u32,
	pub consecutive_failures: u32,
	/// Connected successfully at least once.
	pub known_good: bool,
	/// Configured server, never evicted nor pruned.
	pub trusted: bool,
	pub redial_at: Instant,
	pub last_seen: Instant,
	pub state: ConnectionState,
}

impl Candidate {
	pub fn new(record: NodeRecord, score: f64, now: Instant) -> Self {
		Self {
			record,
			score: score.clamp(0.0, 1.0),
			dials: 0,
			consecutive_failures: 0,
			known_good: false,
			trusted: false,
			redial_at: now,
			last_seen: now,
			state: ConnectionState::Idle,
		}
	}

	pub fn trusted(record: NodeRecord, now: Instant) -> Self {
		Self {
			known_good: true,
			trusted: true,
			..Self::new(record, 1.0, now)
		}
	}

	pub fn id(&self) -> NodeId {
		self.record.id
	}

	/// Trusted servers rank above every other candidate.
	pub fn dial_priority(&self) -> f64 {
		if self.trusted {
			1.0 + self.score
		} else {
			self.score
		}
	}

	pub fn is_dialable(&self, now: Instant) -> bool {
		self.state == ConnectionState::Idle && self.redial_at <= now
	}

	/// Dial order: priority descending, then fewer dials, then lower id.
	pub fn dial_order(&self, other: &Candidate) -> Ordering {
		other
			.dial_priority()
			.partial_cmp(&self.dial_priority())
			.unwrap_or(Ordering::Equal)
			.then_with(|| self.dials.cmp(&other.dials))
			.then_with(|| self.id().cmp(&other.id()))
	}

	pub fn dialing(&mut self, now: Instant) {
		self.state = ConnectionState::Dialing { since: now };
		self.dials += 1;
	}

	/// Time the dialer has to report the outcome of a handed out dial.
	pub fn dial_expires_at(&self, config: &ServerPoolConfig) -> Option<Instant> {
		match self.state {
			ConnectionState::Dialing { since } => Some(since + config.dial_timeout),
			_ => None,
		}
	}

	/// Returns a dial that never got to connect, without a penalty.
	pub fn dial_aborted(&mut self) -> bool {
		if !matches!(self.state, ConnectionState::Dialing { .. }) {
			return false;
		}
		self.state = ConnectionState::Idle;
		true
	}

	pub fn connected(&mut self, config: &ServerPoolConfig, now: Instant) {
		self.state = ConnectionState::Connected { since: now };
		self.consecutive_failures = 0;
		self.known_good = true;
		self.score = (self.score + config.success_boost).min(1.0);
		self.last_seen = now;
	}

	pub fn failed(&mut self, config: &ServerPoolConfig, now: Instant) -> FailureOutcome {
		self.state = ConnectionState::Idle;
		self.consecutive_failures += 1;
		self.score *= config.failure_penalty;
		if !self.trusted && self.consecutive_failures >= config.max_consecutive_failures {
			return FailureOutcome::Evict;
		}
		let delay = config.backoff.delay(self.consecutive_failures);
		self.redial_at = now + delay;
		FailureOutcome::Backoff(delay)
	}

	/// Handles the end of a connection, a short lived one counts as a failure.
	pub fn disconnected(&mut self, config: &ServerPoolConfig, now: Instant) -> FailureOutcome {
		let since = match self.state {
			ConnectionState::Connected { since } => since,
			_ => now,
		};
		self.last_seen = now;
		if now.saturating_duration_since(since) < config.early_disconnect {
			return self.failed(config, now);
		}
		self.state = ConnectionState::Idle;
		self.redial_at = now + config.min_redial_wait;
		FailureOutcome::Backoff(config.min_redial_wait)
	}

	pub fn is_stale(&self, config: &ServerPoolConfig, now: Instant) -> bool {
		!self.trusted
			&& !self.known_good
			&& self.state == ConnectionState::Idle
			&& now.saturating_duration_since(self.last_seen) > config.stale_after
	}

	pub fn to_stored(&self, now: Instant) -> StoredCandidate {
		let unseen = now.saturating_duration_since(self.last_seen).as_secs();
		StoredCandidate {
			id: self.id(),
			address: self.record.address.clone(),
			score: self.score,
			known_good: self.known_good,
			last_seen_secs: unix_now().saturating_sub(unseen),
		}
	}
}

/// Persisted form of a candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredCandidate {
	pub id: NodeId,
	pub address: String,
	#[serde(default)]
	pub score: f64,
	#[serde(default)]
	pub known_good: bool,
	/// Unix time in seconds the candidate was last seen.
	#[serde(default)]
	pub last_seen_secs: u64,
}

impl StoredCandidate {
	pub fn into_candidate(self, now: Instant) -> Candidate {
		let unseen = Duration::from_secs(unix_now().saturating_sub(self.last_seen_secs));
		let mut candidate = Candidate::new(NodeRecord::new(self.id, self.address), self.score, now);
		candidate.known_good = self.known_good;
		candidate.last_seen = now.checked_sub(unseen).unwrap_or(now);
		candidate
	}
}

fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_secs())
		.unwrap_or_default()
}
