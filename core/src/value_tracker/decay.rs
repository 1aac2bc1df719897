use super::response_time::ResponseTimeStats;
use crate::types::duration_seconds_format;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponentially decaying accumulator of value samples and response times.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Basis {
	#[serde(with = "duration_seconds_format")]
	pub time_constant: Duration,
	pub weight: f64,
	pub value: f64,
	#[serde(default)]
	pub response_times: ResponseTimeStats,
}

impl Basis {
	pub fn new(time_constant: Duration) -> Self {
		Self {
			time_constant,
			weight: 0.0,
			value: 0.0,
			response_times: ResponseTimeStats::default(),
		}
	}

	/// Decays every accumulator by `exp(-elapsed / time_constant)`.
	pub fn age(&mut self, elapsed: Duration) {
		if elapsed.is_zero() || self.time_constant.is_zero() {
			return;
		}
		let factor = (-elapsed.as_secs_f64() / self.time_constant.as_secs_f64()).exp();
		self.weight *= factor;
		self.value *= factor;
		self.response_times.scale(factor);
	}

	pub fn add(&mut self, value: f64, response_time: Duration) {
		self.weight += 1.0;
		self.value += value;
		self.response_times.add(response_time, 1.0);
	}

	pub fn mean(&self) -> Option<f64> {
		(self.weight > 0.0).then(|| self.value / self.weight)
	}
}

/// Combines the bases, ordered fastest first, into one value estimate.
///
/// Starting from the neutral prior, every basis from the slowest to the fastest is
/// blended with the estimate of the slower ones, which acts as `fallback_weight`
/// pseudo-samples. A basis dominates once its weight is well above `fallback_weight`.
pub fn combine_bases(bases: &[Basis], prior: f64, fallback_weight: f64) -> f64 {
	bases.iter().rev().fold(prior, |estimate, basis| {
		let total = basis.weight + fallback_weight;
		if total <= 0.0 {
			return estimate;
		}
		(basis.value + fallback_weight * estimate) / total
	})
}
