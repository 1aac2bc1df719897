use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound of the first bucket.
const FIRST_BUCKET: Duration = Duration::from_millis(10);
/// Ratio of consecutive bucket bounds.
const BUCKET_GROWTH: f64 = 1.25;
/// With 40 buckets the last bound is about a minute.
pub const BUCKETS: usize = 40;

/// Weighted response time histogram with logarithmic buckets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeStats {
	buckets: Vec<f64>,
}

impl Default for ResponseTimeStats {
	fn default() -> Self {
		Self {
			buckets: vec![0.0; BUCKETS],
		}
	}
}

fn bucket_bound(index: usize) -> Duration {
	FIRST_BUCKET.mul_f64(BUCKET_GROWTH.powi(index as i32))
}

fn bucket_index(response_time: Duration) -> usize {
	if response_time <= FIRST_BUCKET {
		return 0;
	}
	let ratio = response_time.as_secs_f64() / FIRST_BUCKET.as_secs_f64();
	let index = (ratio.ln() / BUCKET_GROWTH.ln()).ceil() as usize;
	index.min(BUCKETS - 1)
}

impl ResponseTimeStats {
	pub fn add(&mut self, response_time: Duration, weight: f64) {
		self.normalize();
		self.buckets[bucket_index(response_time)] += weight;
	}

	pub fn scale(&mut self, factor: f64) {
		self.buckets.iter_mut().for_each(|bucket| *bucket *= factor);
	}

	pub fn total(&self) -> f64 {
		self.buckets.iter().sum()
	}

	/// Smallest bucket bound below which the given fraction of the weight lies.
	pub fn percentile(&self, fraction: f64) -> Option<Duration> {
		let total = self.total();
		if total <= 0.0 {
			return None;
		}
		let target = total * fraction.clamp(0.0, 1.0);
		let mut sum = 0.0;
		for (index, weight) in self.buckets.iter().enumerate() {
			sum += weight;
			if sum >= target && *weight > 0.0 {
				return Some(bucket_bound(index));
			}
		}
		self.buckets
			.iter()
			.rposition(|weight| *weight > 0.0)
			.map(bucket_bound)
	}

	// persisted histograms may come from a build with a different bucket count
	fn normalize(&mut self) {
		if self.buckets.len() != BUCKETS {
			self.buckets.resize(BUCKETS, 0.0);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(Duration::ZERO => 0 ; "zero")]
	#[test_case(Duration::from_millis(10) => 0 ; "first bound")]
	#[test_case(Duration::from_millis(11) => 1 ; "above first bound")]
	#[test_case(Duration::from_secs(3600) => BUCKETS - 1 ; "clamped")]
	fn index(response_time: Duration) -> usize {
		bucket_index(response_time)
	}

	#[test]
	fn sample_lies_below_its_bucket_bound() {
		for millis in [15, 120, 900, 4_000, 20_000] {
			let response_time = Duration::from_millis(millis);
			let index = bucket_index(response_time);
			assert!(response_time <= bucket_bound(index));
			assert!(response_time > bucket_bound(index - 1));
		}
	}

	#[test]
	fn high_percentile_ignores_fast_bulk() {
		let mut stats = ResponseTimeStats::default();
		assert_eq!(stats.percentile(0.95), None);

		stats.add(Duration::from_millis(100), 90.0);
		stats.add(Duration::from_secs(2), 10.0);
		let p50 = stats.percentile(0.5).unwrap();
		let p95 = stats.percentile(0.95).unwrap();
		assert!(p50 >= Duration::from_millis(100) && p50 < Duration::from_millis(200));
		assert!(p95 >= Duration::from_secs(2) && p95 < Duration::from_millis(2600));
	}

	#[test]
	fn scaling_keeps_percentiles() {
		let mut stats = ResponseTimeStats::default();
		stats.add(Duration::from_millis(300), 4.0);
		let before = stats.percentile(0.95);
		stats.scale(0.25);
		assert_eq!(stats.total(), 1.0);
		assert_eq!(stats.percentile(0.95), before);
	}
}
