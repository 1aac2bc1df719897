use crate::types::{
	duration_millis_format, duration_seconds_format, duration_vec_seconds_format,
	tracing_level_format, NodeRecord, RequestType,
};
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::Level;

/// Representation of the light client retrieval configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LightConfig {
	/// Log level. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// File system path where RocksDB stores the peer statistics, used only with the `rocksdb` feature (default: "light_path").
	pub db_path: String,
	pub value_tracker: ValueTrackerConfig,
	pub server_pool: ServerPoolConfig,
	pub distributor: DistributorConfig,
	pub retrieve: RetrieveConfig,
}

impl Default for LightConfig {
	fn default() -> Self {
		Self {
			log_level: Level::INFO,
			log_format_json: false,
			db_path: "light_path".to_string(),
			value_tracker: Default::default(),
			server_pool: Default::default(),
			distributor: Default::default(),
			retrieve: Default::default(),
		}
	}
}

impl LightConfig {
	/// Loads the configuration from the given TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		fs::metadata(path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		let config: LightConfig = confy::load_path(path)
			.wrap_err(format!("Failed to load configuration from {}", path.display()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		let vt = &self.value_tracker;
		if vt.time_constants.is_empty() {
			return Err(eyre!("At least one value tracker time constant is required"));
		}
		if vt.time_constants.iter().any(Duration::is_zero) {
			return Err(eyre!("Value tracker time constants must be positive"));
		}
		if vt.min_priority >= vt.max_priority {
			return Err(eyre!(
				"Minimum priority {} must be lower than maximum priority {}",
				vt.min_priority,
				vt.max_priority
			));
		}
		if !(0.0..=1.0).contains(&vt.timeout_percentile) {
			return Err(eyre!("Timeout percentile must be within [0, 1]"));
		}
		if vt.min_timeout > vt.max_timeout {
			return Err(eyre!("Minimum timeout is greater than maximum timeout"));
		}
		if self.distributor.max_attempts == 0 {
			return Err(eyre!("Maximum attempts must be greater than zero"));
		}
		if self.server_pool.max_consecutive_failures == 0 {
			return Err(eyre!("Maximum consecutive failures must be greater than zero"));
		}
		if self.server_pool.dial_timeout.is_zero() {
			return Err(eyre!("Dial timeout must be positive"));
		}
		Ok(())
	}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ValueTrackerConfig {
	/// Time constants of the decay bases, fastest first, in seconds (default: [3600, 360000, 3600000]).
	#[serde(with = "duration_vec_seconds_format")]
	pub time_constants: Vec<Duration>,
	/// Pseudo-weight of the fallback estimate blended into every basis (default: 8.0).
	pub fallback_weight: f64,
	/// Lowest priority a peer can get (default: 0.0).
	pub min_priority: f64,
	/// Highest priority a peer can get (default: 100.0).
	pub max_priority: f64,
	/// Replies faster than this keep their full value, in milliseconds (default: 500).
	#[serde(with = "duration_millis_format")]
	pub soft_response_time: Duration,
	/// Replies slower than this are worth nothing, failures are recorded with this latency, in milliseconds (default: 10000).
	#[serde(with = "duration_millis_format")]
	pub max_response_time: Duration,
	/// Percentile of the response time distribution used as request timeout (default: 0.95).
	pub timeout_percentile: f64,
	/// Basis weight needed before its response times are trusted for timeouts (default: 5.0).
	pub timeout_min_weight: f64,
	/// Timeout used before anything was observed, in milliseconds (default: 3000).
	#[serde(with = "duration_millis_format")]
	pub default_timeout: Duration,
	/// Lower timeout bound, in milliseconds (default: 250).
	#[serde(with = "duration_millis_format")]
	pub min_timeout: Duration,
	/// Upper timeout bound, in milliseconds (default: 10000).
	#[serde(with = "duration_millis_format")]
	pub max_timeout: Duration,
	/// Interval of persisting statistics, in seconds (default: 60).
	#[serde(with = "duration_seconds_format")]
	pub save_interval: Duration,
}

impl Default for ValueTrackerConfig {
	fn default() -> Self {
		const HOUR: u64 = 60 * 60;
		Self {
			time_constants: vec![
				Duration::from_secs(HOUR),
				Duration::from_secs(100 * HOUR),
				Duration::from_secs(1000 * HOUR),
			],
			fallback_weight: 8.0,
			min_priority: 0.0,
			max_priority: 100.0,
			soft_response_time: Duration::from_millis(500),
			max_response_time: Duration::from_secs(10),
			timeout_percentile: 0.95,
			timeout_min_weight: 5.0,
			default_timeout: Duration::from_secs(3),
			min_timeout: Duration::from_millis(250),
			max_timeout: Duration::from_secs(10),
			save_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerPoolConfig {
	/// Servers that are always dialed and never evicted (default: []).
	pub trusted_servers: Vec<NodeRecord>,
	/// Consecutive dial failures or early disconnects after which a candidate is evicted (default: 5).
	pub max_consecutive_failures: u32,
	/// Redial backoff after failures (default: base: 2, factor: 1000, max_delay: 600000).
	pub backoff: BackoffConfig,
	/// Score added on a successful connection (default: 0.1).
	pub success_boost: f64,
	/// Score multiplier on failure (default: 0.5).
	pub failure_penalty: f64,
	/// Connections shorter than this count as failures, in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub early_disconnect: Duration,
	/// Redial delay after a regular disconnect, in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub min_redial_wait: Duration,
	/// Candidates not seen for this long are pruned, in seconds (default: 86400).
	#[serde(with = "duration_seconds_format")]
	pub stale_after: Duration,
	/// Time an evicted candidate is kept from rediscovery, in seconds (default: 3600).
	#[serde(with = "duration_seconds_format")]
	pub eviction_ttl: Duration,
	/// Interval of re-scoring, pruning and persisting the candidates, in seconds (default: 60).
	#[serde(with = "duration_seconds_format")]
	pub refresh_interval: Duration,
	/// Delay before restarting an exhausted discovery source, in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub discovery_restart: Duration,
	/// Dials without a reported outcome after this long count as failed, in seconds (default: 30).
	#[serde(with = "duration_seconds_format")]
	pub dial_timeout: Duration,
}

impl Default for ServerPoolConfig {
	fn default() -> Self {
		Self {
			trusted_servers: vec![],
			max_consecutive_failures: 5,
			backoff: Default::default(),
			success_boost: 0.1,
			failure_penalty: 0.5,
			early_disconnect: Duration::from_secs(30),
			min_redial_wait: Duration::from_secs(30),
			stale_after: Duration::from_secs(24 * 60 * 60),
			eviction_ttl: Duration::from_secs(60 * 60),
			refresh_interval: Duration::from_secs(60),
			discovery_restart: Duration::from_secs(30),
			dial_timeout: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackoffConfig {
	pub base: u64,
	pub factor: u64,
	#[serde(with = "duration_millis_format")]
	pub max_delay: Duration,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base: 2,
			factor: 1000,
			max_delay: Duration::from_secs(600),
		}
	}
}

impl BackoffConfig {
	/// Redial delay after the given number of consecutive failures.
	pub fn delay(&self, failures: u32) -> Duration {
		let step = failures.saturating_sub(1) as usize;
		ExponentialBackoff::from_millis(self.base)
			.factor(self.factor)
			.max_delay(self.max_delay)
			.nth(step)
			.unwrap_or(self.max_delay)
	}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DistributorConfig {
	/// Attempts after which a request fails with no peers (default: 5).
	pub max_attempts: usize,
}

impl Default for DistributorConfig {
	fn default() -> Self {
		Self { max_attempts: 5 }
	}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetrieveConfig {
	/// Deadline of a retrieval without an explicit one, in milliseconds (default: 10000).
	#[serde(with = "duration_millis_format")]
	pub request_deadline: Duration,
	/// Value credited to a server for a valid reply, per request type. The value tracker divides it by the server's base cost (default: {}).
	pub reference_values: HashMap<RequestType, f64>,
	/// Value credited for request types missing from `reference_values` (default: 2.0).
	pub default_reference_value: f64,
}

impl Default for RetrieveConfig {
	fn default() -> Self {
		Self {
			request_deadline: Duration::from_secs(10),
			reference_values: HashMap::new(),
			default_reference_value: 2.0,
		}
	}
}

impl RetrieveConfig {
	pub fn reference_value(&self, request_type: RequestType) -> f64 {
		self.reference_values
			.get(&request_type)
			.copied()
			.unwrap_or(self.default_reference_value)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use test_case::test_case;

	#[test_case(1 => Duration::from_secs(2) ; "first failure")]
	#[test_case(2 => Duration::from_secs(4) ; "second failure")]
	#[test_case(4 => Duration::from_secs(16) ; "fourth failure")]
	#[test_case(20 => Duration::from_secs(600) ; "capped")]
	fn backoff_delay(failures: u32) -> Duration {
		BackoffConfig::default().delay(failures)
	}

	#[test]
	fn load_partial_config() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(
			file,
			r#"
log_level = "DEBUG"

[distributor]
max_attempts = 3

[value_tracker]
time_constants = [60, 600]
"#
		)
		.unwrap();

		let config = LightConfig::load(file.path()).unwrap();
		assert_eq!(config.log_level, Level::DEBUG);
		assert_eq!(config.distributor.max_attempts, 3);
		assert_eq!(
			config.value_tracker.time_constants,
			vec![Duration::from_secs(60), Duration::from_secs(600)]
		);
		assert_eq!(config.value_tracker.timeout_percentile, 0.95);
		assert_eq!(config.retrieve.reference_value(RequestType::Code), 2.0);
	}

	#[test]
	fn reference_value_override() {
		let config: RetrieveConfig =
			serde_json::from_str(r#"{"reference_values": {"receipts": 2.5}}"#).unwrap();
		assert_eq!(config.reference_value(RequestType::Receipts), 2.5);
		assert_eq!(config.reference_value(RequestType::BlockHeaders), 2.0);
		assert_eq!(config.request_deadline, Duration::from_secs(10));
	}

	#[test]
	fn missing_config_file() {
		assert!(LightConfig::load("/nonexistent/light.toml").is_err());
	}

	#[test]
	fn invalid_priorities_rejected() {
		let mut config = LightConfig::default();
		config.value_tracker.min_priority = 10.0;
		config.value_tracker.max_priority = 10.0;
		assert!(config.validate().is_err());
		assert!(LightConfig::default().validate().is_ok());
	}
}
