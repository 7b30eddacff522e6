use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use evrec_resilience::RetryPolicy;

use crate::error::EngineError;
use crate::service::ServiceConfig;
use crate::weights::ActionWeights;

#[derive(Parser, Debug)]
#[command(
	name = "evrec-engine",
	about = "Event-similarity aggregation and recommendation engine over JSON-RPC stdio"
)]
pub struct CliArgs {
	/// Weight of a VIEW action
	#[arg(long, default_value = "0.4", env = "EVREC_VIEW_WEIGHT")]
	pub view_weight: f64,

	/// Weight of a REGISTER action
	#[arg(long, default_value = "0.8", env = "EVREC_REGISTER_WEIGHT")]
	pub register_weight: f64,

	/// Weight of a LIKE action
	#[arg(long, default_value = "1.0", env = "EVREC_LIKE_WEIGHT")]
	pub like_weight: f64,

	/// Topic carrying user actions
	#[arg(long, default_value = "stats.user-actions.v1", env = "EVREC_ACTIONS_TOPIC")]
	pub actions_topic: String,

	/// Topic carrying event similarity updates
	#[arg(long, default_value = "stats.events-similarity.v1", env = "EVREC_SIMILARITY_TOPIC")]
	pub similarity_topic: String,

	/// Partitions per topic (one worker per partition and consumer group)
	#[arg(long, default_value = "4", env = "EVREC_PARTITIONS")]
	pub partitions: usize,

	/// Upper bound on a single poll, in milliseconds
	#[arg(long, default_value = "1000", env = "EVREC_POLL_INTERVAL_MS")]
	pub poll_interval_ms: u64,

	/// Maximum records returned by one poll
	#[arg(long, default_value = "500", env = "EVREC_MAX_POLL_RECORDS")]
	pub max_poll_records: usize,

	/// First retry delay after a failed batch, in milliseconds
	#[arg(long, default_value = "100", env = "EVREC_RETRY_BASE_DELAY_MS")]
	pub retry_base_delay_ms: u64,

	/// Cap on the retry delay, in milliseconds
	#[arg(long, default_value = "5000", env = "EVREC_RETRY_MAX_DELAY_MS")]
	pub retry_max_delay_ms: u64,

	/// How long shutdown waits for in-flight records, in milliseconds
	#[arg(long, default_value = "30000", env = "EVREC_DRAIN_TIMEOUT_MS")]
	pub drain_timeout_ms: u64,

	/// Directory for persisted state. Omit to keep state in memory only.
	#[arg(long, env = "EVREC_STORAGE_PATH")]
	pub storage_path: Option<PathBuf>,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, default_value = "info", env = "EVREC_LOG_LEVEL")]
	pub log_level: String,
}

impl CliArgs {
	/// Build and validate the service configuration.
	pub fn into_service_config(self) -> Result<ServiceConfig, EngineError> {
		if self.retry_base_delay_ms == 0 || self.retry_max_delay_ms < self.retry_base_delay_ms {
			return Err(EngineError::Config(format!(
				"retry delays must satisfy 0 < base ({}) <= max ({})",
				self.retry_base_delay_ms, self.retry_max_delay_ms
			)));
		}

		let config = ServiceConfig {
			weights: ActionWeights::new(self.view_weight, self.register_weight, self.like_weight)?,
			actions_topic: self.actions_topic,
			similarity_topic: self.similarity_topic,
			partitions: self.partitions,
			poll_interval: Duration::from_millis(self.poll_interval_ms),
			max_poll_records: self.max_poll_records,
			retry: RetryPolicy::new(
				Duration::from_millis(self.retry_base_delay_ms),
				Duration::from_millis(self.retry_max_delay_ms),
			)
			.with_max_attempts(None),
			drain_timeout: Duration::from_millis(self.drain_timeout_ms),
			storage_path: self.storage_path,
		};
		config.validate()?;
		Ok(config)
	}
}
