// ---------------------------------------------------------------------------
// RecommendationService: wires the pipeline and answers queries
// ---------------------------------------------------------------------------
//
//   collect() ──► actions topic ──┬─► [aggregator]  ──► similarity topic
//                                 │                          │
//                                 └─► [history]              ▼
//                                         │           [similarity-ingestor]
//                                         ▼                  │
//                              InteractionHistory     SimilarityStore
//                                         └──── queries ─────┘
//
// One worker per partition for each of the three consumer groups. Queries
// read whatever the ingestors have applied so far (eventually consistent).
// Locks are always taken history first, then store.
//
// Shutdown drains the actions topic, then the similarity topic, before the
// workers are stopped, so every acknowledged `collect` reaches the tables.
// ---------------------------------------------------------------------------

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use evrec_resilience::{retry, RetryPolicy};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregator::SimilarityAggregator;
use crate::codec::encode_interaction;
use crate::error::EngineError;
use crate::history::InteractionHistory;
use crate::ingestor::{InteractionIngestor, SimilarityIngestor};
use crate::persistence;
use crate::pipeline::{AggregationHandler, BatchHandler, ConsumerLoop, LoopConfig};
use crate::recommender::RecommendationEngine;
use crate::shared::{lock, read, write, SharedAggregator, SharedHistory, SharedStore};
use crate::similarity_store::{SimilarityStore, UpsertOutcome};
use crate::stream::{MemoryConsumer, MemoryLog, MemoryProducer, Producer};
use crate::types::{EventId, InteractionEvent, RecommendedEvent, UserId};
use crate::weights::ActionWeights;

pub const AGGREGATOR_GROUP: &str = "evrec-aggregator";
pub const HISTORY_GROUP: &str = "evrec-history";
pub const SIMILARITY_GROUP: &str = "evrec-analyzer";

/// Publish attempts per collected action before the caller sees an error.
const COLLECT_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceConfig {
	pub weights: ActionWeights,
	pub actions_topic: String,
	pub similarity_topic: String,
	pub partitions: usize,
	pub poll_interval: Duration,
	pub max_poll_records: usize,
	pub retry: RetryPolicy,
	/// How long shutdown waits for the consumer groups to catch up.
	pub drain_timeout: Duration,
	/// Directory for `index.gz`. `None` keeps everything in memory.
	pub storage_path: Option<PathBuf>,
}

impl Default for ServiceConfig {
	fn default() -> Self {
		Self {
			weights: ActionWeights::default(),
			actions_topic: "stats.user-actions.v1".to_string(),
			similarity_topic: "stats.events-similarity.v1".to_string(),
			partitions: 4,
			poll_interval: Duration::from_millis(1000),
			max_poll_records: 500,
			retry: RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(5000))
				.with_max_attempts(None),
			drain_timeout: Duration::from_secs(30),
			storage_path: None,
		}
	}
}

impl ServiceConfig {
	pub fn validate(&self) -> Result<(), EngineError> {
		self.weights.validate()?;
		if self.partitions == 0 {
			return Err(EngineError::Config("partitions must be at least 1".into()));
		}
		if self.poll_interval.is_zero() {
			return Err(EngineError::Config("poll interval must be positive".into()));
		}
		if self.max_poll_records == 0 {
			return Err(EngineError::Config("max poll records must be at least 1".into()));
		}
		if self.actions_topic.is_empty() || self.similarity_topic.is_empty() {
			return Err(EngineError::Config("topic names must not be empty".into()));
		}
		if self.actions_topic == self.similarity_topic {
			return Err(EngineError::Config(format!(
				"actions and similarity topics must differ (both '{}')",
				self.actions_topic
			)));
		}
		Ok(())
	}
}

/// Table sizes reported by `store/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
	pub similarities: usize,
	pub interactions: usize,
	pub users: usize,
	pub events: usize,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct RecommendationService {
	config: ServiceConfig,
	log: Arc<MemoryLog>,
	producer: MemoryProducer,
	aggregator: SharedAggregator,
	store: SharedStore,
	history: SharedHistory,
	shutdown: CancellationToken,
	workers: Vec<JoinHandle<()>>,
}

impl RecommendationService {
	/// Restore persisted state (if configured) and spawn all workers.
	/// Must be called from within a tokio runtime.
	pub async fn start(config: ServiceConfig) -> Result<Self, EngineError> {
		config.validate()?;

		let mut aggregator = SimilarityAggregator::new(config.weights);
		let mut store = SimilarityStore::new();
		let mut history = InteractionHistory::new();

		if let Some(dir) = &config.storage_path {
			let loaded = persistence::load_from_directory(dir)?;
			if loaded.skipped > 0 {
				tracing::warn!(skipped = loaded.skipped, "Skipped unreadable entries while loading");
			}
			tracing::info!(
				path = %dir.display(),
				similarities = loaded.similarities.len(),
				interactions = loaded.interactions.len(),
				"Restored persisted state"
			);
			for record in &loaded.similarities {
				store.upsert(record);
			}
			store.mark_clean();
			history = InteractionHistory::from_rows(loaded.interactions);
			if let Some(snapshot) = loaded.aggregator {
				aggregator.restore(snapshot);
			}
		}

		let log = MemoryLog::new(config.partitions);
		let mut service = Self {
			producer: log.producer(),
			log,
			aggregator: Arc::new(Mutex::new(aggregator)),
			store: Arc::new(RwLock::new(store)),
			history: Arc::new(RwLock::new(history)),
			shutdown: CancellationToken::new(),
			workers: Vec::new(),
			config,
		};
		service.spawn_workers()?;

		tracing::info!(
			partitions = service.config.partitions,
			actions_topic = %service.config.actions_topic,
			similarity_topic = %service.config.similarity_topic,
			"Recommendation service started"
		);
		Ok(service)
	}

	fn spawn_workers(&mut self) -> Result<(), EngineError> {
		let loop_config = LoopConfig {
			poll_timeout: self.config.poll_interval,
			retry: self.config.retry.clone(),
		};

		for partition in 0..self.config.partitions {
			let consumer = self.consumer(&self.config.actions_topic, AGGREGATOR_GROUP, partition)?;
			let handler = AggregationHandler::new(
				Arc::clone(&self.aggregator),
				self.producer.clone(),
				self.config.similarity_topic.clone(),
			);
			self.spawn(consumer, handler, &loop_config);

			let consumer = self.consumer(&self.config.actions_topic, HISTORY_GROUP, partition)?;
			let handler = InteractionIngestor::new(Arc::clone(&self.history), self.config.weights);
			self.spawn(consumer, handler, &loop_config);

			let consumer = self.consumer(&self.config.similarity_topic, SIMILARITY_GROUP, partition)?;
			let handler = SimilarityIngestor::new(Arc::clone(&self.store));
			self.spawn(consumer, handler, &loop_config);
		}
		Ok(())
	}

	fn consumer(&self, topic: &str, group: &str, partition: usize) -> Result<MemoryConsumer, EngineError> {
		Ok(self
			.log
			.consumer(topic, group, partition, self.config.max_poll_records)?)
	}

	fn spawn<H>(&mut self, consumer: MemoryConsumer, handler: H, config: &LoopConfig)
	where
		H: BatchHandler + 'static,
	{
		let worker = ConsumerLoop::new(consumer, handler, config.clone(), self.shutdown.child_token());
		self.workers.push(tokio::spawn(async move {
			if let Err(e) = worker.run().await {
				tracing::error!("Consumer worker failed: {}", e);
			}
		}));
	}

	// -- Ingress -------------------------------------------------------------

	/// Publish a user action to the actions topic, keyed by user. Transient
	/// publish failures are retried a few times.
	pub async fn collect(&self, event: InteractionEvent) -> Result<(), EngineError> {
		if self.shutdown.is_cancelled() {
			return Err(EngineError::ShutDown);
		}
		let payload = encode_interaction(&event);
		let policy = self
			.config
			.retry
			.clone()
			.with_max_attempts(Some(COLLECT_ATTEMPTS));
		retry(&policy, |_| {
			self.producer
				.send(&self.config.actions_topic, event.user_id, payload.clone())
		})
		.await?;
		tracing::debug!(
			user = event.user_id,
			event = event.event_id,
			kind = %event.kind,
			"Collected user action"
		);
		Ok(())
	}

	// -- Queries -------------------------------------------------------------

	pub fn recommend_for_user(&self, user: UserId, limit: usize) -> Vec<RecommendedEvent> {
		let history = read(&self.history);
		let store = read(&self.store);
		RecommendationEngine::new(&store, &history).recommend_for_user(user, limit)
	}

	pub fn similar_events(&self, event: EventId, user: UserId, limit: usize) -> Vec<RecommendedEvent> {
		let history = read(&self.history);
		let store = read(&self.store);
		RecommendationEngine::new(&store, &history).similar_events(event, user, limit)
	}

	pub fn interaction_scores(&self, event_ids: &[EventId]) -> Vec<RecommendedEvent> {
		let history = read(&self.history);
		let store = read(&self.store);
		RecommendationEngine::new(&store, &history).interaction_scores(event_ids)
	}

	pub fn stats(&self) -> ServiceStats {
		let history = read(&self.history);
		let store = read(&self.store);
		ServiceStats {
			similarities: store.len(),
			interactions: history.len(),
			users: history.user_count(),
			events: history.event_count(),
		}
	}

	fn action_groups(&self) -> [(&str, &str); 2] {
		[
			(self.config.actions_topic.as_str(), AGGREGATOR_GROUP),
			(self.config.actions_topic.as_str(), HISTORY_GROUP),
		]
	}

	fn similarity_groups(&self) -> [(&str, &str); 1] {
		[(self.config.similarity_topic.as_str(), SIMILARITY_GROUP)]
	}

	fn lag(&self, groups: &[(&str, &str)]) -> u64 {
		groups
			.iter()
			.map(|(topic, group)| self.log.lag(topic, group))
			.sum()
	}

	/// Records published but not yet committed by every consumer group.
	pub fn pending(&self) -> u64 {
		self.lag(&self.action_groups()) + self.lag(&self.similarity_groups())
	}

	/// Wait until every published record has been committed by all groups.
	/// Returns `false` if `timeout` elapses first.
	pub async fn settle(&self, timeout: Duration) -> bool {
		self.drain(tokio::time::Instant::now() + timeout).await
	}

	/// Actions first: the aggregator keeps publishing similarity records
	/// until it has caught up.
	async fn drain(&self, deadline: tokio::time::Instant) -> bool {
		self.wait_for_lag(&self.action_groups(), deadline).await
			&& self.wait_for_lag(&self.similarity_groups(), deadline).await
	}

	async fn wait_for_lag(&self, groups: &[(&str, &str)], deadline: tokio::time::Instant) -> bool {
		loop {
			if self.lag(groups) == 0 {
				return true;
			}
			if tokio::time::Instant::now() >= deadline {
				return false;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	// -- Persistence ---------------------------------------------------------

	/// Whether anything changed since the last load or save.
	pub fn is_dirty(&self) -> bool {
		let aggregator = lock(&self.aggregator).is_dirty();
		let history = read(&self.history).is_dirty();
		aggregator || history || read(&self.store).is_dirty()
	}

	/// Write the current tables to `storage_path`. Returns `false` when no
	/// storage path is configured.
	pub fn save(&self) -> Result<bool, EngineError> {
		let Some(dir) = &self.config.storage_path else {
			return Ok(false);
		};

		// Flags are cleared together with the capture so a change landing
		// during the write is not forgotten.
		let snapshot = {
			let mut aggregator = lock(&self.aggregator);
			aggregator.mark_clean();
			aggregator.snapshot()
		};
		let (rows, records) = {
			let mut history = write(&self.history);
			let mut store = write(&self.store);
			history.mark_clean();
			store.mark_clean();
			(history.rows(), store.records())
		};
		if let Err(e) = persistence::save_to_directory(dir, &records, &rows, Some(&snapshot)) {
			lock(&self.aggregator).mark_dirty();
			write(&self.history).mark_dirty();
			write(&self.store).mark_dirty();
			return Err(e.into());
		}

		tracing::info!(
			path = %dir.display(),
			similarities = records.len(),
			interactions = rows.len(),
			"Saved state"
		);
		Ok(true)
	}

	// -- Lifecycle -----------------------------------------------------------

	/// Drain in-flight records, stop all workers and save state if it
	/// changed. Taking `self` means no `collect` can race the drain.
	pub async fn shutdown(mut self) -> Result<(), EngineError> {
		tracing::info!(pending = self.pending(), "Shutting down recommendation service");
		let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
		if !self.drain(deadline).await {
			tracing::warn!(
				pending = self.pending(),
				timeout_ms = self.config.drain_timeout.as_millis() as u64,
				"Drain timed out, unconsumed records are dropped"
			);
		}

		self.shutdown.cancel();
		for worker in std::mem::take(&mut self.workers) {
			if let Err(e) = worker.await {
				tracing::error!("Consumer worker panicked: {}", e);
			}
		}

		let caught_up = self.reconcile_store();
		if caught_up > 0 {
			tracing::warn!(caught_up, "Applied similarity updates that had not reached the store");
		}

		if self.is_dirty() {
			self.save()?;
		} else {
			tracing::debug!("State unchanged, skipping save");
		}
		Ok(())
	}

	/// Bring the store level with the aggregator. Covers emissions that
	/// were computed but not ingested before the workers stopped. Returns
	/// the number of rows written.
	fn reconcile_store(&self) -> usize {
		let records = lock(&self.aggregator).emitted_records();
		let mut store = write(&self.store);
		let mut written = 0;
		for record in &records {
			if store.similarity(record.event_a, record.event_b) == Some(record.score) {
				continue;
			}
			if matches!(
				store.upsert(record),
				UpsertOutcome::Inserted | UpsertOutcome::Replaced
			) {
				written += 1;
			}
		}
		written
	}
}

impl Drop for RecommendationService {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

pub fn current_timestamp_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::ActionKind;

	fn fast_config() -> ServiceConfig {
		ServiceConfig {
			partitions: 2,
			poll_interval: Duration::from_millis(20),
			..ServiceConfig::default()
		}
	}

	fn action(user: UserId, event: EventId, kind: ActionKind, timestamp: u64) -> InteractionEvent {
		InteractionEvent {
			user_id: user,
			event_id: event,
			kind,
			timestamp,
		}
	}

	#[test]
	fn validate_rejects_bad_config() {
		assert!(ServiceConfig::default().validate().is_ok());

		let zero_partitions = ServiceConfig {
			partitions: 0,
			..ServiceConfig::default()
		};
		assert!(matches!(zero_partitions.validate(), Err(EngineError::Config(_))));

		let same_topic = ServiceConfig {
			similarity_topic: "stats.user-actions.v1".into(),
			..ServiceConfig::default()
		};
		assert!(same_topic.validate().is_err());

		let zero_poll = ServiceConfig {
			poll_interval: Duration::ZERO,
			..ServiceConfig::default()
		};
		assert!(zero_poll.validate().is_err());
	}

	#[tokio::test]
	async fn collected_actions_become_recommendations() {
		let service = RecommendationService::start(fast_config()).await.unwrap();

		service.collect(action(1, 10, ActionKind::Like, 1)).await.unwrap();
		service.collect(action(1, 11, ActionKind::Like, 2)).await.unwrap();
		service.collect(action(2, 10, ActionKind::Like, 3)).await.unwrap();
		assert!(service.settle(Duration::from_secs(5)).await);

		let stats = service.stats();
		assert_eq!(stats.similarities, 1);
		assert_eq!(stats.interactions, 3);
		assert_eq!(stats.users, 2);
		assert_eq!(stats.events, 2);

		let recs = service.recommend_for_user(2, 5);
		assert_eq!(recs.len(), 1);
		assert_eq!(recs[0].event_id, 11);

		let similar = service.similar_events(10, 2, 5);
		assert_eq!(similar.len(), 1);
		assert_eq!(similar[0].event_id, 11);

		let counts = service.interaction_scores(&[10, 11, 12]);
		assert!((counts[0].score - 2.0).abs() < 1e-9);
		assert!((counts[1].score - 1.0).abs() < 1e-9);
		assert_eq!(counts[2].score, 0.0);

		service.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn save_without_storage_is_a_noop() {
		let service = RecommendationService::start(fast_config()).await.unwrap();
		assert!(!service.save().unwrap());
		service.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn state_survives_restart() {
		let dir = tempfile::tempdir().unwrap();
		let config = ServiceConfig {
			storage_path: Some(dir.path().to_path_buf()),
			..fast_config()
		};

		let service = RecommendationService::start(config.clone()).await.unwrap();
		service.collect(action(1, 10, ActionKind::Register, 1)).await.unwrap();
		service.collect(action(1, 11, ActionKind::Like, 2)).await.unwrap();
		assert!(service.settle(Duration::from_secs(5)).await);
		let before = service.stats();
		service.shutdown().await.unwrap();

		let restarted = RecommendationService::start(config).await.unwrap();
		assert_eq!(restarted.stats(), before);

		// The restored aggregator keeps counting from where it stopped.
		restarted.collect(action(2, 10, ActionKind::Register, 3)).await.unwrap();
		restarted.collect(action(2, 11, ActionKind::Register, 4)).await.unwrap();
		assert!(restarted.settle(Duration::from_secs(5)).await);
		let store = read(&restarted.store);
		let score = store.similarity(10, 11).unwrap();
		// M = min(0.8,1.0) + min(0.8,0.8) = 1.6, S_10 = 1.6, S_11 = 1.8
		let expected = 1.6 / (1.6f64.sqrt() * 1.8f64.sqrt());
		assert!((score - expected).abs() < 1e-9);
		drop(store);
		restarted.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn shutdown_drains_acknowledged_actions() {
		let dir = tempfile::tempdir().unwrap();
		let config = ServiceConfig {
			storage_path: Some(dir.path().to_path_buf()),
			..fast_config()
		};

		let service = RecommendationService::start(config.clone()).await.unwrap();
		service.collect(action(1, 10, ActionKind::Like, 1)).await.unwrap();
		service.collect(action(1, 20, ActionKind::Like, 2)).await.unwrap();
		service.shutdown().await.unwrap();

		let restarted = RecommendationService::start(config).await.unwrap();
		let stats = restarted.stats();
		assert_eq!(stats.interactions, 2);
		assert_eq!(stats.similarities, 1);
		assert_eq!(lock(&restarted.aggregator).user_weight(1, 10), 1.0);
		let similar = restarted.similar_events(10, 99, 5);
		assert_eq!(similar.len(), 1);
		assert!((similar[0].score - 1.0).abs() < 1e-9);
		restarted.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn shutdown_catches_store_up_with_aggregator() {
		let dir = tempfile::tempdir().unwrap();
		let config = ServiceConfig {
			storage_path: Some(dir.path().to_path_buf()),
			..fast_config()
		};

		// Aggregated but never ingested, as when workers stop mid-pipeline.
		let service = RecommendationService::start(config.clone()).await.unwrap();
		{
			let mut aggregator = lock(&service.aggregator);
			aggregator.process(&action(1, 10, ActionKind::View, 1));
			aggregator.process(&action(1, 20, ActionKind::View, 2));
		}
		assert_eq!(service.stats().similarities, 0);
		service.shutdown().await.unwrap();

		let restarted = RecommendationService::start(config).await.unwrap();
		let store = read(&restarted.store);
		assert_eq!(store.similarity(10, 20), Some(1.0));
		drop(store);
		restarted.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn unchanged_state_is_not_rewritten_on_shutdown() {
		let dir = tempfile::tempdir().unwrap();
		let config = ServiceConfig {
			storage_path: Some(dir.path().to_path_buf()),
			..fast_config()
		};
		let index = dir.path().join("index.gz");

		let service = RecommendationService::start(config.clone()).await.unwrap();
		assert!(!service.is_dirty());
		service.shutdown().await.unwrap();
		assert!(!index.exists());

		// An explicit save always writes.
		let service = RecommendationService::start(config).await.unwrap();
		assert!(service.save().unwrap());
		assert!(index.exists());
		service.collect(action(3, 30, ActionKind::View, 1)).await.unwrap();
		assert!(service.settle(Duration::from_secs(5)).await);
		assert!(service.is_dirty());
		service.save().unwrap();
		assert!(!service.is_dirty());
		service.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn collect_after_shutdown_signal_fails() {
		let service = RecommendationService::start(fast_config()).await.unwrap();
		service.shutdown.cancel();
		let err = service.collect(action(1, 1, ActionKind::View, 1)).await.unwrap_err();
		assert!(matches!(err, EngineError::ShutDown));
	}
}
