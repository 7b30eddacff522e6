// ---------------------------------------------------------------------------
// Consumer loop: poll, handle, commit
// ---------------------------------------------------------------------------
//
// One loop per topic partition. A batch is handed to its handler exactly
// once per attempt; the offset is committed only after the handler reports
// success. A failing handler is retried on the same batch with exponential
// backoff and nothing new is polled meanwhile, which pushes back on the
// producer side.
//
// Shutdown interrupts the blocking poll and any backoff sleep. A handler call
// that has already started always runs to completion.
// ---------------------------------------------------------------------------

use std::time::Duration;

use async_trait::async_trait;
use evrec_resilience::RetryPolicy;
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_interaction, encode_similarity};
use crate::error::EngineError;
use crate::shared::{lock, SharedAggregator};
use crate::stream::{Consumer, Producer, Record, StreamError};
use crate::types::EventSimilarity;

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// What a handler did with one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
	/// Records that changed state.
	pub applied: usize,
	/// Records that decoded but changed nothing.
	pub unchanged: usize,
	/// Malformed records that were logged and dropped.
	pub skipped: usize,
	/// Downstream records published.
	pub emitted: usize,
}

#[async_trait]
pub trait BatchHandler: Send {
	fn name(&self) -> &'static str;

	/// Handle one polled batch. An error is treated as transient: the same
	/// batch is offered again after a backoff delay.
	async fn handle(&mut self, batch: &[Record]) -> Result<BatchOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// ConsumerLoop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoopConfig {
	pub poll_timeout: Duration,
	pub retry: RetryPolicy,
}

impl Default for LoopConfig {
	fn default() -> Self {
		Self {
			poll_timeout: Duration::from_millis(1000),
			retry: RetryPolicy::default().with_max_attempts(None),
		}
	}
}

/// Counters reported when a loop exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
	pub batches: u64,
	pub records: u64,
	pub applied: u64,
	pub skipped: u64,
	pub emitted: u64,
	pub retries: u64,
}

pub struct ConsumerLoop<C, H> {
	consumer: C,
	handler: H,
	config: LoopConfig,
	shutdown: CancellationToken,
	stats: LoopStats,
}

impl<C: Consumer, H: BatchHandler> ConsumerLoop<C, H> {
	pub fn new(consumer: C, handler: H, config: LoopConfig, shutdown: CancellationToken) -> Self {
		Self {
			consumer,
			handler,
			config,
			shutdown,
			stats: LoopStats::default(),
		}
	}

	/// Run until shutdown. Returns an error only when the stream closes or a
	/// bounded retry policy is exhausted.
	pub async fn run(mut self) -> Result<LoopStats, EngineError> {
		let assignment = self.consumer.assignment().clone();
		tracing::info!(
			handler = self.handler.name(),
			topic = %assignment.topic,
			group = %assignment.group,
			partition = assignment.partition,
			"Consumer loop started"
		);

		let mut poll_backoff = self.config.retry.backoff();
		loop {
			let polled = tokio::select! {
				biased;
				_ = self.shutdown.cancelled() => break,
				polled = self.consumer.poll(self.config.poll_timeout) => polled,
			};

			let batch = match polled {
				Ok(batch) => {
					poll_backoff.reset();
					batch
				}
				Err(StreamError::Closed) => return Err(StreamError::Closed.into()),
				Err(e) => {
					let Some(delay) = poll_backoff.next_delay() else {
						return Err(e.into());
					};
					tracing::warn!(
						partition = assignment.partition,
						"Poll failed, retrying in {:?}: {}",
						delay,
						e
					);
					if !sleep_or_shutdown(&self.shutdown, delay).await {
						break;
					}
					continue;
				}
			};

			if batch.is_empty() {
				continue;
			}
			tracing::debug!(
				topic = %assignment.topic,
				partition = assignment.partition,
				count = batch.len(),
				"Received records"
			);

			if !self.handle_batch(&batch).await? {
				break;
			}
			if !self.commit().await? {
				break;
			}
		}

		tracing::info!(
			handler = self.handler.name(),
			partition = assignment.partition,
			batches = self.stats.batches,
			records = self.stats.records,
			"Consumer loop stopped"
		);
		Ok(self.stats)
	}

	/// Returns `false` if shutdown arrived before the batch succeeded.
	async fn handle_batch(&mut self, batch: &[Record]) -> Result<bool, EngineError> {
		let mut backoff = self.config.retry.backoff();
		loop {
			match self.handler.handle(batch).await {
				Ok(outcome) => {
					self.stats.batches += 1;
					self.stats.records += batch.len() as u64;
					self.stats.applied += outcome.applied as u64;
					self.stats.skipped += outcome.skipped as u64;
					self.stats.emitted += outcome.emitted as u64;
					return Ok(true);
				}
				Err(e) => {
					let Some(delay) = backoff.next_delay() else {
						tracing::error!(
							handler = self.handler.name(),
							attempts = backoff.failures(),
							"Giving up on batch: {}",
							e
						);
						return Err(e);
					};
					self.stats.retries += 1;
					tracing::warn!(
						handler = self.handler.name(),
						attempt = backoff.failures(),
						"Batch failed, retrying in {:?}: {}",
						delay,
						e
					);
					if !sleep_or_shutdown(&self.shutdown, delay).await {
						tracing::warn!(
							handler = self.handler.name(),
							"Shutdown during retry, batch left uncommitted"
						);
						return Ok(false);
					}
				}
			}
		}
	}

	async fn commit(&mut self) -> Result<bool, EngineError> {
		let mut backoff = self.config.retry.backoff();
		loop {
			match self.consumer.commit().await {
				Ok(()) => {
					tracing::debug!(handler = self.handler.name(), "Offsets committed");
					return Ok(true);
				}
				Err(e) => {
					let Some(delay) = backoff.next_delay() else {
						return Err(e.into());
					};
					tracing::warn!("Commit failed, retrying in {:?}: {}", delay, e);
					if !sleep_or_shutdown(&self.shutdown, delay).await {
						return Ok(false);
					}
				}
			}
		}
	}
}

/// Sleep for `delay`; returns `false` if shutdown fired first.
async fn sleep_or_shutdown(shutdown: &CancellationToken, delay: Duration) -> bool {
	tokio::select! {
		_ = shutdown.cancelled() => false,
		_ = tokio::time::sleep(delay) => true,
	}
}

// ---------------------------------------------------------------------------
// AggregationHandler: interactions in, similarity updates out
// ---------------------------------------------------------------------------

/// Feeds decoded interactions through the shared aggregator and publishes
/// the resulting similarity records.
///
/// Emissions computed for a batch are kept until they have been published
/// and flushed. A retry republishes them instead of recomputing, since the
/// aggregator has already absorbed the batch.
pub struct AggregationHandler<P> {
	aggregator: SharedAggregator,
	producer: P,
	similarity_topic: String,
	pending: Option<PendingEmissions>,
}

struct PendingEmissions {
	records: Vec<EventSimilarity>,
	applied: usize,
	unchanged: usize,
	skipped: usize,
}

impl<P: Producer> AggregationHandler<P> {
	pub fn new(aggregator: SharedAggregator, producer: P, similarity_topic: impl Into<String>) -> Self {
		Self {
			aggregator,
			producer,
			similarity_topic: similarity_topic.into(),
			pending: None,
		}
	}

	fn aggregate(&self, batch: &[Record]) -> PendingEmissions {
		let mut pending = PendingEmissions {
			records: Vec::new(),
			applied: 0,
			unchanged: 0,
			skipped: 0,
		};
		let mut aggregator = lock(&self.aggregator);
		for record in batch {
			match decode_interaction(&record.payload) {
				Ok(event) => {
					let before = aggregator.user_weight(event.user_id, event.event_id);
					let emitted = aggregator.process(&event);
					if aggregator.user_weight(event.user_id, event.event_id) > before {
						pending.applied += 1;
					} else {
						pending.unchanged += 1;
					}
					pending.records.extend(emitted);
				}
				Err(e) => {
					tracing::warn!(
						partition = record.partition,
						offset = record.offset,
						"Skipping malformed interaction record: {}",
						e
					);
					pending.skipped += 1;
				}
			}
		}
		pending
	}

	async fn publish(&self, records: &[EventSimilarity]) -> Result<(), StreamError> {
		for record in records {
			self.producer
				.send(&self.similarity_topic, record.event_a, encode_similarity(record))
				.await?;
		}
		self.producer.flush().await
	}
}

#[async_trait]
impl<P: Producer> BatchHandler for AggregationHandler<P> {
	fn name(&self) -> &'static str {
		"aggregator"
	}

	async fn handle(&mut self, batch: &[Record]) -> Result<BatchOutcome, EngineError> {
		let pending = match self.pending.take() {
			Some(pending) => pending,
			None => self.aggregate(batch),
		};

		if let Err(e) = self.publish(&pending.records).await {
			self.pending = Some(pending);
			return Err(e.into());
		}

		Ok(BatchOutcome {
			applied: pending.applied,
			unchanged: pending.unchanged,
			skipped: pending.skipped,
			emitted: pending.records.len(),
		})
	}
}
