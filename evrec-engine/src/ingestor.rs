// ---------------------------------------------------------------------------
// Ingestors: stream consumers that fill the query-side tables
// ---------------------------------------------------------------------------
//
//   SimilarityIngestor   similarity topic → SimilarityStore (latest wins)
//   InteractionIngestor  action topic     → InteractionHistory (max weight)
//
// Both decode a whole batch first and then apply it under a single write
// lock, so readers never observe half a batch.
// ---------------------------------------------------------------------------

use async_trait::async_trait;

use crate::codec::{decode_interaction, decode_similarity};
use crate::error::EngineError;
use crate::pipeline::{BatchHandler, BatchOutcome};
use crate::shared::{write, SharedHistory, SharedStore};
use crate::similarity_store::UpsertOutcome;
use crate::stream::Record;
use crate::weights::ActionWeights;

fn decode_batch<T, E: std::fmt::Display>(
	batch: &[Record],
	kind: &str,
	decode: impl Fn(&[u8]) -> Result<T, E>,
) -> (Vec<T>, usize) {
	let mut decoded = Vec::with_capacity(batch.len());
	let mut skipped = 0;
	for record in batch {
		match decode(&record.payload) {
			Ok(value) => decoded.push(value),
			Err(e) => {
				tracing::warn!(
					partition = record.partition,
					offset = record.offset,
					"Skipping malformed {} record: {}",
					kind,
					e
				);
				skipped += 1;
			}
		}
	}
	(decoded, skipped)
}

// ---------------------------------------------------------------------------
// SimilarityIngestor
// ---------------------------------------------------------------------------

pub struct SimilarityIngestor {
	store: SharedStore,
}

impl SimilarityIngestor {
	pub fn new(store: SharedStore) -> Self {
		Self { store }
	}
}

#[async_trait]
impl BatchHandler for SimilarityIngestor {
	fn name(&self) -> &'static str {
		"similarity-ingestor"
	}

	async fn handle(&mut self, batch: &[Record]) -> Result<BatchOutcome, EngineError> {
		let (records, skipped) = decode_batch(batch, "similarity", decode_similarity);
		let mut outcome = BatchOutcome {
			skipped,
			..BatchOutcome::default()
		};

		let mut store = write(&self.store);
		for record in &records {
			match store.upsert(record) {
				UpsertOutcome::Inserted | UpsertOutcome::Replaced => outcome.applied += 1,
				UpsertOutcome::Stale | UpsertOutcome::Rejected => outcome.unchanged += 1,
			}
		}
		drop(store);

		if outcome.unchanged > 0 {
			tracing::debug!(stale = outcome.unchanged, "Ignored out-of-date similarity updates");
		}
		Ok(outcome)
	}
}

// ---------------------------------------------------------------------------
// InteractionIngestor
// ---------------------------------------------------------------------------

pub struct InteractionIngestor {
	history: SharedHistory,
	weights: ActionWeights,
}

impl InteractionIngestor {
	pub fn new(history: SharedHistory, weights: ActionWeights) -> Self {
		Self { history, weights }
	}
}

#[async_trait]
impl BatchHandler for InteractionIngestor {
	fn name(&self) -> &'static str {
		"interaction-ingestor"
	}

	async fn handle(&mut self, batch: &[Record]) -> Result<BatchOutcome, EngineError> {
		let (events, skipped) = decode_batch(batch, "interaction", decode_interaction);
		let mut outcome = BatchOutcome {
			skipped,
			..BatchOutcome::default()
		};

		let mut history = write(&self.history);
		for event in &events {
			let changed = history.record(
				event.user_id,
				event.event_id,
				self.weights.weight(event.kind),
				event.timestamp,
			);
			if changed {
				outcome.applied += 1;
			} else {
				outcome.unchanged += 1;
			}
		}
		Ok(outcome)
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
