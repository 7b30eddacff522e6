// ---------------------------------------------------------------------------
// SimilarityStore: canonical pair → score table
// ---------------------------------------------------------------------------
//
// Rows are keyed by canonical pair (eventA < eventB). Two adjacency indexes
// answer "neighbors where X is eventA" and "neighbors where X is eventB"
// without scanning the table.
// ---------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};

use crate::types::{EventId, EventPair, EventSimilarity};

/// Stored similarity for one pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityRow {
	pub score: f64,
	pub updated_at: u64,
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
	Inserted,
	Replaced,
	/// The record was older than the stored row and was dropped.
	Stale,
	/// Self-pair; nothing stored.
	Rejected,
}

/// A neighbor of some event with its similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
	pub event_id: EventId,
	pub score: f64,
}

#[derive(Default)]
pub struct SimilarityStore {
	rows: HashMap<EventPair, SimilarityRow>,
	by_first: HashMap<EventId, HashSet<EventId>>,
	by_second: HashMap<EventId, HashSet<EventId>>,
	dirty: bool,
}

impl SimilarityStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert or replace the row for the record's canonical pair.
	/// Records with a timestamp older than the stored row are dropped;
	/// equal timestamps replace (last write wins).
	pub fn upsert(&mut self, record: &EventSimilarity) -> UpsertOutcome {
		let Some(pair) = record.pair() else {
			return UpsertOutcome::Rejected;
		};
		let row = SimilarityRow {
			score: record.score,
			updated_at: record.timestamp,
		};

		let outcome = match self.rows.get_mut(&pair) {
			Some(existing) if existing.updated_at > row.updated_at => UpsertOutcome::Stale,
			Some(existing) => {
				*existing = row;
				UpsertOutcome::Replaced
			}
			None => {
				self.rows.insert(pair, row);
				self.by_first.entry(pair.first()).or_default().insert(pair.second());
				self.by_second.entry(pair.second()).or_default().insert(pair.first());
				UpsertOutcome::Inserted
			}
		};
		if outcome != UpsertOutcome::Stale {
			self.dirty = true;
		}
		outcome
	}

	/// Similarity of an unordered pair, if stored.
	pub fn similarity(&self, a: EventId, b: EventId) -> Option<f64> {
		EventPair::new(a, b)
			.and_then(|pair| self.rows.get(&pair))
			.map(|row| row.score)
	}

	/// Top `limit` pairs where `event` is eventA, returning the eventB side.
	pub fn top_as_first(&self, event: EventId, limit: usize) -> Vec<Neighbor> {
		self.top_from(self.by_first.get(&event), event, limit)
	}

	/// Top `limit` pairs where `event` is eventB, returning the eventA side.
	pub fn top_as_second(&self, event: EventId, limit: usize) -> Vec<Neighbor> {
		self.top_from(self.by_second.get(&event), event, limit)
	}

	/// Top `limit` neighbors from each orientation, concatenated
	/// (eventA-side results first).
	pub fn neighbors(&self, event: EventId, limit: usize) -> Vec<Neighbor> {
		let mut out = self.top_as_first(event, limit);
		out.extend(self.top_as_second(event, limit));
		out
	}

	fn top_from(
		&self,
		partners: Option<&HashSet<EventId>>,
		event: EventId,
		limit: usize,
	) -> Vec<Neighbor> {
		let Some(partners) = partners else {
			return Vec::new();
		};
		let mut neighbors: Vec<Neighbor> = partners
			.iter()
			.filter_map(|partner| {
				self.similarity(event, *partner).map(|score| Neighbor {
					event_id: *partner,
					score,
				})
			})
			.collect();
		sort_neighbors(&mut neighbors);
		neighbors.truncate(limit);
		neighbors
	}

	// -- Bulk access ---------------------------------------------------------

	/// All rows as similarity records, ordered by pair.
	pub fn records(&self) -> Vec<EventSimilarity> {
		let mut records: Vec<EventSimilarity> = self
			.rows
			.iter()
			.map(|(pair, row)| EventSimilarity {
				event_a: pair.first(),
				event_b: pair.second(),
				score: row.score,
				timestamp: row.updated_at,
			})
			.collect();
		records.sort_by_key(|r| (r.event_a, r.event_b));
		records
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn mark_clean(&mut self) {
		self.dirty = false;
	}

	pub fn mark_dirty(&mut self) {
		self.dirty = true;
	}
}

/// Score descending, then event id ascending.
pub fn sort_neighbors(neighbors: &mut [Neighbor]) {
	neighbors.sort_by(|a, b| {
		b.score
			.total_cmp(&a.score)
			.then_with(|| a.event_id.cmp(&b.event_id))
	});
}
