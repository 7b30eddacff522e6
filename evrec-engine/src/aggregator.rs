// ---------------------------------------------------------------------------
// SimilarityAggregator: incremental event-pair similarity
// ---------------------------------------------------------------------------
//
// Keeps three keyed tables and updates them in place for every interaction:
//
//   weight(u, e)  max action weight user `u` has shown for event `e`
//   S_e           Σ_u weight(u, e)
//   M_{A,B}       Σ_u min(weight(u, A), weight(u, B))      (canonical A < B)
//
// and scores a pair as  M_{A,B} / (sqrt(S_A) · sqrt(S_B)),  which is bounded
// to [0, 1] because M_{A,B} ≤ min(S_A, S_B).
//
// Weights only ever grow, so replaying an interaction (or delivering a weaker
// one late) is a no-op.
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{EventId, EventPair, EventSimilarity, InteractionEvent, UserId};
use crate::weights::ActionWeights;

// ---------------------------------------------------------------------------
// Pair accumulator
// ---------------------------------------------------------------------------

/// Running state for one canonical pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PairAccumulator {
	/// Σ_u min(weight(u, A), weight(u, B))
	pub min_sum: f64,
	/// Timestamp carried by the last emitted record for this pair.
	/// Never decreases, so downstream last-timestamp-wins stays correct
	/// when interactions arrive out of order.
	pub updated_at: u64,
	/// Score carried by the last emitted record for this pair.
	#[serde(default)]
	pub last_score: f64,
}

/// Normalized similarity from a min-sum and the two norm terms.
/// Returns 0.0 when either norm term is zero.
pub fn similarity_score(min_sum: f64, norm_a: f64, norm_b: f64) -> f64 {
	if norm_a <= 0.0 || norm_b <= 0.0 {
		return 0.0;
	}
	let score = min_sum / (norm_a.sqrt() * norm_b.sqrt());
	if !score.is_finite() {
		return 0.0;
	}
	score.clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

pub struct SimilarityAggregator {
	weights: ActionWeights,
	user_weights: HashMap<UserId, HashMap<EventId, f64>>,
	norms: HashMap<EventId, f64>,
	pairs: HashMap<EventPair, PairAccumulator>,
	dirty: bool,
}

impl SimilarityAggregator {
	pub fn new(weights: ActionWeights) -> Self {
		Self {
			weights,
			user_weights: HashMap::new(),
			norms: HashMap::new(),
			pairs: HashMap::new(),
			dirty: false,
		}
	}

	/// Apply one interaction and return the similarity records it changed.
	///
	/// Emitted records are ordered by the partner event id.
	pub fn process(&mut self, event: &InteractionEvent) -> Vec<EventSimilarity> {
		let new_weight = self.weights.weight(event.kind);
		let user_events = self.user_weights.entry(event.user_id).or_default();
		let old_weight = user_events.get(&event.event_id).copied().unwrap_or(0.0);

		if new_weight <= old_weight {
			tracing::trace!(
				user = event.user_id,
				event = event.event_id,
				old_weight,
				new_weight,
				"Weight not raised, skipping"
			);
			return Vec::new();
		}

		user_events.insert(event.event_id, new_weight);
		self.dirty = true;
		*self.norms.entry(event.event_id).or_insert(0.0) += new_weight - old_weight;

		let mut partners: Vec<(EventId, f64)> = user_events
			.iter()
			.filter(|(id, w)| **id != event.event_id && **w > 0.0)
			.map(|(id, w)| (*id, *w))
			.collect();
		partners.sort_by_key(|(id, _)| *id);

		let mut emitted = Vec::with_capacity(partners.len());
		for (partner, partner_weight) in partners {
			let Some(pair) = EventPair::new(event.event_id, partner) else {
				continue;
			};
			let delta = new_weight.min(partner_weight) - old_weight.min(partner_weight);
			let acc = self.pairs.entry(pair).or_default();
			acc.min_sum += delta;
			acc.updated_at = acc.updated_at.max(event.timestamp);

			let norm_a = self.norms.get(&pair.first()).copied().unwrap_or(0.0);
			let norm_b = self.norms.get(&pair.second()).copied().unwrap_or(0.0);
			acc.last_score = similarity_score(acc.min_sum, norm_a, norm_b);
			emitted.push(EventSimilarity {
				event_a: pair.first(),
				event_b: pair.second(),
				score: acc.last_score,
				timestamp: acc.updated_at,
			});
		}

		tracing::trace!(
			user = event.user_id,
			event = event.event_id,
			new_weight,
			emitted = emitted.len(),
			"Interaction aggregated"
		);
		emitted
	}

	// -- Accessors -----------------------------------------------------------

	/// Current weight of `user` toward `event` (0.0 if unseen).
	pub fn user_weight(&self, user: UserId, event: EventId) -> f64 {
		self.user_weights
			.get(&user)
			.and_then(|events| events.get(&event))
			.copied()
			.unwrap_or(0.0)
	}

	/// Norm term S_e (0.0 if unseen).
	pub fn norm(&self, event: EventId) -> f64 {
		self.norms.get(&event).copied().unwrap_or(0.0)
	}

	/// Min-sum M for a pair (0.0 if unseen or a self-pair).
	pub fn min_sum(&self, a: EventId, b: EventId) -> f64 {
		EventPair::new(a, b)
			.and_then(|pair| self.pairs.get(&pair))
			.map_or(0.0, |acc| acc.min_sum)
	}

	/// Current similarity for a pair computed from live state.
	pub fn similarity(&self, a: EventId, b: EventId) -> f64 {
		similarity_score(self.min_sum(a, b), self.norm(a), self.norm(b))
	}

	pub fn user_count(&self) -> usize {
		self.user_weights.len()
	}

	pub fn event_count(&self) -> usize {
		self.norms.len()
	}

	pub fn pair_count(&self) -> usize {
		self.pairs.len()
	}

	/// The last record emitted for every pair, ordered by pair. Replaying
	/// these into a store brings it level with everything aggregated so far.
	pub fn emitted_records(&self) -> Vec<EventSimilarity> {
		let mut records: Vec<EventSimilarity> = self
			.pairs
			.iter()
			.map(|(pair, acc)| EventSimilarity {
				event_a: pair.first(),
				event_b: pair.second(),
				score: acc.last_score,
				timestamp: acc.updated_at,
			})
			.collect();
		records.sort_by_key(|r| (r.event_a, r.event_b));
		records
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

	// -- Snapshot ------------------------------------------------------------

	/// Export the full state in a deterministic order.
	pub fn snapshot(&self) -> AggregatorSnapshot {
		let mut user_weights: Vec<(UserId, EventId, f64)> = self
			.user_weights
			.iter()
			.flat_map(|(user, events)| events.iter().map(move |(event, w)| (*user, *event, *w)))
			.collect();
		user_weights.sort_by_key(|(u, e, _)| (*u, *e));

		let mut norms: Vec<(EventId, f64)> = self.norms.iter().map(|(e, s)| (*e, *s)).collect();
		norms.sort_by_key(|(e, _)| *e);

		let mut pairs: Vec<(EventId, EventId, PairAccumulator)> = self
			.pairs
			.iter()
			.map(|(pair, acc)| (pair.first(), pair.second(), *acc))
			.collect();
		pairs.sort_by_key(|(a, b, _)| (*a, *b));

		AggregatorSnapshot {
			user_weights,
			norms,
			pairs,
		}
	}

	/// Replace all state with a snapshot. Self-pairs in the snapshot are dropped.
	pub fn restore(&mut self, snapshot: AggregatorSnapshot) {
		self.dirty = false;
		self.user_weights.clear();
		self.norms.clear();
		self.pairs.clear();

		for (user, event, weight) in snapshot.user_weights {
			self.user_weights.entry(user).or_default().insert(event, weight);
		}
		self.norms.extend(snapshot.norms);
		for (a, b, acc) in snapshot.pairs {
			if let Some(pair) = EventPair::new(a, b) {
				self.pairs.insert(pair, acc);
			}
		}
	}
}

/// Serializable copy of the aggregator's tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSnapshot {
	pub user_weights: Vec<(UserId, EventId, f64)>,
	pub norms: Vec<(EventId, f64)>,
	pub pairs: Vec<(EventId, EventId, PairAccumulator)>,
}

impl AggregatorSnapshot {
	pub fn is_empty(&self) -> bool {
		self.user_weights.is_empty()
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
