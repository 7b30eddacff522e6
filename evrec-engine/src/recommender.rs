// ---------------------------------------------------------------------------
// RecommendationEngine: read-only queries over similarities and history
// ---------------------------------------------------------------------------
//
// Personalized recommendations run in three stages:
//
//   1. seeds      the user's most recently weighted events
//   2. candidates top neighbors of every seed the user has not touched
//   3. scoring    for each candidate, the similarity-weighted average of the
//                 user's own weights over the candidate's neighbors the user
//                 has touched (the evidence set)
//
// Every ordering is score descending then event id ascending, so identical
// state always yields identical answers.
// ---------------------------------------------------------------------------

use std::collections::{BTreeSet, HashSet};

use crate::history::InteractionHistory;
use crate::similarity_store::{sort_neighbors, Neighbor, SimilarityStore};
use crate::types::{EventId, RecommendedEvent, UserId};

pub struct RecommendationEngine<'a> {
	store: &'a SimilarityStore,
	history: &'a InteractionHistory,
}

impl<'a> RecommendationEngine<'a> {
	pub fn new(store: &'a SimilarityStore, history: &'a InteractionHistory) -> Self {
		Self { store, history }
	}

	/// Personalized recommendations for `user`. Empty for a user without
	/// history.
	pub fn recommend_for_user(&self, user: UserId, limit: usize) -> Vec<RecommendedEvent> {
		if limit == 0 {
			return Vec::new();
		}

		let seeds = self.history.recent_events(user, limit);
		if seeds.is_empty() {
			tracing::debug!(user, "No interaction history, nothing to recommend");
			return Vec::new();
		}

		let candidates: BTreeSet<EventId> = seeds
			.iter()
			.flat_map(|seed| self.store.neighbors(*seed, limit))
			.map(|n| n.event_id)
			.filter(|id| !self.history.has_interacted(user, *id))
			.collect();

		let mut scored: Vec<Neighbor> = candidates
			.into_iter()
			.filter_map(|candidate| {
				self.predict_score(user, candidate, limit).map(|score| Neighbor {
					event_id: candidate,
					score,
				})
			})
			.collect();
		sort_neighbors(&mut scored);
		scored.truncate(limit);

		tracing::debug!(user, seeds = seeds.len(), results = scored.len(), "Recommendations computed");
		scored.into_iter().map(to_result).collect()
	}

	/// Similarity-weighted average of the user's weights over the
	/// candidate's neighbors the user has interacted with. `None` when
	/// that evidence set is empty.
	fn predict_score(&self, user: UserId, candidate: EventId, limit: usize) -> Option<f64> {
		let mut weighted = 0.0;
		let mut similarity_sum = 0.0;
		let mut evidence = 0usize;

		for neighbor in self.store.neighbors(candidate, limit) {
			let Some(weight) = self.history.weight(user, neighbor.event_id) else {
				continue;
			};
			weighted += weight * neighbor.score;
			similarity_sum += neighbor.score;
			evidence += 1;
		}

		if evidence == 0 {
			return None;
		}
		if similarity_sum > 0.0 {
			Some(weighted / similarity_sum)
		} else {
			Some(0.0)
		}
	}

	/// Events most similar to `event` that `user` has not interacted with.
	pub fn similar_events(
		&self,
		event: EventId,
		user: UserId,
		limit: usize,
	) -> Vec<RecommendedEvent> {
		let mut neighbors: Vec<Neighbor> = self
			.store
			.neighbors(event, limit)
			.into_iter()
			.filter(|n| n.event_id != event && !self.history.has_interacted(user, n.event_id))
			.collect();
		sort_neighbors(&mut neighbors);
		neighbors.truncate(limit);
		neighbors.into_iter().map(to_result).collect()
	}

	/// Sum of all users' interaction weights per requested event, one entry
	/// per distinct id in request order. Unknown events score 0.
	pub fn interaction_scores(&self, event_ids: &[EventId]) -> Vec<RecommendedEvent> {
		let mut seen = HashSet::new();
		event_ids
			.iter()
			.filter(|id| seen.insert(**id))
			.map(|id| RecommendedEvent {
				event_id: *id,
				score: self.history.total_weight(*id),
			})
			.collect()
	}
}

fn to_result(n: Neighbor) -> RecommendedEvent {
	RecommendedEvent {
		event_id: n.event_id,
		score: n.score,
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
