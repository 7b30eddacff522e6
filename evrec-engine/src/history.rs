// ---------------------------------------------------------------------------
// InteractionHistory: per-user interaction index
// ---------------------------------------------------------------------------
//
// Replicated view of user actions kept on the serving side. Each
// (user, event) row holds the strongest weight seen and the timestamp of the
// action that set it. A per-event running total backs popularity queries.
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use crate::types::{EventId, UserId};

/// Strongest known interaction of one user with one event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interaction {
	pub weight: f64,
	pub timestamp: u64,
}

/// A history row in flat form (used for persistence).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionRow {
	pub user_id: UserId,
	pub event_id: EventId,
	pub weight: f64,
	pub timestamp: u64,
}

#[derive(Default)]
pub struct InteractionHistory {
	by_user: HashMap<UserId, HashMap<EventId, Interaction>>,
	event_totals: HashMap<EventId, f64>,
	dirty: bool,
}

impl InteractionHistory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record an interaction. Only a strictly stronger weight changes the
	/// row; returns whether it did.
	pub fn record(&mut self, user: UserId, event: EventId, weight: f64, timestamp: u64) -> bool {
		let events = self.by_user.entry(user).or_default();
		let old_weight = events.get(&event).map_or(0.0, |i| i.weight);
		if weight <= old_weight {
			return false;
		}
		events.insert(event, Interaction { weight, timestamp });
		*self.event_totals.entry(event).or_insert(0.0) += weight - old_weight;
		self.dirty = true;
		true
	}

	pub fn get(&self, user: UserId, event: EventId) -> Option<Interaction> {
		self.by_user.get(&user).and_then(|events| events.get(&event)).copied()
	}

	pub fn weight(&self, user: UserId, event: EventId) -> Option<f64> {
		self.get(user, event).map(|i| i.weight)
	}

	pub fn has_interacted(&self, user: UserId, event: EventId) -> bool {
		self.by_user
			.get(&user)
			.is_some_and(|events| events.contains_key(&event))
	}

	/// The user's `limit` most recently weighted events, newest first
	/// (ties broken by event id ascending).
	pub fn recent_events(&self, user: UserId, limit: usize) -> Vec<EventId> {
		let Some(events) = self.by_user.get(&user) else {
			return Vec::new();
		};
		let mut rows: Vec<(EventId, u64)> =
			events.iter().map(|(id, i)| (*id, i.timestamp)).collect();
		rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		rows.truncate(limit);
		rows.into_iter().map(|(id, _)| id).collect()
	}

	/// Sum of all users' weights toward `event` (0.0 if none).
	pub fn total_weight(&self, event: EventId) -> f64 {
		self.event_totals.get(&event).copied().unwrap_or(0.0)
	}

	// -- Bulk access ---------------------------------------------------------

	/// All rows, ordered by (user, event).
	pub fn rows(&self) -> Vec<InteractionRow> {
		let mut rows: Vec<InteractionRow> = self
			.by_user
			.iter()
			.flat_map(|(user, events)| {
				events.iter().map(move |(event, i)| InteractionRow {
					user_id: *user,
					event_id: *event,
					weight: i.weight,
					timestamp: i.timestamp,
				})
			})
			.collect();
		rows.sort_by_key(|r| (r.user_id, r.event_id));
		rows
	}

	/// Rebuild from persisted rows.
	pub fn from_rows(rows: impl IntoIterator<Item = InteractionRow>) -> Self {
		let mut history = Self::new();
		for row in rows {
			history.record(row.user_id, row.event_id, row.weight, row.timestamp);
		}
		history.dirty = false;
		history
	}

	pub fn user_count(&self) -> usize {
		self.by_user.len()
	}

	pub fn event_count(&self) -> usize {
		self.event_totals.len()
	}

	pub fn len(&self) -> usize {
		self.by_user.values().map(HashMap::len).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.by_user.is_empty()
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
