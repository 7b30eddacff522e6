use std::fmt;

use serde::{Deserialize, Serialize};

pub type EventId = i64;
pub type UserId = i64;

/// Kind of user interaction with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
	#[serde(rename = "VIEW", alias = "ACTION_VIEW")]
	View,
	#[serde(rename = "REGISTER", alias = "ACTION_REGISTER")]
	Register,
	#[serde(rename = "LIKE", alias = "ACTION_LIKE")]
	Like,
}

impl ActionKind {
	/// Wire code used by the binary record format.
	pub fn code(self) -> u8 {
		match self {
			Self::View => 0,
			Self::Register => 1,
			Self::Like => 2,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0 => Some(Self::View),
			1 => Some(Self::Register),
			2 => Some(Self::Like),
			_ => None,
		}
	}
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::View => "VIEW",
			Self::Register => "REGISTER",
			Self::Like => "LIKE",
		};
		f.write_str(name)
	}
}

/// A single user interaction, as produced by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionEvent {
	pub user_id: UserId,
	pub event_id: EventId,
	#[serde(rename = "actionType")]
	pub kind: ActionKind,
	pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Canonical event pair
// ---------------------------------------------------------------------------

/// Unordered event pair stored with `first < second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPair {
	first: EventId,
	second: EventId,
}

impl EventPair {
	/// Canonicalize `(a, b)`. Returns `None` for a self-pair.
	pub fn new(a: EventId, b: EventId) -> Option<Self> {
		match a.cmp(&b) {
			std::cmp::Ordering::Less => Some(Self { first: a, second: b }),
			std::cmp::Ordering::Greater => Some(Self { first: b, second: a }),
			std::cmp::Ordering::Equal => None,
		}
	}

	pub fn first(&self) -> EventId {
		self.first
	}

	pub fn second(&self) -> EventId {
		self.second
	}

	/// The member of the pair that is not `event`.
	pub fn other(&self, event: EventId) -> EventId {
		if event == self.first {
			self.second
		} else {
			self.first
		}
	}
}

/// Similarity of a canonical event pair, as emitted by the aggregator and
/// stored by the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSimilarity {
	pub event_a: EventId,
	pub event_b: EventId,
	pub score: f64,
	pub timestamp: u64,
}

impl EventSimilarity {
	pub fn pair(&self) -> Option<EventPair> {
		EventPair::new(self.event_a, self.event_b)
	}
}

/// One entry of a recommendation answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedEvent {
	pub event_id: EventId,
	pub score: f64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pair_is_canonical_regardless_of_order() {
		let ab = EventPair::new(7, 3).unwrap();
		let ba = EventPair::new(3, 7).unwrap();
		assert_eq!(ab, ba);
		assert_eq!(ab.first(), 3);
		assert_eq!(ab.second(), 7);
		assert_eq!(ab.other(3), 7);
		assert_eq!(ab.other(7), 3);
	}

	#[test]
	fn self_pair_is_rejected() {
		assert!(EventPair::new(5, 5).is_none());
	}

	#[test]
	fn action_kind_accepts_prefixed_names() {
		let kind: ActionKind = serde_json::from_str("\"ACTION_LIKE\"").unwrap();
		assert_eq!(kind, ActionKind::Like);
		let kind: ActionKind = serde_json::from_str("\"REGISTER\"").unwrap();
		assert_eq!(kind, ActionKind::Register);
		assert!(serde_json::from_str::<ActionKind>("\"SHARE\"").is_err());
	}

	#[test]
	fn action_codes_roundtrip() {
		for kind in [ActionKind::View, ActionKind::Register, ActionKind::Like] {
			assert_eq!(ActionKind::from_code(kind.code()), Some(kind));
		}
		assert_eq!(ActionKind::from_code(9), None);
	}
}
