// ---------------------------------------------------------------------------
// On-disk persistence: gzipped index of binary rows
// ---------------------------------------------------------------------------
//
// File: `<dir>/index.gz`, gzipped JSON
//   { "version": 1, "entries": { "<key>": "<base64 binary row>", ... } }
//
// Keys:
//   sim:<a>:<b>       similarity record (wire layout, see codec.rs)
//   act:<user>:<ev>   history row  [8B user][8B event][8B weight f64][8B ts]
//   __aggregator      aggregator snapshot as UTF-8 JSON
//
// Corrupt rows are skipped and counted rather than failing the load.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::AggregatorSnapshot;
use crate::codec;
use crate::history::InteractionRow;
use crate::types::EventSimilarity;

#[derive(Debug, Error)]
pub enum PersistenceError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Corruption: {0}")]
	Corruption(String),
	#[error("Serialization: {0}")]
	Serialization(String),
}

pub const INDEX_FILE: &str = "index.gz";
pub const INDEX_VERSION: u32 = 1;
pub const AGGREGATOR_KEY: &str = "__aggregator";

const SIMILARITY_PREFIX: &str = "sim:";
const INTERACTION_PREFIX: &str = "act:";
const INTERACTION_ROW_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Gzip
// ---------------------------------------------------------------------------

pub fn compress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut encoder = GzEncoder::new(data, Compression::new(6));
	let mut compressed = Vec::new();
	encoder.read_to_end(&mut compressed)?;
	Ok(compressed)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PersistenceError> {
	let mut decoder = GzDecoder::new(data);
	let mut decompressed = Vec::new();
	decoder.read_to_end(&mut decompressed)?;
	Ok(decompressed)
}

/// Check for the gzip magic bytes (0x1f, 0x8b).
pub fn is_gzipped(data: &[u8]) -> bool {
	data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

// ---------------------------------------------------------------------------
// History row codec
// ---------------------------------------------------------------------------

pub fn serialize_interaction(row: &InteractionRow) -> Vec<u8> {
	let mut buf = Vec::with_capacity(INTERACTION_ROW_LEN);
	buf.extend_from_slice(&row.user_id.to_be_bytes());
	buf.extend_from_slice(&row.event_id.to_be_bytes());
	buf.extend_from_slice(&row.weight.to_bits().to_be_bytes());
	buf.extend_from_slice(&row.timestamp.to_be_bytes());
	buf
}

pub fn deserialize_interaction(data: &[u8]) -> Result<InteractionRow, PersistenceError> {
	if data.len() != INTERACTION_ROW_LEN {
		return Err(PersistenceError::Corruption(format!(
			"Interaction row length {}, expected {}",
			data.len(),
			INTERACTION_ROW_LEN
		)));
	}
	let word = |i: usize| {
		let mut buf = [0u8; 8];
		buf.copy_from_slice(&data[i * 8..i * 8 + 8]);
		buf
	};
	let weight = f64::from_bits(u64::from_be_bytes(word(2)));
	if !weight.is_finite() || weight <= 0.0 {
		return Err(PersistenceError::Corruption(format!(
			"Invalid interaction weight: {}",
			weight
		)));
	}
	Ok(InteractionRow {
		user_id: i64::from_be_bytes(word(0)),
		event_id: i64::from_be_bytes(word(1)),
		weight,
		timestamp: u64::from_be_bytes(word(3)),
	})
}

// ---------------------------------------------------------------------------
// Bulk operations
// ---------------------------------------------------------------------------

/// Everything restored from disk.
#[derive(Debug, Default)]
pub struct LoadedState {
	pub similarities: Vec<EventSimilarity>,
	pub interactions: Vec<InteractionRow>,
	pub aggregator: Option<AggregatorSnapshot>,
	pub skipped: usize,
}

/// Build the raw key → bytes map for the index.
pub fn serialize_to_storage(
	similarities: &[EventSimilarity],
	interactions: &[InteractionRow],
	aggregator: Option<&AggregatorSnapshot>,
) -> Result<HashMap<String, Vec<u8>>, PersistenceError> {
	let mut data = HashMap::new();

	for record in similarities {
		data.insert(
			format!("{}{}:{}", SIMILARITY_PREFIX, record.event_a, record.event_b),
			codec::encode_similarity(record),
		);
	}
	for row in interactions {
		data.insert(
			format!("{}{}:{}", INTERACTION_PREFIX, row.user_id, row.event_id),
			serialize_interaction(row),
		);
	}
	if let Some(snapshot) = aggregator.filter(|s| !s.is_empty()) {
		let json = serde_json::to_vec(snapshot)
			.map_err(|e| PersistenceError::Serialization(e.to_string()))?;
		data.insert(AGGREGATOR_KEY.to_string(), json);
	}

	Ok(data)
}

/// Decode the raw key → bytes map, skipping rows that fail to decode.
pub fn deserialize_from_storage(raw: &HashMap<String, Vec<u8>>) -> LoadedState {
	let mut state = LoadedState::default();

	for (key, value) in raw {
		if key == AGGREGATOR_KEY {
			match serde_json::from_slice::<AggregatorSnapshot>(value) {
				Ok(snapshot) => state.aggregator = Some(snapshot),
				Err(e) => {
					tracing::warn!("Discarding unreadable aggregator snapshot: {}", e);
					state.skipped += 1;
				}
			}
		} else if key.starts_with(SIMILARITY_PREFIX) {
			match codec::decode_similarity(value) {
				Ok(record) => state.similarities.push(record),
				Err(e) => {
					tracing::warn!(key = %key, "Skipping corrupt similarity row: {}", e);
					state.skipped += 1;
				}
			}
		} else if key.starts_with(INTERACTION_PREFIX) {
			match deserialize_interaction(value) {
				Ok(row) => state.interactions.push(row),
				Err(e) => {
					tracing::warn!(key = %key, "Skipping corrupt interaction row: {}", e);
					state.skipped += 1;
				}
			}
		} else {
			state.skipped += 1;
		}
	}

	state
		.similarities
		.sort_by_key(|r| (r.event_a, r.event_b));
	state
		.interactions
		.sort_by_key(|r| (r.user_id, r.event_id));
	state
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
	version: u32,
	entries: HashMap<String, String>,
}

/// Write all state to `<dir>/index.gz`, creating the directory if needed.
/// The file is written to a temporary name first and renamed into place.
pub fn save_to_directory(
	dir: &Path,
	similarities: &[EventSimilarity],
	interactions: &[InteractionRow],
	aggregator: Option<&AggregatorSnapshot>,
) -> Result<(), PersistenceError> {
	std::fs::create_dir_all(dir)?;

	let storage = serialize_to_storage(similarities, interactions, aggregator)?;
	let index = IndexFile {
		version: INDEX_VERSION,
		entries: storage
			.into_iter()
			.map(|(key, value)| (key, STANDARD.encode(value)))
			.collect(),
	};
	let json = serde_json::to_vec(&index)
		.map_err(|e| PersistenceError::Serialization(format!("Failed to serialize index: {}", e)))?;
	let compressed = compress(&json)?;

	let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
	std::fs::write(&tmp, &compressed)?;
	std::fs::rename(&tmp, dir.join(INDEX_FILE))?;
	Ok(())
}

/// Load state from `<dir>/index.gz`. A missing file yields empty state.
pub fn load_from_directory(dir: &Path) -> Result<LoadedState, PersistenceError> {
	let path = dir.join(INDEX_FILE);
	if !path.exists() {
		return Ok(LoadedState::default());
	}

	let raw_bytes = std::fs::read(&path)?;
	let json_bytes = if is_gzipped(&raw_bytes) {
		decompress(&raw_bytes)?
	} else {
		raw_bytes
	};

	let index: IndexFile = serde_json::from_slice(&json_bytes)
		.map_err(|e| PersistenceError::Corruption(format!("Invalid index JSON: {}", e)))?;
	if index.version != INDEX_VERSION {
		return Err(PersistenceError::Corruption(format!(
			"Unsupported index version: {}",
			index.version
		)));
	}

	let mut raw = HashMap::with_capacity(index.entries.len());
	for (key, b64_value) in &index.entries {
		let binary = STANDARD.decode(b64_value).map_err(|e| {
			PersistenceError::Corruption(format!("Invalid base64 for entry '{}': {}", key, e))
		})?;
		raw.insert(key.clone(), binary);
	}

	Ok(deserialize_from_storage(&raw))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::aggregator::PairAccumulator;

	fn similarity(a: i64, b: i64, score: f64, ts: u64) -> EventSimilarity {
		EventSimilarity {
			event_a: a,
			event_b: b,
			score,
			timestamp: ts,
		}
	}

	fn interaction(user: i64, event: i64, weight: f64, ts: u64) -> InteractionRow {
		InteractionRow {
			user_id: user,
			event_id: event,
			weight,
			timestamp: ts,
		}
	}

	fn snapshot() -> AggregatorSnapshot {
		AggregatorSnapshot {
			user_weights: vec![(1, 10, 0.4), (1, 20, 0.8)],
			norms: vec![(10, 0.4), (20, 0.8)],
			pairs: vec![(
				10,
				20,
				PairAccumulator {
					min_sum: 0.4,
					updated_at: 5,
					last_score: 0.4 / (0.4f64 * 0.8).sqrt(),
				},
			)],
		}
	}

	#[test]
	fn is_gzipped_detection() {
		let compressed = compress(b"test").unwrap();
		assert!(is_gzipped(&compressed));
		assert!(!is_gzipped(b"{}"));
		assert!(!is_gzipped(&[0x1f]));
	}

	#[test]
	fn interaction_row_rejects_bad_weight() {
		let mut bytes = serialize_interaction(&interaction(1, 2, 0.4, 3));
		bytes[16..24].copy_from_slice(&f64::NAN.to_bits().to_be_bytes());
		assert!(deserialize_interaction(&bytes).is_err());
		assert!(deserialize_interaction(&[0u8; 5]).is_err());
	}

	#[test]
	fn bulk_skips_corrupt_entries() {
		let mut raw = serialize_to_storage(
			&[similarity(1, 2, 0.5, 9)],
			&[interaction(7, 1, 0.8, 4)],
			Some(&snapshot()),
		)
		.unwrap();
		raw.insert("sim:3:4".to_string(), vec![1, 2, 3]);
		raw.insert("act:9:9".to_string(), vec![]);
		raw.insert("mystery".to_string(), vec![0]);

		let state = deserialize_from_storage(&raw);
		assert_eq!(state.similarities, vec![similarity(1, 2, 0.5, 9)]);
		assert_eq!(state.interactions, vec![interaction(7, 1, 0.8, 4)]);
		assert_eq!(state.aggregator, Some(snapshot()));
		assert_eq!(state.skipped, 3);
	}

	#[test]
	fn empty_snapshot_is_not_written() {
		let raw = serialize_to_storage(&[], &[], Some(&AggregatorSnapshot::default())).unwrap();
		assert!(!raw.contains_key(AGGREGATOR_KEY));
	}

	#[test]
	fn save_load_directory_roundtrip() {
		let dir = tempfile::tempdir().unwrap();
		let nested = dir.path().join("a").join("b");

		let sims = vec![similarity(1, 2, 0.25, 10), similarity(2, 5, 1.0, 11)];
		let rows = vec![interaction(1, 1, 0.4, 1), interaction(1, 2, 1.0, 2)];
		save_to_directory(&nested, &sims, &rows, Some(&snapshot())).unwrap();
		assert!(nested.join(INDEX_FILE).exists());
		assert!(!nested.join(format!("{}.tmp", INDEX_FILE)).exists());

		let state = load_from_directory(&nested).unwrap();
		assert_eq!(state.similarities, sims);
		assert_eq!(state.interactions, rows);
		assert_eq!(state.aggregator, Some(snapshot()));
		assert_eq!(state.skipped, 0);
	}

	#[test]
	fn load_from_missing_directory_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let state = load_from_directory(&dir.path().join("missing")).unwrap();
		assert!(state.similarities.is_empty());
		assert!(state.interactions.is_empty());
		assert!(state.aggregator.is_none());
	}

	#[test]
	fn unsupported_version_is_corruption() {
		let dir = tempfile::tempdir().unwrap();
		let json = br#"{"version": 99, "entries": {}}"#;
		std::fs::write(dir.path().join(INDEX_FILE), compress(json).unwrap()).unwrap();
		assert!(matches!(
			load_from_directory(dir.path()),
			Err(PersistenceError::Corruption(_))
		));
	}
}
