// ---------------------------------------------------------------------------
// Binary wire codec for stream records
// ---------------------------------------------------------------------------
//
// Interaction record (25 bytes, big-endian):
//   [8B userId i64][8B eventId i64][1B action][8B timestamp u64]
//
// Similarity record (32 bytes, big-endian):
//   [8B eventA i64][8B eventB i64][8B score f64 bits][8B timestamp u64]
// ---------------------------------------------------------------------------

use thiserror::Error;

use crate::types::{ActionKind, EventSimilarity, InteractionEvent};

pub const INTERACTION_RECORD_LEN: usize = 25;
pub const SIMILARITY_RECORD_LEN: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
	#[error("Record length {actual}, expected {expected}")]
	Length { expected: usize, actual: usize },
	#[error("Unknown action code: {0}")]
	UnknownAction(u8),
	#[error("Invalid score: {0}")]
	InvalidScore(f64),
	#[error("Self-pair for event {0}")]
	SelfPair(i64),
}

fn read_i64_be(data: &[u8], offset: usize) -> i64 {
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&data[offset..offset + 8]);
	i64::from_be_bytes(buf)
}

fn read_u64_be(data: &[u8], offset: usize) -> u64 {
	let mut buf = [0u8; 8];
	buf.copy_from_slice(&data[offset..offset + 8]);
	u64::from_be_bytes(buf)
}

fn check_len(data: &[u8], expected: usize) -> Result<(), CodecError> {
	if data.len() != expected {
		return Err(CodecError::Length {
			expected,
			actual: data.len(),
		});
	}
	Ok(())
}

// ---------------------------------------------------------------------------
// Interaction records
// ---------------------------------------------------------------------------

pub fn encode_interaction(event: &InteractionEvent) -> Vec<u8> {
	let mut buf = Vec::with_capacity(INTERACTION_RECORD_LEN);
	buf.extend_from_slice(&event.user_id.to_be_bytes());
	buf.extend_from_slice(&event.event_id.to_be_bytes());
	buf.push(event.kind.code());
	buf.extend_from_slice(&event.timestamp.to_be_bytes());
	buf
}

pub fn decode_interaction(data: &[u8]) -> Result<InteractionEvent, CodecError> {
	check_len(data, INTERACTION_RECORD_LEN)?;
	let code = data[16];
	let kind = ActionKind::from_code(code).ok_or(CodecError::UnknownAction(code))?;
	Ok(InteractionEvent {
		user_id: read_i64_be(data, 0),
		event_id: read_i64_be(data, 8),
		kind,
		timestamp: read_u64_be(data, 17),
	})
}

// ---------------------------------------------------------------------------
// Similarity records
// ---------------------------------------------------------------------------

pub fn encode_similarity(record: &EventSimilarity) -> Vec<u8> {
	let mut buf = Vec::with_capacity(SIMILARITY_RECORD_LEN);
	buf.extend_from_slice(&record.event_a.to_be_bytes());
	buf.extend_from_slice(&record.event_b.to_be_bytes());
	buf.extend_from_slice(&record.score.to_bits().to_be_bytes());
	buf.extend_from_slice(&record.timestamp.to_be_bytes());
	buf
}

/// Decode a similarity record. The pair is returned in canonical order.
pub fn decode_similarity(data: &[u8]) -> Result<EventSimilarity, CodecError> {
	check_len(data, SIMILARITY_RECORD_LEN)?;
	let a = read_i64_be(data, 0);
	let b = read_i64_be(data, 8);
	let score = f64::from_bits(read_u64_be(data, 16));
	if !score.is_finite() || !(0.0..=1.0).contains(&score) {
		return Err(CodecError::InvalidScore(score));
	}
	if a == b {
		return Err(CodecError::SelfPair(a));
	}
	Ok(EventSimilarity {
		event_a: a.min(b),
		event_b: a.max(b),
		score,
		timestamp: read_u64_be(data, 24),
	})
}
