use thiserror::Error;

use crate::codec::CodecError;
use crate::persistence::PersistenceError;
use crate::stream::StreamError;

/// Typed error variants for the recommendation engine.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Invalid configuration: {0}")]
	Config(String),
	#[error("Codec error: {0}")]
	Codec(#[from] CodecError),
	#[error("Stream error: {0}")]
	Stream(#[from] StreamError),
	#[error("Persistence error: {0}")]
	Persistence(#[from] PersistenceError),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Engine is shutting down")]
	ShutDown,
}

impl EngineError {
	/// Machine-readable error code for this variant.
	pub fn code(&self) -> &str {
		match self {
			Self::InvalidArgument(_) => "EVREC_INVALID_ARGUMENT",
			Self::Config(_) => "EVREC_CONFIG",
			Self::Codec(_) => "EVREC_CODEC",
			Self::Stream(_) => "EVREC_STREAM",
			Self::Persistence(_) => "EVREC_PERSISTENCE",
			Self::Io(_) => "EVREC_IO",
			Self::Serialization(_) => "EVREC_SERIALIZATION",
			Self::ShutDown => "EVREC_SHUT_DOWN",
		}
	}

	pub fn to_json_rpc_error(&self) -> serde_json::Value {
		serde_json::json!({
			"engineCode": self.code(),
			"message": self.to_string(),
		})
	}
}
