// ---------------------------------------------------------------------------
// EngineServer: JSON-RPC dispatcher
// ---------------------------------------------------------------------------
//
// Routes JSON-RPC 2.0 requests (NDJSON over stdin) to the recommendation
// service: a `run()` loop, a `dispatch()` match, and free-standing handler
// functions for each method. Requests are answered in arrival order.
// ---------------------------------------------------------------------------

use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::error::EngineError;
use crate::protocol::*;
use crate::service::{current_timestamp_ms, RecommendationService};
use crate::transport::NdjsonTransport;
use crate::types::{ActionKind, EventId, InteractionEvent, RecommendedEvent, UserId};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct EngineServer {
	transport: NdjsonTransport,
	service: RecommendationService,
}

impl EngineServer {
	pub fn new(transport: NdjsonTransport, service: RecommendationService) -> Self {
		Self { transport, service }
	}

	/// Serve requests from stdin until it closes.
	pub async fn run(&mut self) -> Result<(), EngineError> {
		self.serve(BufReader::new(tokio::io::stdin())).await
	}

	async fn serve<R: AsyncBufRead + Unpin>(&mut self, reader: R) -> Result<(), EngineError> {
		let mut lines = reader.lines();
		while let Some(line) = lines.next_line().await? {
			if line.trim().is_empty() {
				continue;
			}

			let request: JsonRpcRequest = match serde_json::from_str(&line) {
				Ok(r) => r,
				Err(e) => {
					tracing::error!("Failed to parse request: {}", e);
					continue;
				}
			};

			self.dispatch(request).await;
		}
		tracing::info!("Input closed");
		Ok(())
	}

	/// Hand back the service, e.g. for an orderly shutdown.
	pub fn into_service(self) -> RecommendationService {
		self.service
	}

	// -- Dispatch ------------------------------------------------------------

	async fn dispatch(&mut self, req: JsonRpcRequest) {
		let id = req.id;
		match self.route(&req.method, req.params).await {
			Some(Ok(value)) => self.transport.write_response(id, value),
			Some(Err(e)) => self.transport.write_error(
				id,
				rpc_code(&e),
				e.to_string(),
				Some(e.to_json_rpc_error()),
			),
			None => self.transport.write_error(
				id,
				METHOD_NOT_FOUND,
				format!("Unknown method: {}", req.method),
				None,
			),
		}
	}

	/// Run a method. `None` means the method does not exist.
	async fn route(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Option<Result<serde_json::Value, EngineError>> {
		let service = &self.service;
		let result = match method {
			// -- Queries -------------------------------------------------
			"recommendations/forUser" => handle_for_user(service, params),
			"recommendations/similarEvents" => handle_similar_events(service, params),
			"recommendations/interactionsCount" => handle_interactions_count(service, params),

			// -- Ingress -------------------------------------------------
			"actions/collect" => handle_collect(service, params).await,

			// -- Store ---------------------------------------------------
			"store/save" => service.save().map(|_| serde_json::json!({})),
			"store/stats" => serde_json::to_value(service.stats())
				.map_err(|e| EngineError::Serialization(e.to_string())),

			_ => return None,
		};
		Some(result)
	}
}

fn rpc_code(error: &EngineError) -> i32 {
	match error {
		EngineError::InvalidArgument(_) => INVALID_PARAMS,
		_ => ENGINE_ERROR,
	}
}

// ---------------------------------------------------------------------------
// Param types
// ---------------------------------------------------------------------------

fn parse_params<T: serde::de::DeserializeOwned>(
	params: serde_json::Value,
) -> Result<T, EngineError> {
	serde_json::from_value(params)
		.map_err(|e| EngineError::InvalidArgument(format!("Invalid params: {}", e)))
}

/// `maxResults` must be a positive integer.
fn result_limit(max_results: i64) -> Result<usize, EngineError> {
	if max_results <= 0 {
		return Err(EngineError::InvalidArgument(format!(
			"maxResults must be positive, got {}",
			max_results
		)));
	}
	Ok(max_results as usize)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForUserParams {
	user_id: UserId,
	max_results: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarEventsParams {
	event_id: EventId,
	user_id: UserId,
	max_results: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InteractionsCountParams {
	event_ids: Vec<EventId>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectParams {
	user_id: UserId,
	event_id: EventId,
	action_type: ActionKind,
	timestamp: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn recommendations(results: Vec<RecommendedEvent>) -> serde_json::Value {
	serde_json::json!({ "recommendations": results })
}

fn handle_for_user(
	service: &RecommendationService,
	params: serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
	let p: ForUserParams = parse_params(params)?;
	let limit = result_limit(p.max_results)?;
	Ok(recommendations(service.recommend_for_user(p.user_id, limit)))
}

fn handle_similar_events(
	service: &RecommendationService,
	params: serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
	let p: SimilarEventsParams = parse_params(params)?;
	let limit = result_limit(p.max_results)?;
	Ok(recommendations(service.similar_events(p.event_id, p.user_id, limit)))
}

fn handle_interactions_count(
	service: &RecommendationService,
	params: serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
	let p: InteractionsCountParams = parse_params(params)?;
	Ok(recommendations(service.interaction_scores(&p.event_ids)))
}

async fn handle_collect(
	service: &RecommendationService,
	params: serde_json::Value,
) -> Result<serde_json::Value, EngineError> {
	let p: CollectParams = parse_params(params)?;
	service
		.collect(InteractionEvent {
			user_id: p.user_id,
			event_id: p.event_id,
			kind: p.action_type,
			timestamp: p.timestamp.unwrap_or_else(current_timestamp_ms),
		})
		.await?;
	Ok(serde_json::json!({}))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
