// ---------------------------------------------------------------------------
// Integration tests for evrec-engine JSON-RPC 2.0 / NDJSON protocol
// ---------------------------------------------------------------------------
//
// Each test spawns a fresh evrec-engine binary and communicates via
// stdin/stdout using newline-delimited JSON-RPC 2.0 messages. Similarities
// are computed in the background, so tests poll `store/stats` until the
// pipeline has caught up.
// ---------------------------------------------------------------------------

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct EngineProcess {
	child: Child,
	reader: BufReader<std::process::ChildStdout>,
	next_id: AtomicU64,
}

impl EngineProcess {
	fn spawn() -> Self {
		Self::spawn_with(&[])
	}

	fn spawn_with(extra_args: &[&str]) -> Self {
		let bin = env!("CARGO_BIN_EXE_evrec-engine");
		let mut child = Command::new(bin)
			.args(["--poll-interval-ms", "20", "--partitions", "2"])
			.args(extra_args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()
			.expect("failed to spawn evrec-engine");

		let stdout = child.stdout.take().expect("no stdout");
		let reader = BufReader::new(stdout);

		Self {
			child,
			reader,
			next_id: AtomicU64::new(1),
		}
	}

	fn send(&mut self, method: &str, params: Value) -> RpcResponse {
		let id = self.next_id.fetch_add(1, Ordering::SeqCst);
		let request = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});

		let stdin = self.child.stdin.as_mut().expect("no stdin");
		let mut line = serde_json::to_string(&request).unwrap();
		line.push('\n');
		stdin.write_all(line.as_bytes()).unwrap();
		stdin.flush().unwrap();

		loop {
			let mut buf = String::new();
			let bytes_read = self
				.reader
				.read_line(&mut buf)
				.expect("failed to read from stdout");
			if bytes_read == 0 {
				panic!("unexpected EOF while waiting for response to id={}", id);
			}
			let buf = buf.trim();
			if buf.is_empty() {
				continue;
			}
			let parsed: Value = serde_json::from_str(buf)
				.unwrap_or_else(|e| panic!("invalid JSON from engine: {e}\nline: {buf}"));
			if parsed.get("id").is_none() {
				continue;
			}
			let resp_id = parsed["id"].as_u64().expect("response id is not u64");
			assert_eq!(resp_id, id, "response id mismatch");
			if let Some(error) = parsed.get("error") {
				return RpcResponse::Error(error.clone());
			}
			return RpcResponse::Ok(parsed.get("result").cloned().unwrap_or(Value::Null));
		}
	}

	fn call(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Ok(v) => v,
			RpcResponse::Error(e) => panic!("expected success, got error: {e}"),
		}
	}

	fn call_err(&mut self, method: &str, params: Value) -> Value {
		match self.send(method, params) {
			RpcResponse::Error(e) => e,
			RpcResponse::Ok(v) => panic!("expected error, got success: {v}"),
		}
	}

	fn collect(&mut self, user: i64, event: i64, action: &str, timestamp: u64) {
		self.call(
			"actions/collect",
			json!({
				"userId": user,
				"eventId": event,
				"actionType": action,
				"timestamp": timestamp,
			}),
		);
	}

	/// Repeat a call until `ready` holds for its result or five seconds pass.
	fn poll_until(&mut self, method: &str, params: Value, ready: impl Fn(&Value) -> bool) -> Value {
		let deadline = Instant::now() + Duration::from_secs(5);
		loop {
			let result = self.call(method, params.clone());
			if ready(&result) {
				return result;
			}
			assert!(Instant::now() < deadline, "pipeline did not settle: {result}");
			std::thread::sleep(Duration::from_millis(20));
		}
	}

	fn wait_for(&mut self, ready: impl Fn(&Value) -> bool) -> Value {
		self.poll_until("store/stats", json!({}), ready)
	}

	/// Stop the engine by closing stdin and wait for it to exit.
	fn close(mut self) {
		drop(self.child.stdin.take());
		let status = self.child.wait().expect("wait failed");
		assert!(status.success(), "engine exited with {status}");
	}
}

impl Drop for EngineProcess {
	fn drop(&mut self) {
		drop(self.child.stdin.take());
		let _ = self.child.wait();
	}
}

#[derive(Debug)]
enum RpcResponse {
	Ok(Value),
	Error(Value),
}

fn ids(result: &Value) -> Vec<i64> {
	result["recommendations"]
		.as_array()
		.expect("recommendations should be an array")
		.iter()
		.map(|r| r["eventId"].as_i64().unwrap())
		.collect()
}

fn scores(result: &Value) -> Vec<f64> {
	result["recommendations"]
		.as_array()
		.expect("recommendations should be an array")
		.iter()
		.map(|r| r["score"].as_f64().unwrap())
		.collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn single_viewer_makes_events_fully_similar() {
	let mut proc = EngineProcess::spawn();
	proc.collect(1, 100, "VIEW", 1);
	proc.collect(1, 200, "VIEW", 2);
	proc.wait_for(|s| s["similarities"] == 1);

	let result = proc.call(
		"recommendations/similarEvents",
		json!({ "eventId": 100, "userId": 99, "maxResults": 5 }),
	);
	assert_eq!(ids(&result), vec![200]);
	assert!((scores(&result)[0] - 1.0).abs() < 1e-9);
}

#[test]
fn cold_start_user_gets_empty_list() {
	let mut proc = EngineProcess::spawn();
	let result = proc.call(
		"recommendations/forUser",
		json!({ "userId": 42, "maxResults": 10 }),
	);
	assert_eq!(result, json!({ "recommendations": [] }));
}

#[test]
fn recommends_events_liked_by_similar_users() {
	let mut proc = EngineProcess::spawn();
	// Users 1 and 2 both like 10 and 20; user 3 only likes 10.
	proc.collect(1, 10, "LIKE", 1);
	proc.collect(1, 20, "LIKE", 2);
	proc.collect(2, 10, "LIKE", 3);
	proc.collect(2, 20, "LIKE", 4);
	proc.collect(3, 10, "LIKE", 5);
	proc.wait_for(|s| s["interactions"] == 5 && s["similarities"] == 1);

	let result = proc.call(
		"recommendations/forUser",
		json!({ "userId": 3, "maxResults": 5 }),
	);
	assert_eq!(ids(&result), vec![20]);

	// Already-seen events never come back.
	let result = proc.call(
		"recommendations/similarEvents",
		json!({ "eventId": 10, "userId": 1, "maxResults": 5 }),
	);
	assert!(ids(&result).is_empty());
}

#[test]
fn interactions_count_sums_weights() {
	let mut proc = EngineProcess::spawn();
	proc.collect(1, 5, "VIEW", 1);
	proc.collect(1, 5, "REGISTER", 2);
	proc.collect(2, 5, "LIKE", 3);

	let result = proc.poll_until(
		"recommendations/interactionsCount",
		json!({ "eventIds": [5, 6] }),
		|r| (scores(r)[0] - 1.8).abs() < 1e-9,
	);
	assert_eq!(ids(&result), vec![5, 6]);
	assert_eq!(scores(&result)[1], 0.0);
}

#[test]
fn invalid_requests_are_rejected() {
	let mut proc = EngineProcess::spawn();

	let err = proc.call_err(
		"recommendations/forUser",
		json!({ "userId": 1, "maxResults": 0 }),
	);
	assert_eq!(err["code"], -32602);
	assert_eq!(err["data"]["engineCode"], "EVREC_INVALID_ARGUMENT");

	let err = proc.call_err("actions/collect", json!({ "userId": 1 }));
	assert_eq!(err["code"], -32602);

	let err = proc.call_err("store/explode", json!({}));
	assert_eq!(err["code"], -32601);

	// Server still healthy afterwards
	let stats = proc.call("store/stats", json!({}));
	assert_eq!(stats["similarities"], 0);
}

#[test]
fn state_persists_across_restarts() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().to_str().unwrap().to_string();

	let mut proc = EngineProcess::spawn_with(&["--storage-path", &path]);
	proc.collect(1, 10, "LIKE", 1);
	proc.collect(1, 20, "LIKE", 2);
	proc.wait_for(|s| s["similarities"] == 1 && s["interactions"] == 2);
	proc.close();

	assert!(dir.path().join("index.gz").exists());

	let mut proc = EngineProcess::spawn_with(&["--storage-path", &path]);
	let stats = proc.call("store/stats", json!({}));
	assert_eq!(stats["similarities"], 1);
	assert_eq!(stats["interactions"], 2);

	let result = proc.call(
		"recommendations/similarEvents",
		json!({ "eventId": 20, "userId": 7, "maxResults": 3 }),
	);
	assert_eq!(ids(&result), vec![10]);
}

#[test]
fn acknowledged_actions_survive_immediate_close() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().to_str().unwrap().to_string();

	// Close right after the last acknowledgement, without waiting for the
	// pipeline to catch up.
	let mut proc = EngineProcess::spawn_with(&["--storage-path", &path]);
	proc.collect(1, 10, "VIEW", 1);
	proc.collect(1, 20, "VIEW", 2);
	proc.collect(2, 30, "LIKE", 3);
	proc.close();

	let mut proc = EngineProcess::spawn_with(&["--storage-path", &path]);
	let stats = proc.call("store/stats", json!({}));
	assert_eq!(stats["interactions"], 3);
	assert_eq!(stats["similarities"], 1);

	let result = proc.call(
		"recommendations/similarEvents",
		json!({ "eventId": 10, "userId": 9, "maxResults": 3 }),
	);
	assert_eq!(ids(&result), vec![20]);
	assert!((scores(&result)[0] - 1.0).abs() < 1e-9);
}
