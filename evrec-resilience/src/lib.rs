// ---------------------------------------------------------------------------
// Resilience primitives: retry with exponential backoff
// ---------------------------------------------------------------------------
//
// Shared by every consumer loop in the workspace. A `RetryPolicy` describes
// the delay curve; a `Backoff` walks it one failure at a time; `retry` wraps
// an async operation that can simply be called again.
// ---------------------------------------------------------------------------

use std::future::Future;
use std::time::Duration;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	/// Delay before the first retry.
	pub base_delay: Duration,
	/// Upper bound for any single delay.
	pub max_delay: Duration,
	/// Growth factor applied per failed attempt.
	pub multiplier: f64,
	/// Total attempts (including the first) before `retry` gives up.
	/// `None` retries forever.
	pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(100),
			max_delay: Duration::from_secs(5),
			multiplier: 2.0,
			max_attempts: Some(5),
		}
	}
}

impl RetryPolicy {
	pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
		Self {
			base_delay,
			max_delay,
			..Default::default()
		}
	}

	pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
		self.max_attempts = max_attempts;
		self
	}

	/// Delay to wait after the `failures`-th consecutive failure (1-based).
	pub fn delay_for(&self, failures: u32) -> Duration {
		if failures == 0 {
			return Duration::ZERO;
		}
		let factor = self.multiplier.max(1.0).powi(failures.saturating_sub(1) as i32);
		let millis = self.base_delay.as_millis() as f64 * factor;
		let capped = millis.min(self.max_delay.as_millis() as f64);
		if !capped.is_finite() {
			return self.max_delay;
		}
		Duration::from_millis(capped as u64)
	}

	/// Start a fresh backoff sequence.
	pub fn backoff(&self) -> Backoff {
		Backoff {
			policy: self.clone(),
			failures: 0,
		}
	}
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Failure counter walking a [`RetryPolicy`]'s delay curve.
#[derive(Debug, Clone)]
pub struct Backoff {
	policy: RetryPolicy,
	failures: u32,
}

impl Backoff {
	/// Record a failure and return the delay before the next attempt, or
	/// `None` once the policy's attempt budget is spent.
	pub fn next_delay(&mut self) -> Option<Duration> {
		self.failures = self.failures.saturating_add(1);
		if let Some(max) = self.policy.max_attempts {
			if self.failures >= max {
				return None;
			}
		}
		Some(self.policy.delay_for(self.failures))
	}

	/// Consecutive failures recorded so far.
	pub fn failures(&self) -> u32 {
		self.failures
	}

	pub fn reset(&mut self) {
		self.failures = 0;
	}
}

// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds or the policy's attempt budget is spent.
/// The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
	F: FnMut(u32) -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let mut backoff = policy.backoff();
	let mut attempt = 1;
	loop {
		match op(attempt).await {
			Ok(value) => return Ok(value),
			Err(e) => match backoff.next_delay() {
				Some(delay) => {
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				None => return Err(e),
			},
		}
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
