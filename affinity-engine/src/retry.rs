// ---------------------------------------------------------------------------
// Retry with exponential backoff
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::AffinityError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub initial_delay_ms: u64,
	pub factor: f64,
	pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_delay_ms: 200,
			factor: 2.0,
			max_delay_ms: 5_000,
		}
	}
}

impl RetryPolicy {
	/// Delay before retry number `retry` (1-based).
	pub fn delay_for(&self, retry: u32) -> Duration {
		let exp = self.factor.powi(retry.saturating_sub(1) as i32);
		let ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
		Duration::from_millis(ms.max(0.0) as u64)
	}
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Only [`AffinityError::is_retryable`] errors are retried.
pub async fn with_backoff<T, F, Fut>(
	policy: &RetryPolicy,
	label: &str,
	mut op: F,
) -> Result<T, AffinityError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, AffinityError>>,
{
	let attempts = policy.max_attempts.max(1);
	let mut attempt = 1;
	loop {
		match op().await {
			Ok(value) => return Ok(value),
			Err(e) if e.is_retryable() && attempt < attempts => {
				let delay = policy.delay_for(attempt);
				tracing::warn!(
					op = label,
					attempt,
					delay_ms = delay.as_millis() as u64,
					error = %e,
					"Retrying after upstream failure"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			Err(e) => return Err(e),
		}
	}
}
