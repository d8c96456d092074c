//! Generic exponential-backoff retry helper (§4.8), for auxiliary calls such as token refresh.
//! The relay orchestrator itself never retries dispatch at this layer.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

const DEFAULT_ATTEMPTS: u32 = 3;

/// Runs `f` up to `attempts` times, sleeping `2^i * 1000ms` between attempts. Returns the first
/// `Ok`, or the last `Err` if every attempt fails.
pub async fn with_backoff<T, E, F, Fut>(attempts: u32, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	let attempts = attempts.max(1);
	let mut last_err = None;
	for attempt in 0..attempts {
		match f().await {
			Ok(v) => return Ok(v),
			Err(e) => {
				if attempt + 1 < attempts {
					let delay = Duration::from_millis(1000 * 2u64.pow(attempt));
					debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");
					tokio::time::sleep(delay).await;
				}
				last_err = Some(e);
			},
		}
	}
	Err(last_err.expect("loop runs at least once"))
}

/// Convenience wrapper using the default attempt count (3).
pub async fn with_default_backoff<T, E, F, Fut>(f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
{
	with_backoff(DEFAULT_ATTEMPTS, f).await
}
