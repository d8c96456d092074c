//! Account health controller (§4.6). Classifies a vendor response into at most one health-flag
//! transition and applies it through the [`Scheduler`]/[`AccountService`] collaborators.

use http::HeaderMap;
use tracing::warn;

use crate::collab::{AccountService, CollabError, KvStore, Scheduler};
use crate::model::SessionHash;
use crate::telemetry::metrics::Metrics;

const UNAUTHORIZED_TTL_SECS: u64 = 300;
const UNAUTHORIZED_THRESHOLD: i64 = 1;
const SERVER_ERROR_THRESHOLD: u64 = 3;
const RATE_LIMIT_BODY_MARKER: &str = "exceed your account's rate limit";

/// Inputs needed to classify one response (§4.6). `body_snippet` only needs to contain enough
/// of the response body to check for the rate-limit marker string; callers may pass the full
/// body.
pub struct HealthClassifyInput<'a> {
	pub account_id: &'a str,
	pub account_type: &'a str,
	pub session_hash: SessionHash,
	pub status: u16,
	pub headers: &'a HeaderMap,
	pub body_snippet: &'a str,
	/// True when this status was synthesized locally (e.g. a connection timeout mapped to 504)
	/// rather than received from the vendor.
	pub synthesized: bool,
}

/// Applies exactly one branch of §4.6 for a non-2xx or 2xx response. Collaborator failures are
/// logged and swallowed — health bookkeeping never aborts the caller's response.
pub async fn classify(
	input: &HealthClassifyInput<'_>,
	scheduler: &dyn Scheduler,
	account_service: &dyn AccountService,
	kv: &dyn KvStore,
	overload_enabled_minutes: u32,
	metrics: Option<&Metrics>,
) {
	let session_hash = input.session_hash.as_deref();

	if (200..300).contains(&input.status) {
		clear_flags(input.account_id, input.account_type, input.headers, scheduler, account_service, kv, metrics).await;
		return;
	}

	if input.status == 401 {
		escalate_unauthorized(input, scheduler, kv, metrics).await;
		return;
	}

	if input.status == 403 {
		match scheduler.mark_account_blocked(input.account_id, input.account_type, session_hash).await {
			Ok(()) => {
				if let Some(m) = metrics {
					m.set_account_health_flag(input.account_id, "blocked", true);
				}
			},
			Err(e) => warn!(account_id = input.account_id, error = %e, "failed to mark account blocked"),
		}
		return;
	}

	if input.status == 429 || contains_rate_limit_marker(input.body_snippet) {
		escalate_rate_limited(input, scheduler, metrics).await;
		return;
	}

	if input.status == 529 {
		if overload_enabled_minutes > 0 {
			match account_service.mark_account_overloaded(input.account_id, overload_enabled_minutes).await {
				Ok(()) => {
					if let Some(m) = metrics {
						m.set_account_health_flag(input.account_id, "overloaded", true);
					}
				},
				Err(e) => warn!(account_id = input.account_id, error = %e, "failed to mark account overloaded"),
			}
		}
		return;
	}

	if (500..600).contains(&input.status) || input.synthesized {
		record_server_error(input.account_id, account_service).await;
	}
}

fn contains_rate_limit_marker(body: &str) -> bool {
	body.to_ascii_lowercase().contains(&RATE_LIMIT_BODY_MARKER.to_ascii_lowercase())
}

async fn escalate_unauthorized(input: &HealthClassifyInput<'_>, scheduler: &dyn Scheduler, kv: &dyn KvStore, metrics: Option<&Metrics>) {
	let key = format!("401_errors:{}", input.account_id);
	let count = match kv.incr(&key).await {
		Ok(c) => c,
		Err(e) => {
			warn!(account_id = input.account_id, error = %e, "failed to increment 401 counter");
			return;
		},
	};
	if let Err(e) = kv.expire(&key, UNAUTHORIZED_TTL_SECS).await {
		warn!(account_id = input.account_id, error = %e, "failed to set 401 counter ttl");
	}
	if count >= UNAUTHORIZED_THRESHOLD {
		match scheduler
			.mark_account_unauthorized(input.account_id, input.account_type, input.session_hash.as_deref())
			.await
		{
			Ok(()) => {
				if let Some(m) = metrics {
					m.set_account_health_flag(input.account_id, "unauthorized", true);
				}
			},
			Err(e) => warn!(account_id = input.account_id, error = %e, "failed to mark account unauthorized"),
		}
	}
}

async fn escalate_rate_limited(input: &HealthClassifyInput<'_>, scheduler: &dyn Scheduler, metrics: Option<&Metrics>) {
	let reset_at = input
		.headers
		.get("anthropic-ratelimit-unified-reset")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<i64>().ok());
	match scheduler
		.mark_account_rate_limited(input.account_id, input.account_type, input.session_hash.as_deref(), reset_at)
		.await
	{
		Ok(()) => {
			if let Some(m) = metrics {
				m.set_account_health_flag(input.account_id, "rate_limited", true);
			}
		},
		Err(e) => warn!(account_id = input.account_id, error = %e, "failed to mark account rate limited"),
	}
}

async fn record_server_error(account_id: &str, account_service: &dyn AccountService) {
	match account_service.record_server_error(account_id).await {
		Ok(count) if count >= SERVER_ERROR_THRESHOLD => {
			warn!(account_id, count, "account crossed server-error threshold");
		},
		Ok(_) => {},
		Err(e) => warn!(account_id, error = %e, "failed to record server error"),
	}
}

async fn clear_flags(
	account_id: &str,
	account_type: &str,
	headers: &HeaderMap,
	scheduler: &dyn Scheduler,
	account_service: &dyn AccountService,
	kv: &dyn KvStore,
	metrics: Option<&Metrics>,
) {
	let key = format!("401_errors:{account_id}");
	if let Err(e) = kv.del(&key).await {
		warn!(account_id, error = %e, "failed to clear 401 counter");
	}
	if let Err(e) = account_service.clear_internal_errors(account_id).await {
		warn!(account_id, error = %e, "failed to clear internal error counter");
	}
	if scheduler.is_account_rate_limited(account_id, account_type).await {
		match scheduler.remove_account_rate_limit(account_id, account_type).await {
			Ok(()) => {
				if let Some(m) = metrics {
					m.set_account_health_flag(account_id, "rate_limited", false);
				}
			},
			Err(e) => warn!(account_id, error = %e, "failed to clear rate-limit flag"),
		}
	}
	if account_service.is_account_overloaded(account_id).await {
		match account_service.remove_account_overload(account_id).await {
			Ok(()) => {
				if let Some(m) = metrics {
					m.set_account_health_flag(account_id, "overloaded", false);
				}
			},
			Err(e) => warn!(account_id, error = %e, "failed to clear overload flag"),
		}
	}
	if let Some(status) = headers
		.iter()
		.find(|(name, _)| name.as_str().eq_ignore_ascii_case("anthropic-ratelimit-unified-5h-status"))
		.and_then(|(_, v)| v.to_str().ok())
	{
		if let Err(e) = account_service.update_session_window_status(account_id, status).await {
			warn!(account_id, error = %e, "failed to persist session window status");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use parking_lot::Mutex;
	use std::collections::HashMap;
	use std::sync::Arc;

	#[derive(Default)]
	struct FakeCollab {
		unauthorized: Mutex<Vec<String>>,
		blocked: Mutex<Vec<String>>,
		rate_limited: Mutex<Vec<(String, Option<i64>)>>,
		rate_limited_flag: Mutex<bool>,
		overloaded: Mutex<Vec<(String, u32)>>,
		overloaded_flag: Mutex<bool>,
		server_errors: Mutex<u64>,
		kv: Mutex<HashMap<String, i64>>,
	}

	#[async_trait]
	impl Scheduler for FakeCollab {
		async fn select_account_for_api_key(
			&self,
			_api_key: &str,
			_session_hash: Option<&str>,
			_model: &str,
		) -> Result<crate::model::AccountSelection, CollabError> {
			unimplemented!()
		}
		async fn mark_account_rate_limited(
			&self,
			account_id: &str,
			_account_type: &str,
			_session_hash: Option<&str>,
			reset_at: Option<i64>,
		) -> Result<(), CollabError> {
			self.rate_limited.lock().push((account_id.to_string(), reset_at));
			*self.rate_limited_flag.lock() = true;
			Ok(())
		}
		async fn mark_account_blocked(
			&self,
			account_id: &str,
			_account_type: &str,
			_session_hash: Option<&str>,
		) -> Result<(), CollabError> {
			self.blocked.lock().push(account_id.to_string());
			Ok(())
		}
		async fn mark_account_unauthorized(
			&self,
			account_id: &str,
			_account_type: &str,
			_session_hash: Option<&str>,
		) -> Result<(), CollabError> {
			self.unauthorized.lock().push(account_id.to_string());
			Ok(())
		}
		async fn is_account_rate_limited(&self, _account_id: &str, _account_type: &str) -> bool {
			*self.rate_limited_flag.lock()
		}
		async fn remove_account_rate_limit(&self, _account_id: &str, _account_type: &str) -> Result<(), CollabError> {
			*self.rate_limited_flag.lock() = false;
			Ok(())
		}
	}

	#[async_trait]
	impl AccountService for FakeCollab {
		async fn get_valid_access_token(&self, _account_id: &str) -> Result<String, CollabError> {
			unimplemented!()
		}
		async fn get_account(&self, _account_id: &str) -> Result<crate::model::Account, CollabError> {
			unimplemented!()
		}
		async fn get_all_accounts(&self) -> Result<Vec<crate::model::Account>, CollabError> {
			unimplemented!()
		}
		async fn mark_account_overloaded(&self, account_id: &str, duration_minutes: u32) -> Result<(), CollabError> {
			self.overloaded.lock().push((account_id.to_string(), duration_minutes));
			*self.overloaded_flag.lock() = true;
			Ok(())
		}
		async fn remove_account_overload(&self, _account_id: &str) -> Result<(), CollabError> {
			*self.overloaded_flag.lock() = false;
			Ok(())
		}
		async fn is_account_overloaded(&self, _account_id: &str) -> bool {
			*self.overloaded_flag.lock()
		}
		async fn record_server_error(&self, _account_id: &str) -> Result<u64, CollabError> {
			let mut c = self.server_errors.lock();
			*c += 1;
			Ok(*c)
		}
		async fn get_server_error_count(&self, _account_id: &str) -> Result<u64, CollabError> {
			Ok(*self.server_errors.lock())
		}
		async fn clear_internal_errors(&self, _account_id: &str) -> Result<(), CollabError> {
			*self.server_errors.lock() = 0;
			Ok(())
		}
		async fn update_session_window_status(&self, _account_id: &str, _status: &str) -> Result<(), CollabError> {
			Ok(())
		}
	}

	#[async_trait]
	impl KvStore for FakeCollab {
		async fn incr(&self, key: &str) -> Result<i64, CollabError> {
			let mut kv = self.kv.lock();
			let v = kv.entry(key.to_string()).or_insert(0);
			*v += 1;
			Ok(*v)
		}
		async fn expire(&self, _key: &str, _ttl_secs: u64) -> Result<(), CollabError> {
			Ok(())
		}
		async fn get(&self, key: &str) -> Result<Option<String>, CollabError> {
			Ok(self.kv.lock().get(key).map(|v| v.to_string()))
		}
		async fn del(&self, key: &str) -> Result<(), CollabError> {
			self.kv.lock().remove(key);
			Ok(())
		}
		async fn setex(&self, _key: &str, _ttl_secs: u64, _value: &str) -> Result<(), CollabError> {
			Ok(())
		}
	}

	#[tokio::test]
	async fn first_401_escalates_immediately() {
		let fake = Arc::new(FakeCollab::default());
		let headers = HeaderMap::new();
		let input = HealthClassifyInput {
			account_id: "acc1",
			account_type: "shared",
			session_hash: None,
			status: 401,
			headers: &headers,
			body_snippet: "",
			synthesized: false,
		};
		classify(&input, fake.as_ref(), fake.as_ref(), fake.as_ref(), 10, None).await;
		assert_eq!(fake.unauthorized.lock().as_slice(), &["acc1".to_string()]);
	}

	#[tokio::test]
	async fn rate_limit_marker_in_body_escalates_even_on_200_status_range() {
		let fake = Arc::new(FakeCollab::default());
		let headers = HeaderMap::new();
		let input = HealthClassifyInput {
			account_id: "acc1",
			account_type: "shared",
			session_hash: None,
			status: 400,
			headers: &headers,
			body_snippet: "You exceed your account's rate limit for this model",
			synthesized: false,
		};
		classify(&input, fake.as_ref(), fake.as_ref(), fake.as_ref(), 10, None).await;
		assert_eq!(fake.rate_limited.lock().len(), 1);
	}

	#[tokio::test]
	async fn overload_skipped_when_disabled() {
		let fake = Arc::new(FakeCollab::default());
		let headers = HeaderMap::new();
		let input = HealthClassifyInput {
			account_id: "acc1",
			account_type: "shared",
			session_hash: None,
			status: 529,
			headers: &headers,
			body_snippet: "",
			synthesized: false,
		};
		classify(&input, fake.as_ref(), fake.as_ref(), fake.as_ref(), 0, None).await;
		assert!(fake.overloaded.lock().is_empty());
	}

	#[tokio::test]
	async fn success_clears_flags() {
		let fake = Arc::new(FakeCollab::default());
		*fake.rate_limited_flag.lock() = true;
		*fake.overloaded_flag.lock() = true;
		let headers = HeaderMap::new();
		let input = HealthClassifyInput {
			account_id: "acc1",
			account_type: "shared",
			session_hash: None,
			status: 200,
			headers: &headers,
			body_snippet: "",
			synthesized: false,
		};
		classify(&input, fake.as_ref(), fake.as_ref(), fake.as_ref(), 10, None).await;
		assert!(!*fake.rate_limited_flag.lock());
		assert!(!*fake.overloaded_flag.lock());
	}
}
