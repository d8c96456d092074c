//! Trait interfaces for subsystems the core relay treats as external collaborators: the
//! account scheduler, the account service, the KV store, and the Claude-Code request
//! validator. None of these are implemented here — production wiring supplies real
//! implementations; tests supply fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Account, AccountSelection};

#[derive(Debug, Error)]
pub enum CollabError {
	#[error("no account available for this request")]
	NoAccountAvailable,
	#[error("account not found: {0}")]
	AccountNotFound(String),
	#[error("access token unavailable for account {0}")]
	TokenUnavailable(String),
	#[error("collaborator call failed: {0}")]
	Other(#[from] anyhow::Error),
}

/// Owns sticky-session routing and account eviction/ranking policy. The core only ever calls
/// through this trait; it never inspects scheduler internals.
#[async_trait]
pub trait Scheduler: Send + Sync {
	async fn select_account_for_api_key(
		&self,
		api_key: &str,
		session_hash: Option<&str>,
		model: &str,
	) -> Result<AccountSelection, CollabError>;

	async fn mark_account_rate_limited(
		&self,
		account_id: &str,
		account_type: &str,
		session_hash: Option<&str>,
		reset_at: Option<i64>,
	) -> Result<(), CollabError>;

	async fn mark_account_blocked(
		&self,
		account_id: &str,
		account_type: &str,
		session_hash: Option<&str>,
	) -> Result<(), CollabError>;

	async fn mark_account_unauthorized(
		&self,
		account_id: &str,
		account_type: &str,
		session_hash: Option<&str>,
	) -> Result<(), CollabError>;

	async fn is_account_rate_limited(&self, account_id: &str, account_type: &str) -> bool;

	async fn remove_account_rate_limit(
		&self,
		account_id: &str,
		account_type: &str,
	) -> Result<(), CollabError>;
}

/// Account CRUD and per-account overload/internal-error bookkeeping.
#[async_trait]
pub trait AccountService: Send + Sync {
	async fn get_valid_access_token(&self, account_id: &str) -> Result<String, CollabError>;
	async fn get_account(&self, account_id: &str) -> Result<Account, CollabError>;
	async fn get_all_accounts(&self) -> Result<Vec<Account>, CollabError>;

	async fn mark_account_overloaded(
		&self,
		account_id: &str,
		duration_minutes: u32,
	) -> Result<(), CollabError>;
	async fn remove_account_overload(&self, account_id: &str) -> Result<(), CollabError>;
	async fn is_account_overloaded(&self, account_id: &str) -> bool;

	async fn record_server_error(&self, account_id: &str) -> Result<u64, CollabError>;
	async fn get_server_error_count(&self, account_id: &str) -> Result<u64, CollabError>;
	async fn clear_internal_errors(&self, account_id: &str) -> Result<(), CollabError>;

	async fn update_session_window_status(
		&self,
		account_id: &str,
		status: &str,
	) -> Result<(), CollabError>;
}

/// Atomic, TTL-aware counters. Readers tolerate missing keys as zero.
#[async_trait]
pub trait KvStore: Send + Sync {
	async fn incr(&self, key: &str) -> Result<i64, CollabError>;
	async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), CollabError>;
	async fn get(&self, key: &str) -> Result<Option<String>, CollabError>;
	async fn del(&self, key: &str) -> Result<(), CollabError>;
	async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> Result<(), CollabError>;
}

/// Decides whether an inbound request looks like it came from the real Claude Code CLI, as
/// opposed to a third-party client impersonating it. Drives the system-prompt injection in
/// §4.3 step 8.
#[async_trait]
pub trait ClaudeCodeValidator: Send + Sync {
	async fn validate(&self, headers: &http::HeaderMap, body: &serde_json::Value, path: &str) -> bool;
}

/// JSON-on-disk model → limits table, keyed by full model name.
pub trait PricingTable: Send + Sync {
	fn lookup(&self, model: &str) -> Option<crate::model::PricingEntry>;
}
