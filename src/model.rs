//! Shapes shared across the relay: accounts, health counters, usage records, and the
//! JSON-backed request body the preparer mutates in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A vendor account the relay can dispatch a request through.
///
/// Owned and mutated by the account-management subsystem; the core only reads fields here
/// and, through [`crate::collab::AccountService`], updates health flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub id: String,
	pub name: String,
	pub is_active: bool,
	pub status: String,
	#[serde(default)]
	pub proxy: Option<ProxyDescriptor>,
	#[serde(default)]
	pub ban_mode: bool,
	#[serde(default)]
	pub use_unified_client_id: bool,
	#[serde(default)]
	pub unified_client_id: Option<String>,
	#[serde(default)]
	pub use_unified_user_agent: bool,
}

/// Proxy descriptor as stored on an [`Account`]. See [`crate::proxy_agent`] for the factory
/// that turns this into a connectable [`crate::proxy_agent::ProxyAgent`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ProxyDescriptor {
	#[serde(rename = "type")]
	pub kind: ProxyKind,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
	Socks5,
	Http,
	Https,
}

impl std::fmt::Display for ProxyKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			ProxyKind::Socks5 => "socks5",
			ProxyKind::Http => "http",
			ProxyKind::Https => "https",
		};
		f.write_str(s)
	}
}

/// Returned by the scheduler for `(api_key, session_hash, model)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSelection {
	pub account_id: String,
	pub account_type: String,
}

/// Deterministic digest of request content used as sticky-session key. Requests without a
/// stable key route without affinity.
pub type SessionHash = Option<String>;

/// Per-request usage accounting, merged across the lifetime of a (possibly streamed) response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
	pub model: Option<String>,
	#[serde(default)]
	pub input_tokens: u64,
	#[serde(default)]
	pub output_tokens: u64,
	#[serde(default)]
	pub cache_creation_input_tokens: u64,
	#[serde(default)]
	pub cache_read_input_tokens: u64,
	#[serde(default)]
	pub cache_creation: Option<CacheCreationUsage>,
	pub account_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheCreationUsage {
	#[serde(default)]
	pub ephemeral_5m_input_tokens: u64,
	#[serde(default)]
	pub ephemeral_1h_input_tokens: u64,
}

impl UsageRecord {
	/// Sums token fields from `other` into `self`, keeping the richer `model`/`cache_creation`.
	pub fn merge(&mut self, other: &UsageRecord) {
		self.input_tokens += other.input_tokens;
		self.output_tokens += other.output_tokens;
		self.cache_creation_input_tokens += other.cache_creation_input_tokens;
		self.cache_read_input_tokens += other.cache_read_input_tokens;
		if let Some(cc) = &other.cache_creation {
			let mine = self.cache_creation.get_or_insert_with(Default::default);
			mine.ephemeral_5m_input_tokens += cc.ephemeral_5m_input_tokens;
			mine.ephemeral_1h_input_tokens += cc.ephemeral_1h_input_tokens;
		}
		if other.model.is_some() {
			self.model = other.model.clone();
		}
	}
}

/// Thin wrapper around the `serde_json::Value` request body so the preparer can do targeted,
/// path-based mutation without modelling every vendor field.
#[derive(Debug, Clone)]
pub struct RequestBody(pub Value);

impl RequestBody {
	pub fn model(&self) -> Option<&str> {
		self.0.get("model").and_then(Value::as_str)
	}

	pub fn set_model(&mut self, model: &str) {
		if let Some(obj) = self.0.as_object_mut() {
			obj.insert("model".to_string(), Value::String(model.to_string()));
		}
	}

	pub fn max_tokens(&self) -> Option<u64> {
		self.0.get("max_tokens").and_then(Value::as_u64)
	}

	pub fn set_max_tokens(&mut self, v: u64) {
		if let Some(obj) = self.0.as_object_mut() {
			obj.insert("max_tokens".to_string(), Value::from(v));
		}
	}

	pub fn is_streaming(&self) -> bool {
		self.0.get("stream").and_then(Value::as_bool).unwrap_or(false)
	}
}

/// Model-pricing entry used to clamp `max_tokens` (§4.3 step 6).
#[derive(Debug, Clone, Deserialize)]
pub struct PricingEntry {
	#[serde(default)]
	pub max_tokens: Option<u64>,
	#[serde(default)]
	pub max_output_tokens: Option<u64>,
}

impl PricingEntry {
	pub fn ceiling(&self) -> Option<u64> {
		self.max_tokens.or(self.max_output_tokens)
	}
}
