//! Proxy agent factory (§4.2). Turns an [`Account`]'s proxy descriptor into a cached,
//! connectable [`ProxyAgent`], and masks credentials for safe logging.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{ProxyDescriptor, ProxyKind};

#[derive(Debug, Error)]
pub enum ProxyAgentError {
	#[error("proxy descriptor missing required field: {0}")]
	MissingField(&'static str),
	#[error("unsupported proxy type: {0}")]
	UnsupportedType(String),
	#[error("proxy port out of range: {0}")]
	PortOutOfRange(u32),
	#[error("invalid proxy descriptor json: {0}")]
	InvalidJson(#[from] serde_json::Error),
}

/// Raw wire shape accepted by [`ProxyAgentFactory::from_json`]; `type`/`host`/`port` are
/// mandatory, matched against the validation rules in §4.2.
#[derive(Debug, Deserialize)]
struct RawProxyDescriptor {
	#[serde(rename = "type")]
	kind: Option<String>,
	host: Option<String>,
	port: Option<u32>,
	username: Option<String>,
	password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpPreference {
	V4,
	V6,
}

/// A connectable, cached proxy endpoint. Immutable after creation; [`ProxyAgentFactory`] hands
/// out `Arc<ProxyAgent>` so callers keep a stable reference even as the cache evolves.
#[derive(Debug, Clone)]
pub struct ProxyAgent {
	pub kind: ProxyKind,
	pub host: String,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
	pub ip_preference: IpPreference,
	pub pool_limits: PoolLimits,
}

/// Keep-alive / pool sizing applied to sockets dialed through this agent (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
	pub keep_alive_secs: u64,
	pub max_sockets: usize,
	pub max_idle_sockets: usize,
}

impl Default for PoolLimits {
	fn default() -> Self {
		PoolLimits {
			keep_alive_secs: 30,
			max_sockets: 50,
			max_idle_sockets: 10,
		}
	}
}

impl ProxyAgent {
	/// Basic auth payload for an HTTP(S) CONNECT tunnel, if credentials are present (§4.1).
	pub fn basic_auth(&self) -> Option<String> {
		let user = self.username.as_deref().unwrap_or("");
		let pass = self.password.as_deref().unwrap_or("");
		if self.username.is_none() && self.password.is_none() {
			return None;
		}
		use base64::Engine;
		let raw = format!("{user}:{pass}");
		Some(base64::engine::general_purpose::STANDARD.encode(raw))
	}

	fn cache_key(kind: ProxyKind, host: &str, port: u16, username: Option<&str>) -> String {
		format!("{kind}://{host}:{port}:{}", username.unwrap_or(""))
	}
}

/// Masks a username to first+last char plus stars, for safe logging.
pub fn mask_username(username: &str) -> String {
	let chars: Vec<char> = username.chars().collect();
	match chars.len() {
		0 => String::new(),
		1 => "*".to_string(),
		2 => "**".to_string(),
		n => {
			let stars = "*".repeat(n - 2);
			format!("{}{}{}", chars[0], stars, chars[n - 1])
		},
	}
}

/// Masks a password to up to 8 stars, revealing nothing about its length beyond that cap.
pub fn mask_password(password: &str) -> String {
	"*".repeat(password.len().min(8))
}

/// Caches one [`ProxyAgent`] per `type://host:port:user` tuple (§2, §4.2 and the concurrency
/// invariants of SPEC_FULL.md §5: insert-if-absent under a single owner, stable references for
/// readers).
#[derive(Default)]
pub struct ProxyAgentFactory {
	cache: Mutex<HashMap<String, Arc<ProxyAgent>>>,
	default_ip_preference: IpPreference,
}

impl ProxyAgentFactory {
	pub fn new(default_ip_preference: IpPreference) -> Self {
		ProxyAgentFactory {
			cache: Mutex::new(HashMap::new()),
			default_ip_preference,
		}
	}

	pub fn from_json(&self, raw: &str) -> Result<Arc<ProxyAgent>, ProxyAgentError> {
		let parsed: RawProxyDescriptor = serde_json::from_str(raw)?;
		self.build(parsed)
	}

	pub fn get(
		&self,
		descriptor: Option<&ProxyDescriptor>,
	) -> Result<Option<Arc<ProxyAgent>>, ProxyAgentError> {
		let Some(descriptor) = descriptor else {
			return Ok(None);
		};
		Ok(Some(self.get_or_create(
			descriptor.kind,
			&descriptor.host,
			descriptor.port,
			descriptor.username.as_deref(),
			descriptor.password.as_deref(),
		)?))
	}

	fn build(&self, raw: RawProxyDescriptor) -> Result<Arc<ProxyAgent>, ProxyAgentError> {
		let kind = match raw.kind.as_deref() {
			None => return Err(ProxyAgentError::MissingField("type")),
			Some("socks5") => ProxyKind::Socks5,
			Some("http") => ProxyKind::Http,
			Some("https") => ProxyKind::Https,
			Some(other) => return Err(ProxyAgentError::UnsupportedType(other.to_string())),
		};
		let host = raw.host.ok_or(ProxyAgentError::MissingField("host"))?;
		let port = raw.port.ok_or(ProxyAgentError::MissingField("port"))?;
		if port == 0 || port > 65535 {
			return Err(ProxyAgentError::PortOutOfRange(port));
		}
		self.get_or_create(
			kind,
			&host,
			port as u16,
			raw.username.as_deref(),
			raw.password.as_deref(),
		)
	}

	fn get_or_create(
		&self,
		kind: ProxyKind,
		host: &str,
		port: u16,
		username: Option<&str>,
		password: Option<&str>,
	) -> Result<Arc<ProxyAgent>, ProxyAgentError> {
		let key = ProxyAgent::cache_key(kind, host, port, username);
		let mut cache = self.cache.lock();
		if let Some(existing) = cache.get(&key) {
			return Ok(existing.clone());
		}
		let agent = Arc::new(ProxyAgent {
			kind,
			host: host.to_string(),
			port,
			username: username.map(str::to_string),
			password: password.map(str::to_string),
			ip_preference: self.default_ip_preference,
			pool_limits: PoolLimits::default(),
		});
		cache.insert(key, agent.clone());
		Ok(agent)
	}
}

impl Default for IpPreference {
	fn default() -> Self {
		IpPreference::V4
	}
}
