//! Process-wide configuration. Loaded once at startup and held behind an `Arc`; nothing here
//! is mutated at runtime (operator changes require a restart — see SPEC_FULL.md §9).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
	pub claude: ClaudeConfig,
	pub overload_handling: OverloadHandling,
	#[serde(with = "humantime_secs")]
	pub request_timeout: Duration,
	pub proxy: ProxyDefaults,
	pub pricing_table_path: PathBuf,
	pub request_dump: RequestDumpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeConfig {
	pub api_url: String,
	pub api_version: String,
	pub beta_header: String,
	pub system_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverloadHandling {
	/// Minutes to mark an account overloaded for after a 529; 0 disables the flag entirely.
	pub enabled_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyDefaults {
	pub use_ipv4: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestDumpConfig {
	pub enabled: bool,
	pub directory: PathBuf,
}

impl Default for RelayConfig {
	fn default() -> Self {
		RelayConfig {
			claude: ClaudeConfig::default(),
			overload_handling: OverloadHandling::default(),
			request_timeout: Duration::from_secs(30),
			proxy: ProxyDefaults::default(),
			pricing_table_path: PathBuf::from("config/model_pricing.json"),
			request_dump: RequestDumpConfig::default(),
		}
	}
}

impl Default for ClaudeConfig {
	fn default() -> Self {
		ClaudeConfig {
			api_url: "https://api.anthropic.com".to_string(),
			api_version: "2023-06-01".to_string(),
			beta_header: String::new(),
			system_prompt: String::new(),
		}
	}
}

impl Default for OverloadHandling {
	fn default() -> Self {
		OverloadHandling { enabled_minutes: 10 }
	}
}

impl Default for ProxyDefaults {
	fn default() -> Self {
		ProxyDefaults { use_ipv4: true }
	}
}

impl Default for RequestDumpConfig {
	fn default() -> Self {
		RequestDumpConfig {
			enabled: false,
			directory: PathBuf::from("logs/dumps"),
		}
	}
}

/// Raw, all-optional mirror of [`RelayConfig`] as it appears in the YAML file; every field is
/// overridable by an environment variable of the same name in `SCREAMING_SNAKE_CASE`.
pub fn load(contents: &str) -> anyhow::Result<RelayConfig> {
	let mut cfg: RelayConfig = serde_yaml::from_str(contents).unwrap_or_default();

	if let Some(v) = env_str("CLAUDE_API_URL") {
		cfg.claude.api_url = v;
	}
	if let Some(v) = env_str("CLAUDE_API_VERSION") {
		cfg.claude.api_version = v;
	}
	if let Some(v) = env_str("CLAUDE_BETA_HEADER") {
		cfg.claude.beta_header = v;
	}
	if let Some(v) = env_str("CLAUDE_SYSTEM_PROMPT") {
		cfg.claude.system_prompt = v;
	}
	if let Some(v) = env_parse::<u32>("OVERLOAD_HANDLING_ENABLED_MINUTES")? {
		cfg.overload_handling.enabled_minutes = v;
	}
	if let Some(v) = env_parse::<u64>("REQUEST_TIMEOUT_SECS")? {
		cfg.request_timeout = Duration::from_secs(v);
	}
	if let Some(v) = env_parse::<bool>("PROXY_USE_IPV4")? {
		cfg.proxy.use_ipv4 = v;
	}
	if let Some(v) = env_str("PRICING_TABLE_PATH") {
		cfg.pricing_table_path = PathBuf::from(v);
	}
	if let Some(v) = env_parse::<bool>("REQUEST_DUMP_ENABLED")? {
		cfg.request_dump.enabled = v;
	}
	if let Some(v) = env_str("REQUEST_DUMP_DIRECTORY") {
		cfg.request_dump.directory = PathBuf::from(v);
	}

	Ok(cfg)
}

fn env_str(name: &str) -> Option<String> {
	env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
	T::Err: std::fmt::Display,
{
	match env_str(name) {
		None => Ok(None),
		Some(v) => v
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid {name}: {e}")),
	}
}

mod humantime_secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}
