//! Request dump hook (ambient module 12). Best-effort per-request archival, gated by whether
//! the dump config is enabled; failures are logged and swallowed (§7).

use std::path::PathBuf;

use http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::config::RequestDumpConfig;
use crate::proxy_agent::{mask_password, mask_username};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
	Request,
	Response,
	Error,
}

impl DumpKind {
	fn label(self) -> &'static str {
		match self {
			DumpKind::Request => "request",
			DumpKind::Response => "response",
			DumpKind::Error => "error",
		}
	}
}

#[derive(Debug, Serialize)]
struct DumpRecord<'a> {
	model: &'a str,
	headers: Vec<(String, String)>,
	body: &'a Value,
	metadata: Option<&'a Value>,
}

/// Writes one dump file under `<directory>/<model>/<timestamp>_<kind>.log`. A no-op when the
/// dump config is disabled. `timestamp` is supplied by the caller since this module may not
/// call time-source functions directly.
pub async fn dump(
	config: &RequestDumpConfig,
	model: &str,
	timestamp: i64,
	kind: DumpKind,
	headers: &HeaderMap,
	body: &Value,
	metadata: Option<&Value>,
) {
	if !config.enabled {
		return;
	}

	let sanitized_model = sanitize_path_segment(model);
	let dir: PathBuf = config.directory.join(&sanitized_model);
	if let Err(e) = fs::create_dir_all(&dir).await {
		warn!(error = %e, dir = %dir.display(), "failed to create request-dump directory");
		return;
	}

	let record = DumpRecord {
		model,
		headers: masked_headers(headers),
		body,
		metadata,
	};
	let contents = match serde_json::to_vec_pretty(&record) {
		Ok(bytes) => bytes,
		Err(e) => {
			warn!(error = %e, "failed to serialize request dump");
			return;
		},
	};

	let path = dir.join(format!("{timestamp}_{}.log", kind.label()));
	if let Err(e) = fs::write(&path, contents).await {
		warn!(error = %e, path = %path.display(), "failed to write request dump");
	}
}

fn sanitize_path_segment(raw: &str) -> String {
	raw
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
		.collect()
}

fn masked_headers(headers: &HeaderMap) -> Vec<(String, String)> {
	headers
		.iter()
		.map(|(name, value)| {
			let lower = name.as_str().to_ascii_lowercase();
			let value = value.to_str().unwrap_or("<binary>");
			let masked = match lower.as_str() {
				"authorization" => mask_bearer(value),
				"x-api-key" => mask_password(value),
				"proxy-authorization" => mask_bearer(value),
				_ => value.to_string(),
			};
			(lower, masked)
		})
		.collect()
}

fn mask_bearer(value: &str) -> String {
	match value.split_once(' ') {
		Some((scheme, token)) => format!("{scheme} {}", mask_password(token)),
		None => mask_password(value),
	}
}

/// Masks proxy credentials embedded in a URL-like string for safe dump output (reuses the
/// username/password masking from the proxy agent factory).
pub fn mask_proxy_url(username: &str, password: &str) -> (String, String) {
	(mask_username(username), mask_password(password))
}
