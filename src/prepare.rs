//! Header & body preparer (§4.3). Normalizes an inbound request body into the shape the vendor
//! API expects, and computes the matching outbound header set.

use http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::beta;
use crate::collab::{ClaudeCodeValidator, PricingTable};
use crate::fingerprint::ClientFingerprint;
use crate::model::{Account, RequestBody};

#[derive(Debug, Error)]
pub enum PrepareError {
	#[error("request body is not a JSON object")]
	NotAnObject,
}

/// A fixed system-prompt block injected ahead of whatever the client sent, when the request
/// does not look like it came from the real Claude Code CLI (§4.3 step 8).
const CLAUDE_CODE_SYSTEM_PROMPT: &str =
	"You are a Claude agent, built on Anthropic's Claude Agent SDK.";

/// Hard-coded boilerplate the real CLI injects as the second system block; stripped so it is
/// not duplicated once the relay's own copy (if any) is added back.
const DEFENSIVE_SECURITY_BOILERPLATE: &str = "\n\nIMPORTANT: Assist with defensive security tasks only. Refuse to create, modify, or improve code that may be used maliciously.";

static SYSTEM_REMINDER_SUFFIX_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?s)<system-reminder>.*?</system-reminder>\n$").expect("valid regex"));

static UNIFIED_USER_ID_RE: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"^user_[a-f0-9]{64}(_account__session_[a-f0-9-]{36})$").expect("valid regex")
});

const BASELINE_HEADERS: &[(&str, &str)] = &[
	("content-type", "application/json"),
	("x-app", "cli"),
	("accept-language", "*"),
	("sec-fetch-mode", "cors"),
	("accept-encoding", "gzip, deflate"),
	("anthropic-dangerous-direct-browser-access", "true"),
];

const SENSITIVE_INGRESS_HEADERS: &[&str] = &[
	"authorization",
	"x-api-key",
	"content-type",
	"host",
	"content-length",
	"connection",
	"proxy-authorization",
	"content-encoding",
	"transfer-encoding",
];

const ALWAYS_KEPT_INGRESS_HEADERS: &[&str] = &["x-request-id", "anthropic-version", "anthropic-beta"];

/// Parameters for [`prepare_body`] beyond the body itself.
pub struct PrepareContext<'a> {
	pub account: &'a Account,
	pub is_count_tokens: bool,
	pub operator_system_prompt: &'a str,
}

/// Implements §4.3 steps 1–13. Returns the mutated body ready for header construction and
/// dispatch.
pub async fn prepare_body(
	body: RequestBody,
	ctx: &PrepareContext<'_>,
	client_headers: &HeaderMap,
	validator: &dyn ClaudeCodeValidator,
	pricing: &dyn PricingTable,
) -> Result<RequestBody, PrepareError> {
	if ctx.is_count_tokens {
		return Ok(body);
	}

	let Value::Object(mut obj) = body.0 else {
		return Err(PrepareError::NotAnObject);
	};

	let variant = split_model_variant(&mut obj);
	strip_defensive_boilerplate(&mut obj);
	strip_system_reminder_suffixes(&mut obj);
	clamp_max_tokens(&mut obj, pricing);
	strip_cache_control_ttl(&mut obj);

	let is_claude_code = validator
		.validate(client_headers, &Value::Object(obj.clone()), "/v1/messages")
		.await;
	if !is_claude_code {
		inject_claude_code_prompt(&mut obj);
	}
	if !ctx.operator_system_prompt.is_empty() {
		append_operator_system_prompt(&mut obj, ctx.operator_system_prompt);
	}
	drop_empty_system(&mut obj);

	obj.remove("top_p");

	if ctx.account.use_unified_client_id {
		apply_unified_client_id(&mut obj, ctx.account);
	}

	if variant.as_deref() == Some("thinking") {
		apply_thinking_variant(&mut obj);
	}

	Ok(RequestBody(Value::Object(obj)))
}

fn split_model_variant(obj: &mut serde_json::Map<String, Value>) -> Option<String> {
	let model = obj.get("model")?.as_str()?.to_string();
	let (base, variant) = match model.split_once(':') {
		Some((base, "thinking")) => (base.to_string(), Some("thinking".to_string())),
		_ => (model, None),
	};
	obj.insert("model".to_string(), Value::String(base));
	variant
}

fn strip_defensive_boilerplate(obj: &mut serde_json::Map<String, Value>) {
	let Some(Value::Array(system)) = obj.get_mut("system") else {
		return;
	};
	if system.len() < 2 {
		return;
	}
	if let Some(text) = system[1].get_mut("text").and_then(Value::as_str).map(str::to_string) {
		if text.contains(DEFENSIVE_SECURITY_BOILERPLATE) {
			let stripped = text.replace(DEFENSIVE_SECURITY_BOILERPLATE, "");
			system[1]["text"] = Value::String(stripped);
		}
	}
}

fn strip_system_reminder_suffixes(obj: &mut serde_json::Map<String, Value>) {
	let Some(Value::Array(messages)) = obj.get_mut("messages") else {
		return;
	};
	for message in messages {
		if message.get("role").and_then(Value::as_str) != Some("user") {
			continue;
		}
		let Some(Value::Array(content)) = message.get_mut("content") else {
			continue;
		};
		for block in content {
			if block.get("type").and_then(Value::as_str) != Some("tool_result") {
				continue;
			}
			if let Some(text) = block.get("content").and_then(Value::as_str).map(str::to_string) {
				if SYSTEM_REMINDER_SUFFIX_RE.is_match(&text) {
					let stripped = SYSTEM_REMINDER_SUFFIX_RE.replace(&text, "").into_owned();
					block["content"] = Value::String(stripped);
				}
			}
		}
	}
}

fn clamp_max_tokens(obj: &mut serde_json::Map<String, Value>, pricing: &dyn PricingTable) {
	let Some(model) = obj.get("model").and_then(Value::as_str).map(str::to_string) else {
		return;
	};
	let Some(entry) = pricing.lookup(&model) else {
		return;
	};
	let Some(ceiling) = entry.ceiling() else {
		return;
	};
	if let Some(current) = obj.get("max_tokens").and_then(Value::as_u64) {
		if current > ceiling {
			obj.insert("max_tokens".to_string(), Value::from(ceiling));
		}
	}
}

fn strip_cache_control_ttl(obj: &mut serde_json::Map<String, Value>) {
	if let Some(system) = obj.get_mut("system") {
		strip_ttl_from_blocks(system);
	}
	if let Some(Value::Array(messages)) = obj.get_mut("messages") {
		for message in messages {
			if let Some(content) = message.get_mut("content") {
				strip_ttl_from_blocks(content);
			}
		}
	}
}

fn strip_ttl_from_blocks(value: &mut Value) {
	let Value::Array(blocks) = value else { return };
	for block in blocks {
		if let Some(cache_control) = block.get_mut("cache_control").and_then(Value::as_object_mut) {
			cache_control.remove("ttl");
		}
	}
}

fn claude_code_block() -> Value {
	json!({
		"type": "text",
		"text": CLAUDE_CODE_SYSTEM_PROMPT,
		"cache_control": {"type": "ephemeral"},
	})
}

fn is_claude_code_block(value: &Value) -> bool {
	value.get("text").and_then(Value::as_str) == Some(CLAUDE_CODE_SYSTEM_PROMPT)
}

fn inject_claude_code_prompt(obj: &mut serde_json::Map<String, Value>) {
	match obj.remove("system") {
		None => {
			obj.insert("system".to_string(), Value::Array(vec![claude_code_block()]));
		},
		Some(Value::String(text)) => {
			let mut list = vec![claude_code_block()];
			if text != CLAUDE_CODE_SYSTEM_PROMPT {
				list.push(json!({"type": "text", "text": text}));
			}
			obj.insert("system".to_string(), Value::Array(list));
		},
		Some(Value::Array(mut list)) => {
			if list.first().map(is_claude_code_block).unwrap_or(false) {
				obj.insert("system".to_string(), Value::Array(list));
				return;
			}
			list.retain(|v| !is_claude_code_block(v));
			let mut rebuilt = vec![claude_code_block()];
			rebuilt.extend(list);
			obj.insert("system".to_string(), Value::Array(rebuilt));
		},
		Some(other) => {
			obj.insert("system".to_string(), other);
		},
	}
}

fn append_operator_system_prompt(obj: &mut serde_json::Map<String, Value>, prompt: &str) {
	let already_present = obj
		.get("system")
		.and_then(Value::as_array)
		.map(|list| list.iter().any(|v| v.get("text").and_then(Value::as_str) == Some(prompt)))
		.unwrap_or(false);
	if already_present {
		return;
	}
	let block = json!({"type": "text", "text": prompt});
	match obj.get_mut("system") {
		Some(Value::Array(list)) => list.push(block),
		_ => {
			obj.insert("system".to_string(), Value::Array(vec![block]));
		},
	}
}

fn drop_empty_system(obj: &mut serde_json::Map<String, Value>) {
	let has_text = obj
		.get("system")
		.and_then(Value::as_array)
		.map(|list| {
			list
				.iter()
				.any(|v| v.get("text").and_then(Value::as_str).map(|t| !t.is_empty()).unwrap_or(false))
		})
		.unwrap_or(false);
	if !has_text {
		obj.remove("system");
	}
}

fn apply_unified_client_id(obj: &mut serde_json::Map<String, Value>, account: &Account) {
	let Some(unified_id) = &account.unified_client_id else {
		return;
	};
	let metadata = obj
		.entry("metadata")
		.or_insert_with(|| Value::Object(Default::default()));
	let Some(metadata) = metadata.as_object_mut() else {
		return;
	};
	match metadata.get("user_id").and_then(Value::as_str).map(str::to_string) {
		None => {
			let session = Uuid::new_v4();
			metadata.insert(
				"user_id".to_string(),
				Value::String(format!("user_{unified_id}_account__session_{session}")),
			);
		},
		Some(existing) => {
			if let Some(caps) = UNIFIED_USER_ID_RE.captures(&existing) {
				let suffix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
				metadata.insert(
					"user_id".to_string(),
					Value::String(format!("user_{unified_id}{suffix}")),
				);
			}
		},
	}
}

fn apply_thinking_variant(obj: &mut serde_json::Map<String, Value>) {
	let budget = obj
		.get("max_tokens")
		.and_then(Value::as_u64)
		.and_then(|v| v.checked_sub(1))
		.unwrap_or(31999);
	obj.insert(
		"thinking".to_string(),
		json!({"type": "enabled", "budget_tokens": budget}),
	);
}

/// Options captured at dispatch time that affect the header set (§4.3 "Header construction").
pub struct HeaderOptions<'a> {
	pub account: &'a Account,
	pub access_token: &'a str,
	pub api_version: &'a str,
	pub is_streaming: bool,
	pub beta_header: Option<String>,
	pub fingerprint_override: Option<&'a ClientFingerprint>,
	/// The ingress client's own `User-Agent`, if any. Captured opportunistically onto the
	/// outbound request when the account has `use_unified_user_agent` set, so repeated requests
	/// funneled through this account present one canonical client identity rather than whatever
	/// each ingress client happens to send (§3 `Account.use_unified_user_agent`).
	pub client_user_agent: Option<&'a str>,
}

/// Builds the full outbound header map for a prepared request.
pub fn make_request_headers(opts: &HeaderOptions<'_>) -> HeaderMap {
	let mut headers = HeaderMap::new();
	for (name, value) in BASELINE_HEADERS {
		insert(&mut headers, name, value);
	}
	insert(&mut headers, "anthropic-version", opts.api_version);
	headers.insert(
		http::header::AUTHORIZATION,
		HeaderValue::from_str(&format!("Bearer {}", opts.access_token)).expect("valid header value"),
	);
	insert(&mut headers, "user-agent", "claude-cli/1.0.0 (external, cli)");
	insert(&mut headers, "x-stainless-lang", "js");
	insert(&mut headers, "x-stainless-package-version", "1.0.0");
	insert(&mut headers, "x-stainless-os", "Linux");
	insert(&mut headers, "x-stainless-arch", "x64");
	insert(&mut headers, "x-stainless-runtime", "node");
	insert(&mut headers, "x-stainless-runtime-version", "20.0.0");

	if opts.account.ban_mode {
		if let Some(fp) = opts.fingerprint_override {
			fp.apply(&mut headers);
		} else {
			ClientFingerprint::generate().apply(&mut headers);
		}
	} else if opts.account.use_unified_user_agent {
		if let Some(ua) = opts.client_user_agent.filter(|ua| !ua.is_empty()) {
			insert(&mut headers, "user-agent", ua);
		}
	}

	if opts.is_streaming {
		insert(&mut headers, "x-stainless-helper-method", "stream");
	}

	if let Some(beta) = &opts.beta_header {
		if !beta.is_empty() {
			insert(&mut headers, "anthropic-beta", beta);
		}
	}

	headers
}

/// Computes the beta header and the request path suffix in one step, per §4.3/§4.4.
pub fn beta_header_and_path(
	model: &str,
	base_beta_string: &str,
	client_beta_string: &str,
	is_count_tokens: bool,
	base_path: &str,
) -> (Option<String>, String) {
	let beta = beta::select(model, base_beta_string, client_beta_string, is_count_tokens);
	let path = if is_count_tokens {
		"/v1/messages/count_tokens".to_string()
	} else if beta.is_some() {
		format!("{base_path}?beta=true")
	} else {
		base_path.to_string()
	};
	(beta, path)
}

/// Filters inbound ingress headers for the small set the relay forwards/consults (§4.3
/// "Client-header filtering").
pub fn filter_client_headers(headers: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in headers {
		let lower = name.as_str().to_ascii_lowercase();
		if ALWAYS_KEPT_INGRESS_HEADERS.contains(&lower.as_str()) {
			out.insert(name.clone(), value.clone());
			continue;
		}
		if SENSITIVE_INGRESS_HEADERS.contains(&lower.as_str()) {
			continue;
		}
		if lower.starts_with("sec-") || lower.starts_with("accept-") {
			continue;
		}
		if matches!(lower.as_str(), "origin" | "referer" | "pragma" | "anthropic-dangerous-direct-browser-access") {
			continue;
		}
		out.insert(name.clone(), value.clone());
	}
	out
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
	if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
		headers.insert(name, value);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::PricingEntry;

	struct AlwaysClaudeCode(bool);

	#[async_trait::async_trait]
	impl ClaudeCodeValidator for AlwaysClaudeCode {
		async fn validate(&self, _headers: &HeaderMap, _body: &Value, _path: &str) -> bool {
			self.0
		}
	}

	struct FixedPricing(Option<u64>);

	impl PricingTable for FixedPricing {
		fn lookup(&self, _model: &str) -> Option<crate::model::PricingEntry> {
			self.0.map(|max_tokens| PricingEntry {
				max_tokens: Some(max_tokens),
				max_output_tokens: None,
			})
		}
	}

	fn account() -> Account {
		Account {
			id: "acc1".to_string(),
			name: "acc".to_string(),
			is_active: true,
			status: "active".to_string(),
			proxy: None,
			ban_mode: false,
			use_unified_client_id: false,
			unified_client_id: None,
			use_unified_user_agent: false,
		}
	}

	#[tokio::test]
	async fn injects_claude_code_prompt_when_not_validated() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514", "messages": []}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(false),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		let system = out.0.get("system").unwrap().as_array().unwrap();
		assert_eq!(system[0]["text"], "You are a Claude agent, built on Anthropic's Claude Agent SDK.");
	}

	#[tokio::test]
	async fn skips_injection_for_real_claude_code() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514", "messages": []}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		assert!(out.0.get("system").is_none());
	}

	#[tokio::test]
	async fn count_tokens_passes_through_unchanged() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514:thinking", "top_p": 0.9}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: true,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body.clone(),
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		assert_eq!(out.0, body.0);
	}

	#[tokio::test]
	async fn thinking_variant_sets_budget_tokens() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514:thinking", "max_tokens": 2000}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		assert_eq!(out.0["model"], "claude-sonnet-4-20250514");
		assert_eq!(out.0["thinking"]["budget_tokens"], 1999);
	}

	#[tokio::test]
	async fn thinking_variant_defaults_budget_without_max_tokens() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514:thinking"}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		assert_eq!(out.0["thinking"]["budget_tokens"], 31999);
	}

	#[tokio::test]
	async fn clamps_max_tokens_to_pricing_ceiling() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514", "max_tokens": 99999}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(Some(8192)),
		)
		.await
		.unwrap();
		assert_eq!(out.0["max_tokens"], 8192);
	}

	#[tokio::test]
	async fn top_p_always_removed() {
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514", "top_p": 0.5}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		assert!(out.0.get("top_p").is_none());
	}

	#[tokio::test]
	async fn strips_cache_control_ttl() {
		let body = RequestBody(json!({
			"model": "claude-sonnet-4-20250514",
			"system": [{"type": "text", "text": "hi", "cache_control": {"type": "ephemeral", "ttl": "1h"}}],
		}));
		let ctx = PrepareContext {
			account: &account(),
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		let system = out.0.get("system").unwrap().as_array().unwrap();
		assert!(system[0]["cache_control"].get("ttl").is_none());
	}

	#[tokio::test]
	async fn unified_client_id_generates_fresh_user_id() {
		let mut acc = account();
		acc.use_unified_client_id = true;
		acc.unified_client_id = Some("a".repeat(64));
		let body = RequestBody(json!({"model": "claude-sonnet-4-20250514"}));
		let ctx = PrepareContext {
			account: &acc,
			is_count_tokens: false,
			operator_system_prompt: "",
		};
		let out = prepare_body(
			body,
			&ctx,
			&HeaderMap::new(),
			&AlwaysClaudeCode(true),
			&FixedPricing(None),
		)
		.await
		.unwrap();
		let user_id = out.0["metadata"]["user_id"].as_str().unwrap();
		assert!(user_id.starts_with(&format!("user_{}", "a".repeat(64))));
	}

	#[test]
	fn filters_sensitive_and_browser_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("secret"));
		headers.insert("origin", HeaderValue::from_static("https://example.test"));
		headers.insert("x-request-id", HeaderValue::from_static("abc"));
		headers.insert("anthropic-beta", HeaderValue::from_static("context-1m-2025-08-07"));
		let out = filter_client_headers(&headers);
		assert!(out.get(http::header::AUTHORIZATION).is_none());
		assert!(out.get("origin").is_none());
		assert!(out.get("x-request-id").is_some());
		assert!(out.get("anthropic-beta").is_some());
	}

	#[test]
	fn unified_user_agent_captures_client_ua() {
		let mut acc = account();
		acc.use_unified_user_agent = true;
		let headers = make_request_headers(&HeaderOptions {
			account: &acc,
			access_token: "tok",
			api_version: "2023-06-01",
			is_streaming: false,
			beta_header: None,
			fingerprint_override: None,
			client_user_agent: Some("MyApp/1.2.3"),
		});
		assert_eq!(headers.get(http::header::USER_AGENT).unwrap(), "MyApp/1.2.3");
	}

	#[test]
	fn unified_user_agent_falls_back_to_default_without_client_ua() {
		let mut acc = account();
		acc.use_unified_user_agent = true;
		let headers = make_request_headers(&HeaderOptions {
			account: &acc,
			access_token: "tok",
			api_version: "2023-06-01",
			is_streaming: false,
			beta_header: None,
			fingerprint_override: None,
			client_user_agent: None,
		});
		assert_eq!(headers.get(http::header::USER_AGENT).unwrap(), "claude-cli/1.0.0 (external, cli)");
	}

	#[test]
	fn ban_mode_takes_precedence_over_unified_user_agent() {
		let mut acc = account();
		acc.ban_mode = true;
		acc.use_unified_user_agent = true;
		let headers = make_request_headers(&HeaderOptions {
			account: &acc,
			access_token: "tok",
			api_version: "2023-06-01",
			is_streaming: false,
			beta_header: None,
			fingerprint_override: None,
			client_user_agent: Some("MyApp/1.2.3"),
		});
		assert_ne!(headers.get(http::header::USER_AGENT).unwrap(), "MyApp/1.2.3");
	}
}
