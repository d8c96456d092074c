//! Beta-feature header selector (§4.4). Given a model and the base/client beta strings, emits
//! an ordered `anthropic-beta` value. Rules are expressed as a static table, not control flow,
//! so adding a feature never touches the ordering or admission logic below.

use once_cell::sync::Lazy;
use regex::Regex;

/// Canonical emission order. Tokens not in this list are appended after it, in the order they
/// were admitted.
const CANONICAL_ORDER: &[&str] = &[
	"claude-code-20250219",
	"oauth-2025-04-20",
	"interleaved-thinking-2025-05-14",
	"fine-grained-tool-streaming-2025-05-14",
	"context-1m-2025-08-07",
	"token-counting-2024-11-01",
];

const INTERLEAVED_THINKING_MODELS: &[&str] = &[
	"claude-sonnet-4-20250514",
	"claude-opus-4-20250514",
	"claude-opus-4-1-20250805",
];

static CLAUDE_CODE_MODEL_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new("(?i)sonnet|opus").expect("valid regex"));

/// Whether `token` is admissible for `model`, per the per-token rule table in §4.4.
fn admits(token: &str, model: &str) -> bool {
	match token {
		"interleaved-thinking-2025-05-14" => INTERLEAVED_THINKING_MODELS.contains(&model),
		"claude-code-20250219" => CLAUDE_CODE_MODEL_RE.is_match(model),
		_ => true,
	}
}

/// Builds the `anthropic-beta` header value, or `None` if no token survives admission.
pub fn select(
	model: &str,
	base_beta_string: &str,
	client_beta_string: &str,
	is_count_tokens: bool,
) -> Option<String> {
	let mut admitted: Vec<String> = Vec::new();

	for raw in base_beta_string.split(',') {
		let token = raw.trim();
		if token.is_empty() {
			continue;
		}
		if admits(token, model) && !admitted.iter().any(|t| t == token) {
			admitted.push(token.to_string());
		}
	}

	if client_beta_string.contains("context-1m-2025-08-07") && !admitted.iter().any(|t| t == "context-1m-2025-08-07") {
		admitted.push("context-1m-2025-08-07".to_string());
	}

	if is_count_tokens && !admitted.iter().any(|t| t == "token-counting-2024-11-01") {
		admitted.push("token-counting-2024-11-01".to_string());
	}

	if admitted.is_empty() {
		return None;
	}

	let mut ordered: Vec<String> = Vec::with_capacity(admitted.len());
	for canonical in CANONICAL_ORDER {
		if let Some(pos) = admitted.iter().position(|t| t == canonical) {
			ordered.push(admitted.remove(pos));
		}
	}
	ordered.extend(admitted);

	Some(ordered.join(","))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_inputs_yield_none() {
		assert_eq!(select("claude-3-5-haiku-20241022", "", "", false), None);
	}

	#[test]
	fn claude_code_admitted_only_for_sonnet_or_opus() {
		let haiku = select("claude-3-5-haiku-20241022", "claude-code-20250219", "", false);
		assert_eq!(haiku, None);

		let sonnet = select("claude-sonnet-4-20250514", "claude-code-20250219", "", false);
		assert_eq!(sonnet.as_deref(), Some("claude-code-20250219"));
	}

	#[test]
	fn interleaved_thinking_restricted_to_exact_models() {
		let ok = select(
			"claude-opus-4-1-20250805",
			"interleaved-thinking-2025-05-14",
			"",
			false,
		);
		assert_eq!(ok.as_deref(), Some("interleaved-thinking-2025-05-14"));

		let rejected = select(
			"claude-sonnet-3-7-20250219",
			"interleaved-thinking-2025-05-14",
			"",
			false,
		);
		assert_eq!(rejected, None);
	}

	#[test]
	fn client_hint_adds_context_1m() {
		let out = select("claude-sonnet-4-20250514", "", "context-1m-2025-08-07", false);
		assert_eq!(out.as_deref(), Some("context-1m-2025-08-07"));
	}

	#[test]
	fn count_tokens_adds_token_counting() {
		let out = select("claude-sonnet-4-20250514", "", "", true);
		assert_eq!(out.as_deref(), Some("token-counting-2024-11-01"));
	}

	#[test]
	fn canonical_ordering_applied_regardless_of_input_order() {
		let out = select(
			"claude-sonnet-4-20250514",
			"fine-grained-tool-streaming-2025-05-14,interleaved-thinking-2025-05-14,claude-code-20250219,oauth-2025-04-20",
			"context-1m-2025-08-07",
			true,
		);
		assert_eq!(
			out.as_deref(),
			Some(
				"claude-code-20250219,oauth-2025-04-20,interleaved-thinking-2025-05-14,fine-grained-tool-streaming-2025-05-14,context-1m-2025-08-07,token-counting-2024-11-01"
			)
		);
	}

	#[test]
	fn unknown_tokens_appended_after_canonical_order() {
		let out = select("claude-sonnet-4-20250514", "some-future-token-2099-01-01", "", false);
		assert_eq!(out.as_deref(), Some("some-future-token-2099-01-01"));
	}

	#[test]
	fn duplicate_tokens_collapse() {
		let out = select("claude-sonnet-4-20250514", "oauth-2025-04-20,oauth-2025-04-20", "", false);
		assert_eq!(out.as_deref(), Some("oauth-2025-04-20"));
	}
}
