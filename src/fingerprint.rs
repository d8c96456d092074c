//! Random client-fingerprint generation for ban-evasion mode (§4.5). Produces a consistent
//! User-Agent / `x-stainless-*` header tuple per generated identity so repeated requests from
//! the same evasion identity look like the same SDK install, instead of a fresh random one on
//! every call.

use rand::Rng;
use rand::seq::IndexedRandom;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
	ClaudeCli,
	Browser,
	Node,
	Mobile,
	Other,
}

const KINDS: &[ClientKind] = &[
	ClientKind::ClaudeCli,
	ClientKind::Browser,
	ClientKind::Node,
	ClientKind::Mobile,
	ClientKind::Other,
];

const OSES: &[&str] = &["MacOS", "Windows", "Linux", "iOS", "Android"];
const ARCHS: &[&str] = &["x64", "arm64"];

/// A single generated identity. Every field is internally consistent with `kind` (a
/// `ClaudeCli` identity never pairs a Chrome UA with a `node` runtime) and is reused verbatim
/// across requests for the identity's lifetime.
#[derive(Debug, Clone)]
pub struct ClientFingerprint {
	pub kind: ClientKind,
	pub user_agent: String,
	pub package_version: String,
	pub os: &'static str,
	pub arch: &'static str,
	pub runtime: &'static str,
	pub runtime_version: String,
}

impl ClientFingerprint {
	pub fn generate() -> Self {
		Self::generate_with(&mut rand::rng())
	}

	pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
		let kind = *KINDS.choose(rng).expect("non-empty table");
		let os = *OSES.choose(rng).expect("non-empty table");
		let arch = *ARCHS.choose(rng).expect("non-empty table");

		match kind {
			ClientKind::ClaudeCli => {
				let package_version = format!("1.{}.{}", rng.random_range(0..60), rng.random_range(0..10));
				let node_major = rng.random_range(16..=23);
				ClientFingerprint {
					kind,
					user_agent: format!("claude-cli/{package_version} (external, cli)"),
					package_version,
					os,
					arch,
					runtime: "node",
					runtime_version: format!("{node_major}.0.0"),
				}
			},
			ClientKind::Node => {
				let package_version = format!("0.{}.{}", rng.random_range(20..60), rng.random_range(0..20));
				let node_major = rng.random_range(16..=23);
				ClientFingerprint {
					kind,
					user_agent: format!("Anthropic/JS {package_version}"),
					package_version,
					os,
					arch,
					runtime: "node",
					runtime_version: format!("{node_major}.0.0"),
				}
			},
			ClientKind::Browser => {
				let chrome_major = rng.random_range(100..=129);
				ClientFingerprint {
					kind,
					user_agent: format!(
						"Mozilla/5.0 (compatible; Chrome/{chrome_major}.0.0.0) Anthropic/JS"
					),
					package_version: format!("0.{}.0", rng.random_range(20..60)),
					os,
					arch,
					runtime: "browser",
					runtime_version: format!("{chrome_major}.0.0.0"),
				}
			},
			ClientKind::Mobile => {
				let package_version = format!("0.{}.0", rng.random_range(1..20));
				ClientFingerprint {
					kind,
					user_agent: format!("Anthropic/Mobile {package_version}"),
					package_version,
					os,
					arch,
					runtime: "mobile",
					runtime_version: "1.0.0".to_string(),
				}
			},
			ClientKind::Other => {
				let package_version = format!("0.{}.0", rng.random_range(1..60));
				ClientFingerprint {
					kind,
					user_agent: format!("Anthropic/JS {package_version}"),
					package_version,
					os,
					arch,
					runtime: "unknown",
					runtime_version: "0.0.0".to_string(),
				}
			},
		}
	}

	/// Applies this identity's headers onto an outbound request, overwriting whatever was set
	/// before.
	pub fn apply(&self, headers: &mut http::HeaderMap) {
		use http::HeaderValue;
		if let Ok(v) = HeaderValue::from_str(&self.user_agent) {
			headers.insert(http::header::USER_AGENT, v);
		}
		insert_str(headers, "x-stainless-lang", "js");
		insert_str(headers, "x-stainless-package-version", &self.package_version);
		insert_str(headers, "x-stainless-os", self.os);
		insert_str(headers, "x-stainless-arch", self.arch);
		insert_str(headers, "x-stainless-runtime", self.runtime);
		insert_str(headers, "x-stainless-runtime-version", &self.runtime_version);
	}
}

fn insert_str(headers: &mut http::HeaderMap, name: &'static str, value: &str) {
	if let Ok(v) = http::HeaderValue::from_str(value) {
		headers.insert(http::header::HeaderName::from_static(name), v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;
	use rand::rngs::StdRng;

	#[test]
	fn claude_cli_pairs_with_node_runtime() {
		let mut rng = StdRng::seed_from_u64(7);
		for _ in 0..50 {
			let fp = ClientFingerprint::generate_with(&mut rng);
			if fp.kind == ClientKind::ClaudeCli {
				assert_eq!(fp.runtime, "node");
				assert!(fp.user_agent.starts_with("claude-cli/"));
			}
		}
	}

	#[test]
	fn apply_sets_all_stainless_headers() {
		let fp = ClientFingerprint::generate_with(&mut rand::rng());
		let mut headers = http::HeaderMap::new();
		fp.apply(&mut headers);
		for name in [
			"x-stainless-lang",
			"x-stainless-package-version",
			"x-stainless-os",
			"x-stainless-arch",
			"x-stainless-runtime",
			"x-stainless-runtime-version",
		] {
			assert!(headers.contains_key(name), "missing header {name}");
		}
		assert!(headers.contains_key(http::header::USER_AGENT));
	}

	#[test]
	fn browser_identity_uses_chrome_ua() {
		let mut rng = StdRng::seed_from_u64(3);
		for _ in 0..50 {
			let fp = ClientFingerprint::generate_with(&mut rng);
			if fp.kind == ClientKind::Browser {
				assert!(fp.user_agent.contains("Chrome/"));
				assert_eq!(fp.runtime, "browser");
			}
		}
	}
}
