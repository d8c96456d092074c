//! Prometheus metrics (ambient module 11), grounded in the teacher's
//! `telemetry/metrics.rs`/`mtrcs.rs` pattern: label structs deriving `EncodeLabelSet`, counters
//! and gauges held in `Family`s, registered once against a `Registry` at process start.
//!
//! The teacher's label types (`DefaultedUnknown<RichStrng>`, `EncodeDisplay<...>`) live in its
//! `agent_core` crate, which this crate does not depend on; plain `String`/`u16` labels serve
//! the same purpose here without pulling in that dependency (see DESIGN.md).

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
	pub model: String,
	pub status: String,
	pub streaming: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct AccountHealthLabels {
	pub account_id: String,
	pub state: String,
}

type RequestCounter = Family<RequestLabels, Counter>;
type AccountHealthGauge = Family<AccountHealthLabels, Gauge>;

/// Process-wide metric handles, constructed once and shared via `Arc` alongside the other
/// module-level singletons (§9 "Module-level singletons").
#[derive(Debug)]
pub struct Metrics {
	/// One increment per completed relayed request (streaming or not), labeled by model/status.
	pub requests_total: RequestCounter,
	/// 1 while an account carries a given health flag (`unauthorized`, `blocked`, `overloaded`,
	/// `rate_limited`), 0 otherwise; mirrors the account health controller's state transitions.
	pub account_health_state: AccountHealthGauge,
	/// Bytes forwarded to ingress clients across all SSE streams.
	pub sse_bytes_total: Counter,
	/// Usage records (`message_start`/`message_delta` pairs) aggregated by the SSE tap.
	pub sse_usage_records_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let mut build_counter = |name: &str, help: &str| -> RequestCounter {
			let m = Family::default();
			registry.register(name, help, m.clone());
			m
		};
		let mut build_gauge = |name: &str, help: &str| -> AccountHealthGauge {
			let m = Family::default();
			registry.register(name, help, m.clone());
			m
		};

		let requests_total = build_counter("requests_total", "Total relayed requests by model and status");
		let account_health_state = build_gauge(
			"account_health_state",
			"Whether an account currently carries a given health flag (1) or not (0)",
		);

		let sse_bytes_total = Counter::default();
		registry.register("sse_bytes_total", "Bytes forwarded to ingress clients over SSE streams", sse_bytes_total.clone());

		let sse_usage_records_total = Counter::default();
		registry.register(
			"sse_usage_records_total",
			"Usage records aggregated from message_start/message_delta pairs",
			sse_usage_records_total.clone(),
		);

		Metrics {
			requests_total,
			account_health_state,
			sse_bytes_total,
			sse_usage_records_total,
		}
	}

	pub fn record_request(&self, model: &str, status: u16, streaming: bool) {
		self
			.requests_total
			.get_or_create(&RequestLabels {
				model: model.to_string(),
				status: status.to_string(),
				streaming: streaming.to_string(),
			})
			.inc();
	}

	pub fn set_account_health_flag(&self, account_id: &str, state: &str, active: bool) {
		self
			.account_health_state
			.get_or_create(&AccountHealthLabels {
				account_id: account_id.to_string(),
				state: state.to_string(),
			})
			.set(if active { 1 } else { 0 });
	}
}
