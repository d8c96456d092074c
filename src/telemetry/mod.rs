//! Telemetry (ambient module 11): structured logging handles and Prometheus metrics, grounded
//! in the teacher's `telemetry/log.rs` and `telemetry/metrics.rs`.

pub mod log;
pub mod metrics;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Installs a process-wide `tracing` subscriber, grounded in the teacher's
/// `core::telemetry::setup_logging` (`RUST_LOG`-driven `EnvFilter` over a plain formatter).
/// The teacher additionally routes through a non-blocking writer thread and a structured
/// Istio-flavored formatter; this crate is a library embedded into a larger service rather than
/// the process that owns stdout, so it installs a plain `fmt` layer and leaves writer/format
/// choices to the embedding binary. Call once at process start.
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NONE);
	let _ = tracing_subscriber::registry().with(filter).with(fmt_layer).try_init();
}
