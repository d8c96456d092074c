//! SSE tap / usage aggregator (§4.7 step 3, §8). Splits a raw SSE byte stream into lines for
//! verbatim forwarding, while concurrently parsing `data: ` lines to accumulate usage telemetry.
//! Forwarding never blocks on parsing: [`LineSplitter::push`] returns forwardable lines
//! immediately, and usage parsing is a pure, synchronous step applied to the same lines.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::model::{CacheCreationUsage, UsageRecord};

const RATE_LIMIT_MARKER: &str = "exceed your account's rate limit";

/// Buffers partial lines across chunk boundaries, yielding complete `\n`-terminated lines as
/// soon as they're available.
#[derive(Default)]
pub struct LineSplitter {
	buf: BytesMut,
}

impl LineSplitter {
	pub fn new() -> Self {
		LineSplitter::default()
	}

	/// Appends a chunk and drains every complete line it completes (including lines that were
	/// already partially buffered).
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
		self.buf.extend_from_slice(chunk);
		let mut lines = Vec::new();
		loop {
			let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
				break;
			};
			let line = self.buf.split_to(pos + 1).freeze();
			lines.push(line);
		}
		lines
	}

	/// Called on stream end: returns the trailing partial line, if any, so it can still be
	/// forwarded and parsed.
	pub fn flush(&mut self) -> Option<Bytes> {
		if self.buf.is_empty() {
			None
		} else {
			Some(std::mem::take(&mut self.buf).freeze())
		}
	}
}

/// Accumulates `message_start`/`message_delta` usage fields observed across a single SSE
/// response into one merged [`UsageRecord`] (§4.7 step 3–4).
#[derive(Default)]
pub struct UsageAggregator {
	records: Vec<UsageRecord>,
	current: Option<UsageRecord>,
	rate_limit_detected: bool,
}

impl UsageAggregator {
	pub fn new() -> Self {
		UsageAggregator::default()
	}

	pub fn rate_limit_detected(&self) -> bool {
		self.rate_limit_detected
	}

	/// Number of `message_start`/`message_delta` pairs accumulated so far, including the
	/// in-progress record if one is open. Used to drive the `sse_usage_records_total` metric
	/// without exposing the record list itself.
	pub fn record_count(&self) -> usize {
		self.records.len() + usize::from(self.current.is_some())
	}

	/// Feeds one complete line (as produced by [`LineSplitter`]); no-ops for anything that is
	/// not a `data: ` SSE data line.
	pub fn ingest_line(&mut self, line: &[u8]) {
		let text = String::from_utf8_lossy(line);
		let trimmed = text.trim_end_matches(['\n', '\r']);
		let Some(payload) = trimmed.strip_prefix("data: ").or_else(|| trimmed.strip_prefix("data:")) else {
			return;
		};
		let Ok(event) = serde_json::from_str::<Value>(payload.trim_start()) else {
			return;
		};
		match event.get("type").and_then(Value::as_str) {
			Some("message_start") => self.ingest_message_start(&event),
			Some("message_delta") => self.ingest_message_delta(&event),
			Some("error") => self.ingest_error(&event),
			_ => {},
		}
	}

	fn ingest_message_start(&mut self, event: &Value) {
		if self.current.is_some() {
			self.push_current();
		}
		let message = event.get("message").unwrap_or(&Value::Null);
		let usage = message.get("usage").unwrap_or(&Value::Null);
		let mut record = UsageRecord {
			model: message.get("model").and_then(Value::as_str).map(str::to_string),
			input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
			cache_creation_input_tokens: usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0),
			cache_read_input_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
			..Default::default()
		};
		if let Some(cache_creation) = usage.get("cache_creation") {
			record.cache_creation = Some(CacheCreationUsage {
				ephemeral_5m_input_tokens: cache_creation.get("ephemeral_5m_input_tokens").and_then(Value::as_u64).unwrap_or(0),
				ephemeral_1h_input_tokens: cache_creation.get("ephemeral_1h_input_tokens").and_then(Value::as_u64).unwrap_or(0),
			});
		}
		self.current = Some(record);
	}

	fn ingest_message_delta(&mut self, event: &Value) {
		let Some(current) = self.current.as_mut() else {
			return;
		};
		if let Some(output_tokens) = event.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64) {
			current.output_tokens = output_tokens;
		}
		if current.input_tokens > 0 {
			self.push_current();
		}
	}

	fn ingest_error(&mut self, event: &Value) {
		let message = event
			.get("error")
			.and_then(|e| e.get("message"))
			.and_then(Value::as_str)
			.unwrap_or("");
		if message.to_ascii_lowercase().contains(&RATE_LIMIT_MARKER.to_ascii_lowercase()) {
			self.rate_limit_detected = true;
		}
	}

	fn push_current(&mut self) {
		if let Some(record) = self.current.take() {
			self.records.push(record);
		}
	}

	/// Finalizes the aggregator: any still-open record gets `output_tokens = 0` and is pushed,
	/// then every record is summed into one merged total (§4.7 step 4).
	pub fn finish(mut self) -> UsageRecord {
		self.push_current();
		let mut merged = UsageRecord::default();
		for record in &self.records {
			merged.merge(record);
		}
		merged
	}
}
