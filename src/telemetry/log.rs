//! Request-scoped log record, grounded in the teacher's `AsyncLog<T>` pattern
//! (`telemetry/log.rs`): a handle a response-body-driven task can publish into after the
//! initiating call has already returned its `Response` to its own caller. The streaming path
//! in `relay.rs` is the motivating case — usage is only known once the SSE tap has seen the
//! last chunk, long after the HTTP response headers went out.
//!
//! The teacher backs this with `crossbeam::atomic::AtomicCell`; this crate is not already
//! pulling in `crossbeam`, so the same atomically-settable-from-afar shape is built on
//! `parking_lot::Mutex`, which is already part of the dependency stack.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::model::UsageRecord;

/// A handle around a value that can be set from a task that has outlived the call that created
/// the handle. Cloning shares the same underlying cell.
#[derive(Clone)]
pub struct AsyncLog<T>(Arc<Mutex<Option<T>>>);

impl<T> AsyncLog<T> {
	pub fn store(&self, v: Option<T>) {
		*self.0.lock() = v;
	}

	pub fn take(&self) -> Option<T> {
		self.0.lock().take()
	}
}

impl<T: Clone> AsyncLog<T> {
	pub fn load(&self) -> Option<T> {
		self.0.lock().clone()
	}
}

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(Mutex::new(None)))
	}
}

impl<T: Debug> Debug for AsyncLog<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AsyncLog").finish_non_exhaustive()
	}
}

/// Everything worth logging about one relayed request, assembled incrementally across the
/// request's lifetime and emitted once as a single structured event.
#[derive(Debug, Clone, Default)]
pub struct RequestLogRecord {
	pub request_id: Option<String>,
	pub account_id: Option<String>,
	pub model: Option<String>,
	pub status: Option<u16>,
	pub streaming: bool,
	pub usage: AsyncLog<UsageRecord>,
}

impl RequestLogRecord {
	pub fn new(request_id: Option<String>) -> Self {
		RequestLogRecord {
			request_id,
			..Default::default()
		}
	}

	/// Emits the accumulated fields as one `tracing` event. Called exactly once, after the
	/// response (streaming or not) has fully resolved.
	pub fn emit(&self) {
		let usage = self.usage.load();
		info!(
			request_id = self.request_id.as_deref().unwrap_or(""),
			account_id = self.account_id.as_deref().unwrap_or(""),
			model = self.model.as_deref().unwrap_or(""),
			status = self.status.unwrap_or(0),
			streaming = self.streaming,
			input_tokens = usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
			output_tokens = usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
			"relayed request completed"
		);
	}
}
