//! Relay orchestrator (§4.7). Ties together account selection, body preparation, transport
//! dispatch, health classification, and usage accounting into the two request lifecycles the
//! crate exposes: non-streaming and streaming.

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

use crate::collab::{AccountService, ClaudeCodeValidator, CollabError, KvStore, PricingTable, Scheduler};
use crate::config::RelayConfig;
use crate::health::{self, HealthClassifyInput};
use crate::model::{RequestBody, SessionHash, UsageRecord};
use crate::prepare::{self, HeaderOptions, PrepareContext};
use crate::proxy_agent::ProxyAgentFactory;
use crate::sse_tap::{LineSplitter, UsageAggregator};
use crate::telemetry::log::RequestLogRecord;
use crate::telemetry::metrics::Metrics;
use crate::transport::{RequestOpts, Transport, TransportError};

#[derive(Debug, Error)]
pub enum RelayError {
	#[error(transparent)]
	Collab(#[from] CollabError),
	#[error(transparent)]
	Prepare(#[from] crate::prepare::PrepareError),
	#[error(transparent)]
	ProxyAgent(#[from] crate::proxy_agent::ProxyAgentError),
	#[error("{message}")]
	Upstream { message: String, status: Option<u16> },
	#[error("request cancelled by ingress disconnect")]
	Cancelled,
}

impl From<TransportError> for RelayError {
	fn from(err: TransportError) -> Self {
		let status = match &err {
			TransportError::ConnectionTimedOut => Some(504),
			_ => Some(502),
		};
		RelayError::Upstream { message: humanize(&err), status }
	}
}

fn humanize(err: &TransportError) -> String {
	match err {
		TransportError::ConnectionReset => "Connection reset".to_string(),
		TransportError::DnsResolutionFailed(_) => "Unable to resolve hostname".to_string(),
		TransportError::ConnectionRefused => "Connection refused".to_string(),
		TransportError::ConnectionTimedOut => "Connection timed out".to_string(),
		other => other.to_string(),
	}
}

/// A one-shot signal the caller fires when the ingress connection drops before completion.
pub type IngressCancel = watch::Receiver<bool>;

pub fn new_ingress_cancel() -> (watch::Sender<bool>, IngressCancel) {
	watch::channel(false)
}

/// Where streamed bytes and usage end up. Implemented by the embedding service; the relay core
/// never owns the client connection itself.
#[async_trait::async_trait]
pub trait IngressSink: Send {
	async fn send_chunk(&mut self, chunk: Bytes);
	async fn send_event_error(&mut self, error: &Value, status: u16);
	async fn close(&mut self);
}

pub struct RelayResponse {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub account_id: String,
}

/// Shared collaborator set + ambient singletons (transport, proxy factory) a single process
/// constructs once and hands to every request task via `Arc` (§9 "Module-level singletons").
pub struct RelayCore {
	pub transport: Arc<Transport>,
	pub proxy_factory: Arc<ProxyAgentFactory>,
	pub scheduler: Arc<dyn Scheduler>,
	pub account_service: Arc<dyn AccountService>,
	pub kv: Arc<dyn KvStore>,
	pub validator: Arc<dyn ClaudeCodeValidator>,
	pub pricing: Arc<dyn PricingTable>,
	pub config: Arc<RelayConfig>,
	pub metrics: Arc<Metrics>,
}

/// Caller-supplied overrides for a single request; most fields mirror `RelayConfig` defaults.
#[derive(Default)]
pub struct RelayOpts {
	pub is_count_tokens: bool,
}

impl RelayCore {
	/// Non-streaming request lifecycle (§4.7 steps 1-9).
	pub async fn relay_request(
		&self,
		body: RequestBody,
		api_key: &str,
		client_headers: &HeaderMap,
		mut ingress_cancel: IngressCancel,
		opts: RelayOpts,
	) -> Result<RelayResponse, RelayError> {
		let session_hash = hash_session(&body);
		let model = body.model().unwrap_or_default().to_string();

		let selection = self
			.scheduler
			.select_account_for_api_key(api_key, session_hash.as_deref(), &model)
			.await?;
		let access_token = self.account_service.get_valid_access_token(&selection.account_id).await?;
		let account = self.account_service.get_account(&selection.account_id).await?;

		let ctx = PrepareContext {
			account: &account,
			is_count_tokens: opts.is_count_tokens,
			operator_system_prompt: &self.config.claude.system_prompt,
		};
		let processed = prepare::prepare_body(body, &ctx, client_headers, self.validator.as_ref(), self.pricing.as_ref()).await?;
		let proxy = self.proxy_factory.get(account.proxy.as_ref())?;

		let (beta_header, path) = prepare::beta_header_and_path(
			&model,
			&self.config.claude.beta_header,
			client_headers.get("anthropic-beta").and_then(|v| v.to_str().ok()).unwrap_or(""),
			opts.is_count_tokens,
			"/v1/messages",
		);
		let headers = prepare::make_request_headers(&HeaderOptions {
			account: &account,
			access_token: &access_token,
			api_version: &self.config.claude.api_version,
			is_streaming: false,
			beta_header,
			fingerprint_override: None,
			client_user_agent: client_headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok()),
		});

		let request_opts = RequestOpts {
			method: http::Method::POST,
			path,
			headers,
			body: Bytes::from(serde_json::to_vec(&processed.0).unwrap_or_default()),
			proxy_agent: proxy,
			timeout: self.config.request_timeout,
		};

		if *ingress_cancel.borrow() {
			return Err(RelayError::Cancelled);
		}

		let (host, port) = split_host_port(&self.config.claude.api_url);
		let dispatch_result = tokio::select! {
			result = self.transport.request(&host, port, request_opts) => result,
			_ = ingress_cancel.changed() => return Err(RelayError::Cancelled),
		};
		let response = match dispatch_result {
			Ok(response) => response,
			Err(e) => {
				let relay_err: RelayError = e.into();
				let status = match &relay_err {
					RelayError::Upstream { status, .. } => status.unwrap_or(502),
					_ => 502,
				};
				self
					.classify_and_log(&selection.account_id, &selection.account_type, session_hash, status, &HeaderMap::new(), "", true)
					.await;
				return Err(relay_err);
			},
		};

		let body_text = String::from_utf8_lossy(&response.body);
		self
			.classify_and_log(
				&selection.account_id,
				&selection.account_type,
				session_hash,
				response.status,
				&response.headers,
				&body_text,
				false,
			)
			.await;

		let usage = self.emit_non_streaming_usage(&selection.account_id, &model, &response.body);
		self.metrics.record_request(&model, response.status, false);

		let mut log_record = RequestLogRecord::new(
			client_headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string),
		);
		log_record.account_id = Some(selection.account_id.clone());
		log_record.model = Some(model.clone());
		log_record.status = Some(response.status);
		log_record.usage.store(Some(usage));
		log_record.emit();

		Ok(RelayResponse {
			status: response.status,
			headers: response.headers,
			body: response.body,
			account_id: selection.account_id,
		})
	}

	/// Streaming request lifecycle (§4.7 "Streaming").
	pub async fn relay_stream_request_with_usage_capture(
		&self,
		body: RequestBody,
		api_key: &str,
		client_headers: &HeaderMap,
		ingress: &mut dyn IngressSink,
		usage_callback: impl FnOnce(UsageRecord) + Send,
		mut ingress_cancel: IngressCancel,
		opts: RelayOpts,
	) -> Result<(), RelayError> {
		let session_hash = hash_session(&body);
		let model = body.model().unwrap_or_default().to_string();

		let selection = self
			.scheduler
			.select_account_for_api_key(api_key, session_hash.as_deref(), &model)
			.await?;
		let access_token = self.account_service.get_valid_access_token(&selection.account_id).await?;
		let account = self.account_service.get_account(&selection.account_id).await?;

		let ctx = PrepareContext {
			account: &account,
			is_count_tokens: opts.is_count_tokens,
			operator_system_prompt: &self.config.claude.system_prompt,
		};
		let processed = prepare::prepare_body(body, &ctx, client_headers, self.validator.as_ref(), self.pricing.as_ref()).await?;
		let proxy = self.proxy_factory.get(account.proxy.as_ref())?;

		let (beta_header, path) = prepare::beta_header_and_path(
			&model,
			&self.config.claude.beta_header,
			client_headers.get("anthropic-beta").and_then(|v| v.to_str().ok()).unwrap_or(""),
			opts.is_count_tokens,
			"/v1/messages",
		);
		let mut headers = prepare::make_request_headers(&HeaderOptions {
			account: &account,
			access_token: &access_token,
			api_version: &self.config.claude.api_version,
			is_streaming: true,
			beta_header,
			fingerprint_override: None,
			client_user_agent: client_headers.get(http::header::USER_AGENT).and_then(|v| v.to_str().ok()),
		});
		headers.insert(http::header::ACCEPT, http::HeaderValue::from_static("text/event-stream"));

		let request_opts = RequestOpts {
			method: http::Method::POST,
			path,
			headers,
			body: Bytes::from(serde_json::to_vec(&processed.0).unwrap_or_default()),
			proxy_agent: proxy,
			timeout: self.config.request_timeout,
		};

		let (host, port) = split_host_port(&self.config.claude.api_url);
		let mut stream = match tokio::select! {
			result = self.transport.stream_sse(&host, port, request_opts) => result,
			_ = ingress_cancel.changed() => return Err(RelayError::Cancelled),
		} {
			Ok(stream) => stream,
			Err(e) => {
				let relay_err: RelayError = e.into();
				let (message, status) = match &relay_err {
					RelayError::Upstream { message, status } => (message.clone(), status.unwrap_or(502)),
					_ => ("unknown transport error".to_string(), 502),
				};
				ingress
					.send_event_error(&json!({"error": message, "status": status}), status)
					.await;
				ingress.close().await;
				self
					.classify_and_log(&selection.account_id, &selection.account_type, session_hash, status, &HeaderMap::new(), "", true)
					.await;
				self.metrics.record_request(&model, status, true);
				return Err(relay_err);
			},
		};

		if !(200..300).contains(&stream.status) {
			let mut body = Vec::new();
			while let Some(chunk) = stream.next_chunk().await {
				if let Ok(bytes) = chunk {
					body.extend_from_slice(&bytes);
				}
			}
			let body_text = String::from_utf8_lossy(&body).into_owned();
			ingress
				.send_event_error(
					&json!({"error": body_text, "status": stream.status, "details": Value::Null, "timestamp": Value::Null}),
					stream.status,
				)
				.await;
			ingress.close().await;
			self
				.classify_and_log(&selection.account_id, &selection.account_type, session_hash, stream.status, &stream.headers, &body_text, false)
				.await;
			self.metrics.record_request(&model, stream.status, true);
			return Err(RelayError::Upstream { message: "upstream returned an error response".to_string(), status: Some(stream.status) });
		}

		let mut splitter = LineSplitter::new();
		let mut aggregator = UsageAggregator::new();

		loop {
			tokio::select! {
				chunk = stream.next_chunk() => {
					match chunk {
						Some(Ok(bytes)) => {
							for line in splitter.push(&bytes) {
								aggregator.ingest_line(&line);
								self.metrics.sse_bytes_total.inc_by(line.len() as u64);
								ingress.send_chunk(line).await;
							}
						},
						Some(Err(e)) => {
							let relay_err: RelayError = e.into();
							let (message, status) = match &relay_err {
								RelayError::Upstream { message, status } => (message.clone(), status.unwrap_or(500)),
								_ => ("unknown transport error".to_string(), 500),
							};
							ingress.send_event_error(&json!({"error": message, "status": status}), status).await;
							ingress.close().await;
							self.metrics.record_request(&model, status, true);
							return Err(relay_err);
						},
						None => break,
					}
				},
				_ = ingress_cancel.changed() => {
					return Err(RelayError::Cancelled);
				},
			}
		}

		if let Some(tail) = splitter.flush() {
			aggregator.ingest_line(&tail);
			self.metrics.sse_bytes_total.inc_by(tail.len() as u64);
			ingress.send_chunk(tail).await;
		}
		ingress.close().await;

		let rate_limit_detected = aggregator.rate_limit_detected();
		self.metrics.sse_usage_records_total.inc_by(aggregator.record_count() as u64);
		let mut final_usage = aggregator.finish();
		final_usage.account_id = Some(selection.account_id.clone());
		if final_usage.model.is_none() {
			final_usage.model = Some(model.clone());
		}

		let effective_status = if rate_limit_detected { 429 } else { stream.status };
		self
			.classify_and_log(
				&selection.account_id,
				&selection.account_type,
				session_hash,
				effective_status,
				&stream.headers,
				"",
				false,
			)
			.await;
		self.metrics.record_request(&model, effective_status, true);

		let mut log_record = RequestLogRecord::new(
			client_headers.get("x-request-id").and_then(|v| v.to_str().ok()).map(str::to_string),
		);
		log_record.account_id = Some(selection.account_id.clone());
		log_record.model = Some(model.clone());
		log_record.status = Some(effective_status);
		log_record.streaming = true;
		log_record.usage.store(Some(final_usage.clone()));
		log_record.emit();

		usage_callback(final_usage);
		Ok(())
	}

	async fn classify_and_log(
		&self,
		account_id: &str,
		account_type: &str,
		session_hash: SessionHash,
		status: u16,
		headers: &HeaderMap,
		body_snippet: &str,
		synthesized: bool,
	) {
		let input = HealthClassifyInput {
			account_id,
			account_type,
			session_hash,
			status,
			headers,
			body_snippet,
			synthesized,
		};
		health::classify(
			&input,
			self.scheduler.as_ref(),
			self.account_service.as_ref(),
			self.kv.as_ref(),
			self.config.overload_handling.enabled_minutes,
			Some(self.metrics.as_ref()),
		)
		.await;
	}

	fn emit_non_streaming_usage(&self, account_id: &str, model: &str, body: &Bytes) -> UsageRecord {
		let usage = serde_json::from_slice::<Value>(body)
			.ok()
			.and_then(|v| v.get("usage").cloned());
		let record = match usage {
			Some(usage) => UsageRecord {
				model: Some(model.to_string()),
				input_tokens: usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
				output_tokens: usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
				cache_creation_input_tokens: usage.get("cache_creation_input_tokens").and_then(Value::as_u64).unwrap_or(0),
				cache_read_input_tokens: usage.get("cache_read_input_tokens").and_then(Value::as_u64).unwrap_or(0),
				cache_creation: None,
				account_id: Some(account_id.to_string()),
			},
			None => UsageRecord {
				model: Some(model.to_string()),
				output_tokens: (body.len() / 4) as u64,
				account_id: Some(account_id.to_string()),
				..Default::default()
			},
		};
		if record.input_tokens == 0 && record.output_tokens == 0 {
			warn!(account_id, "no usage information available, emitted zero-token record");
		}
		record
	}
}

fn hash_session(body: &RequestBody) -> SessionHash {
	let bytes = serde_json::to_vec(&body.0).ok()?;
	let mut hasher = Sha256::new();
	hasher.update(&bytes);
	Some(hex::encode(hasher.finalize()))
}

fn split_host_port(api_url: &str) -> (String, u16) {
	let without_scheme = api_url.split("://").nth(1).unwrap_or(api_url);
	let host_part = without_scheme.split('/').next().unwrap_or(without_scheme);
	match host_part.rsplit_once(':') {
		Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
		None => (host_part.to_string(), 443),
	}
}
