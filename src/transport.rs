//! HTTP/2 client transport (§4.1). Maintains a pool of long-lived h2 sessions keyed by
//! `host:port`, with idle reaping and per-key connect coalescing, optionally tunneled through a
//! [`ProxyAgent`].

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rustls_pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::proxy_agent::{IpPreference, ProxyAgent};

const IDLE_REAP_AFTER: Duration = Duration::from_secs(300);
const REAP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BUFFERED_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("connection reset")]
	ConnectionReset,
	#[error("unable to resolve hostname: {0}")]
	DnsResolutionFailed(String),
	#[error("connection refused")]
	ConnectionRefused,
	#[error("connection timed out")]
	ConnectionTimedOut,
	#[error("proxy tunnel setup failed: {0}")]
	ProxyTunnelFailed(String),
	#[error("tls handshake failed: {0}")]
	TlsHandshakeFailed(String),
	#[error("http/2 handshake failed: {0}")]
	Http2HandshakeFailed(String),
	#[error("http/2 stream error: {0}")]
	Http2Stream(#[from] h2::Error),
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("response decompression failed: {0}")]
	Decompression(String),
}

impl TransportError {
	/// Maps a low-level I/O error to the taxonomy used in client-facing messages (§4.1 "Failure
	/// semantics").
	fn from_io(err: &std::io::Error) -> Self {
		match err.kind() {
			ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => TransportError::ConnectionReset,
			ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
			ErrorKind::TimedOut => TransportError::ConnectionTimedOut,
			_ => TransportError::ProxyTunnelFailed(err.to_string()),
		}
	}
}

/// Per-request dispatch options.
pub struct RequestOpts {
	pub method: Method,
	pub path: String,
	pub headers: HeaderMap,
	pub body: Bytes,
	pub proxy_agent: Option<Arc<ProxyAgent>>,
	pub timeout: Duration,
}

impl Default for RequestOpts {
	fn default() -> Self {
		RequestOpts {
			method: Method::POST,
			path: "/".to_string(),
			headers: HeaderMap::new(),
			body: Bytes::new(),
			proxy_agent: None,
			timeout: DEFAULT_TIMEOUT,
		}
	}
}

/// A fully-buffered response, decompressed and with HTTP/2 pseudo-headers stripped.
#[derive(Debug, Clone)]
pub struct RawResponse {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
}

/// A live SSE response. `status`/`headers` are populated from the `:status` frame before the
/// first chunk is produced; callers poll chunks with [`SseStream::next_chunk`].
pub struct SseStream {
	pub status: u16,
	pub headers: HeaderMap,
	chunks: mpsc::Receiver<Result<Bytes, TransportError>>,
}

impl SseStream {
	pub async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
		self.chunks.recv().await
	}
}

struct Session {
	send_request: SendRequest<Bytes>,
	last_used: std::sync::Mutex<Instant>,
	closed: Arc<AtomicBool>,
}

impl Session {
	fn usable(&self) -> bool {
		!self.closed.load(Ordering::Acquire)
	}

	fn touch(&self) {
		*self.last_used.lock().expect("session lock poisoned") = Instant::now();
	}

	fn idle_for(&self) -> Duration {
		self.last_used.lock().expect("session lock poisoned").elapsed()
	}
}

type SessionSlot = Arc<AsyncMutex<Option<Arc<Session>>>>;

/// Owns the pool of HTTP/2 sessions. Cheap to clone via [`Transport::handle`]; all clones share
/// the same pool and reaper task.
pub struct Transport {
	sessions: Arc<std::sync::Mutex<HashMap<String, SessionSlot>>>,
	tls_connector: TlsConnector,
	default_ip_preference: IpPreference,
}

impl Transport {
	pub fn new(default_ip_preference: IpPreference) -> Result<Self, TransportError> {
		let roots = rustls_native_certs::load_native_certs();
		for err in &roots.errors {
			warn!(error = %err, "failed to load a native certificate");
		}
		let mut root_store = rustls::RootCertStore::empty();
		for cert in roots.certs {
			let _ = root_store.add(cert);
		}
		let mut tls_config = rustls::ClientConfig::builder()
			.with_root_certificates(root_store)
			.with_no_client_auth();
		tls_config.alpn_protocols = vec![b"h2".to_vec()];

		let transport = Transport {
			sessions: Arc::new(std::sync::Mutex::new(HashMap::new())),
			tls_connector: TlsConnector::from(Arc::new(tls_config)),
			default_ip_preference,
		};
		transport.spawn_reaper();
		Ok(transport)
	}

	fn spawn_reaper(&self) {
		let sessions = self.sessions.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(REAP_INTERVAL);
			loop {
				interval.tick().await;
				let mut map = sessions.lock().expect("session map poisoned");
				map.retain(|key, slot| {
					let Ok(guard) = slot.try_lock() else {
						return true;
					};
					match guard.as_ref() {
						Some(session) if session.usable() && session.idle_for() < IDLE_REAP_AFTER => true,
						Some(_) => {
							debug!(key, "reaping idle or closed http/2 session");
							false
						},
						None => false,
					}
				});
			}
		});
	}

	/// Buffers the full response for `opts`, decompressing and stripping pseudo-headers.
	pub async fn request(&self, host: &str, port: u16, opts: RequestOpts) -> Result<RawResponse, TransportError> {
		let session = self.get_or_connect(host, port, opts.proxy_agent.as_deref()).await?;
		let (status, headers, mut body) = self.dispatch(&session, &opts).await?;

		let mut collected = BytesMut::new();
		while let Some(chunk) = body.next_chunk().await {
			collected.extend_from_slice(&chunk?);
		}
		let decompressed = decompress(&headers, collected.freeze()).await?;
		Ok(RawResponse { status, headers, body: decompressed })
	}

	/// Opens a streaming response, yielding chunks as they arrive without buffering the whole
	/// body (§4.1 `stream_sse`).
	pub async fn stream_sse(&self, host: &str, port: u16, opts: RequestOpts) -> Result<SseStream, TransportError> {
		let session = self.get_or_connect(host, port, opts.proxy_agent.as_deref()).await?;
		let (status, headers, body) = self.dispatch(&session, &opts).await?;
		Ok(SseStream { status, headers, chunks: body.into_receiver() })
	}

	async fn dispatch(&self, session: &Session, opts: &RequestOpts) -> Result<(u16, HeaderMap, ChunkSource), TransportError> {
		let mut send_request = session.send_request.clone();
		session.touch();

		let uri: http::Uri = opts.path.parse().map_err(|e: http::uri::InvalidUri| TransportError::InvalidRequest(e.to_string()))?;
		let mut builder = http::Request::builder().method(opts.method.clone()).uri(uri);
		for (name, value) in &opts.headers {
			builder = builder.header(name, value);
		}
		let request = builder
			.body(())
			.map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

		send_request
			.ready()
			.await
			.map_err(|e| TransportError::Http2HandshakeFailed(e.to_string()))?;

		let has_body = !opts.body.is_empty();
		let (response_future, mut send_stream) = send_request
			.send_request(request, !has_body)
			.map_err(TransportError::Http2Stream)?;
		if has_body {
			send_stream.send_data(opts.body.clone(), true).map_err(TransportError::Http2Stream)?;
		}

		let response = tokio::time::timeout(opts.timeout, response_future)
			.await
			.map_err(|_| TransportError::ConnectionTimedOut)?
			.map_err(TransportError::Http2Stream)?;

		let status = response.status().as_u16();
		let headers = strip_pseudo_headers(response.headers());
		let recv_stream = response.into_body();
		Ok((status, headers, ChunkSource::new(recv_stream)))
	}

	async fn get_or_connect(
		&self,
		host: &str,
		port: u16,
		proxy_agent: Option<&ProxyAgent>,
	) -> Result<Arc<Session>, TransportError> {
		let key = format!("{host}:{port}");
		let slot = {
			let mut map = self.sessions.lock().expect("session map poisoned");
			map.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(None))).clone()
		};

		let mut guard = slot.lock().await;
		if let Some(session) = guard.as_ref() {
			if session.usable() {
				return Ok(session.clone());
			}
			trace!(key, "discarding closed http/2 session");
		}

		let session = Arc::new(self.connect(host, port, proxy_agent).await?);
		*guard = Some(session.clone());
		Ok(session)
	}

	async fn connect(&self, host: &str, port: u16, proxy_agent: Option<&ProxyAgent>) -> Result<Session, TransportError> {
		let tcp = match proxy_agent {
			Some(proxy) => self.connect_through_proxy(proxy, host, port).await?,
			None => self.connect_direct(host, port).await?,
		};

		let server_name = ServerName::try_from(host.to_string())
			.map_err(|_| TransportError::TlsHandshakeFailed(format!("invalid DNS name: {host}")))?;
		let tls_stream = self
			.tls_connector
			.connect(server_name, tcp)
			.await
			.map_err(|e| TransportError::TlsHandshakeFailed(e.to_string()))?;

		let (send_request, connection) = h2::client::handshake(tls_stream)
			.await
			.map_err(|e| TransportError::Http2HandshakeFailed(e.to_string()))?;

		let closed = Arc::new(AtomicBool::new(false));
		let closed_for_task = closed.clone();
		tokio::spawn(async move {
			if let Err(e) = connection.await {
				debug!(error = %e, "http/2 connection task ended with error");
			}
			closed_for_task.store(true, Ordering::Release);
		});

		Ok(Session {
			send_request,
			last_used: std::sync::Mutex::new(Instant::now()),
			closed,
		})
	}

	async fn connect_direct(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
		let addr = self.resolve(host).await?;
		tokio::time::timeout(DEFAULT_TIMEOUT, TcpStream::connect((addr, port)))
			.await
			.map_err(|_| TransportError::ConnectionTimedOut)?
			.map_err(|e| TransportError::from_io(&e))
	}

	async fn connect_through_proxy(&self, proxy: &ProxyAgent, target_host: &str, target_port: u16) -> Result<TcpStream, TransportError> {
		let mut stream = tokio::time::timeout(DEFAULT_TIMEOUT, TcpStream::connect((proxy.host.as_str(), proxy.port)))
			.await
			.map_err(|_| TransportError::ConnectionTimedOut)?
			.map_err(|e| TransportError::from_io(&e))?;

		match proxy.kind {
			crate::model::ProxyKind::Http | crate::model::ProxyKind::Https => {
				http_connect(&mut stream, proxy, target_host, target_port).await?;
			},
			crate::model::ProxyKind::Socks5 => {
				socks5_connect(&mut stream, proxy, target_host, target_port).await?;
			},
		}
		Ok(stream)
	}

	async fn resolve(&self, host: &str) -> Result<std::net::IpAddr, TransportError> {
		if let Ok(ip) = host.parse::<std::net::IpAddr>() {
			return Ok(ip);
		}
		let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
			.map_err(|e| TransportError::DnsResolutionFailed(e.to_string()))?;
		let response = resolver
			.lookup_ip(host)
			.await
			.map_err(|e| TransportError::DnsResolutionFailed(e.to_string()))?;
		let prefer_v6 = self.default_ip_preference == IpPreference::V6;
		let mut addrs = response.iter();
		let chosen = if prefer_v6 {
			addrs.clone().find(|a| a.is_ipv6()).or_else(|| addrs.next())
		} else {
			addrs.clone().find(|a| a.is_ipv4()).or_else(|| addrs.next())
		};
		chosen.ok_or_else(|| TransportError::DnsResolutionFailed(host.to_string()))
	}
}

async fn http_connect(stream: &mut TcpStream, proxy: &ProxyAgent, target_host: &str, target_port: u16) -> Result<(), TransportError> {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let mut request = format!("CONNECT {target_host}:{target_port} HTTP/1.1\r\nHost: {target_host}:{target_port}\r\n");
	if let Some(auth) = proxy.basic_auth() {
		request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
	}
	request.push_str("\r\n");

	stream
		.write_all(request.as_bytes())
		.await
		.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;

	let mut buf = Vec::new();
	let mut chunk = [0u8; 512];
	loop {
		let n = stream
			.read(&mut chunk)
			.await
			.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
		if n == 0 {
			return Err(TransportError::ProxyTunnelFailed("proxy closed connection during CONNECT".to_string()));
		}
		buf.extend_from_slice(&chunk[..n]);
		if buf.windows(4).any(|w| w == b"\r\n\r\n") {
			break;
		}
	}

	let status_line = String::from_utf8_lossy(&buf);
	if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
		return Err(TransportError::ProxyTunnelFailed(format!("unexpected CONNECT response: {}", status_line.lines().next().unwrap_or(""))));
	}
	Ok(())
}

async fn socks5_connect(stream: &mut TcpStream, proxy: &ProxyAgent, target_host: &str, target_port: u16) -> Result<(), TransportError> {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let auth_methods: &[u8] = if proxy.username.is_some() { &[0x00, 0x02] } else { &[0x00] };
	let mut greeting = vec![0x05, auth_methods.len() as u8];
	greeting.extend_from_slice(auth_methods);
	stream.write_all(&greeting).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;

	let mut reply = [0u8; 2];
	stream.read_exact(&mut reply).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
	if reply[0] != 0x05 {
		return Err(TransportError::ProxyTunnelFailed("not a socks5 proxy".to_string()));
	}

	if reply[1] == 0x02 {
		let user = proxy.username.as_deref().unwrap_or("");
		let pass = proxy.password.as_deref().unwrap_or("");
		let mut auth = vec![0x01, user.len() as u8];
		auth.extend_from_slice(user.as_bytes());
		auth.push(pass.len() as u8);
		auth.extend_from_slice(pass.as_bytes());
		stream.write_all(&auth).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
		let mut auth_reply = [0u8; 2];
		stream.read_exact(&mut auth_reply).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
		if auth_reply[1] != 0x00 {
			return Err(TransportError::ProxyTunnelFailed("socks5 authentication rejected".to_string()));
		}
	} else if reply[1] != 0x00 {
		return Err(TransportError::ProxyTunnelFailed("socks5 server rejected all auth methods".to_string()));
	}

	let mut request = vec![0x05, 0x01, 0x00, 0x03];
	request.push(target_host.len() as u8);
	request.extend_from_slice(target_host.as_bytes());
	request.extend_from_slice(&target_port.to_be_bytes());
	stream.write_all(&request).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;

	let mut head = [0u8; 4];
	stream.read_exact(&mut head).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
	if head[1] != 0x00 {
		return Err(TransportError::ProxyTunnelFailed(format!("socks5 connect failed with code {}", head[1])));
	}
	let addr_len = match head[3] {
		0x01 => 4,
		0x04 => 16,
		0x03 => {
			let mut len_byte = [0u8; 1];
			stream.read_exact(&mut len_byte).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
			len_byte[0] as usize
		},
		other => return Err(TransportError::ProxyTunnelFailed(format!("unsupported socks5 address type {other}"))),
	};
	let mut rest = vec![0u8; addr_len + 2];
	stream.read_exact(&mut rest).await.map_err(|e| TransportError::ProxyTunnelFailed(e.to_string()))?;
	Ok(())
}

fn strip_pseudo_headers(headers: &HeaderMap) -> HeaderMap {
	headers
		.iter()
		.filter(|(name, _)| !name.as_str().starts_with(':'))
		.map(|(name, value)| (name.clone(), value.clone()))
		.fold(HeaderMap::new(), |mut acc, (name, value)| {
			acc.insert(name, value);
			acc
		})
}

async fn decompress(headers: &HeaderMap, body: Bytes) -> Result<Bytes, TransportError> {
	use tokio::io::AsyncReadExt;

	let encoding = headers
		.get(http::header::CONTENT_ENCODING)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("");

	let mut out = Vec::new();
	match encoding {
		"gzip" => {
			let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(&body[..]);
			decoder.read_to_end(&mut out).await.map_err(|e| TransportError::Decompression(e.to_string()))?;
		},
		"deflate" => {
			let mut decoder = async_compression::tokio::bufread::DeflateDecoder::new(&body[..]);
			decoder.read_to_end(&mut out).await.map_err(|e| TransportError::Decompression(e.to_string()))?;
		},
		"br" => {
			let mut decoder = async_compression::tokio::bufread::BrotliDecoder::new(&body[..]);
			decoder.read_to_end(&mut out).await.map_err(|e| TransportError::Decompression(e.to_string()))?;
		},
		_ => return Ok(body),
	}
	Ok(Bytes::from(out))
}

/// Bridges an `h2::RecvStream` to a plain chunk interface used by both the buffering `request`
/// path and the streaming `stream_sse` path.
struct ChunkSource {
	recv: h2::RecvStream,
}

impl ChunkSource {
	fn new(recv: h2::RecvStream) -> Self {
		ChunkSource { recv }
	}

	async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
		match self.recv.data().await {
			Some(Ok(bytes)) => {
				let _ = self.recv.flow_control().release_capacity(bytes.len());
				Some(Ok(bytes))
			},
			Some(Err(e)) => Some(Err(TransportError::Http2Stream(e))),
			None => None,
		}
	}

	/// Spawns a task forwarding chunks into a channel, for the non-buffering streaming path.
	fn into_receiver(mut self) -> mpsc::Receiver<Result<Bytes, TransportError>> {
		let (tx, rx) = mpsc::channel(MAX_BUFFERED_CHUNK.min(64).max(8));
		tokio::spawn(async move {
			while let Some(chunk) = self.next_chunk().await {
				if tx.send(chunk).await.is_err() {
					break;
				}
			}
		});
		rx
	}
}
