//! Per-endpoint round-trip transport. One [`HyperRoundTripper`] is built per endpoint, bound
//! to a fixed socket address and (for TLS endpoints) a fixed SNI name drawn from the
//! endpoint's `server_cert_domain_san`, and is reused across requests by the endpoint's lazy
//! transport slot (`endpoint.rs`). The connector ignores the request `Uri` for dialing purposes
//! since the dispatcher always rewrites it to the endpoint's own address beforehand.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::Uri;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tower::Service;

use crate::error::TransportError;

/// Resolves `addr` (`host:port`) to a socket address. Deliberately done inside the connect
/// future (here and in `dial_raw`), not at transport construction: the transport slot's
/// constructor (`Endpoint::transport_or_init`) is synchronous, so DNS resolution cannot happen
/// there without blocking a caller that only wanted the cached transport.
async fn resolve(addr: &str) -> std::io::Result<std::net::SocketAddr> {
	if let Ok(sa) = addr.parse() {
		return Ok(sa);
	}
	tokio::net::lookup_host(addr)
		.await?
		.next()
		.ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {addr}")))
}

pub type ReqBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// What a lazily-constructed endpoint transport is built from: enough to dial and, for TLS,
/// to validate and present SNI.
#[derive(Clone)]
pub struct EndpointTarget {
	pub addr: String,
	pub tls: Option<TlsParams>,
	pub http2: bool,
}

#[derive(Clone)]
pub struct TlsParams {
	pub config: Arc<rustls::ClientConfig>,
	pub sni: ServerName<'static>,
}

/// The round-tripper behind an endpoint's transport slot. Object-safe so it can live behind
/// `Arc<dyn RoundTripper>` in the endpoint's once-initialized slot.
pub trait RoundTripper: Send + Sync {
	fn round_trip(&self, req: http::Request<ReqBody>) -> BoxFuture<Result<http::Response<Incoming>, TransportError>>;
}

pub struct HyperRoundTripper {
	client: Client<EndpointConnector, ReqBody>,
}

impl HyperRoundTripper {
	pub fn new(target: EndpointTarget) -> Self {
		let mut builder = Client::builder(TokioExecutor::new());
		if target.http2 {
			builder.http2_only(true);
		}
		let client = builder.build(EndpointConnector { target });
		Self { client }
	}
}

impl RoundTripper for HyperRoundTripper {
	fn round_trip(&self, req: http::Request<ReqBody>) -> BoxFuture<Result<http::Response<Incoming>, TransportError>> {
		let client = self.client.clone();
		Box::pin(async move { client.request(req).await.map_err(classify_hyper_error) })
	}
}

fn classify_hyper_error(e: hyper_util::client::legacy::Error) -> TransportError {
	if e.is_connect() {
		if let Some(io_err) = source_as::<std::io::Error>(&e) {
			if let Some(rustls_err) = io_err.get_ref().and_then(|b| b.downcast_ref::<rustls::Error>()) {
				return classify_rustls_error(rustls_err);
			}
			return TransportError::Dial(String::new(), std::io::Error::new(io_err.kind(), io_err.to_string()));
		}
		return TransportError::Dial(String::new(), std::io::Error::other(e.to_string()));
	}
	if is_connection_reset(&e) {
		return TransportError::ConnectionReset;
	}
	if is_incomplete_message(&e) {
		return TransportError::Eof;
	}
	TransportError::Other(anyhow::anyhow!(e))
}

/// True for an io error observed mid-response whose kind is `ConnectionReset` (`ECONNRESET`):
/// §4.A's "connection reset on read" — the backend tore down the connection while a response was
/// outstanding, as opposed to refusing the connection outright (that is a dial failure, handled
/// separately by `e.is_connect()` above).
fn is_connection_reset(e: &(dyn std::error::Error + 'static)) -> bool {
	let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(e);
	while let Some(err) = cur {
		if let Some(io) = err.downcast_ref::<std::io::Error>()
			&& io.kind() == std::io::ErrorKind::ConnectionReset
		{
			return true;
		}
		cur = err.source();
	}
	false
}

/// True for a hyper/io error that represents the connection closing mid-message: the backend
/// went away before finishing a response, as opposed to refusing the request outright. The
/// dispatcher is the one that decides whether this is retriable (idempotent requests only); this
/// function only identifies the shape of the error.
fn is_incomplete_message(e: &(dyn std::error::Error + 'static)) -> bool {
	let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(e);
	while let Some(err) = cur {
		if let Some(he) = err.downcast_ref::<hyper::Error>()
			&& he.is_incomplete_message()
		{
			return true;
		}
		if let Some(io) = err.downcast_ref::<std::io::Error>()
			&& io.kind() == std::io::ErrorKind::UnexpectedEof
		{
			return true;
		}
		cur = err.source();
	}
	false
}

fn source_as<'a, T: std::error::Error + 'static>(e: &'a (dyn std::error::Error + 'static)) -> Option<&'a T> {
	let mut cur = e.source();
	while let Some(src) = cur {
		if let Some(t) = src.downcast_ref::<T>() {
			return Some(t);
		}
		cur = src.source();
	}
	None
}

fn classify_rustls_error(e: &rustls::Error) -> TransportError {
	use rustls::Error as RE;
	use rustls::CertificateError as CE;
	match e {
		RE::InvalidCertificate(CE::Expired) => TransportError::CertificateExpired,
		RE::InvalidCertificate(CE::NotValidYet) => TransportError::CertificateNotYetValid,
		RE::InvalidCertificate(CE::NotValidForName) => TransportError::HostnameMismatch(e.to_string()),
		RE::InvalidCertificate(_) => TransportError::UntrustedCertificate(e.to_string()),
		RE::InvalidMessage(_) => TransportError::TlsRecordHeader,
		RE::General(_) => TransportError::HandshakeFailure(e.to_string()),
		_ => TransportError::HandshakeFailure(e.to_string()),
	}
}

#[derive(Clone)]
pub struct EndpointConnector {
	target: EndpointTarget,
}

pub enum EndpointIo {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for EndpointIo {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			EndpointIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
			EndpointIo::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for EndpointIo {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			EndpointIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
			EndpointIo::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			EndpointIo::Plain(s) => Pin::new(s).poll_flush(cx),
			EndpointIo::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			EndpointIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
			EndpointIo::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

impl Connection for TokioIo<EndpointIo> {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

impl Service<Uri> for EndpointConnector {
	type Response = TokioIo<EndpointIo>;
	type Error = std::io::Error;
	type Future = BoxFuture<Result<Self::Response, Self::Error>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, _uri: Uri) -> Self::Future {
		let addr = self.target.addr.clone();
		let tls = self.target.tls.clone();
		Box::pin(async move {
			let sockaddr = resolve(&addr).await?;
			let stream = TcpStream::connect(sockaddr).await?;
			stream.set_nodelay(true)?;
			match tls {
				None => Ok(TokioIo::new(EndpointIo::Plain(stream))),
				Some(tls) => {
					let connector = tokio_rustls::TlsConnector::from(tls.config);
					let tls_stream = connector
						.connect(tls.sni, stream)
						.await
						.map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
					Ok(TokioIo::new(EndpointIo::Tls(Box::new(tls_stream))))
				},
			}
		})
	}
}

/// Dials a raw connection to `target`, bypassing the pooled HTTP transport entirely. Used by
/// the WebSocket/TCP upgrade path (`dispatcher.rs`), which needs the bare stream to splice
/// once the 101 handshake completes.
pub async fn dial_raw(target: &EndpointTarget) -> Result<EndpointIo, TransportError> {
	let sockaddr = resolve(&target.addr)
		.await
		.map_err(|e| TransportError::Dial(target.addr.clone(), e))?;
	let stream = TcpStream::connect(sockaddr)
		.await
		.map_err(|e| TransportError::Dial(target.addr.clone(), e))?;
	stream.set_nodelay(true).ok();
	match &target.tls {
		None => Ok(EndpointIo::Plain(stream)),
		Some(tls) => {
			let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
			let tls_stream = connector
				.connect(tls.sni.clone(), stream)
				.await
				.map_err(|e| classify_rustls_io_error(e))?;
			Ok(EndpointIo::Tls(Box::new(tls_stream)))
		},
	}
}

fn classify_rustls_io_error(e: std::io::Error) -> TransportError {
	if let Some(rustls_err) = e.get_ref().and_then(|b| b.downcast_ref::<rustls::Error>()) {
		classify_rustls_error(rustls_err)
	} else {
		TransportError::HandshakeFailure(e.to_string())
	}
}

/// Builds the default trust store: native roots when available, falling back to the bundled
/// Mozilla root set (`webpki-roots`) otherwise, matching how most `rustls` consumers in this
/// ecosystem bootstrap a client config without a custom CA file.
pub fn default_tls_config() -> Arc<rustls::ClientConfig> {
	let mut roots = rustls::RootCertStore::empty();
	match rustls_native_certs::load_native_certs().certs.into_iter().try_for_each(|c| roots.add(c)) {
		Ok(()) => {},
		Err(_) => {
			roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
		},
	}
	if roots.is_empty() {
		roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
	}
	Arc::new(
		rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth(),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_expired_certificate() {
		let e = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
		assert!(matches!(classify_rustls_error(&e), TransportError::CertificateExpired));
	}

	#[test]
	fn classifies_hostname_mismatch() {
		let e = rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName);
		assert!(matches!(classify_rustls_error(&e), TransportError::HostnameMismatch(_)));
	}

	#[test]
	fn detects_connection_reset_through_an_error_chain() {
		let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
		let wrapped: Box<dyn std::error::Error> = Box::new(io);
		assert!(is_connection_reset(wrapped.as_ref()));
	}

	#[test]
	fn does_not_mistake_other_io_errors_for_a_reset() {
		let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
		assert!(!is_connection_reset(&io));
		assert!(is_incomplete_message(&io));
	}
}
