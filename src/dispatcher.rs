//! The retry loop and upgrade path (§4.E): selects endpoints through the iterator, dispatches
//! through each endpoint's transport, classifies failures, retries or terminates, and on success
//! installs the sticky cookie. The WebSocket/raw-TCP upgrade path shares endpoint selection and
//! header rewriting with the normal path but bypasses the pooled HTTP transport entirely, since
//! once a 101 response arrives the connection stops being HTTP at all.
//!
//! Bodies are buffered up front (`DispatchRequest::body: Bytes`) rather than streamed, so a
//! retried attempt can replay the same bytes without a `Request.GetBody`-style reconstructor —
//! this core has no equivalent of that interface, and the spec's retry loop never needs more
//! than one in-flight attempt at a time anyway.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agent_core::strng::Strng;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::classify;
use crate::endpoint::Endpoint;
use crate::error::{DispatchError, TransportError};
use crate::iterator::AzPreference;
use crate::pool::Pool;
use crate::sticky::{self, StickyConfig};
use crate::transport::{self, EndpointTarget, ReqBody, RoundTripper};

/// Builds the transport for an endpoint (§4.E step 6: "constructed from a factory keyed on SAN,
/// is-route-service, is-http2"). TLS material provisioning is out of this core's scope
/// (spec.md §1), so the concrete factory is supplied by whatever embeds this crate.
pub trait TransportFactory: Send + Sync {
	fn round_tripper(&self, endpoint: &Endpoint, is_route_service: bool) -> Arc<dyn RoundTripper>;
	fn raw_target(&self, endpoint: &Endpoint) -> EndpointTarget;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
	pub backend_max_attempts: usize,
	pub route_service_max_attempts: usize,
	pub endpoint_timeout: Duration,
	pub max_response_headers: usize,
	pub az_preference: AzPreference,
	pub local_az: Option<Strng>,
	pub sticky: StickyConfig,
}

/// A fully-buffered request ready to dispatch.
pub struct DispatchRequest {
	pub method: Method,
	pub uri: Uri,
	pub version: http::Version,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl DispatchRequest {
	/// §4.E step 8: "method in {GET,HEAD,OPTIONS,TRACE} or bodyless ... or carries
	/// Idempotency-Key / X-Idempotency-Key".
	fn is_idempotent(&self) -> bool {
		matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
			|| self.body.is_empty()
			|| self.headers.contains_key("idempotency-key")
			|| self.headers.contains_key("x-idempotency-key")
	}
}

/// The per-request context the route resolver hands the dispatcher (§6), trimmed to the fields
/// this core consumes: frontend response-writer plumbing is out of scope (spec.md §1).
pub struct DispatchContext {
	pub pool: Arc<Pool>,
	pub route_service_url: Option<Uri>,
	pub route_service_transport: Option<Arc<dyn RoundTripper>>,
	pub initial_sticky_id: Option<Strng>,
	pub must_be_sticky: bool,
	pub client_addr: Option<std::net::IpAddr>,
	/// Cancelled by the frontend layer (out of this core's scope, spec.md §1) when the client
	/// disconnects. `None` means the caller does not track cancellation; the retry loop then
	/// behaves as if the client never disconnects.
	pub cancellation: Option<CancellationToken>,
}

impl DispatchContext {
	fn is_cancelled(&self) -> bool {
		self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
	}
}

/// Mirrors §6's per-request observability fields, trimmed to what a caller would actually log
/// after `dispatch` returns (the per-attempt tracer timings require hooking hyper's connection
/// tracing, which this core does not instrument — see DESIGN.md).
#[derive(Default)]
pub struct RequestInfo {
	pub route_endpoint: Option<Arc<Endpoint>>,
	pub round_trip_successful: bool,
	pub failed_attempts: u32,
}

pub struct Dispatcher {
	config: DispatcherConfig,
	transport_factory: Arc<dyn TransportFactory>,
}

impl Dispatcher {
	pub fn new(config: DispatcherConfig, transport_factory: Arc<dyn TransportFactory>) -> Self {
		Self { config, transport_factory }
	}

	fn max_attempts(&self, is_route_service: bool) -> usize {
		let configured = if is_route_service {
			self.config.route_service_max_attempts
		} else {
			self.config.backend_max_attempts
		};
		configured.max(1)
	}

	/// Runs the retry loop (§4.E). On success, returns the backend response (with the sticky
	/// cookie appended when warranted) and the request's observability summary. On terminal
	/// failure, returns the `DispatchError` for `error_handler::handle`.
	pub async fn dispatch(&self, ctx: &DispatchContext, req: DispatchRequest) -> Result<(http::Response<Incoming>, RequestInfo), DispatchError> {
		let is_route_service = ctx.route_service_url.is_some();
		let max_attempts = self.max_attempts(is_route_service);
		let iter = ctx.pool.endpoints(
			ctx.initial_sticky_id.clone(),
			ctx.must_be_sticky,
			self.config.az_preference,
			self.config.local_az.clone(),
		);
		let pool_size = ctx.pool.num_endpoints();

		let request_cookie = req.headers.get(header::COOKIE).cloned();
		let idempotent = req.is_idempotent();

		let mut base_headers = req.headers.clone();
		strip_hop_by_hop(&mut base_headers);
		apply_forwarded_for(&mut base_headers, ctx.client_addr);
		apply_request_start(&mut base_headers);

		let mut tried: HashSet<Strng> = HashSet::new();
		let mut info = RequestInfo::default();
		let mut last_err: Option<DispatchError> = None;

		for attempt in 0..max_attempts {
			if ctx.is_cancelled() {
				last_err = Some(DispatchError::Cancelled);
				break;
			}
			let span = info_span!("attempt", attempt, pool = %ctx.pool.context_path);
			let Some(endpoint) = iter.next(attempt) else {
				last_err.get_or_insert(DispatchError::NoEndpointsAvailable);
				break;
			};

			if attempt >= pool_size && tried.contains(&endpoint.address) {
				last_err.get_or_insert(DispatchError::NoEndpointsAvailable);
				break;
			}
			tried.insert(endpoint.address.clone());
			info.route_endpoint = Some(endpoint.clone());

			let mut headers = base_headers.clone();
			let uri = match &ctx.route_service_url {
				Some(route_service_url) => rewrite_for_route_service(&mut headers, route_service_url),
				None => rewrite_for_endpoint(&mut headers, &req.uri, &endpoint),
			};
			let Ok(uri) = uri else {
				last_err = Some(DispatchError::SetupError("could not rewrite outbound request URI"));
				break;
			};

			let mut parts = http::Request::new(()).into_parts().0;
			parts.method = req.method.clone();
			parts.uri = uri;
			parts.version = req.version;
			parts.headers = headers;
			let attempt_req = http::Request::from_parts(parts, body_for_attempt(&req.body));

			let transport = match (&ctx.route_service_transport, is_route_service) {
				(Some(t), true) => t.clone(),
				_ => endpoint.transport_or_init(|| self.transport_factory.round_tripper(&endpoint, is_route_service)),
			};

			iter.pre_request(&endpoint);
			let outcome = self
				.round_trip_or_cancel(&transport, attempt_req, ctx.cancellation.as_ref())
				.instrument(span)
				.await;
			iter.post_request(&endpoint);

			match outcome {
				RoundTripOutcome::Response(response) => {
					if self.config.max_response_headers > 0 && response.headers().len() > self.config.max_response_headers {
						last_err = Some(DispatchError::TooManyResponseHeaders);
						break;
					}
					info.round_trip_successful = true;
					let final_response = self.finish_success(ctx, &endpoint, request_cookie.as_ref(), response, is_route_service);
					return Ok((final_response, info));
				},
				RoundTripOutcome::Cancelled => {
					debug!(attempt, endpoint = %endpoint.canonical_addr(), "client request cancelled mid-attempt");
					last_err = Some(DispatchError::Cancelled);
					break;
				},
				RoundTripOutcome::Error(mut err) => {
					if matches!(err, TransportError::Eof) && idempotent {
						err = TransportError::IdempotentRequestEof;
					}
					if err.occurred_before_connect() {
						err = TransportError::IncompleteRequest(Box::new(err));
					}
					info.failed_attempts += 1;
					debug!(attempt, endpoint = %endpoint.canonical_addr(), error = %err, "round trip failed");
					if !is_route_service {
						iter.endpoint_failed(&err);
					}
					let retriable = classify::is_retriable(&err);
					last_err = Some(DispatchError::Transport(err));
					if !retriable {
						break;
					}
				},
			}
		}

		// §7 property 10: client cancellation outranks any gateway error the loop may already
		// have produced, even one from the very last attempt.
		if ctx.is_cancelled() {
			last_err = Some(DispatchError::Cancelled);
		}
		let err = last_err.unwrap_or(DispatchError::NoEndpointsAvailable);
		warn!(error = %err, attempts = info.failed_attempts, "dispatch exhausted without success");
		Err(err)
	}

	/// Races one round trip (with its own `endpointTimeout`, via [`Self::round_trip_with_timeout`])
	/// against the original request's cancellation, so a client disconnect preempts an attempt
	/// that would otherwise block until the endpoint responds or the attempt deadline elapses.
	async fn round_trip_or_cancel(
		&self,
		transport: &Arc<dyn RoundTripper>,
		req: http::Request<ReqBody>,
		cancellation: Option<&CancellationToken>,
	) -> RoundTripOutcome {
		let fut = self.round_trip_with_timeout(transport, req);
		let Some(token) = cancellation else {
			return match fut.await {
				Ok(r) => RoundTripOutcome::Response(r),
				Err(e) => RoundTripOutcome::Error(e),
			};
		};
		tokio::select! {
			res = fut => match res {
				Ok(r) => RoundTripOutcome::Response(r),
				Err(e) => RoundTripOutcome::Error(e),
			},
			() = token.cancelled() => RoundTripOutcome::Cancelled,
		}
	}

	async fn round_trip_with_timeout(&self, transport: &Arc<dyn RoundTripper>, req: http::Request<ReqBody>) -> Result<http::Response<Incoming>, TransportError> {
		if self.config.endpoint_timeout.is_zero() {
			return transport.round_trip(req).await;
		}
		match tokio::time::timeout(self.config.endpoint_timeout, transport.round_trip(req)).await {
			Ok(result) => result,
			Err(_) => Err(TransportError::Timeout),
		}
	}

	/// §4.E "Sticky-session installation": never run for route-service responses.
	fn finish_success(
		&self,
		ctx: &DispatchContext,
		endpoint: &Endpoint,
		request_cookie: Option<&HeaderValue>,
		mut response: http::Response<Incoming>,
		is_route_service: bool,
	) -> http::Response<Incoming> {
		if !is_route_service
			&& let Some(cookie) = sticky::sticky_cookie(
				&self.config.sticky,
				&ctx.pool.context_path,
				request_cookie,
				response.headers(),
				&endpoint.private_instance_id,
			)
		{
			response.headers_mut().append(header::SET_COOKIE, cookie);
		}
		response
	}

	/// Upgrade path (§4.E "raw TCP / WebSocket"): dials the endpoint directly, forwards the
	/// upgrade request over a bare HTTP/1.1 connection, and on a 101 response splices
	/// `client_io` with the backend's upgraded connection. No retry across endpoints: once a
	/// byte has been written to the client's hijacked socket there is nothing left to retry
	/// against (DESIGN.md's adopted reading of "after endpoint selection ... hijacks").
	pub async fn dispatch_upgrade<C>(
		&self,
		ctx: &DispatchContext,
		mut client_io: C,
		req: DispatchRequest,
		backend_read_timeout: Duration,
	) -> Result<UpgradeOutcome, DispatchError>
	where
		C: AsyncRead + AsyncWrite + Unpin + Send,
	{
		let iter = ctx.pool.endpoints(
			ctx.initial_sticky_id.clone(),
			ctx.must_be_sticky,
			self.config.az_preference,
			self.config.local_az.clone(),
		);
		let endpoint = iter.next(0).ok_or(DispatchError::NoEndpointsAvailable)?;

		let mut headers = req.headers.clone();
		strip_hop_by_hop_preserving_upgrade(&mut headers);
		apply_forwarded_for(&mut headers, ctx.client_addr);
		let uri = rewrite_for_endpoint(&mut headers, &req.uri, &endpoint).map_err(|_| DispatchError::SetupError("could not rewrite upgrade request URI"))?;

		let target = self.transport_factory.raw_target(&endpoint);
		let backend_io = transport::dial_raw(&target).await.map_err(|e| {
			iter.endpoint_failed(&e);
			DispatchError::Transport(e)
		})?;
		let io = hyper_util::rt::TokioIo::new(backend_io);

		let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(|e| {
			let err = TransportError::Other(anyhow::anyhow!(e));
			iter.endpoint_failed(&err);
			DispatchError::Transport(err)
		})?;
		let conn_task = tokio::spawn(conn.with_upgrades());

		let mut parts = http::Request::new(()).into_parts().0;
		parts.method = req.method;
		parts.uri = uri;
		parts.version = http::Version::HTTP_11;
		parts.headers = headers;
		let backend_req = http::Request::from_parts(parts, http_body_util::Empty::<Bytes>::new());

		let send = sender.send_request(backend_req);
		let response = match tokio::time::timeout(backend_read_timeout, send).await {
			Ok(Ok(resp)) => resp,
			Ok(Err(e)) => {
				conn_task.abort();
				iter.endpoint_failed(&TransportError::Other(anyhow::anyhow!(e)));
				write_synthetic_bad_gateway(&mut client_io).await.ok();
				return Ok(UpgradeOutcome::BadGateway);
			},
			Err(_) => {
				conn_task.abort();
				iter.endpoint_failed(&TransportError::Timeout);
				write_synthetic_bad_gateway(&mut client_io).await.ok();
				return Ok(UpgradeOutcome::BadGateway);
			},
		};

		let status = response.status();
		if write_response_head(&mut client_io, &response).await.is_err() {
			conn_task.abort();
			return Ok(UpgradeOutcome::BadGateway);
		}

		if status != StatusCode::SWITCHING_PROTOCOLS {
			conn_task.abort();
			return Ok(UpgradeOutcome::NonSwitching(status));
		}

		let mut upgraded = match hyper::upgrade::on(response).await {
			Ok(u) => hyper_util::rt::TokioIo::new(u),
			Err(_) => {
				conn_task.abort();
				return Ok(UpgradeOutcome::BadGateway);
			},
		};

		let result = agent_core::copy::copy_bidirectional(&mut client_io, &mut upgraded).await;
		conn_task.abort();
		match result {
			Ok(counters) => Ok(UpgradeOutcome::Spliced(counters)),
			Err(e) => {
				warn!(error = %e, "upgrade splice ended with an error");
				Ok(UpgradeOutcome::Spliced(agent_core::copy::ConnectionResult::default()))
			},
		}
	}
}

/// Outcome of racing one attempt's round trip against the request's cancellation token.
enum RoundTripOutcome {
	Response(http::Response<Incoming>),
	Error(TransportError),
	Cancelled,
}

pub enum UpgradeOutcome {
	/// The backend returned something other than 101; the status line and headers were already
	/// forwarded to the client verbatim (§4.E: "On any non-101 status, return immediately").
	NonSwitching(StatusCode),
	/// The splice completed (either side closed).
	Spliced(agent_core::copy::ConnectionResult),
	/// Read timeout or malformed response; a synthetic 502 was written to the client.
	BadGateway,
}

async fn write_synthetic_bad_gateway(io: &mut (impl AsyncWrite + Unpin)) -> std::io::Result<()> {
	io.write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await
}

async fn write_response_head(io: &mut (impl AsyncWrite + Unpin), resp: &http::Response<Incoming>) -> std::io::Result<()> {
	let mut buf = format!(
		"HTTP/1.1 {} {}\r\n",
		resp.status().as_u16(),
		resp.status().canonical_reason().unwrap_or("")
	);
	for (name, value) in resp.headers() {
		buf.push_str(name.as_str());
		buf.push_str(": ");
		buf.push_str(value.to_str().unwrap_or(""));
		buf.push_str("\r\n");
	}
	buf.push_str("\r\n");
	io.write_all(buf.as_bytes()).await
}

/// RFC 7230 §6.1 hop-by-hop headers, stripped before forwarding upstream, plus whatever the
/// request's own `Connection:` header names (§6: "configured Connection:-list sanitization
/// filtering hop-by-hop names").
static HOP_HEADERS: [HeaderName; 8] = [
	header::CONNECTION,
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
	if let Some(listed) = headers.get(header::CONNECTION).and_then(|v| v.to_str().ok()) {
		for name in listed.split(',') {
			if let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) {
				headers.remove(name);
			}
		}
	}
	for h in HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

/// Same as `strip_hop_by_hop`, but keeps `Connection: Upgrade` / `Upgrade: <proto>` so the
/// handshake can still be recognized by the backend.
fn strip_hop_by_hop_preserving_upgrade(headers: &mut HeaderMap) {
	let upgrade = headers.get(header::UPGRADE).cloned();
	strip_hop_by_hop(headers);
	if let Some(upgrade) = upgrade {
		headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(header::UPGRADE, upgrade);
	}
}

fn apply_forwarded_for(headers: &mut HeaderMap, client_addr: Option<std::net::IpAddr>) {
	const X_FORWARDED_FOR: &str = "x-forwarded-for";
	let Some(addr) = client_addr else { return };
	let addr = addr.to_string();
	let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) => format!("{existing}, {addr}"),
		None => addr,
	};
	if let Ok(v) = HeaderValue::from_str(&value) {
		headers.insert(HeaderName::from_static(X_FORWARDED_FOR), v);
	}
}

fn apply_request_start(headers: &mut HeaderMap) {
	const X_REQUEST_START: &str = "x-request-start";
	if headers.contains_key(X_REQUEST_START) {
		return;
	}
	let millis = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
	if let Ok(v) = HeaderValue::from_str(&millis.to_string()) {
		headers.insert(HeaderName::from_static(X_REQUEST_START), v);
	}
}

fn rewrite_for_endpoint(headers: &mut HeaderMap, original_uri: &Uri, endpoint: &Endpoint) -> Result<Uri, http::Error> {
	let scheme = if endpoint.is_tls() { "https" } else { "http" };
	let mut parts = original_uri.clone().into_parts();
	parts.scheme = Some(scheme.parse()?);
	parts.authority = Some(endpoint.canonical_addr().parse()?);
	let uri = Uri::from_parts(parts).map_err(http::Error::from)?;

	set_cf_headers(headers, endpoint);
	Ok(uri)
}

/// §4.E "Route-service branch": substitutes the route-service URL for the entire outbound
/// request, `Host` included. No `X-CF-*` headers are set here — those identify the selected
/// backend endpoint, which the route-service branch never exposes.
fn rewrite_for_route_service(headers: &mut HeaderMap, route_service_url: &Uri) -> Result<Uri, http::Error> {
	if let Some(authority) = route_service_url.authority()
		&& let Ok(host_header) = HeaderValue::from_str(authority.as_str())
	{
		headers.insert(header::HOST, host_header);
	}
	Ok(route_service_url.clone())
}

fn set_cf_headers(headers: &mut HeaderMap, endpoint: &Endpoint) {
	if let Ok(v) = HeaderValue::from_str(&endpoint.application_id) {
		headers.insert(HeaderName::from_static("x-cf-applicationid"), v);
	}
	if let Ok(v) = HeaderValue::from_str(&endpoint.private_instance_index) {
		headers.insert(HeaderName::from_static("x-cf-instanceindex"), v);
	}
	if let Ok(v) = HeaderValue::from_str(endpoint.instance_id_header_value()) {
		headers.insert(HeaderName::from_static("x-cf-instanceid"), v);
	}
}

fn body_for_attempt(bytes: &Bytes) -> ReqBody {
	Full::new(bytes.clone())
		.map_err(|never: std::convert::Infallible| -> Box<dyn std::error::Error + Send + Sync> { match never {} })
		.boxed()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::ModificationTag;

	fn ep(addr: &str) -> Endpoint {
		Endpoint::new(addr, "app", ModificationTag::new("g", 1))
	}

	fn get_request() -> DispatchRequest {
		DispatchRequest {
			method: Method::GET,
			uri: Uri::from_static("/foo"),
			version: http::Version::HTTP_11,
			headers: HeaderMap::new(),
			body: Bytes::new(),
		}
	}

	#[test]
	fn idempotent_request_detection_covers_safe_methods_and_bodyless_requests() {
		let mut req = get_request();
		assert!(req.is_idempotent());
		req.method = Method::POST;
		assert!(req.is_idempotent()); // empty body
		req.body = Bytes::from_static(b"x");
		assert!(!req.is_idempotent());
		req
			.headers
			.insert(HeaderName::from_static("idempotency-key"), HeaderValue::from_static("abc"));
		assert!(req.is_idempotent());
	}

	#[test]
	fn strip_hop_by_hop_removes_both_fixed_and_listed_headers() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, HeaderValue::from_static("x-custom"));
		headers.insert(HeaderName::from_static("x-custom"), HeaderValue::from_static("1"));
		headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
		strip_hop_by_hop(&mut headers);
		assert!(!headers.contains_key(header::CONNECTION));
		assert!(!headers.contains_key("x-custom"));
		assert!(!headers.contains_key(header::TRANSFER_ENCODING));
	}

	#[test]
	fn forwarded_for_appends_to_an_existing_chain() {
		let mut headers = HeaderMap::new();
		headers.insert(header::X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
		apply_forwarded_for(&mut headers, Some("5.6.7.8".parse().unwrap()));
		assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.2.3.4, 5.6.7.8");
	}

	#[test]
	fn rewrite_for_endpoint_sets_scheme_host_and_cf_headers() {
		let mut headers = HeaderMap::new();
		let mut e = ep("10.0.0.5:8080");
		e.tls = true;
		e.private_instance_index = "2".into();
		let uri = rewrite_for_endpoint(&mut headers, &Uri::from_static("/path?x=1"), &e).unwrap();
		assert_eq!(uri.scheme_str(), Some("https"));
		assert_eq!(uri.authority().unwrap().as_str(), "10.0.0.5:8080");
		assert_eq!(headers.get("x-cf-instanceindex").unwrap(), "2");
	}

	struct NeverResponds;
	impl RoundTripper for NeverResponds {
		fn round_trip(&self, _req: http::Request<ReqBody>) -> crate::transport::BoxFuture<Result<http::Response<Incoming>, TransportError>> {
			Box::pin(std::future::pending())
		}
	}

	struct UnusedFactory;
	impl TransportFactory for UnusedFactory {
		fn round_tripper(&self, _e: &Endpoint, _is_route_service: bool) -> Arc<dyn RoundTripper> {
			unreachable!("test never looks up a transport by endpoint")
		}
		fn raw_target(&self, _e: &Endpoint) -> EndpointTarget {
			unreachable!("test never dials raw")
		}
	}

	/// §7 property 10, isolated at the unit that implements it: a cancellation that has already
	/// fired wins the race against a round trip that would otherwise hang forever.
	#[tokio::test]
	async fn round_trip_or_cancel_prefers_an_already_cancelled_token() {
		let dispatcher = Dispatcher::new(
			DispatcherConfig {
				backend_max_attempts: 3,
				route_service_max_attempts: 3,
				endpoint_timeout: Duration::from_secs(30),
				max_response_headers: 0,
				az_preference: AzPreference::None,
				local_az: None,
				sticky: StickyConfig::default(),
			},
			Arc::new(UnusedFactory),
		);

		let token = tokio_util::sync::CancellationToken::new();
		token.cancel();
		let transport: Arc<dyn RoundTripper> = Arc::new(NeverResponds);
		let req = http::Request::new(body_for_attempt(&Bytes::new()));

		let outcome = dispatcher.round_trip_or_cancel(&transport, req, Some(&token)).await;
		assert!(matches!(outcome, RoundTripOutcome::Cancelled));
	}

	#[tokio::test]
	async fn round_trip_or_cancel_with_no_token_just_awaits_the_round_trip() {
		struct Fails;
		impl RoundTripper for Fails {
			fn round_trip(&self, _req: http::Request<ReqBody>) -> crate::transport::BoxFuture<Result<http::Response<Incoming>, TransportError>> {
				Box::pin(async { Err(TransportError::ConnectionReset) })
			}
		}

		let dispatcher = Dispatcher::new(
			DispatcherConfig {
				backend_max_attempts: 1,
				route_service_max_attempts: 1,
				endpoint_timeout: Duration::ZERO,
				max_response_headers: 0,
				az_preference: AzPreference::None,
				local_az: None,
				sticky: StickyConfig::default(),
			},
			Arc::new(UnusedFactory),
		);
		let transport: Arc<dyn RoundTripper> = Arc::new(Fails);
		let req = http::Request::new(body_for_attempt(&Bytes::new()));
		let outcome = dispatcher.round_trip_or_cancel(&transport, req, None).await;
		assert!(matches!(outcome, RoundTripOutcome::Error(TransportError::ConnectionReset)));
	}
}
