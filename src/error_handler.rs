//! Terminal-error → HTTP response mapping (§4.F, §7). Walks a fixed, ordered table instead of a
//! runtime-configurable one: spec.md describes the table as "configured", but every entry it
//! actually lists is a structural property of `TransportError`, so the table is compiled in
//! rather than threaded through `Config`.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};

use crate::error::{DispatchError, TransportError};

pub const ROUTER_ERROR_HEADER: &str = "x-cf-routererror";
const ROUTER_ERROR_VALUE: &str = "endpoint_failure";

pub struct ErrorResponse {
	pub status: StatusCode,
	pub body: String,
}

fn status_unchecked(code: u16) -> StatusCode {
	StatusCode::from_u16(code).expect("status codes in this table are fixed and valid")
}

fn default_bad_gateway() -> ErrorResponse {
	ErrorResponse {
		status: StatusCode::BAD_GATEWAY,
		body: "502 Bad Gateway: Registered endpoint failed to handle the request.".to_string(),
	}
}

/// Maps a terminal `DispatchError` to the client-visible status and body. Does not touch
/// headers; call [`apply_headers`] once the caller has a `HeaderMap` to write into.
pub fn handle(err: &DispatchError) -> ErrorResponse {
	match err {
		DispatchError::Cancelled => ErrorResponse {
			status: status_unchecked(499),
			body: "499 Request Cancelled".to_string(),
		},
		DispatchError::Transport(t) => transport_response(t),
		DispatchError::NoEndpointsAvailable => default_bad_gateway(),
		DispatchError::DeadlineExceeded => default_bad_gateway(),
		DispatchError::TooManyResponseHeaders => default_bad_gateway(),
		DispatchError::SetupError(msg) => ErrorResponse {
			status: StatusCode::BAD_GATEWAY,
			body: format!("502 Bad Gateway: {msg}"),
		},
	}
}

/// Walks through `IncompleteRequest`'s wrap to classify the cause underneath, same as the
/// classifier does, so a wrapped hostname-mismatch still maps to 503 rather than the 502
/// default.
fn transport_response(e: &TransportError) -> ErrorResponse {
	match e {
		TransportError::IncompleteRequest(inner) => transport_response(inner),
		TransportError::TlsRecordHeader => ErrorResponse {
			status: status_unchecked(525),
			body: "525 SSL Handshake Failed".to_string(),
		},
		TransportError::HostnameMismatch(_) => ErrorResponse {
			status: StatusCode::SERVICE_UNAVAILABLE,
			body: "503 Service Unavailable".to_string(),
		},
		TransportError::UntrustedCertificate(_) | TransportError::CertificateExpired | TransportError::CertificateNotYetValid => ErrorResponse {
			status: status_unchecked(526),
			body: "526 Invalid SSL Certificate".to_string(),
		},
		TransportError::RemoteCertCheckFailed => ErrorResponse {
			status: status_unchecked(496),
			body: "496 SSL Certificate Required".to_string(),
		},
		_ => default_bad_gateway(),
	}
}

/// Sets the router-error header and strips `Connection`, per §4.F/§6. The dispatcher calls this
/// at most once per request, on the single path that writes the terminal response.
pub fn apply_headers(headers: &mut HeaderMap) {
	headers.insert(
		HeaderName::from_static(ROUTER_ERROR_HEADER),
		HeaderValue::from_static(ROUTER_ERROR_VALUE),
	);
	headers.remove(header::CONNECTION);
}

/// True if a `DispatchError` ultimately fell through the table's default arm: the caller uses
/// this to decide whether to bump the bad-gateway counter (§4.F: "plus a bad-gateway counter").
pub fn is_default_bad_gateway(err: &DispatchError) -> bool {
	match err {
		DispatchError::Cancelled => false,
		DispatchError::Transport(t) => is_transport_default(t),
		DispatchError::SetupError(_) => true,
		DispatchError::NoEndpointsAvailable | DispatchError::DeadlineExceeded | DispatchError::TooManyResponseHeaders => true,
	}
}

fn is_transport_default(e: &TransportError) -> bool {
	match e {
		TransportError::IncompleteRequest(inner) => is_transport_default(inner),
		TransportError::TlsRecordHeader
		| TransportError::HostnameMismatch(_)
		| TransportError::UntrustedCertificate(_)
		| TransportError::CertificateExpired
		| TransportError::CertificateNotYetValid
		| TransportError::RemoteCertCheckFailed => false,
		_ => true,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tls_to_non_tls_maps_to_525() {
		let err = DispatchError::Transport(TransportError::TlsRecordHeader);
		assert_eq!(handle(&err).status.as_u16(), 525);
		assert!(!is_default_bad_gateway(&err));
	}

	#[test]
	fn hostname_mismatch_maps_to_503() {
		let err = DispatchError::Transport(TransportError::HostnameMismatch("app.internal".to_string()));
		assert_eq!(handle(&err).status, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[test]
	fn unmatched_dial_error_falls_through_to_502_and_counts() {
		let err = DispatchError::Transport(TransportError::Dial("10.0.0.1:80".to_string(), std::io::Error::other("refused")));
		assert_eq!(handle(&err).status, StatusCode::BAD_GATEWAY);
		assert!(is_default_bad_gateway(&err));
	}

	#[test]
	fn cancellation_maps_to_499_and_does_not_count_as_bad_gateway() {
		let err = DispatchError::Cancelled;
		assert_eq!(handle(&err).status.as_u16(), 499);
		assert!(!is_default_bad_gateway(&err));
	}

	#[test]
	fn incomplete_request_wrap_is_classified_through_to_the_inner_cause() {
		let err = DispatchError::Transport(TransportError::IncompleteRequest(Box::new(TransportError::HostnameMismatch("x".to_string()))));
		assert_eq!(handle(&err).status, StatusCode::SERVICE_UNAVAILABLE);
	}

	#[test]
	fn applying_headers_sets_router_error_and_strips_connection() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		apply_headers(&mut headers);
		assert_eq!(headers.get(ROUTER_ERROR_HEADER).unwrap(), "endpoint_failure");
		assert!(!headers.contains_key(header::CONNECTION));
	}
}
