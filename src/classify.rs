//! Retriable / Prunable / Failable predicate groups over [`TransportError`]. Matching walks the
//! wrap chain (`TransportError::any_in_chain`) rather than looking only at the outermost layer,
//! and TLS identity errors are matched structurally, never by formatted string.

use crate::error::TransportError;

fn is_retriable_single(e: &TransportError) -> bool {
	matches!(
		e,
		TransportError::Dial(..)
			| TransportError::ConnectionReset
			| TransportError::TlsRecordHeader
			| TransportError::HandshakeFailure(_)
			| TransportError::HandshakeTimeout
			| TransportError::HostnameMismatch(_)
			| TransportError::UntrustedCertificate(_)
			| TransportError::CertificateExpired
			| TransportError::CertificateNotYetValid
			| TransportError::RemoteCertCheckFailed
			| TransportError::Timeout
			| TransportError::IdempotentRequestEof
	)
}

/// Sound to retry against a different endpoint. `IncompleteRequest` is unconditionally retriable
/// regardless of what it wraps: the request never reached the backend, so retrying it can't
/// double-apply any side effect (§4.A).
pub fn is_retriable(e: &TransportError) -> bool {
	matches!(e, TransportError::IncompleteRequest(_)) || e.any_in_chain(is_retriable_single)
}

/// `Failable` is defined identically to `Retriable`: whether to mark the endpoint's `failed_at`
/// timestamp on the pool.
pub fn is_failable(e: &TransportError) -> bool {
	is_retriable(e)
}

fn is_identity_error_single(e: &TransportError) -> bool {
	matches!(
		e,
		TransportError::HostnameMismatch(_)
			| TransportError::TlsRecordHeader
			| TransportError::HandshakeFailure(_)
			| TransportError::HandshakeTimeout
			| TransportError::UntrustedCertificate(_)
			| TransportError::CertificateExpired
			| TransportError::CertificateNotYetValid
	)
}

/// Prunable on a TLS endpoint: the endpoint's identity looks wrong, remove it from the pool
/// immediately rather than merely marking it failed. Dial failures are prunable only on TLS
/// endpoints (a TLS-configured endpoint that won't even accept a TCP connection is presumed
/// decommissioned, not transiently overloaded).
pub fn is_prunable_on_tls_endpoint(e: &TransportError) -> bool {
	e.any_in_chain(|e| is_identity_error_single(e) || matches!(e, TransportError::Dial(..)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dial_is_retriable_but_only_prunable_on_tls() {
		let e = TransportError::Dial("10.0.0.1:80".into(), std::io::Error::other("refused"));
		assert!(is_retriable(&e));
		assert!(is_prunable_on_tls_endpoint(&e));
	}

	#[test]
	fn hostname_mismatch_is_retriable_and_prunable() {
		let e = TransportError::HostnameMismatch("app.internal".into());
		assert!(is_retriable(&e));
		assert!(is_prunable_on_tls_endpoint(&e));
	}

	#[test]
	fn connection_reset_is_retriable_but_not_prunable() {
		let e = TransportError::ConnectionReset;
		assert!(is_retriable(&e));
		assert!(!is_prunable_on_tls_endpoint(&e));
	}

	#[test]
	fn incomplete_request_unwraps_through_the_chain() {
		let inner = TransportError::ConnectionReset;
		let wrapped = TransportError::IncompleteRequest(Box::new(inner));
		assert!(is_retriable(&wrapped));
		assert!(!is_prunable_on_tls_endpoint(&wrapped));

		let inner = TransportError::HostnameMismatch("x".into());
		let wrapped = TransportError::IncompleteRequest(Box::new(inner));
		assert!(is_prunable_on_tls_endpoint(&wrapped));
	}

	#[test]
	fn other_is_not_retriable() {
		let e = TransportError::Other(anyhow::anyhow!("response body read error"));
		assert!(!is_retriable(&e));
	}

	#[test]
	fn incomplete_request_is_retriable_even_when_its_inner_error_is_not() {
		let wrapped = TransportError::IncompleteRequest(Box::new(TransportError::Eof));
		assert!(!is_retriable(&TransportError::Eof));
		assert!(is_retriable(&wrapped));
	}
}
