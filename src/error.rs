//! The terminal error taxonomy produced by a dispatch attempt. `TransportError` is the surface
//! the classifier groups (`classify.rs`) match against; `DispatchError` wraps it with the
//! setup/protocol-policy/cancellation cases that never reach the classifier at all.

use std::fmt;

/// Errors observed from (or synthesized around) a single round-trip attempt.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("dial {0}: {1}")]
	Dial(String, std::io::Error),

	#[error("read: connection reset by peer")]
	ConnectionReset,

	#[error("tls record header looks like plaintext: endpoint speaks http, not tls")]
	TlsRecordHeader,

	#[error("tls handshake failed: {0}")]
	HandshakeFailure(String),

	#[error("tls handshake timed out")]
	HandshakeTimeout,

	#[error("tls hostname mismatch: {0}")]
	HostnameMismatch(String),

	#[error("tls certificate untrusted: {0}")]
	UntrustedCertificate(String),

	#[error("tls certificate expired")]
	CertificateExpired,

	#[error("tls certificate not yet valid")]
	CertificateNotYetValid,

	#[error("remote certificate check failed")]
	RemoteCertCheckFailed,

	/// A bare EOF observed mid-response, before substitution. Not retriable on its own: the
	/// dispatcher only retries this for requests it has established are idempotent, at which
	/// point it substitutes `IdempotentRequestEof` instead of surfacing this variant.
	#[error("unexpected eof")]
	Eof,

	/// The per-attempt `endpointTimeout` deadline elapsed before the round trip completed.
	#[error("endpoint timeout elapsed")]
	Timeout,

	/// Substituted by the dispatcher in place of a bare EOF on an idempotent request, so the
	/// classifier can allow a retry without losing the fact that the wire error was just EOF.
	#[error("idempotent request saw eof")]
	IdempotentRequestEof,

	/// Wraps any of the above when the per-attempt tracer shows the request never obtained a
	/// connection or never finished writing its headers: always safe to retry.
	#[error("incomplete request: {0}")]
	IncompleteRequest(Box<TransportError>),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl TransportError {
	/// Walks the wrap chain (currently only `IncompleteRequest` wraps), applying `f` to each
	/// layer until it returns `true`. Classifiers use this instead of matching only the
	/// outermost variant.
	pub fn any_in_chain(&self, f: impl Fn(&TransportError) -> bool) -> bool {
		if f(self) {
			return true;
		}
		match self {
			TransportError::IncompleteRequest(inner) => inner.any_in_chain(f),
			_ => false,
		}
	}

	/// True when this error occurred before the round trip could have obtained a connection and
	/// written its request headers: dial failures and every phase of the TLS handshake. Drives
	/// whether the dispatcher wraps the error in `IncompleteRequest` (§4.E step 8) — a request
	/// that never left the client is always safe to retry, independent of what the error itself
	/// is.
	pub fn occurred_before_connect(&self) -> bool {
		match self {
			TransportError::Dial(..)
				| TransportError::TlsRecordHeader
				| TransportError::HandshakeFailure(_)
				| TransportError::HandshakeTimeout
				| TransportError::HostnameMismatch(_)
				| TransportError::UntrustedCertificate(_)
				| TransportError::CertificateExpired
				| TransportError::CertificateNotYetValid
				| TransportError::RemoteCertCheckFailed => true,
			TransportError::IncompleteRequest(inner) => inner.occurred_before_connect(),
			_ => false,
		}
	}
}

/// A terminal error from one full dispatch (all attempts exhausted, or a non-retriable failure
/// on the first attempt). This is what reaches the error handler.
#[derive(thiserror::Error)]
pub enum DispatchError {
	#[error("no endpoints available")]
	NoEndpointsAvailable,

	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error("client request cancelled")]
	Cancelled,

	#[error("attempt deadline exceeded")]
	DeadlineExceeded,

	#[error("too many response headers")]
	TooManyResponseHeaders,

	#[error("dispatcher misconfigured: {0}")]
	SetupError(&'static str),
}

impl DispatchError {
	pub fn transport(&self) -> Option<&TransportError> {
		match self {
			DispatchError::Transport(t) => Some(t),
			_ => None,
		}
	}
}

/// A stable, loggable label for a `DispatchError`, independent of its `Display` message.
/// Used as a metric label so cardinality stays bounded.
pub fn kind_label(e: &DispatchError) -> &'static str {
	match e {
		DispatchError::NoEndpointsAvailable => "no_endpoints",
		DispatchError::Transport(t) => transport_kind_label(t),
		DispatchError::Cancelled => "cancelled",
		DispatchError::DeadlineExceeded => "deadline_exceeded",
		DispatchError::TooManyResponseHeaders => "too_many_response_headers",
		DispatchError::SetupError(_) => "setup_error",
	}
}

fn transport_kind_label(e: &TransportError) -> &'static str {
	match e {
		TransportError::Dial(..) => "dial",
		TransportError::ConnectionReset => "connection_reset",
		TransportError::TlsRecordHeader => "tls_record_header",
		TransportError::HandshakeFailure(_) => "handshake_failure",
		TransportError::HandshakeTimeout => "handshake_timeout",
		TransportError::HostnameMismatch(_) => "hostname_mismatch",
		TransportError::UntrustedCertificate(_) => "untrusted_certificate",
		TransportError::CertificateExpired => "certificate_expired",
		TransportError::CertificateNotYetValid => "certificate_not_yet_valid",
		TransportError::RemoteCertCheckFailed => "remote_cert_check_failed",
		TransportError::Eof => "eof",
		TransportError::Timeout => "timeout",
		TransportError::IdempotentRequestEof => "idempotent_eof",
		TransportError::IncompleteRequest(inner) => transport_kind_label(inner),
		TransportError::Other(_) => "other",
	}
}

impl fmt::Debug for DispatchError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self}")
	}
}
