//! End-to-end scenarios (§8) exercised against the pool, iterator, classifier, error handler,
//! and sticky-cookie modules together. The backend round trip itself is not mocked here:
//! `hyper::body::Incoming` has no public constructor outside hyper's own connection-driving
//! internals, so a full `Dispatcher::dispatch` integration test would need a real listening
//! socket. These tests instead drive the same decision points `dispatch` walks through, using
//! the actual pool/iterator/classifier/sticky code paths end to end.

use std::sync::Arc;

use fabricproxy::classify;
use fabricproxy::endpoint::{Endpoint, LoadBalancingAlgorithm, ModificationTag};
use fabricproxy::error::{DispatchError, TransportError};
use fabricproxy::error_handler;
use fabricproxy::iterator::AzPreference;
use fabricproxy::pool::{Pool, PoolConfig};
use fabricproxy::sticky::{self, StickyConfig};
use http::{HeaderMap, HeaderValue, header};

fn endpoint(addr: &str, private_id: &str) -> Endpoint {
	let mut e = Endpoint::new(addr, "app", ModificationTag::new("g", 1));
	e.private_instance_id = private_id.into();
	e
}

/// Scenario 1: one endpoint, every attempt dials and fails, `maxAttempts = 3`. Expect exactly
/// 3 attempts, the pool's endpoint marked failed each time, and a 502 with the router-error
/// header once the loop gives up.
#[test]
fn scenario_1_exhausted_dial_failures_become_a_502() {
	let pool = Arc::new(Pool::new("/app", PoolConfig::default()));
	pool.put(endpoint("10.0.0.1:80", ""));

	let iter = pool.endpoints(None, false, AzPreference::None, None);
	let max_attempts = 3;
	let mut attempts = 0;
	let mut last_err = None;

	for attempt in 0..max_attempts {
		let Some(ep) = iter.next(attempt) else { break };
		attempts += 1;
		let err = TransportError::Dial(ep.canonical_addr().to_string(), std::io::Error::other("refused"));
		iter.endpoint_failed(&err);
		let retriable = classify::is_retriable(&err);
		last_err = Some(DispatchError::Transport(err));
		if !retriable {
			break;
		}
	}

	assert_eq!(attempts, 3);
	let err = last_err.unwrap();
	let response = error_handler::handle(&err);
	assert_eq!(response.status, http::StatusCode::BAD_GATEWAY);

	let mut headers = HeaderMap::new();
	error_handler::apply_headers(&mut headers);
	assert_eq!(headers.get(error_handler::ROUTER_ERROR_HEADER).unwrap(), "endpoint_failure");
}

/// Scenario 2: two endpoints, no sticky cookie on the request; the serving endpoint reports no
/// backend-driven affinity. Expect no `__VCAP_ID__` cookie gets installed.
#[test]
fn scenario_2_no_pin_and_no_backend_affinity_sets_no_cookie() {
	let config = StickyConfig::default();
	let response_headers = HeaderMap::new();
	let cookie = sticky::sticky_cookie(&config, "/app", None, &response_headers, "b");
	assert!(cookie.is_none());
}

/// Scenario 3: request carries `JSESSIONID=x; __VCAP_ID__=a`, served by the same endpoint `a`,
/// and the backend sets `JSESSIONID=x; Secure`. Expect `Set-Cookie: __VCAP_ID__=a` inheriting
/// the Secure flag from the matched session cookie.
#[test]
fn scenario_3_backend_affinity_cookie_inherits_secure_flag() {
	let config = StickyConfig {
		cookie_names: vec!["JSESSIONID".to_string()],
		..Default::default()
	};
	let mut response_headers = HeaderMap::new();
	response_headers.append(header::SET_COOKIE, HeaderValue::from_static("JSESSIONID=x; Secure"));
	let request_cookie = HeaderValue::from_static("JSESSIONID=x; __VCAP_ID__=a");

	let cookie = sticky::sticky_cookie(&config, "/app", Some(&request_cookie), &response_headers, "a").unwrap();
	let s = cookie.to_str().unwrap();
	assert!(s.contains("__VCAP_ID__=a"));
	assert!(s.contains("HttpOnly"));
	assert!(s.contains("Secure"));
}

/// Scenario 4: request still carries `__VCAP_ID__=a`, but `a` was removed from the pool mid-
/// flight and `b` served the retried request. Expect the response re-pins to `b`.
#[test]
fn scenario_4_pin_drift_after_mid_flight_removal_repins() {
	let pool = Arc::new(Pool::new("/app", PoolConfig::default()));
	let a = endpoint("10.0.0.1:80", "a");
	let b = endpoint("10.0.0.2:80", "b");
	pool.put(a);
	pool.put(b);

	pool.remove("10.0.0.1:80", &ModificationTag::new("g", 1));

	let iter = pool.endpoints(Some("a".into()), false, AzPreference::None, None);
	let served = iter.next(0).unwrap();
	assert_eq!(served.canonical_addr(), "10.0.0.2:80");

	let request_cookie = HeaderValue::from_static("__VCAP_ID__=a");
	let response_headers = HeaderMap::new();
	let cookie = sticky::sticky_cookie(&StickyConfig::default(), "/app", Some(&request_cookie), &response_headers, &served.private_instance_id).unwrap();
	assert!(cookie.to_str().unwrap().contains("__VCAP_ID__=b"));
}

/// Scenario 5: a TLS endpoint's round trip reports a hostname mismatch. Expect it is pruned
/// from the pool outright (not just marked failed), and with no endpoint left the terminal
/// error maps to 503.
#[test]
fn scenario_5_hostname_mismatch_prunes_tls_endpoint_and_yields_503() {
	let pool = Arc::new(Pool::new("/app", PoolConfig::default()));
	let mut e = endpoint("10.0.0.1:443", "a");
	e.tls = true;
	pool.put(e);
	assert_eq!(pool.num_endpoints(), 1);

	let iter = pool.endpoints(None, false, AzPreference::None, None);
	let served = iter.next(0).unwrap();
	assert!(served.is_tls());

	let err = TransportError::HostnameMismatch("backend.internal".to_string());
	assert!(classify::is_prunable_on_tls_endpoint(&err));
	iter.endpoint_failed(&err);

	assert_eq!(pool.num_endpoints(), 0);
	assert!(iter.next(1).is_none());

	let response = error_handler::handle(&DispatchError::Transport(err));
	assert_eq!(response.status, http::StatusCode::SERVICE_UNAVAILABLE);
}

/// Scenario 6: `endpointTimeout` elapses while a round trip is still in flight. Expect the
/// timeout surfaces as `TransportError::Timeout`, classified retriable, and the in-flight
/// future is dropped (cancelled) rather than left running.
#[tokio::test(start_paused = true)]
async fn scenario_6_endpoint_timeout_cancels_the_in_flight_round_trip() {
	use std::sync::atomic::{AtomicBool, Ordering};

	let cancelled = Arc::new(AtomicBool::new(false));
	let cancelled_for_drop = cancelled.clone();

	struct CancelOnDrop(Arc<AtomicBool>);
	impl Drop for CancelOnDrop {
		fn drop(&mut self) {
			self.0.store(true, Ordering::SeqCst);
		}
	}

	let blocked = async move {
		let _guard = CancelOnDrop(cancelled_for_drop);
		std::future::pending::<()>().await;
	};

	let result = tokio::time::timeout(std::time::Duration::from_millis(10), blocked).await;
	assert!(result.is_err());
	assert!(cancelled.load(Ordering::SeqCst));

	let err = TransportError::Timeout;
	assert!(classify::is_retriable(&err));
}

#[test]
fn round_robin_cycles_with_least_connection_also_available() {
	let pool = Arc::new(Pool::new("/app", PoolConfig::default()));
	pool.set_pool_load_balancing_algorithm(LoadBalancingAlgorithm::LeastConnection);
	pool.put(endpoint("10.0.0.1:80", ""));
	pool.put(endpoint("10.0.0.2:80", ""));

	let iter = pool.endpoints(None, false, AzPreference::None, None);
	assert!(iter.next(0).is_some());
}
