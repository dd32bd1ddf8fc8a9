//! One backend instance: its routable identity, its modification tag (the sole ordering truth
//! for pool updates), its atomic connection counter, and its lazily-initialized transport.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use agent_core::strng::{self, Strng};
use serde::Serialize;

use crate::transport::RoundTripper;

/// Monotonic `(guid, index)` ordering for `Pool::put`/`Pool::remove`. The zero tag never
/// supersedes anything and is always superseded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModificationTag {
	pub guid: Strng,
	pub index: u32,
}

impl ModificationTag {
	pub fn new(guid: impl Into<Strng>, index: u32) -> Self {
		Self { guid: guid.into(), index }
	}

	pub fn zero() -> Self {
		Self { guid: strng::EMPTY, index: 0 }
	}

	pub fn is_zero(&self) -> bool {
		self.guid.is_empty() && self.index == 0
	}

	/// True if `self` is strictly newer than `other`: same guid lineage with a higher index,
	/// or `other` is the zero tag (anything non-zero supersedes it).
	pub fn supersedes(&self, other: &ModificationTag) -> bool {
		other.is_zero() || (self.guid == other.guid && self.index > other.index)
	}

	/// True if `self` is equal to or newer than `other`, used by `Pool::remove`'s tag check.
	pub fn at_least(&self, other: &ModificationTag) -> bool {
		other.is_zero() || (self.guid == other.guid && self.index >= other.index)
	}
}

/// Deserialized and displayed by hand (not `#[serde(rename_all)]`) so the wire strings
/// (`"round-robin"`, `"least-connection"`) match SPEC_FULL.md §6 without pulling in a derive
/// macro for a two-variant enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "&'static str")]
pub enum LoadBalancingAlgorithm {
	RoundRobin,
	LeastConnection,
}

impl From<LoadBalancingAlgorithm> for &'static str {
	fn from(a: LoadBalancingAlgorithm) -> Self {
		a.as_str()
	}
}

impl<'de> serde::Deserialize<'de> for LoadBalancingAlgorithm {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		LoadBalancingAlgorithm::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown load balancing algorithm: {s}")))
	}
}

impl LoadBalancingAlgorithm {
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"round-robin" => Some(Self::RoundRobin),
			"least-connection" => Some(Self::LeastConnection),
			_ => None,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::RoundRobin => "round-robin",
			Self::LeastConnection => "least-connection",
		}
	}
}

/// Double-checked-lock slot for an endpoint's round-trip transport. Constructed at most once
/// per endpoint; cleared (so the next use rebuilds it) when the endpoint's SAN changes on
/// update. Deliberately not a `OnceLock`, which cannot be cleared.
#[derive(Default)]
pub struct TransportSlot(RwLock<Option<Arc<dyn RoundTripper>>>);

impl TransportSlot {
	pub fn new() -> Self {
		Self(RwLock::new(None))
	}

	pub fn get(&self) -> Option<Arc<dyn RoundTripper>> {
		self.0.read().unwrap().clone()
	}

	pub fn set(&self, transport: Arc<dyn RoundTripper>) {
		*self.0.write().unwrap() = Some(transport);
	}

	pub fn clear(&self) {
		*self.0.write().unwrap() = None;
	}

	/// Builds the transport via `ctor` if unset. `ctor` runs at most once across any number of
	/// concurrent first-callers.
	pub fn get_or_init(&self, ctor: impl FnOnce() -> Arc<dyn RoundTripper>) -> Arc<dyn RoundTripper> {
		if let Some(t) = self.get() {
			return t;
		}
		let mut guard = self.0.write().unwrap();
		if let Some(t) = guard.as_ref() {
			return t.clone();
		}
		let t = ctor();
		*guard = Some(t.clone());
		t
	}
}

pub struct Endpoint {
	pub address: Strng,
	pub tls: bool,
	pub server_cert_domain_san: Option<Strng>,
	pub protocol: Option<Strng>,
	pub application_id: Strng,
	pub private_instance_id: Strng,
	pub private_instance_index: Strng,
	pub availability_zone: Option<Strng>,
	pub load_balancing_algorithm: Option<LoadBalancingAlgorithm>,
	pub isolation_segment: Strng,
	pub tags: BTreeMap<Strng, Strng>,
	pub route_service_url: Option<Strng>,
	pub stale_threshold: Duration,
	pub modification_tag: ModificationTag,

	transport: TransportSlot,
	connections: AtomicI64,
}

impl Endpoint {
	pub fn new(address: impl Into<Strng>, application_id: impl Into<Strng>, modification_tag: ModificationTag) -> Self {
		Self {
			address: address.into(),
			tls: false,
			server_cert_domain_san: None,
			protocol: None,
			application_id: application_id.into(),
			private_instance_id: strng::EMPTY,
			private_instance_index: strng::EMPTY,
			availability_zone: None,
			load_balancing_algorithm: None,
			isolation_segment: strng::EMPTY,
			tags: BTreeMap::new(),
			route_service_url: None,
			stale_threshold: Duration::from_secs(120),
			modification_tag,
			transport: TransportSlot::new(),
			connections: AtomicI64::new(0),
		}
	}

	pub fn canonical_addr(&self) -> &str {
		&self.address
	}

	pub fn is_tls(&self) -> bool {
		self.tls
	}

	pub fn has_private_instance_id(&self) -> bool {
		!self.private_instance_id.is_empty()
	}

	/// The header value used for `X-CF-InstanceID`: the private instance id if set, else the
	/// canonical address.
	pub fn instance_id_header_value(&self) -> &str {
		if self.has_private_instance_id() {
			&self.private_instance_id
		} else {
			&self.address
		}
	}

	pub fn connection_count(&self) -> i64 {
		self.connections.load(Ordering::SeqCst)
	}

	pub fn pre_request(&self) {
		self.connections.fetch_add(1, Ordering::SeqCst);
	}

	pub fn post_request(&self) {
		self.connections.fetch_sub(1, Ordering::SeqCst);
	}

	pub fn is_overloaded(&self, max_conns_per_backend: i64) -> bool {
		max_conns_per_backend > 0 && self.connection_count() >= max_conns_per_backend
	}

	pub fn transport(&self) -> Option<Arc<dyn RoundTripper>> {
		self.transport.get()
	}

	pub fn transport_or_init(&self, ctor: impl FnOnce() -> Arc<dyn RoundTripper>) -> Arc<dyn RoundTripper> {
		self.transport.get_or_init(ctor)
	}

	/// Whether `self` and `update` share the identity that pins the lazily-built transport: same
	/// TLS flag and SAN. Used by `Pool::put` to decide whether the transport slot carries over.
	pub(crate) fn same_transport_identity(&self, update: &Endpoint) -> bool {
		self.tls == update.tls && self.server_cert_domain_san == update.server_cert_domain_san
	}

	/// Seeds this freshly-constructed endpoint's transport slot from a predecessor, used by
	/// `Pool::put` when a `Put` carries a newer tag but unchanged transport identity.
	pub(crate) fn inherit_transport(&self, transport: Arc<dyn RoundTripper>) {
		self.transport.set(transport);
	}

	/// Seeds this freshly-constructed endpoint's connection counter from a predecessor, so a
	/// `Put` never resets in-flight connection accounting to zero.
	pub(crate) fn inherit_connection_count(&self, count: i64) {
		if count != 0 {
			self.connections.fetch_add(count, Ordering::SeqCst);
		}
	}

	pub fn to_json(&self) -> EndpointJson<'_> {
		EndpointJson {
			address: &self.address,
			availability_zone: self.availability_zone.as_deref(),
			protocol: self.protocol.as_deref(),
			tls: self.tls,
			ttl: self.stale_threshold.as_secs(),
			route_service_url: self.route_service_url.as_deref().filter(|s| !s.is_empty()),
			tags: &self.tags,
			isolation_segment: &self.isolation_segment,
			private_instance_id: &self.private_instance_id,
			server_cert_domain_san: self.server_cert_domain_san.as_deref(),
			load_balancing_algorithm: self.load_balancing_algorithm.map(|a| a.as_str()),
		}
	}
}

/// Field-by-field identity comparison, including deep map equality on tags. Deliberately
/// excludes runtime state (connection count, transport slot): two descriptions of "the same
/// endpoint" can disagree on live connection count without being unequal.
impl PartialEq for Endpoint {
	fn eq(&self, other: &Self) -> bool {
		self.address == other.address
			&& self.tls == other.tls
			&& self.server_cert_domain_san == other.server_cert_domain_san
			&& self.protocol == other.protocol
			&& self.application_id == other.application_id
			&& self.private_instance_id == other.private_instance_id
			&& self.private_instance_index == other.private_instance_index
			&& self.availability_zone == other.availability_zone
			&& self.load_balancing_algorithm == other.load_balancing_algorithm
			&& self.isolation_segment == other.isolation_segment
			&& self.tags == other.tags
			&& self.route_service_url == other.route_service_url
			&& self.stale_threshold == other.stale_threshold
			&& self.modification_tag == other.modification_tag
	}
}

#[derive(Serialize)]
pub struct EndpointJson<'a> {
	pub address: &'a str,
	pub availability_zone: Option<&'a str>,
	pub protocol: Option<&'a str>,
	pub tls: bool,
	pub ttl: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub route_service_url: Option<&'a str>,
	pub tags: &'a BTreeMap<Strng, Strng>,
	pub isolation_segment: &'a str,
	pub private_instance_id: &'a str,
	pub server_cert_domain_san: Option<&'a str>,
	pub load_balancing_algorithm: Option<&'static str>,
}

/// Timestamp of the last time this endpoint was observed to fail with a `Failable` error;
/// cleared by the iterator once `retry_after_failure` has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct FailureMark(pub Option<Instant>);

impl Default for FailureMark {
	fn default() -> Self {
		Self(None)
	}
}

impl FailureMark {
	pub fn mark_now(&mut self) {
		self.0 = Some(Instant::now());
	}

	pub fn clear(&mut self) {
		self.0 = None;
	}

	pub fn is_failed(&self) -> bool {
		self.0.is_some()
	}

	/// Clears the mark if it is older than `retry_after_failure`, then reports whether the
	/// endpoint is still considered failed.
	pub fn recheck(&mut self, retry_after_failure: Duration) -> bool {
		if let Some(at) = self.0 {
			if at.elapsed() > retry_after_failure {
				self.0 = None;
			}
		}
		self.is_failed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn zero_tag_is_superseded_by_anything() {
		let zero = ModificationTag::zero();
		let t = ModificationTag::new("a", 1);
		assert!(t.supersedes(&zero));
		assert!(!zero.supersedes(&t));
	}

	#[test]
	fn same_guid_higher_index_supersedes() {
		let a = ModificationTag::new("g", 1);
		let b = ModificationTag::new("g", 2);
		assert!(b.supersedes(&a));
		assert!(!a.supersedes(&b));
	}

	#[test]
	fn different_guid_does_not_supersede() {
		let a = ModificationTag::new("g1", 5);
		let b = ModificationTag::new("g2", 1);
		assert!(!b.supersedes(&a));
		assert!(!a.supersedes(&b));
	}

	#[test]
	fn failure_mark_clears_after_retry_window() {
		let mut mark = FailureMark::default();
		assert!(!mark.is_failed());
		mark.mark_now();
		assert!(mark.recheck(Duration::from_secs(60)));
		assert!(!mark.recheck(Duration::from_millis(0)));
	}

	#[test]
	fn equality_ignores_connection_count_and_transport() {
		let a = Endpoint::new("10.0.0.1:80", "app", ModificationTag::new("g", 1));
		let b = Endpoint::new("10.0.0.1:80", "app", ModificationTag::new("g", 1));
		a.pre_request();
		assert_eq!(a, b);
	}
}
