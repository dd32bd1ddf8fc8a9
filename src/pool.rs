//! The endpoint pool: the dynamic, concurrent collection of backends sharing one routing key.
//! Mutations take the pool-wide lock; the connection counters and transport slots they leave
//! alone stay lock-free/element-scoped per `endpoint.rs`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use agent_core::strng::Strng;

use crate::endpoint::{Endpoint, FailureMark, LoadBalancingAlgorithm, ModificationTag};
use crate::error::TransportError;
use crate::iterator::{AzPreference, EndpointIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutResult {
	Added,
	Updated,
	Unmodified,
}

struct Element {
	endpoint: Arc<Endpoint>,
	updated: Instant,
	failed: FailureMark,
}

struct PoolState {
	elements: Vec<Element>,
	by_address: HashMap<Strng, usize>,
	by_private_instance_id: HashMap<Strng, usize>,
	next_index: usize,
	route_service_url: Option<Strng>,
}

impl PoolState {
	fn new() -> Self {
		Self {
			elements: Vec::new(),
			by_address: HashMap::new(),
			by_private_instance_id: HashMap::new(),
			next_index: 0,
			route_service_url: None,
		}
	}

	/// Swap-removes the element at `idx`, re-indexing whichever element took its place.
	fn remove_at(&mut self, idx: usize) -> Element {
		let removed = self.elements.swap_remove(idx);
		self.by_address.remove(removed.endpoint.canonical_addr());
		if removed.endpoint.has_private_instance_id() {
			self.by_private_instance_id.remove(&removed.endpoint.private_instance_id);
		}
		if idx < self.elements.len() {
			let moved_addr = self.elements[idx].endpoint.address.clone();
			self.by_address.insert(moved_addr, idx);
			if self.elements[idx].endpoint.has_private_instance_id() {
				let id = self.elements[idx].endpoint.private_instance_id.clone();
				self.by_private_instance_id.insert(id, idx);
			}
		}
		if self.next_index >= self.elements.len() {
			self.next_index = 0;
		}
		removed
	}
}

/// Configuration carried alongside the element list; set at construction, mutable only through
/// explicit setters (not part of the per-request hot path).
pub struct PoolConfig {
	pub load_balancing_algorithm: LoadBalancingAlgorithm,
	pub retry_after_failure: Duration,
	pub max_conns_per_backend: i64,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			load_balancing_algorithm: LoadBalancingAlgorithm::RoundRobin,
			retry_after_failure: Duration::from_secs(30),
			max_conns_per_backend: 0,
		}
	}
}

pub struct Pool {
	pub context_path: Strng,
	config: RwLock<PoolConfig>,
	state: RwLock<PoolState>,
}

impl Pool {
	pub fn new(context_path: impl Into<Strng>, config: PoolConfig) -> Self {
		Self {
			context_path: context_path.into(),
			config: RwLock::new(config),
			state: RwLock::new(PoolState::new()),
		}
	}

	pub fn put(&self, endpoint: Endpoint) -> PutResult {
		let mut state = self.state.write().unwrap();
		if let Some(&idx) = state.by_address.get(&endpoint.address) {
			let old = state.elements[idx].endpoint.clone();
			let stored_tag = old.modification_tag.clone();
			if !endpoint.modification_tag.supersedes(&stored_tag) || endpoint.modification_tag == stored_tag {
				return PutResult::Unmodified;
			}
			let old_private_id = old.private_instance_id.clone();
			let new_private_id = endpoint.private_instance_id.clone();
			state.route_service_url = endpoint.route_service_url.clone();

			let keep_transport = old.same_transport_identity(&endpoint);
			let new_endpoint = Arc::new(endpoint);
			if keep_transport {
				if let Some(t) = old.transport() {
					new_endpoint.inherit_transport(t);
				}
			}
			new_endpoint.inherit_connection_count(old.connection_count());
			state.elements[idx].endpoint = new_endpoint;
			state.elements[idx].updated = Instant::now();

			if old_private_id != new_private_id {
				if !old_private_id.is_empty() {
					state.by_private_instance_id.remove(&old_private_id);
				}
				if !new_private_id.is_empty() {
					state.by_private_instance_id.insert(new_private_id, idx);
				}
			}
			PutResult::Updated
		} else {
			let addr = endpoint.address.clone();
			let private_id = endpoint.private_instance_id.clone();
			state.route_service_url = endpoint.route_service_url.clone();
			let idx = state.elements.len();
			state.elements.push(Element {
				endpoint: Arc::new(endpoint),
				updated: Instant::now(),
				failed: FailureMark::default(),
			});
			state.by_address.insert(addr, idx);
			if !private_id.is_empty() {
				state.by_private_instance_id.insert(private_id, idx);
			}
			PutResult::Added
		}
	}

	/// Removes the endpoint at `address` if the stored tag is equal to or older than `tag`.
	pub fn remove(&self, address: &str, tag: &ModificationTag) -> bool {
		let mut state = self.state.write().unwrap();
		let Some(&idx) = state.by_address.get(address) else {
			return false;
		};
		let stored_tag = state.elements[idx].endpoint.modification_tag.clone();
		if !tag.at_least(&stored_tag) {
			return false;
		}
		state.remove_at(idx);
		true
	}

	/// Removes and returns every non-TLS endpoint whose last update is older than its own
	/// stale threshold. TLS endpoints are never pruned this way.
	pub fn prune_endpoints(&self) -> Vec<Arc<Endpoint>> {
		let mut state = self.state.write().unwrap();
		let now = Instant::now();
		let stale: Vec<usize> = state
			.elements
			.iter()
			.enumerate()
			.filter(|(_, e)| !e.endpoint.is_tls() && now.saturating_duration_since(e.updated) > e.endpoint.stale_threshold)
			.map(|(i, _)| i)
			.collect();
		// Remove from the back so earlier indices stay valid.
		let mut removed = Vec::with_capacity(stale.len());
		for idx in stale.into_iter().rev() {
			removed.push(state.remove_at(idx).endpoint);
		}
		removed
	}

	/// Marks `endpoint` failed (pool bookkeeping only), or removes it outright if it is a TLS
	/// endpoint and `err` is in the Prunable group.
	pub fn endpoint_failed(&self, address: &str, is_tls: bool, err: &TransportError) {
		if is_tls && crate::classify::is_prunable_on_tls_endpoint(err) {
			let mut state = self.state.write().unwrap();
			if let Some(&idx) = state.by_address.get(address) {
				state.remove_at(idx);
			}
			return;
		}
		if crate::classify::is_failable(err) {
			let mut state = self.state.write().unwrap();
			if let Some(&idx) = state.by_address.get(address) {
				state.elements[idx].failed.mark_now();
			}
		}
	}

	pub fn num_endpoints(&self) -> usize {
		self.state.read().unwrap().elements.len()
	}

	pub fn is_empty(&self) -> bool {
		self.num_endpoints() == 0
	}

	pub fn is_overloaded(&self) -> bool {
		let state = self.state.read().unwrap();
		let max = self.config.read().unwrap().max_conns_per_backend;
		max > 0 && !state.elements.is_empty() && state.elements.iter().all(|e| e.endpoint.is_overloaded(max))
	}

	pub fn route_service_url(&self) -> Option<Strng> {
		self.state.read().unwrap().route_service_url.clone()
	}

	pub fn max_conns_per_backend(&self) -> i64 {
		self.config.read().unwrap().max_conns_per_backend
	}

	pub fn retry_after_failure(&self) -> Duration {
		self.config.read().unwrap().retry_after_failure
	}

	pub fn load_balancing_algorithm(&self) -> LoadBalancingAlgorithm {
		self.config.read().unwrap().load_balancing_algorithm
	}

	/// Lets a known endpoint's own algorithm override the pool-level default, as long as it
	/// names a valid algorithm.
	pub fn set_pool_load_balancing_algorithm(&self, algorithm: LoadBalancingAlgorithm) {
		self.config.write().unwrap().load_balancing_algorithm = algorithm;
	}

	pub fn each(&self, mut f: impl FnMut(&Endpoint)) {
		let state = self.state.read().unwrap();
		for e in &state.elements {
			f(&e.endpoint);
		}
	}

	pub fn to_json(&self) -> Vec<serde_json::Value> {
		let state = self.state.read().unwrap();
		state.elements.iter().map(|e| serde_json::to_value(e.endpoint.to_json()).unwrap()).collect()
	}

	/// Builds an iterator snapshot bound to the pool's current algorithm.
	pub fn endpoints(
		self: &Arc<Self>,
		initial: Option<Strng>,
		must_be_sticky: bool,
		az_preference: AzPreference,
		local_az: Option<Strng>,
	) -> EndpointIterator {
		EndpointIterator::new(self.clone(), initial, must_be_sticky, az_preference, local_az)
	}

	/// Looks up an endpoint by private instance id, honoring overload and failure state.
	pub(crate) fn find_sticky(&self, id: &str) -> Option<Arc<Endpoint>> {
		let mut state = self.state.write().unwrap();
		let max = self.config.read().unwrap().max_conns_per_backend;
		let idx = *state.by_private_instance_id.get(id)?;
		if state.elements[idx].endpoint.is_overloaded(max) {
			return None;
		}
		Some(state.elements[idx].endpoint.clone())
	}

	/// Core selection step shared by both iterator strategies: snapshot of eligible endpoints
	/// plus whatever index bookkeeping (cursor) the round-robin strategy needs. `rng` is reused
	/// across calls by the iterator so least-connection's permutation does not reseed per call.
	pub(crate) fn with_state_mut<R>(&self, f: impl FnOnce(&mut PoolState, &PoolConfig) -> R) -> R {
		let mut state = self.state.write().unwrap();
		let config = self.config.read().unwrap();
		f(&mut state, &config)
	}
}

pub(crate) struct ElementView {
	pub endpoint: Arc<Endpoint>,
	pub failed: bool,
	pub az: Option<Strng>,
}

impl PoolState {
	pub(crate) fn snapshot(&mut self, retry_after_failure: Duration) -> Vec<ElementView> {
		self
			.elements
			.iter_mut()
			.map(|e| ElementView {
				endpoint: e.endpoint.clone(),
				failed: e.failed.recheck(retry_after_failure),
				az: e.endpoint.availability_zone.clone(),
			})
			.collect()
	}

	pub(crate) fn clear_all_failures(&mut self) {
		for e in &mut self.elements {
			e.failed.clear();
		}
	}

	pub(crate) fn next_cursor(&mut self) -> usize {
		self.next_index
	}

	pub(crate) fn set_cursor(&mut self, idx: usize) {
		if self.elements.is_empty() {
			self.next_index = 0;
		} else {
			self.next_index = idx % self.elements.len();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ep(addr: &str, tag: u32) -> Endpoint {
		Endpoint::new(addr, "app", ModificationTag::new("g", tag))
	}

	#[test]
	fn put_adds_then_updates_then_ignores_stale_tag() {
		let pool = Pool::new("/", PoolConfig::default());
		assert_eq!(pool.put(ep("10.0.0.1:80", 1)), PutResult::Added);
		assert_eq!(pool.num_endpoints(), 1);

		assert_eq!(pool.put(ep("10.0.0.1:80", 2)), PutResult::Updated);
		assert_eq!(pool.put(ep("10.0.0.1:80", 1)), PutResult::Unmodified);
		assert_eq!(pool.num_endpoints(), 1);
	}

	#[test]
	fn remove_requires_tag_at_least_stored() {
		let pool = Pool::new("/", PoolConfig::default());
		pool.put(ep("10.0.0.1:80", 5));
		assert!(!pool.remove("10.0.0.1:80", &ModificationTag::new("g", 3)));
		assert_eq!(pool.num_endpoints(), 1);
		assert!(pool.remove("10.0.0.1:80", &ModificationTag::new("g", 5)));
		assert_eq!(pool.num_endpoints(), 0);
	}

	#[test]
	fn is_overloaded_requires_every_endpoint_over_limit() {
		let mut cfg = PoolConfig::default();
		cfg.max_conns_per_backend = 1;
		let pool = Pool::new("/", cfg);
		pool.put(ep("10.0.0.1:80", 1));
		pool.put(ep("10.0.0.2:80", 1));
		assert!(!pool.is_overloaded());
	}

	#[test]
	fn no_two_elements_share_an_address() {
		let pool = Pool::new("/", PoolConfig::default());
		pool.put(ep("10.0.0.1:80", 1));
		pool.put(ep("10.0.0.2:80", 1));
		pool.remove("10.0.0.1:80", &ModificationTag::new("g", 1));
		assert_eq!(pool.num_endpoints(), 1);
		pool.each(|e| assert_eq!(e.canonical_addr(), "10.0.0.2:80"));
	}
}
