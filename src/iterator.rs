//! Per-request endpoint selection. One [`EndpointIterator`] is built per dispatch (`Pool::endpoints`)
//! and driven by the dispatcher's retry loop: `next(attempt)` picks an endpoint, `pre_request`/
//! `post_request` bracket the dispatched round trip, and `endpoint_failed` forwards to the pool's
//! bookkeeping using whichever endpoint `next` most recently handed out.
//!
//! The iterator is a value-typed snapshot: it borrows the pool by `Arc` and does not own
//! endpoint lifetime. Round-robin's cursor and least-connection's tie-breaking both read and
//! mutate shared pool state through `Pool::with_state_mut`, so concurrent iterators over the
//! same pool interleave safely but may observe each other's cursor advances.

use std::sync::{Arc, Mutex};

use agent_core::strng::Strng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::endpoint::{Endpoint, LoadBalancingAlgorithm};
use crate::error::TransportError;
use crate::pool::Pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AzPreference {
	#[default]
	None,
	Local,
}

pub struct EndpointIterator {
	pool: Arc<Pool>,
	strategy: LoadBalancingAlgorithm,
	initial: Mutex<Option<Strng>>,
	must_be_sticky: bool,
	az_preference: AzPreference,
	local_az: Option<Strng>,
	last: Mutex<Option<Arc<Endpoint>>>,
}

impl EndpointIterator {
	pub(crate) fn new(
		pool: Arc<Pool>,
		initial: Option<Strng>,
		must_be_sticky: bool,
		az_preference: AzPreference,
		local_az: Option<Strng>,
	) -> Self {
		let strategy = pool.load_balancing_algorithm();
		Self {
			pool,
			strategy,
			initial: Mutex::new(initial.filter(|s| !s.is_empty())),
			must_be_sticky,
			az_preference,
			local_az,
			last: Mutex::new(None),
		}
	}

	/// Returns the endpoint to try for the `attempt`-th attempt (zero-indexed), or `None` when
	/// no eligible endpoint exists.
	pub fn next(&self, attempt: usize) -> Option<Arc<Endpoint>> {
		if attempt == 0
			&& let Some(id) = self.initial.lock().unwrap().take()
		{
			match self.pool.find_sticky(&id) {
				Some(ep) => {
					*self.last.lock().unwrap() = Some(ep.clone());
					return Some(ep);
				},
				None if self.must_be_sticky => {
					debug!(private_instance_id = %id, "sticky endpoint unavailable and must_be_sticky set, failing selection");
					return None;
				},
				None => {},
			}
		}

		let az_active = self.az_preference == AzPreference::Local && attempt == 0 && self.local_az.is_some();
		let picked = match self.strategy {
			LoadBalancingAlgorithm::RoundRobin => self.round_robin_next(az_active),
			LoadBalancingAlgorithm::LeastConnection => self.least_connection_next(az_active),
		};
		if let Some(ep) = &picked {
			*self.last.lock().unwrap() = Some(ep.clone());
		}
		picked
	}

	pub fn pre_request(&self, e: &Endpoint) {
		e.pre_request();
	}

	pub fn post_request(&self, e: &Endpoint) {
		e.post_request();
	}

	/// Forwards to the pool's `endpoint_failed`, using the endpoint most recently returned by
	/// `next`. A no-op if `next` was never called or returned `None`.
	pub fn endpoint_failed(&self, err: &TransportError) {
		if let Some(ep) = self.last.lock().unwrap().clone() {
			self.pool.endpoint_failed(ep.canonical_addr(), ep.is_tls(), err);
		}
	}

	fn round_robin_next(&self, az_active: bool) -> Option<Arc<Endpoint>> {
		self.pool.with_state_mut(|state, config| {
			let n = state.elements.len();
			if n == 0 {
				return None;
			}
			let retry_after = config.retry_after_failure;
			let max = config.max_conns_per_backend;
			let local_az = self.local_az.as_deref();

			let start = state.next_cursor();
			let mut idx = start;
			for _ in 0..n {
				let elem = &mut state.elements[idx];
				let failed = elem.failed.recheck(retry_after);
				let overloaded = elem.endpoint.is_overloaded(max);
				let az_ok = !az_active || elem.endpoint.availability_zone.as_deref() == local_az;
				if !failed && !overloaded && az_ok {
					let picked = elem.endpoint.clone();
					state.set_cursor(idx + 1);
					return Some(picked);
				}
				idx = (idx + 1) % n;
			}

			// Full scan from the cursor found nothing. If every endpoint is overloaded there is
			// nothing a second pass can fix. Otherwise drop the AZ constraint and failure marks
			// and scan once more: a pool that is entirely (temporarily) marked failed must still
			// make forward progress.
			if state.elements.iter().all(|e| e.endpoint.is_overloaded(max)) {
				return None;
			}
			state.clear_all_failures();
			let mut idx = start;
			for _ in 0..n {
				let elem = &state.elements[idx];
				if !elem.endpoint.is_overloaded(max) {
					let picked = elem.endpoint.clone();
					state.set_cursor(idx + 1);
					return Some(picked);
				}
				idx = (idx + 1) % n;
			}
			None
		})
	}

	fn least_connection_next(&self, az_active: bool) -> Option<Arc<Endpoint>> {
		self.pool.with_state_mut(|state, config| {
			let n = state.elements.len();
			if n == 0 {
				return None;
			}
			let retry_after = config.retry_after_failure;
			let max = config.max_conns_per_backend;
			let local_az = self.local_az.as_deref();

			let mut order: Vec<usize> = (0..n).collect();
			order.shuffle(&mut rand::rng());

			let mut selected: Option<(i64, Arc<Endpoint>)> = None;
			let mut selected_local: Option<(i64, Arc<Endpoint>)> = None;
			for idx in order {
				let elem = &mut state.elements[idx];
				if elem.failed.recheck(retry_after) {
					continue;
				}
				if elem.endpoint.is_overloaded(max) {
					continue;
				}
				let count = elem.endpoint.connection_count();
				if selected.as_ref().is_none_or(|(c, _)| count < *c) {
					selected = Some((count, elem.endpoint.clone()));
				}
				if az_active
					&& elem.endpoint.availability_zone.as_deref() == local_az
					&& selected_local.as_ref().is_none_or(|(c, _)| count < *c)
				{
					selected_local = Some((count, elem.endpoint.clone()));
				}
			}

			if az_active && let Some((_, e)) = selected_local {
				return Some(e);
			}
			selected.map(|(_, e)| e)
		})
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::endpoint::ModificationTag;
	use crate::pool::PoolConfig;

	fn ep(addr: &str, tag: u32) -> Endpoint {
		Endpoint::new(addr, "app", ModificationTag::new("g", tag))
	}

	fn az_ep(addr: &str, tag: u32, az: &str) -> Endpoint {
		let mut e = ep(addr, tag);
		e.availability_zone = Some(az.into());
		e
	}

	#[test]
	fn round_robin_cycles_through_every_endpoint() {
		let pool = Arc::new(Pool::new("/", PoolConfig::default()));
		pool.put(ep("10.0.0.1:80", 1));
		pool.put(ep("10.0.0.2:80", 1));
		pool.put(ep("10.0.0.3:80", 1));

		let iter = pool.endpoints(None, false, AzPreference::None, None);
		let mut seen = HashMap::new();
		for k in 0..3 {
			for attempt in 0..3 {
				let e = iter.next(attempt).unwrap();
				*seen.entry(e.canonical_addr().to_string()).or_insert(0) += 1;
				let _ = k;
			}
		}
		assert_eq!(seen.len(), 3);
		for count in seen.values() {
			assert_eq!(*count, 3);
		}
	}

	#[test]
	fn least_connection_picks_the_zero_count_endpoint() {
		let cfg = PoolConfig {
			load_balancing_algorithm: LoadBalancingAlgorithm::LeastConnection,
			..PoolConfig::default()
		};
		let pool = Arc::new(Pool::new("/", cfg));
		pool.put(ep("10.0.0.1:80", 1));
		pool.put(ep("10.0.0.2:80", 1));
		pool.put(ep("10.0.0.3:80", 1));
		pool.put(ep("10.0.0.4:80", 1));
		pool.put(ep("10.0.0.5:80", 1));

		pool.each(|e| {
			if e.canonical_addr() != "10.0.0.3:80" {
				e.pre_request();
			}
		});

		let iter = pool.endpoints(None, false, AzPreference::None, None);
		let picked = iter.next(0).unwrap();
		assert_eq!(picked.canonical_addr(), "10.0.0.3:80");
	}

	#[test]
	fn sticky_initial_endpoint_is_returned_once() {
		let pool = Arc::new(Pool::new("/", PoolConfig::default()));
		let mut a = ep("10.0.0.1:80", 1);
		a.private_instance_id = "a".into();
		let mut b = ep("10.0.0.2:80", 1);
		b.private_instance_id = "b".into();
		pool.put(a);
		pool.put(b);

		let iter = pool.endpoints(Some("b".into()), false, AzPreference::None, None);
		assert_eq!(iter.next(0).unwrap().canonical_addr(), "10.0.0.2:80");
		// Second call to next(0) (retry on the same iterator) no longer honors the sticky pin.
		let second = iter.next(0).unwrap();
		assert!(second.canonical_addr() == "10.0.0.1:80" || second.canonical_addr() == "10.0.0.2:80");
	}

	#[test]
	fn must_be_sticky_fails_closed_when_pin_is_unavailable() {
		let pool = Arc::new(Pool::new("/", PoolConfig::default()));
		pool.put(ep("10.0.0.1:80", 1));

		let iter = pool.endpoints(Some("missing".into()), true, AzPreference::None, None);
		assert!(iter.next(0).is_none());
	}

	#[test]
	fn az_local_preference_only_applies_on_first_attempt() {
		let pool = Arc::new(Pool::new("/", PoolConfig::default()));
		pool.put(az_ep("10.0.0.1:80", 1, "us-east-1a"));
		pool.put(az_ep("10.0.0.2:80", 1, "us-east-1b"));

		let iter = pool.endpoints(None, false, AzPreference::Local, Some("us-east-1b".into()));
		assert_eq!(iter.next(0).unwrap().canonical_addr(), "10.0.0.2:80");
	}

	#[test]
	fn overloaded_pool_returns_none_indefinitely() {
		let mut cfg = PoolConfig::default();
		cfg.max_conns_per_backend = 1;
		let pool = Arc::new(Pool::new("/", cfg));
		pool.put(ep("10.0.0.1:80", 1));
		pool.each(|e| e.pre_request());

		let iter = pool.endpoints(None, false, AzPreference::None, None);
		assert!(iter.next(0).is_none());
		assert!(iter.next(1).is_none());
	}
}
