use std::mem;

use prometheus_client::registry::Registry;
use tracing::error;

/// Returns a sub-registry namespaced under `prefix`, so unrelated components' counters never
/// collide on metric name.
pub fn sub_registry<'a>(registry: &'a mut Registry, prefix: &str) -> &'a mut Registry {
	registry.sub_registry_with_prefix(prefix.to_string())
}

pub struct Deferred<'a, F, T>
where
	F: FnOnce(&'a T),
	T: ?Sized,
{
	param: &'a T,
	deferred_fn: Option<F>,
}

impl<'a, F, T> Deferred<'a, F, T>
where
	F: FnOnce(&'a T),
	T: ?Sized,
{
	pub fn new(param: &'a T, deferred_fn: F) -> Self {
		Self {
			param,
			deferred_fn: Some(deferred_fn),
		}
	}
}

impl<'a, F, T> Drop for Deferred<'a, F, T>
where
	F: FnOnce(&'a T),
	T: ?Sized,
{
	fn drop(&mut self) {
		if let Some(deferred_fn) = mem::take(&mut self.deferred_fn) {
			(deferred_fn)(self.param);
		} else {
			error!("deferred metric record lost its callback");
		}
	}
}

pub trait DeferRecorder {
	#[must_use = "metric will be dropped (and thus recorded) immediately if not assigned"]
	/// Records when the returned [`Deferred`] is dropped, e.g. at the end of a request scope.
	fn defer_record<'a, F>(&'a self, record: F) -> Deferred<'a, F, Self>
	where
		F: FnOnce(&'a Self),
	{
		Deferred::new(self, record)
	}
}

pub trait Recorder<E, T> {
	fn record(&self, event: &E, meta: T);
}

pub trait IncrementRecorder<E>: Recorder<E, u64> {
	fn increment(&self, event: &E);
}

impl<E, R> IncrementRecorder<E> for R
where
	R: Recorder<E, u64>,
{
	fn increment(&self, event: &E) {
		self.record(event, 1);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU64, Ordering};

	use super::*;

	struct Counter(AtomicU64);

	enum Event {
		Hit,
	}

	impl Recorder<Event, u64> for Counter {
		fn record(&self, _event: &Event, meta: u64) {
			self.0.fetch_add(meta, Ordering::Relaxed);
		}
	}

	#[test]
	fn increment_records_one() {
		let c = Counter(AtomicU64::new(0));
		c.increment(&Event::Hit);
		assert_eq!(c.0.load(Ordering::Relaxed), 1);
	}
}
