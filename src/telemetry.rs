//! Proxy-specific counters plus the `/metrics` `axum` router (§4.G). The generic
//! `Recorder`/`IncrementRecorder` trait pair lives in `agent_core::metrics`; this module only
//! adds the concrete event types and their `prometheus_client` storage, the way the teacher's
//! `metrics.rs` keeps domain counters next to the generic trait machinery it pulled from.

use std::sync::Arc;

use agent_core::metrics::Recorder;
use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::error::{DispatchError, kind_label};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchErrorLabels {
	pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PoolLabels {
	pub pool: String,
}

/// A terminal dispatch attempt, successful or not. Recorded once per `Dispatcher::dispatch`
/// call, independent of how many per-attempt retries it took internally.
pub struct DispatchEvent<'a> {
	pub pool: &'a str,
	pub outcome: Result<(), &'a DispatchError>,
}

pub struct Metrics {
	dispatch_total: Family<PoolLabels, Counter>,
	dispatch_errors: Family<DispatchErrorLabels, Counter>,
	bad_gateway_total: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Arc<Self> {
		let sub = agent_core::metrics::sub_registry(registry, "fabricproxy");
		let dispatch_total = Family::default();
		let dispatch_errors = Family::default();
		let bad_gateway_total = Counter::default();

		sub.register("dispatch_requests", "Total dispatch attempts by pool", dispatch_total.clone());
		sub.register("dispatch_errors", "Terminal dispatch errors by kind", dispatch_errors.clone());
		sub.register("bad_gateway", "Responses that fell through to the default 502", bad_gateway_total.clone());

		Arc::new(Self { dispatch_total, dispatch_errors, bad_gateway_total })
	}
}

impl Recorder<DispatchEvent<'_>, u64> for Metrics {
	fn record(&self, event: &DispatchEvent<'_>, meta: u64) {
		self
			.dispatch_total
			.get_or_create(&PoolLabels { pool: event.pool.to_string() })
			.inc_by(meta);
		if let Err(err) = event.outcome {
			self
				.dispatch_errors
				.get_or_create(&DispatchErrorLabels { kind: kind_label(err).to_string() })
				.inc_by(meta);
			if crate::error_handler::is_default_bad_gateway(err) {
				self.bad_gateway_total.inc_by(meta);
			}
		}
	}
}

#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}

	pub fn router(&self) -> Router {
		Router::new().route("/metrics", get(metrics_handler)).with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<App>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	prometheus_client::encoding::text::encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}
