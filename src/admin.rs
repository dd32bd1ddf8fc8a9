//! `/healthz` and `/pools/:key` admin surface (§4.G), grounded on the teacher's `admin.rs`
//! shape: a small `axum::Router` built from state shared with the rest of the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use agent_core::strng::Strng;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;

use crate::pool::Pool;

/// Every pool currently known to the process, keyed by routing key (host + context path).
pub type PoolRegistry = RwLock<HashMap<Strng, Arc<Pool>>>;

#[derive(Clone)]
pub struct App {
	pools: Arc<PoolRegistry>,
}

impl App {
	pub fn new(pools: Arc<PoolRegistry>) -> Self {
		Self { pools }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/healthz", get(healthz))
			.route("/pools/{key}", get(pool_handler))
			.with_state(self.clone())
	}
}

async fn healthz() -> &'static str {
	"ok"
}

async fn pool_handler(State(app): State<App>, Path(key): Path<String>) -> Result<String, StatusCode> {
	let pools = app.pools.read().unwrap();
	let pool = pools.get(key.as_str()).ok_or(StatusCode::NOT_FOUND)?;
	serde_json::to_string(&pool.to_json()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
	use crate::endpoint::{Endpoint, ModificationTag};
	use crate::pool::PoolConfig;

	use super::*;

	#[tokio::test]
	async fn unknown_pool_key_returns_not_found() {
		let pools: Arc<PoolRegistry> = Arc::new(RwLock::new(HashMap::new()));
		let app = App::new(pools);
		let result = pool_handler(State(app), Path("/missing".to_string())).await;
		assert_eq!(result.unwrap_err(), StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn known_pool_key_returns_its_json() {
		let pool = Arc::new(Pool::new("/app", PoolConfig::default()));
		pool.put(Endpoint::new("10.0.0.1:80", "app", ModificationTag::new("g", 1)));

		let mut pools = HashMap::new();
		pools.insert(Strng::from("/app"), pool);
		let app = App::new(Arc::new(RwLock::new(pools)));

		let body = pool_handler(State(app), Path("/app".to_string())).await.unwrap();
		assert!(body.contains("10.0.0.1:80"));
	}
}
