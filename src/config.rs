//! Typed configuration (§6 "Configuration"). One `serde`-deserializable `Config`, loaded from a
//! YAML or JSON file the way the teacher's `main.rs` loads its own `Config`: `clap`-parsed
//! `--file`/`--config` flags picking between a path and an inline byte blob.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::endpoint::LoadBalancingAlgorithm;
use crate::iterator::AzPreference;

/// Every knob named in §6, with `Default` for whichever the spec marks optional. The
/// struct-level `#[serde(default)]` fills any field missing from the input file with its value
/// from [`Default::default`], so every field below is optional on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Admin/metrics listener, not itself part of §6 but needed to bind them.
	pub admin_addr: String,
	pub metrics_addr: String,

	pub load_balance: LoadBalancingAlgorithm,
	pub az_preference: AzPreference,
	pub zone: Option<String>,

	pub backend_max_attempts: usize,
	pub route_service_max_attempts: usize,

	/// Seconds; 0 disables the per-attempt deadline.
	pub endpoint_timeout_secs: u64,
	/// Read deadline for a backend's upgrade-handshake response.
	pub backend_read_timeout_secs: u64,

	pub sticky_session_cookie_names: Vec<String>,
	pub sticky_sessions_for_auth_negotiate: bool,
	pub secure_cookies: bool,

	/// 0 = unlimited.
	pub max_conns_per_backend: i64,
	pub retry_after_failure_secs: u64,

	/// 0 disables the ceiling.
	pub max_response_headers: usize,

	pub enable_http2: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			admin_addr: "0.0.0.0:8081".to_string(),
			metrics_addr: "0.0.0.0:9090".to_string(),
			load_balance: LoadBalancingAlgorithm::RoundRobin,
			az_preference: AzPreference::None,
			zone: None,
			backend_max_attempts: 3,
			route_service_max_attempts: 3,
			endpoint_timeout_secs: 15,
			backend_read_timeout_secs: 900,
			sticky_session_cookie_names: Vec::new(),
			sticky_sessions_for_auth_negotiate: false,
			secure_cookies: false,
			max_conns_per_backend: 0,
			retry_after_failure_secs: 30,
			max_response_headers: 0,
			enable_http2: false,
		}
	}
}

impl Config {
	pub fn endpoint_timeout(&self) -> Duration {
		Duration::from_secs(self.endpoint_timeout_secs)
	}

	pub fn backend_read_timeout(&self) -> Duration {
		Duration::from_secs(self.backend_read_timeout_secs)
	}

	pub fn retry_after_failure(&self) -> Duration {
		Duration::from_secs(self.retry_after_failure_secs)
	}

	pub fn local_az(&self) -> Option<agent_core::strng::Strng> {
		self.zone.as_deref().map(agent_core::strng::new)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_round_trip_through_yaml() {
		let cfg = Config::default();
		let yaml = serde_yaml::to_string(&cfg).unwrap();
		let back: Config = serde_yaml::from_str(&yaml).unwrap();
		assert_eq!(back.backend_max_attempts, cfg.backend_max_attempts);
		assert_eq!(back.load_balance, cfg.load_balance);
	}

	#[test]
	fn partial_yaml_falls_back_to_field_defaults() {
		let yaml = "backend_max_attempts: 7\n";
		let cfg: Config = serde_yaml::from_str(yaml).unwrap();
		assert_eq!(cfg.backend_max_attempts, 7);
		assert_eq!(cfg.route_service_max_attempts, Config::default().route_service_max_attempts);
	}
}
