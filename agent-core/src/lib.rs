//! Ambient utilities shared by the proxy binary: interned strings, graceful shutdown
//! primitives, readiness tracking, a splice helper for tunneled connections, and the generic
//! metrics-recording traits the proxy's counters are built on.

pub mod copy;
pub mod drain;
pub mod metrics;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod strng;
pub mod telemetry;
