use std::time::Instant;

use once_cell::sync::Lazy;

/// Process start time, used to report time-to-ready in [`crate::readiness`].
pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
