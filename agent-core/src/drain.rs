use std::time::Duration;

pub use internal::{DrainMode, ReleaseShutdown as DrainBlocker, Signal as DrainTrigger, Watch as DrainWatcher};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a new drain pair.
/// * `DrainTrigger` starts a drain and waits for it to complete.
/// * `DrainWatcher` is held by anything participating in the drain. It may be cloned; a drain
///   will not complete until every outstanding `DrainWatcher` is dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Runs a future with graceful-shutdown support: `make_future` receives a `DrainWatcher` (hold
/// it to block shutdown; watch it to learn when to start draining) and a force-shutdown
/// receiver (fires once the deadline has passed and all work must stop now).
pub async fn run_with_drain<F, O>(component: String, drain: DrainWatcher, deadline: Duration, make_future: F)
where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_drain_signal, sub_drain) = new();
	let (trigger_force_shutdown, force_shutdown) = watch::channel(());
	let trigger_force_shutdown_cpy = trigger_force_shutdown.clone();
	let fut = make_future(sub_drain, force_shutdown).in_current_span();
	let watch = async move {
		let res = drain.wait_for_drain().await;
		if res.mode() == DrainMode::Graceful {
			info!(component, "drain started, waiting {:?} for in-flight requests", deadline);
			if tokio::time::timeout(deadline, sub_drain_signal.start_drain_and_wait(DrainMode::Graceful))
				.await
				.is_err()
			{
				warn!(component, "drain deadline expired with requests still in flight, forcing shutdown");
			}
		} else {
			debug!(component, "terminating");
		}
		let _ = trigger_force_shutdown.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = trigger_force_shutdown_cpy.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Signal, Watch) {
		let (signal_tx, signal_rx) = watch::channel(None);
		let (drained_tx, drained_rx) = mpsc::channel(1);
		(
			Signal { drained_rx, signal_tx },
			Watch { drained_tx, signal_rx },
		)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum DrainMode {
		Immediate,
		Graceful,
	}

	/// Sends a drain command to all watchers and waits for them all to release.
	pub struct Signal {
		drained_rx: mpsc::Receiver<Never>,
		signal_tx: watch::Sender<Option<DrainMode>>,
	}

	/// Watches for a drain command. All clones must be dropped for `Signal::start_drain_and_wait`
	/// to complete.
	#[derive(Clone)]
	pub struct Watch {
		drained_tx: mpsc::Sender<Never>,
		signal_rx: watch::Receiver<Option<DrainMode>>,
	}

	#[must_use = "ReleaseShutdown should be dropped explicitly to release the drain"]
	#[derive(Clone)]
	#[allow(dead_code)]
	pub struct ReleaseShutdown(mpsc::Sender<Never>, DrainMode);

	impl ReleaseShutdown {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl Signal {
		pub async fn closed(&mut self) {
			self.signal_tx.closed().await;
		}

		pub fn count(&self) -> usize {
			self.signal_tx.receiver_count()
		}

		/// Signals all watchers to begin draining and waits for every handle to be dropped.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.signal_tx.send(Some(mode));
			match self.drained_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	impl Watch {
		/// Completes once a drain has been signaled, returning a handle that must be dropped
		/// once the caller has wound down.
		pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
			let mode = self
				.signal_rx
				.wait_for(Option::is_some)
				.await
				.map(|mode| mode.expect("already asserted is_some"))
				.unwrap_or(DrainMode::Immediate);
			ReleaseShutdown(self.drained_tx, mode)
		}
	}

	impl std::fmt::Debug for Signal {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Signal").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watch {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watch").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for ReleaseShutdown {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("ReleaseShutdown").finish_non_exhaustive()
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::DrainMode::Graceful;
	use super::*;

	#[tokio::test]
	async fn drain_waits_for_watchers_to_release() {
		let (trigger, watcher) = new();
		let done = Arc::new(AtomicUsize::new(0));

		for i in 1..=3u64 {
			let watcher = watcher.clone();
			let done = done.clone();
			tokio::spawn(async move {
				let guard = watcher.wait_for_drain().await;
				tokio::time::sleep(Duration::from_millis(i)).await;
				done.fetch_add(1, Ordering::SeqCst);
				drop(guard);
			});
		}
		drop(watcher);

		assert_eq!(done.load(Ordering::SeqCst), 0);
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(500)) => panic!("drain timed out"),
			_ = trigger.start_drain_and_wait(Graceful) => {
				assert_eq!(done.load(Ordering::SeqCst), 3);
			}
		}
	}

	#[tokio::test]
	async fn drain_completes_immediately_with_no_watchers() {
		let (trigger, watcher) = new();
		drop(watcher);
		tokio::select! {
			_ = tokio::time::sleep(Duration::from_millis(200)) => panic!("drain timed out"),
			_ = trigger.start_drain_and_wait(Graceful) => {}
		}
	}
}
