use std::time::Duration;

pub use internal::{
	DrainMode, Guard as DrainBlocker, Trigger as DrainTrigger, Upgrader as DrainUpgrader,
	Watcher as DrainWatcher,
};
use tokio::sync::watch;
use tracing::{Instrument, debug, info, warn};

/// Constructs a drain channel.
/// * The DrainTrigger starts a drain and resolves once every watcher released.
/// * The DrainWatcher is held (and cloned) by everything that should delay
///   shutdown; a drain completes only after all watchers are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	internal::channel()
}

/// Runs a listener-style future with graceful drain semantics.
///
/// The future is built from two inputs:
/// * a sub-watcher it can clone onto accepted connections; holding one blocks
///   completion of the drain.
/// * a force-shutdown channel that fires when the grace period `deadline` has
///   been exhausted; spawned work must terminate promptly once it fires.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (inner_trigger, inner_watcher) = new();
	let (force_tx, force_rx) = watch::channel(());
	let force_tx_inner = force_tx.clone();
	let fut = make_future(inner_watcher, force_rx).in_current_span();
	let watch = async move {
		let release = drain.wait_for_drain().await;
		if release.mode() == DrainMode::Graceful {
			info!(
				component,
				"drain started, waiting up to {:?} for open connections", deadline
			);
			let graceful = inner_trigger.start_drain_and_wait(DrainMode::Graceful);
			if tokio::time::timeout(deadline, graceful).await.is_err() {
				warn!(
					component,
					"drain deadline expired with connections still open, forcing shutdown"
				);
			}
		} else {
			debug!(component, "terminating immediately");
		}
		// Harmless when the graceful path already finished.
		let _ = force_tx.send(());
		info!(component, "shutdown complete");
	};
	tokio::select! {
		_ = fut => {
			let _ = force_tx_inner.send(());
		},
		_ = watch => {}
	}
}

mod internal {
	use tokio::sync::{mpsc, watch};

	pub fn channel() -> (Trigger, Watcher) {
		let (mode_tx, mode_rx) = watch::channel(None);
		let (release_tx, release_rx) = mpsc::channel(1);
		(
			Trigger {
				release_rx,
				mode_tx,
			},
			Watcher {
				release_tx,
				mode_rx,
			},
		)
	}

	enum Never {}

	#[derive(Debug, Clone, Copy, PartialEq)]
	pub enum DrainMode {
		/// Do not wait for connections to finish.
		Immediate,
		/// Give connections a chance to complete before shutdown.
		Graceful,
	}

	/// Starts a drain and observes its completion.
	pub struct Trigger {
		release_rx: mpsc::Receiver<Never>,
		mode_tx: watch::Sender<Option<DrainMode>>,
	}

	impl Trigger {
		/// Signals all watchers and waits until every one of them has released.
		pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
			let _ = self.mode_tx.send(Some(mode));
			// Resolves only when every clone of the release sender is gone.
			match self.release_rx.recv().await {
				None => {},
				Some(n) => match n {},
			}
		}
	}

	/// Participates in draining. Dropping the watcher (or the Guard obtained
	/// from wait_for_drain) releases its hold on shutdown.
	#[derive(Clone)]
	pub struct Watcher {
		release_tx: mpsc::Sender<Never>,
		mode_rx: watch::Receiver<Option<DrainMode>>,
	}

	impl Watcher {
		/// Completes when a drain is signaled, returning a Guard that must be
		/// dropped to let the drain finish.
		pub async fn wait_for_drain(mut self) -> Guard {
			let mode = self
				.mode_rx
				.wait_for(Option::is_some)
				.await
				.map(|m| m.expect("checked is_some"))
				// Trigger dropped without a signal; nothing to wait for.
				.unwrap_or(DrainMode::Immediate);
			Guard(self.release_tx, mode)
		}

		/// Splits the watcher into a weak half that does not block shutdown and
		/// an upgrader that can mint blocking watchers from it. Lets an accept
		/// loop wait for a drain forever while still handing real (blocking)
		/// watchers to each accepted connection.
		pub fn into_weak(self) -> (Upgrader, Weak) {
			let Self {
				release_tx,
				mode_rx,
			} = self;
			(
				Upgrader {
					release_tx: Some(release_tx),
				},
				Weak { mode_rx },
			)
		}
	}

	#[derive(Clone)]
	pub struct Weak {
		mode_rx: watch::Receiver<Option<DrainMode>>,
	}

	pub struct Upgrader {
		release_tx: Option<mpsc::Sender<Never>>,
	}

	impl Upgrader {
		pub fn upgrade(&self, weak: Weak) -> Watcher {
			let release_tx = self.release_tx.clone().unwrap_or_else(|| {
				// Disabled: hand out a watcher that no longer blocks the drain.
				let (tx, _) = mpsc::channel(1);
				tx
			});
			Watcher {
				release_tx,
				mode_rx: weak.mode_rx,
			}
		}

		pub fn disable(&mut self) {
			self.release_tx = None;
		}
	}

	#[must_use = "dropping the guard is what releases the drain"]
	#[derive(Clone)]
	pub struct Guard(#[allow(dead_code)] mpsc::Sender<Never>, DrainMode);

	impl Guard {
		pub fn mode(&self) -> DrainMode {
			self.1
		}
	}

	impl std::fmt::Debug for Trigger {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Trigger").finish_non_exhaustive()
		}
	}

	impl std::fmt::Debug for Watcher {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			f.debug_struct("Watcher").finish_non_exhaustive()
		}
	}
}
