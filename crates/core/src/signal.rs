use tokio::sync::mpsc;

/// Shutdown coordinates process termination: an OS terminate signal or an
/// explicit trigger both complete `wait`.
pub struct Shutdown {
	shutdown_tx: mpsc::Sender<()>,
	shutdown_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
		Shutdown {
			shutdown_tx,
			shutdown_rx,
		}
	}

	/// Returns a handle that can trigger a shutdown programmatically.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			shutdown_tx: self.shutdown_tx.clone(),
		}
	}

	/// Completes when a shutdown has been requested.
	pub async fn wait(mut self) {
		imp::shutdown(&mut self.shutdown_rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	shutdown_tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.shutdown_tx.send(()).await;
	}
}

/// Completes when the user drain signal (SIGUSR1) fires. Repeat signals are
/// absorbed by the caller; this resolves on the first occurrence.
pub async fn wait_for_drain_signal() {
	imp::drain_signal().await
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = receiver.recv() => { info!("received explicit shutdown request") }
		};
	}

	pub(super) async fn drain_signal() {
		watch_signal(SignalKind::user_defined1(), "SIGUSR1").await
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received signal {name}");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn shutdown(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_ctrl_c() => {}
			_ = receiver.recv() => { info!("received explicit shutdown request") }
		};
	}

	// No USR1 equivalent; drains are only triggered programmatically.
	pub(super) async fn drain_signal() {
		std::future::pending().await
	}

	async fn watch_ctrl_c() {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to register signal handler");
		info!("received ctrl-c, starting shutdown");
	}
}
