use tokio::sync::{broadcast, mpsc};

use crate::bus::{Connection, Transport};
use crate::*;

/// An in-process loopback bus. Every connection sees every publish on a
/// subject it subscribed to. Used by tests, and as the stand-in transport
/// when no external bus is configured.
#[derive(Clone)]
pub struct MemoryBus {
	tx: broadcast::Sender<(Strng, Bytes)>,
	/// Dropping all connection handles simulates a bus outage.
	health: Arc<Mutex<HealthState>>,
}

struct HealthState {
	up: bool,
	kill: Vec<mpsc::Sender<()>>,
}

impl MemoryBus {
	pub fn new() -> MemoryBus {
		let (tx, _) = broadcast::channel(1024);
		MemoryBus {
			tx,
			health: Arc::new(Mutex::new(HealthState {
				up: true,
				kill: vec![],
			})),
		}
	}

	/// Publishes a frame as if a backend had sent it.
	pub fn publish(&self, subject: &str, payload: Bytes) {
		let _ = self.tx.send((strng::new(subject), payload));
	}

	/// Severs every open connection and refuses new ones until `restore`.
	pub fn outage(&self) {
		let mut health = self.health.lock().expect("lock poisoned");
		health.up = false;
		for k in health.kill.drain(..) {
			let _ = k.try_send(());
		}
	}

	pub fn restore(&self) {
		self.health.lock().expect("lock poisoned").up = true;
	}

	/// Frames published by the router itself (e.g. the start announcement).
	pub fn watch(&self) -> broadcast::Receiver<(Strng, Bytes)> {
		self.tx.subscribe()
	}
}

impl Default for MemoryBus {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl Transport for MemoryBus {
	async fn connect(&self, subjects: &[&str]) -> anyhow::Result<Box<dyn Connection>> {
		let (kill_tx, kill_rx) = mpsc::channel(1);
		{
			let mut health = self.health.lock().expect("lock poisoned");
			if !health.up {
				anyhow::bail!("bus unavailable");
			}
			health.kill.push(kill_tx);
		}
		Ok(Box::new(MemoryConnection {
			subjects: subjects.iter().map(strng::new).collect(),
			rx: self.tx.subscribe(),
			tx: self.tx.clone(),
			kill: kill_rx,
		}))
	}
}

struct MemoryConnection {
	subjects: Vec<Strng>,
	rx: broadcast::Receiver<(Strng, Bytes)>,
	tx: broadcast::Sender<(Strng, Bytes)>,
	kill: mpsc::Receiver<()>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
	async fn publish(&mut self, subject: &str, payload: Bytes) -> anyhow::Result<()> {
		let _ = self.tx.send((strng::new(subject), payload));
		Ok(())
	}

	async fn next(&mut self) -> Option<(Strng, Bytes)> {
		loop {
			tokio::select! {
				_ = self.kill.recv() => return None,
				msg = self.rx.recv() => match msg {
					Ok((subject, payload)) => {
						if self.subjects.contains(&subject) {
							return Some((subject, payload));
						}
					},
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(dropped = n, "loopback bus lagged");
					},
					Err(broadcast::error::RecvError::Closed) => return None,
				},
			}
		}
	}
}
