use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::telemetry;

/// Ready tracks whether the process has finished starting up.
#[derive(Clone, Debug, Default)]
pub struct Ready(Arc<Mutex<HashSet<String>>>);

impl Ready {
	pub fn new() -> Ready {
		Ready(Default::default())
	}

	/// Registers a named startup task; readiness is blocked until the returned
	/// handle is dropped.
	pub fn register_task(&self, name: &str) -> BlockReady {
		self.0.lock().unwrap().insert(name.to_string());
		BlockReady {
			parent: self.to_owned(),
			name: name.to_string(),
		}
	}

	pub fn pending(&self) -> HashSet<String> {
		self.0.lock().unwrap().clone()
	}

	pub fn is_ready(&self) -> bool {
		self.0.lock().unwrap().is_empty()
	}
}

/// BlockReady blocks readiness until it is dropped.
pub struct BlockReady {
	parent: Ready,
	name: String,
}

impl BlockReady {
	pub fn subtask(&self, name: &str) -> BlockReady {
		self.parent.register_task(name)
	}
}

impl Drop for BlockReady {
	fn drop(&mut self) {
		let mut pending = self.parent.0.lock().unwrap();
		let removed = pending.remove(&self.name);
		debug_assert!(removed);
		let left = pending.len();
		let dur = telemetry::APPLICATION_START_TIME.elapsed();
		if left == 0 {
			info!("task '{}' complete ({dur:?}), marking ready", self.name);
		} else {
			info!(
				"task '{}' complete ({dur:?}), awaiting {left} more",
				self.name
			);
		}
	}
}
