use route_core::drain::DrainWatcher;
use tokio::sync::watch;

use crate::store::Registry;
use crate::telemetry::metrics::Metrics;
use crate::*;

/// Background sweep that evicts endpoints whose registrations have gone
/// stale. When the bus is down no refreshes can arrive, so (if configured)
/// the sweep is suspended rather than slowly emptying the table.
pub struct Pruner {
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	interval: Duration,
	suspend_when_bus_down: bool,
	bus_connected: watch::Receiver<bool>,
}

impl Pruner {
	pub fn new(
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		interval: Duration,
		suspend_when_bus_down: bool,
		bus_connected: watch::Receiver<bool>,
	) -> Pruner {
		Pruner {
			registry,
			metrics,
			interval,
			suspend_when_bus_down,
			bus_connected,
		}
	}

	pub async fn run(self, drain: DrainWatcher) {
		let mut ticker = tokio::time::interval(self.interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		let stopped = drain.wait_for_drain();
		tokio::pin!(stopped);
		loop {
			tokio::select! {
				_ = ticker.tick() => self.tick(),
				_ = &mut stopped => {
					debug!("pruner stopped");
					return;
				}
			}
		}
	}

	fn tick(&self) {
		if self.suspend_when_bus_down && !*self.bus_connected.borrow() {
			debug!("bus unavailable, skipping prune sweep");
			return;
		}
		let pruned = self.registry.prune_stale();
		if pruned > 0 {
			info!(pruned, "pruned stale endpoints");
			self.metrics.endpoints_pruned.inc_by(pruned as u64);
			self.metrics.sync_registry(&self.registry);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::store::RegistryConfig;
	use crate::types::EndpointSpec;

	fn setup(suspend: bool) -> (Arc<Registry>, Pruner, watch::Sender<bool>) {
		let registry = Arc::new(Registry::new(RegistryConfig {
			default_stale_threshold: Duration::from_millis(10),
			prune_tls_routes: true,
		}));
		let (tx, rx) = watch::channel(true);
		let pruner = Pruner::new(
			registry.clone(),
			Arc::new(Metrics::new(&mut prometheus_client::registry::Registry::default())),
			Duration::from_millis(20),
			suspend,
			rx,
		);
		(registry, pruner, tx)
	}

	fn register_one(registry: &Registry) {
		let spec = EndpointSpec {
			host: strng::new("10.0.0.1"),
			port: 8080,
			use_tls: false,
			app_id: strng::EMPTY,
			instance_id: strng::EMPTY,
			instance_index: strng::EMPTY,
			server_cert_san: strng::EMPTY,
			tags: BTreeMap::new(),
			route_service_url: None,
			stale_threshold: Duration::ZERO,
		};
		registry.register(&[strng::new("app.example.com")], &spec);
	}

	#[tokio::test]
	async fn evicts_stale_endpoints() {
		let (registry, pruner, _bus) = setup(false);
		register_one(&registry);
		let (trigger, watcher) = route_core::drain::new();
		let task = tokio::spawn(pruner.run(watcher));
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(registry.num_endpoints(), 0);
		trigger
			.start_drain_and_wait(route_core::drain::DrainMode::Graceful)
			.await;
		task.await.unwrap();
	}

	#[tokio::test]
	async fn suspends_while_bus_down_and_resumes() {
		let (registry, pruner, bus) = setup(true);
		register_one(&registry);
		bus.send_replace(false);
		let (trigger, watcher) = route_core::drain::new();
		let task = tokio::spawn(pruner.run(watcher));
		tokio::time::sleep(Duration::from_millis(100)).await;
		// Stale, but the table is frozen while disconnected.
		assert_eq!(registry.num_endpoints(), 1);

		bus.send_replace(true);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert_eq!(registry.num_endpoints(), 0);
		trigger
			.start_drain_and_wait(route_core::drain::DrainMode::Graceful)
			.await;
		task.await.unwrap();
	}
}
