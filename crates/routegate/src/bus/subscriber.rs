use std::time::SystemTime;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use route_core::drain::DrainWatcher;
use route_core::readiness;
use tokio::sync::watch;

use crate::bus::{
	Connection, RegistryMessage, SUBJECT_REGISTER, SUBJECT_START, SUBJECT_UNREGISTER, StartMessage,
	Transport,
};
use crate::store::Registry;
use crate::telemetry::metrics::{MessageAction, Metrics};
use crate::*;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
	/// Identifies this router in the start announcement.
	pub router_id: Strng,
	/// The address backends should expect traffic from.
	pub host: Strng,
	/// Advertised to backends in the start announcement.
	pub minimum_register_interval: Duration,
	pub prune_threshold: Duration,
	pub reconnect_initial: Duration,
	pub reconnect_max: Duration,
	/// Updated-at latency observed during this window after startup is
	/// discarded; it measures the backlog, not the bus.
	pub latency_warmup: Duration,
}

impl Default for SubscriberConfig {
	fn default() -> Self {
		SubscriberConfig {
			router_id: strng::new("routegate"),
			host: strng::EMPTY,
			minimum_register_interval: Duration::from_secs(20),
			prune_threshold: Duration::from_secs(120),
			reconnect_initial: Duration::from_millis(500),
			reconnect_max: Duration::from_secs(32),
			latency_warmup: Duration::from_secs(90),
		}
	}
}

/// Consumes register/unregister frames from the bus and reconciles them into
/// the registry. One task applies frames in arrival order, so a later
/// unregister always beats an earlier register for the same address.
pub struct Subscriber {
	transport: Arc<dyn Transport>,
	registry: Arc<Registry>,
	metrics: Arc<Metrics>,
	cfg: SubscriberConfig,
	connected: watch::Sender<bool>,
	first_connect: Option<readiness::BlockReady>,
	started: Instant,
}

impl Subscriber {
	pub fn new(
		transport: Arc<dyn Transport>,
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		cfg: SubscriberConfig,
		first_connect: Option<readiness::BlockReady>,
	) -> (Subscriber, watch::Receiver<bool>) {
		let (connected, rx) = watch::channel(false);
		(
			Subscriber {
				transport,
				registry,
				metrics,
				cfg,
				connected,
				first_connect,
				started: Instant::now(),
			},
			rx,
		)
	}

	pub async fn run(mut self, drain: DrainWatcher) {
		let stopped = drain.wait_for_drain();
		tokio::pin!(stopped);
		let mut backoff = ExponentialBackoff {
			initial_interval: self.cfg.reconnect_initial,
			max_interval: self.cfg.reconnect_max,
			max_elapsed_time: None,
			..Default::default()
		};
		loop {
			let conn = tokio::select! {
				res = self.transport.connect(&[SUBJECT_REGISTER, SUBJECT_UNREGISTER]) => res,
				_ = &mut stopped => return,
			};
			let mut conn = match conn {
				Ok(c) => c,
				Err(e) => {
					let delay = backoff.next_backoff().unwrap_or(self.cfg.reconnect_max);
					warn!("bus connect failed ({e}), retrying in {delay:?}");
					tokio::select! {
						_ = tokio::time::sleep(delay) => continue,
						_ = &mut stopped => return,
					}
				},
			};
			backoff.reset();
			if let Err(e) = self.announce(conn.as_mut()).await {
				warn!("failed to publish start announcement: {e}");
				continue;
			}
			info!("subscribed to {SUBJECT_REGISTER} and {SUBJECT_UNREGISTER}");
			self.connected.send_replace(true);
			drop(self.first_connect.take());

			loop {
				tokio::select! {
					frame = conn.next() => match frame {
						Some((subject, payload)) => self.apply(&subject, &payload),
						None => {
							warn!("bus connection lost, reconnecting");
							self.connected.send_replace(false);
							break;
						},
					},
					_ = &mut stopped => {
						debug!("subscriber stopped");
						return;
					}
				}
			}
		}
	}

	/// Announce ourselves so backends (re)send their registrations.
	async fn announce(&self, conn: &mut dyn Connection) -> anyhow::Result<()> {
		let greeting = StartMessage {
			id: self.cfg.router_id.to_string(),
			hosts: vec![self.cfg.host.to_string()],
			minimum_register_interval_in_seconds: self.cfg.minimum_register_interval.as_secs(),
			prune_threshold_in_seconds: self.cfg.prune_threshold.as_secs(),
		};
		let payload = Bytes::from(serde_json::to_vec(&greeting)?);
		conn.publish(SUBJECT_START, payload).await
	}

	fn apply(&self, subject: &str, payload: &[u8]) {
		let msg = match RegistryMessage::decode(payload) {
			Ok(m) => m,
			Err(e) => {
				debug!(subject, "dropping malformed frame: {e}");
				self.metrics.bad_frames.inc();
				return;
			},
		};
		let (uris, spec) = match msg.to_spec() {
			Ok(v) => v,
			Err(e) => {
				debug!(subject, "dropping incomplete frame: {e}");
				self.metrics.bad_frames.inc();
				return;
			},
		};
		match subject {
			SUBJECT_REGISTER => {
				let created = self.registry.register(&uris, &spec);
				trace!(endpoint = %spec.address(), created, "applied register");
				self
					.metrics
					.registry_messages
					.get_or_create(&MessageAction::register())
					.inc();
				self.observe_latency(&msg);
			},
			SUBJECT_UNREGISTER => {
				let removed = self.registry.unregister(&uris, &spec);
				trace!(endpoint = %spec.address(), removed, "applied unregister");
				self
					.metrics
					.registry_messages
					.get_or_create(&MessageAction::unregister())
					.inc();
			},
			_ => {
				debug!(subject, "ignoring frame on unexpected subject");
				return;
			},
		}
		self.metrics.sync_registry(&self.registry);
	}

	fn observe_latency(&self, msg: &RegistryMessage) {
		let Some(updated_ns) = msg.endpoint_updated_at_ns else {
			return;
		};
		if updated_ns <= 0 || self.started.elapsed() < self.cfg.latency_warmup {
			return;
		}
		let now_ns = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|d| d.as_nanos() as i64)
			.unwrap_or_default();
		let delta = now_ns.saturating_sub(updated_ns);
		if delta >= 0 {
			self
				.metrics
				.bus_latency
				.observe(Duration::from_nanos(delta as u64).as_secs_f64());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::MemoryBus;
	use crate::store::RegistryConfig;

	fn message(host: &str, uris: &[&str]) -> Bytes {
		let msg = RegistryMessage {
			host: host.into(),
			port: 8080,
			uris: uris.iter().map(|s| s.to_string()).collect(),
			private_instance_id: format!("id-{host}"),
			..Default::default()
		};
		Bytes::from(serde_json::to_vec(&msg).unwrap())
	}

	struct Harness {
		bus: MemoryBus,
		registry: Arc<Registry>,
		metrics: Arc<Metrics>,
		connected: watch::Receiver<bool>,
		_trigger: route_core::drain::DrainTrigger,
	}

	async fn start() -> Harness {
		let bus = MemoryBus::new();
		let registry = Arc::new(Registry::new(RegistryConfig::default()));
		let metrics = Arc::new(Metrics::new(
			&mut prometheus_client::registry::Registry::default(),
		));
		let cfg = SubscriberConfig {
			reconnect_initial: Duration::from_millis(5),
			reconnect_max: Duration::from_millis(50),
			..Default::default()
		};
		let (sub, connected) = Subscriber::new(
			Arc::new(bus.clone()),
			registry.clone(),
			metrics.clone(),
			cfg,
			None,
		);
		let (trigger, watcher) = route_core::drain::new();
		tokio::spawn(sub.run(watcher));
		let mut ready = connected.clone();
		ready
			.wait_for(|c| *c)
			.await
			.expect("subscriber should connect");
		Harness {
			bus,
			registry,
			metrics,
			connected,
			_trigger: trigger,
		}
	}

	async fn settle(h: &Harness, f: impl Fn(&Harness) -> bool) {
		for _ in 0..200 {
			if f(h) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("condition not reached");
	}

	#[tokio::test]
	async fn applies_register_and_unregister() {
		let h = start().await;
		h.bus
			.publish(SUBJECT_REGISTER, message("10.0.0.1", &["app.example.com"]));
		settle(&h, |h| h.registry.num_endpoints() == 1).await;

		h.bus
			.publish(SUBJECT_UNREGISTER, message("10.0.0.1", &["app.example.com"]));
		settle(&h, |h| h.registry.num_endpoints() == 0).await;
	}

	#[tokio::test]
	async fn malformed_frames_are_counted_and_skipped() {
		let h = start().await;
		h.bus
			.publish(SUBJECT_REGISTER, Bytes::from_static(b"{broken"));
		h.bus.publish(
			SUBJECT_REGISTER,
			Bytes::from_static(b"{\"uris\":[\"no-host.example.com\"]}"),
		);
		h.bus
			.publish(SUBJECT_REGISTER, message("10.0.0.1", &["app.example.com"]));
		settle(&h, |h| h.registry.num_endpoints() == 1).await;
		assert_eq!(h.metrics.bad_frames.get(), 2);
	}

	#[tokio::test]
	async fn announces_on_connect_and_reconnect() {
		let bus = MemoryBus::new();
		let mut announcements = bus.watch();
		let registry = Arc::new(Registry::new(RegistryConfig::default()));
		let metrics = Arc::new(Metrics::new(
			&mut prometheus_client::registry::Registry::default(),
		));
		let (sub, connected) = Subscriber::new(
			Arc::new(bus.clone()),
			registry,
			metrics,
			SubscriberConfig {
				reconnect_initial: Duration::from_millis(5),
				reconnect_max: Duration::from_millis(20),
				..Default::default()
			},
			None,
		);
		let (_trigger, watcher) = route_core::drain::new();
		tokio::spawn(sub.run(watcher));

		let (subject, payload) = announcements.recv().await.unwrap();
		assert_eq!(subject.as_str(), SUBJECT_START);
		let start: StartMessage = serde_json::from_slice(&payload).unwrap();
		assert_eq!(start.id, "routegate");

		let mut status = connected.clone();
		status.wait_for(|c| *c).await.unwrap();
		bus.outage();
		status.wait_for(|c| !*c).await.unwrap();
		bus.restore();

		// A fresh announcement must follow the reconnect.
		loop {
			let (subject, _) = announcements.recv().await.unwrap();
			if subject.as_str() == SUBJECT_START {
				break;
			}
		}
		status.wait_for(|c| *c).await.unwrap();
	}
}
