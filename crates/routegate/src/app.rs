use route_core::drain::{self, DrainMode, DrainTrigger};
use route_core::{readiness, signal};
use tokio::sync::watch;

use crate::bus::{Subscriber, SubscriberConfig};
use crate::management::AdminServer;
use crate::proxy::routeservice::RouteServices;
use crate::store::{Pruner, Registry};
use crate::telemetry::metrics::Metrics;
use crate::{Config, ProxyInputs, bus, client, proxy};

use crate::*;

/// Wires the whole router together and starts serving. Errors returned here
/// are the startup-fatal kind (bad config, unbindable listener, missing
/// identity) and should exit the process with a failure code.
pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();
	let ready = readiness::Ready::new();
	let bus_ready = ready.register_task("bus subscription");
	let gateway_ready = ready.register_task("listeners");

	let mut prometheus = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(&mut prometheus));
	let prometheus = Arc::new(prometheus);

	let registry = Arc::new(Registry::new(config.registry.clone()));

	let transport = bus::transport_for(config.bus.url.as_deref())?;
	let subscriber_cfg = SubscriberConfig {
		router_id: config.bus.router_id.clone(),
		host: config.bus.announce_host.clone(),
		minimum_register_interval: config.bus.minimum_register_interval,
		prune_threshold: config.registry.default_stale_threshold,
		reconnect_initial: config.bus.reconnect_initial,
		reconnect_max: config.bus.reconnect_max,
		latency_warmup: config.bus.latency_warmup,
	};
	let (subscriber, bus_connected) = Subscriber::new(
		transport,
		registry.clone(),
		metrics.clone(),
		subscriber_cfg,
		Some(bus_ready),
	);
	tokio::spawn(subscriber.run(drain_rx.clone()));

	let pruner = Pruner::new(
		registry.clone(),
		metrics.clone(),
		config.prune_interval,
		config.bus.suspend_pruning_if_unavailable,
		bus_connected,
	);
	tokio::spawn(pruner.run(drain_rx.clone()));

	let upstream = client::Client::new(client::Config {
		dial_timeout: config.backend.dial_timeout,
		response_header_timeout: config.backend.response_header_timeout,
		idle_timeout: config.backend.idle_timeout,
		max_idle_per_host: config.backend.max_idle_per_host,
		disable_keep_alives: config.backend.disable_keep_alives,
		tls: config
			.backend
			.tls
			.build()
			.context("building backend TLS config")?,
	});
	let external = client::ExternalClient::new()?;
	let route_services = config
		.route_services
		.as_ref()
		.map(|rs| RouteServices::new(&rs.secret, rs.signature_ttl));

	let (draining_tx, draining_rx) = watch::channel(false);
	let inputs = Arc::new(ProxyInputs {
		cfg: config.clone(),
		registry: registry.clone(),
		metrics: metrics.clone(),
		upstream,
		external,
		route_services,
		draining: draining_rx,
	});

	let admin = AdminServer::bind(
		config.admin_addr,
		config.admin_auth.clone(),
		registry,
		prometheus,
		ready.clone(),
	)
	.await?;
	tokio::spawn(admin.run(drain_rx.clone()));

	// Bind before reporting started so address conflicts and broken TLS
	// identities fail the process instead of limping along.
	let gateway = proxy::Gateway::new(inputs, drain_rx.clone()).bind().await?;
	tokio::spawn(gateway.serve());
	drop(gateway_ready);
	drop(drain_rx);

	Ok(Bound {
		shutdown,
		drain_tx,
		draining: draining_tx,
	})
}

pub struct Bound {
	pub shutdown: signal::Shutdown,
	drain_tx: DrainTrigger,
	draining: watch::Sender<bool>,
}

impl Bound {
	/// Blocks until a drain or terminate signal arrives, then drains: the
	/// listeners refuse new connections, in-flight requests get up to the
	/// drain timeout, and the process exits cleanly. Repeat signals while
	/// draining are absorbed.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		tokio::select! {
			_ = signal::wait_for_drain_signal() => info!("drain signal received"),
			_ = self.shutdown.wait() => info!("terminate received, draining"),
		}
		// From here the healthcheck reports not-serving.
		let _ = self.draining.send(true);
		self
			.drain_tx
			.start_drain_and_wait(DrainMode::Graceful)
			.await;
		info!("drain complete");
		Ok(())
	}
}
