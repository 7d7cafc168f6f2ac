pub mod app;
pub mod bus;
pub mod client;
pub mod config;
pub mod http;
pub mod management;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use config::Config;
pub use route_core::prelude::*;
use tokio::sync::watch;

/// Everything the data path needs, wired once at startup.
pub struct ProxyInputs {
	pub cfg: Arc<Config>,
	pub registry: Arc<store::Registry>,
	pub metrics: Arc<telemetry::metrics::Metrics>,
	pub upstream: client::Client,
	/// For route-service hops, which target arbitrary external URLs.
	pub external: client::ExternalClient,
	pub route_services: Option<proxy::routeservice::RouteServices>,
	/// Flips when a drain starts; the healthcheck answers 503 from then on.
	pub draining: watch::Receiver<bool>,
}
