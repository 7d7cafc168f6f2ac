use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry as PromRegistry;

use crate::store::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageAction {
	pub action: Action,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum Action {
	register,
	unregister,
}

impl MessageAction {
	pub fn register() -> Self {
		MessageAction {
			action: Action::register,
		}
	}
	pub fn unregister() -> Self {
		MessageAction {
			action: Action::unregister,
		}
	}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusClass {
	pub class: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouterErrorLabel {
	pub kind: &'static str,
}

#[derive(Debug)]
pub struct Metrics {
	pub registry_messages: Family<MessageAction, Counter>,
	pub bad_frames: Counter,
	pub bus_latency: Histogram,

	pub routes: Gauge,
	pub endpoints: Gauge,
	pub endpoints_pruned: Counter,

	pub requests: Family<StatusClass, Counter>,
	pub router_errors: Family<RouterErrorLabel, Counter>,
	pub upstream_attempts: Counter,
	pub upstream_retries: Counter,
	pub websocket_upgrades: Counter,
}

impl Metrics {
	pub fn new(registry: &mut PromRegistry) -> Metrics {
		let registry = registry.sub_registry_with_prefix("routegate");
		let m = Metrics {
			registry_messages: Family::default(),
			bad_frames: Counter::default(),
			bus_latency: Histogram::new(exponential_buckets(0.001, 2.0, 16)),
			routes: Gauge::default(),
			endpoints: Gauge::default(),
			endpoints_pruned: Counter::default(),
			requests: Family::default(),
			router_errors: Family::default(),
			upstream_attempts: Counter::default(),
			upstream_retries: Counter::default(),
			websocket_upgrades: Counter::default(),
		};
		registry.register(
			"registry_messages",
			"Registration frames applied, by action",
			m.registry_messages.clone(),
		);
		registry.register(
			"registry_bad_frames",
			"Registration frames dropped as malformed",
			m.bad_frames.clone(),
		);
		registry.register(
			"bus_latency_seconds",
			"Observed delay between endpoint update and frame arrival",
			m.bus_latency.clone(),
		);
		registry.register(
			"routes",
			"Hostnames currently registered",
			m.routes.clone(),
		);
		registry.register(
			"endpoints",
			"Distinct (hostname, endpoint) pairs currently registered",
			m.endpoints.clone(),
		);
		registry.register(
			"endpoints_pruned",
			"Endpoints evicted as stale",
			m.endpoints_pruned.clone(),
		);
		registry.register(
			"requests",
			"Completed requests by status class",
			m.requests.clone(),
		);
		registry.register(
			"router_errors",
			"Proxy-generated errors by kind",
			m.router_errors.clone(),
		);
		registry.register(
			"upstream_attempts",
			"Upstream dispatch attempts, including retries",
			m.upstream_attempts.clone(),
		);
		registry.register(
			"upstream_retries",
			"Upstream attempts beyond the first",
			m.upstream_retries.clone(),
		);
		registry.register(
			"websocket_upgrades",
			"Successful protocol upgrades relayed",
			m.websocket_upgrades.clone(),
		);
		m
	}

	/// Refreshes the table-size gauges from the registry counters.
	pub fn sync_registry(&self, registry: &Registry) {
		self.routes.set(registry.num_routes() as i64);
		self.endpoints.set(registry.num_endpoints() as i64);
	}

	pub fn record_status(&self, status: http::StatusCode) {
		self
			.requests
			.get_or_create(&StatusClass {
				class: status.as_u16() / 100,
			})
			.inc();
	}

	pub fn record_router_error(&self, kind: &'static str) {
		self
			.router_errors
			.get_or_create(&RouterErrorLabel { kind })
			.inc();
	}
}
