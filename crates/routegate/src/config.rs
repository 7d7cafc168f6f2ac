use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::{cmp, env};

use serde::Deserialize;

use crate::http::headers::{ClientCertMode, TracingConfig};
use crate::http::{HeaderName, HeaderValue};
use crate::proxy::ErrorTemplate;
use crate::proxy::selector::BalancingAlgorithm;
use crate::store::RegistryConfig;
use crate::transport::tls::{BackendTlsSettings, ClientAuth, MinTlsVersion, ServerTlsSettings};
use crate::*;

/// Fully-resolved configuration. Loaded once at startup; components receive
/// the slice they need.
#[derive(Debug)]
pub struct Config {
	pub bind_http: SocketAddr,
	pub bind_tls: Option<SocketAddr>,
	pub server_tls: Option<ServerTlsSettings>,
	pub admin_addr: SocketAddr,
	pub admin_auth: Option<(String, String)>,

	pub backend: BackendConfig,
	pub routing: RoutingConfig,
	pub headers: HeaderConfig,
	pub tracing: TracingConfig,
	pub bus: BusConfig,
	pub registry: RegistryConfig,
	pub prune_interval: Duration,

	pub drain_timeout: Duration,
	/// How long a client may dribble request headers before the connection
	/// is dropped.
	pub request_header_timeout: Duration,
	pub max_header_bytes: usize,
	pub healthcheck_user_agent: String,
	pub route_services: Option<RouteServicesConfig>,
	pub error_template: Option<ErrorTemplate>,
	pub worker_threads: usize,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
	pub dial_timeout: Duration,
	pub response_header_timeout: Option<Duration>,
	/// Ceiling for the whole exchange with one endpoint, headers included.
	pub endpoint_timeout: Option<Duration>,
	pub idle_timeout: Duration,
	pub max_idle_per_host: usize,
	/// Per-endpoint in-flight cap enforced at selection; 0 = unlimited.
	pub max_conns: usize,
	pub disable_keep_alives: bool,
	pub tls: BackendTlsSettings,
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
	pub max_attempts: usize,
	pub algorithm: BalancingAlgorithm,
	/// Upstream cookies that trigger session affinity.
	pub sticky_cookies: Vec<Strng>,
	/// The cookie the router emits with the endpoint's instance id.
	pub affinity_cookie: Strng,
	pub secure_cookies: bool,
	pub failure_threshold: usize,
	pub failure_window: Duration,
}

#[derive(Debug, Clone)]
pub struct HeaderConfig {
	pub sanitize_forwarded_proto: bool,
	pub force_forwarded_proto_https: bool,
	pub client_cert_mode: ClientCertMode,
	/// Extra names stripped alongside the hop-by-hop set.
	pub hop_by_hop_filter: Vec<HeaderName>,
	pub remove_response: Vec<HeaderName>,
	/// Injected into responses when not already present.
	pub add_response: Vec<(HeaderName, HeaderValue)>,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
	pub url: Option<String>,
	pub router_id: Strng,
	pub announce_host: Strng,
	pub suspend_pruning_if_unavailable: bool,
	pub reconnect_initial: Duration,
	pub reconnect_max: Duration,
	pub latency_warmup: Duration,
	pub minimum_register_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RouteServicesConfig {
	pub secret: String,
	pub signature_ttl: Duration,
}

pub fn parse_config(contents: &str, _filename: Option<PathBuf>) -> anyhow::Result<Config> {
	let raw: RawConfig = serde_yaml::from_str(contents).context("parsing configuration")?;

	let port: u16 = parse("PORT")?.or(raw.port).unwrap_or(8081);
	let bind_http = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

	let (bind_tls, server_tls) = match raw.tls {
		Some(tls) => {
			let port: u16 = parse("TLS_PORT")?.or(tls.port).unwrap_or(8443);
			let settings = ServerTlsSettings {
				cert_path: tls.cert.context("tls.cert is required")?,
				key_path: tls.key.context("tls.key is required")?,
				min_version: tls.min_version.unwrap_or_default(),
				client_auth: tls.client_auth.unwrap_or_default(),
				ca_certs: tls.ca_certs,
				client_ca_certs: tls.client_ca_certs,
				only_trust_client_ca_certs: tls.only_trust_client_ca_certs.unwrap_or(false),
				enable_http2: tls.enable_http2.unwrap_or(true),
				cipher_suites: tls.cipher_suites.unwrap_or_default(),
			};
			(
				Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))),
				Some(settings),
			)
		},
		None => (None, None),
	};

	let admin = raw.admin.unwrap_or_default();
	let admin_addr = parse::<SocketAddr>("ADMIN_ADDR")?
		.or(admin.addr)
		.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::LOCALHOST, 8082)));
	let admin_auth = match (admin.user, admin.pass) {
		(Some(user), Some(pass)) => Some((user, pass)),
		(None, None) => None,
		_ => anyhow::bail!("admin.user and admin.pass must be set together"),
	};

	let backends = raw.backends.unwrap_or_default();
	let backend = BackendConfig {
		dial_timeout: dur_or(backends.dial_timeout.as_deref(), Duration::from_secs(5))?,
		response_header_timeout: opt_dur(backends.response_header_timeout.as_deref())?
			.or(Some(Duration::from_secs(60))),
		endpoint_timeout: opt_dur(backends.endpoint_timeout.as_deref())?,
		idle_timeout: dur_or(backends.idle_timeout.as_deref(), Duration::from_secs(90))?,
		max_idle_per_host: backends.max_idle_per_host.unwrap_or(100),
		max_conns: backends.max_conns.unwrap_or(0),
		disable_keep_alives: backends.disable_keep_alives.unwrap_or(false),
		tls: BackendTlsSettings {
			ca_certs: backends.tls.as_ref().and_then(|t| t.ca_certs.clone()),
			cert_path: backends.tls.as_ref().and_then(|t| t.cert.clone()),
			key_path: backends.tls.as_ref().and_then(|t| t.key.clone()),
			skip_verification: backends
				.tls
				.as_ref()
				.and_then(|t| t.skip_verification)
				.unwrap_or(false),
		},
	};

	let routing = raw.routing.unwrap_or_default();
	let routing = RoutingConfig {
		max_attempts: cmp::max(1, parse("MAX_ATTEMPTS")?.or(routing.max_attempts).unwrap_or(3)),
		algorithm: routing.algorithm.unwrap_or_default(),
		sticky_cookies: routing
			.sticky_cookies
			.unwrap_or_else(|| vec!["JSESSIONID".to_string()])
			.iter()
			.map(strng::new)
			.collect(),
		affinity_cookie: strng::new(
			routing.affinity_cookie.as_deref().unwrap_or("VCAP_ID"),
		),
		secure_cookies: routing.secure_cookies.unwrap_or(false),
		failure_threshold: routing.failure_threshold.unwrap_or(3),
		failure_window: dur_or(routing.failure_window.as_deref(), Duration::from_secs(30))?,
	};

	let headers = raw.headers.unwrap_or_default();
	let headers = HeaderConfig {
		sanitize_forwarded_proto: headers.sanitize_forwarded_proto.unwrap_or(false),
		force_forwarded_proto_https: headers.force_forwarded_proto_https.unwrap_or(false),
		client_cert_mode: headers.client_cert_mode.unwrap_or_default(),
		hop_by_hop_filter: header_names(&headers.hop_by_hop_filter.unwrap_or_default())?,
		remove_response: header_names(&headers.remove_response.unwrap_or_default())?,
		add_response: headers
			.add_response
			.unwrap_or_default()
			.iter()
			.map(|(k, v)| {
				Ok((
					HeaderName::from_str(k).context("response header name")?,
					HeaderValue::from_str(v).context("response header value")?,
				))
			})
			.collect::<anyhow::Result<_>>()?,
	};

	let tracing = raw.tracing.unwrap_or_default();
	let tracing = TracingConfig {
		enable_b3: tracing.enable_b3.unwrap_or(false),
		enable_w3c: tracing.enable_w3c.unwrap_or(false),
		tenant_id: tracing.tenant_id.as_deref().map(strng::new),
	};

	let bus = raw.bus.unwrap_or_default();
	let bus = BusConfig {
		url: empty_to_none(parse("BUS_URL")?.or(bus.url)),
		router_id: strng::new(bus.router_id.as_deref().unwrap_or("routegate")),
		announce_host: strng::new(bus.announce_host.as_deref().unwrap_or("")),
		suspend_pruning_if_unavailable: bus.suspend_pruning_if_unavailable.unwrap_or(false),
		reconnect_initial: dur_or(bus.reconnect_initial.as_deref(), Duration::from_millis(500))?,
		reconnect_max: dur_or(bus.reconnect_max.as_deref(), Duration::from_secs(32))?,
		latency_warmup: dur_or(bus.latency_warmup.as_deref(), Duration::from_secs(90))?,
		minimum_register_interval: dur_or(
			bus.minimum_register_interval.as_deref(),
			Duration::from_secs(20),
		)?,
	};

	let registry_raw = raw.registry.unwrap_or_default();
	let registry = RegistryConfig {
		default_stale_threshold: dur_or(
			parse::<String>("STALE_THRESHOLD")?
				.as_deref()
				.or(registry_raw.stale_threshold.as_deref()),
			Duration::from_secs(120),
		)?,
		prune_tls_routes: registry_raw.prune_tls_routes.unwrap_or(true),
	};
	let prune_interval = dur_or(
		parse::<String>("PRUNE_INTERVAL")?
			.as_deref()
			.or(registry_raw.prune_interval.as_deref()),
		Duration::from_secs(30),
	)?;

	let route_services = match raw.route_services {
		Some(rs) => Some(RouteServicesConfig {
			secret: rs.secret.context("route_services.secret is required")?,
			signature_ttl: dur_or(rs.signature_ttl.as_deref(), Duration::from_secs(60))?,
		}),
		None => None,
	};

	let error_template = match raw.errors {
		Some(errors) => {
			let path = errors.template.context("errors.template is required")?;
			let body = std::fs::read_to_string(&path)
				.with_context(|| format!("reading error template {}", path.display()))?;
			Some(ErrorTemplate {
				body,
				content_type: HeaderValue::from_str(
					errors.content_type.as_deref().unwrap_or("text/html; charset=utf-8"),
				)
				.context("errors.content_type")?,
			})
		},
		None => None,
	};

	Ok(Config {
		bind_http,
		bind_tls,
		server_tls,
		admin_addr,
		admin_auth,
		backend,
		routing,
		headers,
		tracing,
		bus,
		registry,
		prune_interval,
		drain_timeout: dur_or(
			parse::<String>("DRAIN_TIMEOUT")?
				.as_deref()
				.or(raw.drain_timeout.as_deref()),
			Duration::from_secs(30),
		)?,
		request_header_timeout: dur_or(raw.request_header_timeout.as_deref(), Duration::from_secs(30))?,
		max_header_bytes: raw.max_header_bytes.unwrap_or(1024 * 1024),
		healthcheck_user_agent: raw
			.healthcheck_user_agent
			.unwrap_or_else(|| "HTTP-Monitor/1.1".to_string()),
		route_services,
		error_template,
		worker_threads: parse("WORKER_THREADS")?
			.or(raw.worker_threads)
			.unwrap_or_else(num_cpus::get),
	})
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
	port: Option<u16>,
	tls: Option<RawTls>,
	admin: Option<RawAdmin>,
	backends: Option<RawBackends>,
	routing: Option<RawRouting>,
	headers: Option<RawHeaders>,
	tracing: Option<RawTracing>,
	bus: Option<RawBus>,
	registry: Option<RawRegistry>,
	drain_timeout: Option<String>,
	request_header_timeout: Option<String>,
	max_header_bytes: Option<usize>,
	healthcheck_user_agent: Option<String>,
	route_services: Option<RawRouteServices>,
	errors: Option<RawErrors>,
	worker_threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTls {
	port: Option<u16>,
	cert: Option<PathBuf>,
	key: Option<PathBuf>,
	min_version: Option<MinTlsVersion>,
	client_auth: Option<ClientAuth>,
	ca_certs: Option<PathBuf>,
	client_ca_certs: Option<PathBuf>,
	only_trust_client_ca_certs: Option<bool>,
	enable_http2: Option<bool>,
	cipher_suites: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAdmin {
	addr: Option<SocketAddr>,
	user: Option<String>,
	pass: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackends {
	dial_timeout: Option<String>,
	response_header_timeout: Option<String>,
	endpoint_timeout: Option<String>,
	idle_timeout: Option<String>,
	max_idle_per_host: Option<usize>,
	max_conns: Option<usize>,
	disable_keep_alives: Option<bool>,
	tls: Option<RawBackendTls>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackendTls {
	ca_certs: Option<PathBuf>,
	cert: Option<PathBuf>,
	key: Option<PathBuf>,
	skip_verification: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRouting {
	max_attempts: Option<usize>,
	algorithm: Option<BalancingAlgorithm>,
	sticky_cookies: Option<Vec<String>>,
	affinity_cookie: Option<String>,
	secure_cookies: Option<bool>,
	failure_threshold: Option<usize>,
	failure_window: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHeaders {
	sanitize_forwarded_proto: Option<bool>,
	force_forwarded_proto_https: Option<bool>,
	client_cert_mode: Option<ClientCertMode>,
	hop_by_hop_filter: Option<Vec<String>>,
	remove_response: Option<Vec<String>>,
	add_response: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTracing {
	enable_b3: Option<bool>,
	enable_w3c: Option<bool>,
	tenant_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBus {
	url: Option<String>,
	router_id: Option<String>,
	announce_host: Option<String>,
	suspend_pruning_if_unavailable: Option<bool>,
	reconnect_initial: Option<String>,
	reconnect_max: Option<String>,
	latency_warmup: Option<String>,
	minimum_register_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegistry {
	prune_interval: Option<String>,
	stale_threshold: Option<String>,
	prune_tls_routes: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRouteServices {
	secret: Option<String>,
	signature_ttl: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawErrors {
	template: Option<PathBuf>,
	content_type: Option<String>,
}

fn parse<T: FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(key) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", key, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

fn opt_dur(raw: Option<&str>) -> anyhow::Result<Option<Duration>> {
	raw
		.map(|s| duration_str::parse(s).map_err(|e| anyhow::anyhow!("invalid duration {s:?}: {e}")))
		.transpose()
}

fn dur_or(raw: Option<&str>, default: Duration) -> anyhow::Result<Duration> {
	Ok(opt_dur(raw)?.unwrap_or(default))
}

fn header_names(raw: &[String]) -> anyhow::Result<Vec<HeaderName>> {
	raw
		.iter()
		.map(|s| HeaderName::from_str(s).with_context(|| format!("invalid header name {s:?}")))
		.collect()
}

pub fn empty_to_none(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_from_empty_config() {
		let cfg = parse_config("{}", None).unwrap();
		assert_eq!(cfg.bind_http.port(), 8081);
		assert!(cfg.bind_tls.is_none());
		assert_eq!(cfg.routing.max_attempts, 3);
		assert_eq!(cfg.routing.sticky_cookies, vec![strng::new("JSESSIONID")]);
		assert_eq!(cfg.routing.affinity_cookie.as_str(), "VCAP_ID");
		assert_eq!(cfg.registry.default_stale_threshold, Duration::from_secs(120));
		assert_eq!(cfg.prune_interval, Duration::from_secs(30));
		assert_eq!(cfg.healthcheck_user_agent, "HTTP-Monitor/1.1");
		assert!(cfg.route_services.is_none());
	}

	#[test]
	fn parses_a_full_config() {
		let yaml = r#"
port: 9090
routing:
  max_attempts: 5
  algorithm: least-connection
  sticky_cookies: ["JSESSIONID", "SESSION"]
  secure_cookies: true
headers:
  sanitize_forwarded_proto: true
  client_cert_mode: sanitize_set
  hop_by_hop_filter: ["x-custom-hop"]
  add_response: {"x-served-by": "routegate"}
tracing:
  enable_w3c: true
  tenant_id: tid
bus:
  suspend_pruning_if_unavailable: true
  reconnect_max: 10s
registry:
  prune_interval: 10s
  stale_threshold: 2m
  prune_tls_routes: false
drain_timeout: 90s
route_services:
  secret: open-sesame
  signature_ttl: 2m
"#;
		let cfg = parse_config(yaml, None).unwrap();
		assert_eq!(cfg.bind_http.port(), 9090);
		assert_eq!(cfg.routing.max_attempts, 5);
		assert_eq!(
			cfg.routing.algorithm,
			BalancingAlgorithm::LeastConnection
		);
		assert!(cfg.routing.secure_cookies);
		assert!(cfg.headers.sanitize_forwarded_proto);
		assert_eq!(cfg.headers.client_cert_mode, ClientCertMode::SanitizeSet);
		assert_eq!(cfg.headers.hop_by_hop_filter.len(), 1);
		assert!(cfg.tracing.enable_w3c);
		assert_eq!(cfg.tracing.tenant_id.as_deref(), Some("tid"));
		assert!(cfg.bus.suspend_pruning_if_unavailable);
		assert_eq!(cfg.prune_interval, Duration::from_secs(10));
		assert_eq!(cfg.registry.default_stale_threshold, Duration::from_secs(120));
		assert!(!cfg.registry.prune_tls_routes);
		assert_eq!(cfg.drain_timeout, Duration::from_secs(90));
		let rs = cfg.route_services.unwrap();
		assert_eq!(rs.secret, "open-sesame");
		assert_eq!(rs.signature_ttl, Duration::from_secs(120));
	}

	#[test]
	fn rejects_unknown_fields_and_partial_admin_auth() {
		assert!(parse_config("bogus_field: 1", None).is_err());
		assert!(parse_config("admin: {user: admin}", None).is_err());
	}
}
