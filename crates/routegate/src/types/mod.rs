use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::*;

/// Milliseconds since process start; the monotonic clock endpoints are stamped
/// with. Cheap enough to store in an atomic.
pub fn now_ms() -> u64 {
	route_core::telemetry::APPLICATION_START_TIME
		.elapsed()
		.as_millis() as u64
}

/// Everything a registration frame tells us about one backend address. The
/// identity is the canonical address; the rest is metadata that the most
/// recent registration overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
	pub host: Strng,
	pub port: u16,
	pub use_tls: bool,
	pub app_id: Strng,
	pub instance_id: Strng,
	pub instance_index: Strng,
	pub server_cert_san: Strng,
	pub tags: BTreeMap<Strng, Strng>,
	pub route_service_url: Option<Strng>,
	/// Zero means "use the configured default".
	pub stale_threshold: Duration,
}

impl EndpointSpec {
	/// The canonical `host:port` key. IPv6 hosts are bracketed so the string
	/// round-trips through socket-address parsing.
	pub fn address(&self) -> Strng {
		canonical_address(&self.host, self.port)
	}
}

pub fn canonical_address(host: &str, port: u16) -> Strng {
	if host.contains(':') && !host.starts_with('[') {
		strng::format!("[{host}]:{port}")
	} else {
		strng::format!("{host}:{port}")
	}
}

/// Mutable endpoint metadata, replaced wholesale by re-registration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointMeta {
	pub app_id: Strng,
	pub instance_id: Strng,
	pub instance_index: Strng,
	pub server_cert_san: Strng,
	pub tags: BTreeMap<Strng, Strng>,
	pub route_service_url: Option<Strng>,
	#[serde(skip)]
	pub stale_threshold: Duration,
}

impl From<&EndpointSpec> for EndpointMeta {
	fn from(s: &EndpointSpec) -> Self {
		EndpointMeta {
			app_id: s.app_id.clone(),
			instance_id: s.instance_id.clone(),
			instance_index: s.instance_index.clone(),
			server_cert_san: s.server_cert_san.clone(),
			tags: s.tags.clone(),
			route_service_url: s.route_service_url.clone(),
			stale_threshold: s.stale_threshold,
		}
	}
}

/// One reachable backend address. Shared between the registry, the selector
/// and in-flight requests; eviction from the registry never invalidates a
/// request already holding the Arc.
#[derive(Debug)]
pub struct Endpoint {
	pub address: Strng,
	pub host: Strng,
	pub port: u16,
	pub use_tls: bool,

	meta: RwLock<EndpointMeta>,
	last_heard_ms: AtomicU64,
	inflight: AtomicUsize,
	failures: AtomicUsize,
	last_failure_ms: AtomicU64,
	/// Lazily-built upstream client; pooled connections die with the
	/// endpoint.
	upstream: std::sync::OnceLock<crate::client::PooledClient>,
}

impl Endpoint {
	pub fn new(spec: &EndpointSpec) -> Endpoint {
		Endpoint {
			address: spec.address(),
			host: spec.host.clone(),
			port: spec.port,
			use_tls: spec.use_tls,
			meta: RwLock::new(EndpointMeta::from(spec)),
			last_heard_ms: AtomicU64::new(now_ms()),
			inflight: AtomicUsize::new(0),
			failures: AtomicUsize::new(0),
			last_failure_ms: AtomicU64::new(0),
			upstream: std::sync::OnceLock::new(),
		}
	}

	pub fn upstream_client(
		&self,
		build: impl FnOnce() -> crate::client::PooledClient,
	) -> &crate::client::PooledClient {
		self.upstream.get_or_init(build)
	}

	pub fn meta(&self) -> EndpointMeta {
		self.meta.read().expect("lock poisoned").clone()
	}

	pub fn instance_id(&self) -> Strng {
		self.meta.read().expect("lock poisoned").instance_id.clone()
	}

	pub fn route_service_url(&self) -> Option<Strng> {
		self
			.meta
			.read()
			.expect("lock poisoned")
			.route_service_url
			.clone()
	}

	/// A re-registration: refresh the liveness stamp and replace metadata.
	pub fn refresh(&self, spec: &EndpointSpec) {
		*self.meta.write().expect("lock poisoned") = EndpointMeta::from(spec);
		self.last_heard_ms.store(now_ms(), Ordering::Relaxed);
	}

	pub fn last_heard_ms(&self) -> u64 {
		self.last_heard_ms.load(Ordering::Relaxed)
	}

	/// Stale when the last registration is older than the endpoint's own
	/// threshold, or the default when the frame did not carry one.
	pub fn is_stale(&self, now_ms: u64, default_threshold: Duration) -> bool {
		let mut threshold = self.meta.read().expect("lock poisoned").stale_threshold;
		if threshold.is_zero() {
			threshold = default_threshold;
		}
		now_ms.saturating_sub(self.last_heard_ms()) > threshold.as_millis() as u64
	}

	pub fn inflight(&self) -> usize {
		self.inflight.load(Ordering::Relaxed)
	}

	/// Reserves an in-flight slot, failing when the endpoint is at `cap`
	/// (0 = unlimited). The returned guard releases the slot on drop.
	pub fn try_acquire(self: &Arc<Self>, cap: usize) -> Option<InflightGuard> {
		let res = self
			.inflight
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
				if cap != 0 && cur >= cap {
					None
				} else {
					Some(cur + 1)
				}
			});
		res.ok().map(|_| InflightGuard {
			endpoint: self.clone(),
		})
	}

	pub fn record_failure(&self) {
		self.failures.fetch_add(1, Ordering::Relaxed);
		self.last_failure_ms.store(now_ms(), Ordering::Relaxed);
	}

	pub fn record_success(&self) {
		self.failures.store(0, Ordering::Relaxed);
	}

	/// Whether the endpoint has failed enough, recently enough, that selection
	/// should prefer its siblings. Counters decay once the window passes.
	pub fn in_failure_backoff(&self, now_ms: u64, threshold: usize, window: Duration) -> bool {
		if threshold == 0 {
			return false;
		}
		let failures = self.failures.load(Ordering::Relaxed);
		if failures < threshold {
			return false;
		}
		let since = now_ms.saturating_sub(self.last_failure_ms.load(Ordering::Relaxed));
		if since > window.as_millis() as u64 {
			self.failures.store(0, Ordering::Relaxed);
			return false;
		}
		true
	}
}

/// Releases the endpoint's in-flight slot when dropped. Carried alongside the
/// response body so the slot stays held until the response is fully streamed.
#[derive(Debug)]
pub struct InflightGuard {
	endpoint: Arc<Endpoint>,
}

impl Drop for InflightGuard {
	fn drop(&mut self) {
		self.endpoint.inflight.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Result of an upsert into a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
	Created,
	Refreshed,
}

/// The insertion-ordered set of endpoints registered for one hostname. Each
/// pool carries its own lock so distinct hostnames update in parallel; the
/// round-robin cursor only ever moves forward.
#[derive(Debug)]
pub struct EndpointPool {
	pub host: Strng,
	members: Mutex<Members>,
	cursor: AtomicUsize,
}

#[derive(Debug, Default)]
struct Members {
	endpoints: Vec<Arc<Endpoint>>,
	/// Set when the registry detached this pool; a racing register must start
	/// over rather than insert into an unreachable pool.
	dead: bool,
}

impl EndpointPool {
	pub fn new(host: Strng) -> EndpointPool {
		EndpointPool {
			host,
			members: Mutex::new(Members::default()),
			cursor: AtomicUsize::new(0),
		}
	}

	/// Inserts or refreshes the endpoint for `spec`. Returns None if the pool
	/// has been detached from the registry and the caller must retry.
	pub fn upsert(&self, spec: &EndpointSpec) -> Option<(Upsert, Arc<Endpoint>)> {
		let address = spec.address();
		let mut members = self.members.lock().expect("lock poisoned");
		if members.dead {
			return None;
		}
		if let Some(existing) = members.endpoints.iter().find(|e| e.address == address) {
			existing.refresh(spec);
			return Some((Upsert::Refreshed, existing.clone()));
		}
		let ep = Arc::new(Endpoint::new(spec));
		members.endpoints.push(ep.clone());
		Some((Upsert::Created, ep))
	}

	/// Removes the endpoint with the canonical address. Returns whether it was
	/// present and whether the pool is now empty.
	pub fn remove(&self, address: &str) -> (bool, bool) {
		let mut members = self.members.lock().expect("lock poisoned");
		let before = members.endpoints.len();
		members.endpoints.retain(|e| e.address != address);
		let removed = members.endpoints.len() != before;
		(removed, members.endpoints.is_empty())
	}

	/// Marks the pool detached iff it is empty; the registry calls this while
	/// holding the top-level write lock before unlinking the pool.
	pub fn seal_if_empty(&self) -> bool {
		let mut members = self.members.lock().expect("lock poisoned");
		if members.endpoints.is_empty() {
			members.dead = true;
			true
		} else {
			false
		}
	}

	pub fn is_empty(&self) -> bool {
		self.members.lock().expect("lock poisoned").endpoints.is_empty()
	}

	pub fn len(&self) -> usize {
		self.members.lock().expect("lock poisoned").endpoints.len()
	}

	/// A point-in-time copy of the membership, in insertion order.
	pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
		self.members.lock().expect("lock poisoned").endpoints.clone()
	}

	/// Claims the next round-robin offset.
	pub fn next_cursor(&self) -> usize {
		self.cursor.fetch_add(1, Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn spec(host: &str, port: u16) -> EndpointSpec {
		EndpointSpec {
			host: strng::new(host),
			port,
			use_tls: false,
			app_id: strng::new("app"),
			instance_id: strng::format!("{host}:{port}"),
			instance_index: strng::new("0"),
			server_cert_san: strng::EMPTY,
			tags: Default::default(),
			route_service_url: None,
			stale_threshold: Duration::ZERO,
		}
	}

	#[test]
	fn canonical_addresses() {
		assert_eq!(canonical_address("10.0.1.2", 8080).as_str(), "10.0.1.2:8080");
		assert_eq!(canonical_address("::1", 9000).as_str(), "[::1]:9000");
		assert_eq!(canonical_address("[::1]", 9000).as_str(), "[::1]:9000");
	}

	#[test]
	fn upsert_never_duplicates() {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let s = spec("10.0.0.1", 8080);
		let (first, _) = pool.upsert(&s).unwrap();
		assert_eq!(first, Upsert::Created);
		let (second, _) = pool.upsert(&s).unwrap();
		assert_eq!(second, Upsert::Refreshed);
		assert_eq!(pool.len(), 1);
	}

	#[test]
	fn refresh_overwrites_metadata() {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let mut s = spec("10.0.0.1", 8080);
		let (_, ep) = pool.upsert(&s).unwrap();
		s.instance_id = strng::new("replacement");
		s.tags.insert(strng::new("component"), strng::new("web"));
		pool.upsert(&s).unwrap();
		let meta = ep.meta();
		assert_eq!(meta.instance_id.as_str(), "replacement");
		assert_eq!(meta.tags.len(), 1);
	}

	#[test]
	fn sealed_pool_rejects_upserts() {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let s = spec("10.0.0.1", 8080);
		pool.upsert(&s).unwrap();
		let (removed, empty) = pool.remove("10.0.0.1:8080");
		assert!(removed && empty);
		assert!(pool.seal_if_empty());
		assert!(pool.upsert(&s).is_none());
	}

	#[test]
	fn inflight_cap_enforced() {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let (_, ep) = pool.upsert(&spec("10.0.0.1", 8080)).unwrap();
		let a = ep.try_acquire(2);
		let b = ep.try_acquire(2);
		assert!(a.is_some() && b.is_some());
		assert!(ep.try_acquire(2).is_none());
		drop(a);
		assert!(ep.try_acquire(2).is_some());
		// zero means unlimited
		for _ in 0..64 {
			std::mem::forget(ep.try_acquire(0).unwrap());
		}
	}

	#[test]
	fn failure_backoff_decays() {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let (_, ep) = pool.upsert(&spec("10.0.0.1", 8080)).unwrap();
		ep.record_failure();
		ep.record_failure();
		let now = now_ms();
		assert!(ep.in_failure_backoff(now, 2, Duration::from_secs(30)));
		// pretend the window has long passed
		assert!(!ep.in_failure_backoff(now + 60_000, 2, Duration::from_secs(30)));
		// and the counter was reset by the decay
		assert!(!ep.in_failure_backoff(now, 2, Duration::from_secs(30)));
	}
}
