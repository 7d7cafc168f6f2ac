use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::Serialize;

use crate::types::{Endpoint, EndpointPool, EndpointSpec, Upsert, now_ms};
use crate::*;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Applied to endpoints whose registration did not carry a threshold.
	pub default_stale_threshold: Duration,
	/// When false, endpoints registered with a TLS port are never pruned.
	pub prune_tls_routes: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		RegistryConfig {
			default_stale_threshold: Duration::from_secs(120),
			prune_tls_routes: true,
		}
	}
}

/// The live routing table: lowercased hostname to endpoint pool, plus a
/// reverse index from canonical endpoint address to the hostnames that carry
/// it. The top-level map has one lock; each pool has its own, so two
/// hostnames can be updated in parallel once both pools exist.
#[derive(Debug)]
pub struct Registry {
	cfg: RegistryConfig,
	pools: RwLock<HashMap<Strng, Arc<EndpointPool>>>,
	index: Mutex<Index>,
}

#[derive(Debug, Default)]
struct Index {
	by_addr: HashMap<Strng, HashSet<Strng>>,
	/// Count of distinct (hostname, address) pairs.
	pairs: usize,
}

impl Registry {
	pub fn new(cfg: RegistryConfig) -> Registry {
		Registry {
			cfg,
			pools: RwLock::new(HashMap::new()),
			index: Mutex::new(Index::default()),
		}
	}

	/// Registers `spec` under every URI. Returns how many (hostname, address)
	/// pairs were newly created; refreshes count zero.
	pub fn register(&self, uris: &[Strng], spec: &EndpointSpec) -> usize {
		let mut created = 0;
		for uri in uris {
			let host = fold_host(uri);
			if host.is_empty() {
				continue;
			}
			match self.upsert_one(&host, spec) {
				Upsert::Created => created += 1,
				Upsert::Refreshed => {},
			}
		}
		created
	}

	fn upsert_one(&self, host: &Strng, spec: &EndpointSpec) -> Upsert {
		loop {
			let pool = {
				let pools = self.pools.read().expect("lock poisoned");
				pools.get(host).cloned()
			};
			let pool = match pool {
				Some(p) => p,
				None => {
					let mut pools = self.pools.write().expect("lock poisoned");
					pools
						.entry(host.clone())
						.or_insert_with(|| Arc::new(EndpointPool::new(host.clone())))
						.clone()
				},
			};
			// The index lock brackets the membership change so the reverse
			// index and pair count always agree with pool contents.
			let mut index = self.index.lock().expect("lock poisoned");
			// A pool emptied by a concurrent unregister/prune may already be
			// detached; start over so the entry lands in a reachable pool.
			let Some((upsert, _ep)) = pool.upsert(spec) else {
				drop(index);
				continue;
			};
			if upsert == Upsert::Created {
				index
					.by_addr
					.entry(spec.address())
					.or_default()
					.insert(host.clone());
				index.pairs += 1;
			}
			return upsert;
		}
	}

	/// Removes the endpoint with `spec`'s canonical address from every URI's
	/// pool, dropping pools that become empty. Returns pairs removed.
	pub fn unregister(&self, uris: &[Strng], spec: &EndpointSpec) -> usize {
		let address = spec.address();
		let mut removed = 0;
		for uri in uris {
			let host = fold_host(uri);
			if self.remove_one(&host, &address) {
				removed += 1;
			}
		}
		removed
	}

	fn remove_one(&self, host: &Strng, address: &Strng) -> bool {
		let pool = {
			let pools = self.pools.read().expect("lock poisoned");
			pools.get(host).cloned()
		};
		let Some(pool) = pool else {
			return false;
		};
		let mut index = self.index.lock().expect("lock poisoned");
		let (removed, now_empty) = pool.remove(address);
		if removed {
			if let Some(hosts) = index.by_addr.get_mut(address) {
				hosts.remove(host);
				if hosts.is_empty() {
					index.by_addr.remove(address);
				}
			}
			index.pairs -= 1;
		}
		drop(index);
		if now_empty {
			self.drop_pool_if_empty(host);
		}
		removed
	}

	/// Unlinks the host's pool if it is still empty. Sealing happens under the
	/// top-level write lock so a racing register either lands before the seal
	/// or retries against a fresh pool.
	fn drop_pool_if_empty(&self, host: &Strng) {
		let mut pools = self.pools.write().expect("lock poisoned");
		if let Some(pool) = pools.get(host) {
			if pool.seal_if_empty() {
				pools.remove(host);
			}
		}
	}

	/// Host lookup: strips any port, folds case.
	pub fn lookup(&self, host: &str) -> Option<Arc<EndpointPool>> {
		let host = fold_host(crate::http::strip_port(host));
		self.pools.read().expect("lock poisoned").get(&host).cloned()
	}

	/// The endpoint registered under `host` with the given private instance id.
	pub fn lookup_instance(&self, host: &str, instance_id: &str) -> Option<Arc<Endpoint>> {
		let pool = self.lookup(host)?;
		pool
			.endpoints()
			.into_iter()
			.find(|e| e.instance_id().as_str() == instance_id)
	}

	/// Evicts endpoints not heard from within their stale threshold. Returns
	/// the number of (hostname, address) pairs pruned.
	pub fn prune_stale(&self) -> usize {
		let now = now_ms();
		let pools: Vec<Arc<EndpointPool>> = {
			let pools = self.pools.read().expect("lock poisoned");
			pools.values().cloned().collect()
		};
		let mut pruned = 0;
		for pool in pools {
			let stale: Vec<Arc<Endpoint>> = pool
				.endpoints()
				.into_iter()
				.filter(|e| {
					if e.use_tls && !self.cfg.prune_tls_routes {
						return false;
					}
					e.is_stale(now, self.cfg.default_stale_threshold)
				})
				.collect();
			for ep in stale {
				if self.remove_one(&pool.host, &ep.address) {
					debug!(host = %pool.host, endpoint = %ep.address, "pruned stale endpoint");
					pruned += 1;
				}
			}
		}
		pruned
	}

	/// Number of hostnames with at least one endpoint.
	pub fn num_routes(&self) -> usize {
		self.pools.read().expect("lock poisoned").len()
	}

	/// Number of distinct (hostname, address) pairs.
	pub fn num_endpoints(&self) -> usize {
		self.index.lock().expect("lock poisoned").pairs
	}

	/// A consistent, JSON-serializable view for diagnostics.
	pub fn snapshot(&self) -> Snapshot {
		let pools: Vec<Arc<EndpointPool>> = {
			let pools = self.pools.read().expect("lock poisoned");
			pools.values().cloned().collect()
		};
		let mut routes = std::collections::BTreeMap::new();
		for pool in pools {
			let entries: Vec<SnapshotEndpoint> = pool
				.endpoints()
				.iter()
				.map(|e| {
					let meta = e.meta();
					SnapshotEndpoint {
						address: e.address.clone(),
						tls: e.use_tls,
						app_id: meta.app_id,
						instance_id: meta.instance_id,
						tags: meta.tags.into_iter().collect(),
						route_service_url: meta.route_service_url,
					}
				})
				.collect();
			if !entries.is_empty() {
				routes.insert(pool.host.clone(), entries);
			}
		}
		Snapshot { routes }
	}
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
	#[serde(flatten)]
	pub routes: std::collections::BTreeMap<Strng, Vec<SnapshotEndpoint>>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotEndpoint {
	pub address: Strng,
	pub tls: bool,
	pub app_id: Strng,
	pub instance_id: Strng,
	pub tags: std::collections::BTreeMap<Strng, Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub route_service_url: Option<Strng>,
}

fn fold_host(host: &str) -> Strng {
	if host.chars().all(|c| !c.is_ascii_uppercase()) {
		strng::new(host)
	} else {
		strng::new(host.to_ascii_lowercase())
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::types::EndpointSpec;

	fn spec(host: &str, port: u16) -> EndpointSpec {
		EndpointSpec {
			host: strng::new(host),
			port,
			use_tls: false,
			app_id: strng::new("app-guid"),
			instance_id: strng::format!("id-{host}-{port}"),
			instance_index: strng::new("0"),
			server_cert_san: strng::EMPTY,
			tags: BTreeMap::new(),
			route_service_url: None,
			stale_threshold: Duration::ZERO,
		}
	}

	fn uris(list: &[&str]) -> Vec<Strng> {
		list.iter().map(strng::new).collect()
	}

	#[test]
	fn register_then_unregister_restores_empty() {
		let r = Registry::new(RegistryConfig::default());
		let s = spec("10.0.0.1", 8080);
		let created = r.register(&uris(&["app.example.com", "alias.example.com"]), &s);
		assert_eq!(created, 2);
		assert_eq!(r.num_routes(), 2);
		assert_eq!(r.num_endpoints(), 2);

		let removed = r.unregister(&uris(&["app.example.com", "alias.example.com"]), &s);
		assert_eq!(removed, 2);
		assert_eq!(r.num_routes(), 0);
		assert_eq!(r.num_endpoints(), 0);
		assert!(r.lookup("app.example.com").is_none());
	}

	#[test]
	fn double_register_is_a_refresh() {
		let r = Registry::new(RegistryConfig::default());
		let s = spec("10.0.0.1", 8080);
		assert_eq!(r.register(&uris(&["app.example.com"]), &s), 1);
		assert_eq!(r.register(&uris(&["app.example.com"]), &s), 0);
		assert_eq!(r.num_endpoints(), 1);
		assert_eq!(r.lookup("app.example.com").unwrap().len(), 1);
	}

	#[test]
	fn lookup_is_case_insensitive_and_port_blind() {
		let r = Registry::new(RegistryConfig::default());
		r.register(&uris(&["App.Example.COM"]), &spec("10.0.0.1", 8080));
		assert!(r.lookup("app.example.com").is_some());
		assert!(r.lookup("APP.EXAMPLE.COM").is_some());
		assert!(r.lookup("app.example.com:8443").is_some());
		assert!(r.lookup("other.example.com").is_none());
	}

	#[test]
	fn endpoint_count_tracks_distinct_pairs() {
		let r = Registry::new(RegistryConfig::default());
		let a = spec("10.0.0.1", 8080);
		let b = spec("10.0.0.2", 8080);
		r.register(&uris(&["one.example.com", "two.example.com"]), &a);
		r.register(&uris(&["one.example.com"]), &b);
		assert_eq!(r.num_endpoints(), 3);
		r.unregister(&uris(&["two.example.com"]), &a);
		assert_eq!(r.num_endpoints(), 2);
		assert_eq!(r.num_routes(), 1);
	}

	#[test]
	fn unregister_of_unknown_endpoint_is_a_noop() {
		let r = Registry::new(RegistryConfig::default());
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.1", 8080));
		assert_eq!(r.unregister(&uris(&["app.example.com"]), &spec("10.9.9.9", 1)), 0);
		assert_eq!(r.unregister(&uris(&["ghost.example.com"]), &spec("10.0.0.1", 8080)), 0);
		assert_eq!(r.num_endpoints(), 1);
	}

	#[test]
	fn lookup_instance_finds_by_private_id() {
		let r = Registry::new(RegistryConfig::default());
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.1", 8080));
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.2", 8080));
		let ep = r
			.lookup_instance("app.example.com", "id-10.0.0.2-8080")
			.unwrap();
		assert_eq!(ep.address.as_str(), "10.0.0.2:8080");
		assert!(r.lookup_instance("app.example.com", "nope").is_none());
	}

	#[test]
	fn prune_honors_per_endpoint_threshold() {
		let r = Registry::new(RegistryConfig {
			default_stale_threshold: Duration::from_millis(5),
			prune_tls_routes: true,
		});
		let quick = spec("10.0.0.1", 8080);
		let mut patient = spec("10.0.0.2", 8080);
		patient.stale_threshold = Duration::from_secs(600);
		r.register(&uris(&["app.example.com"]), &quick);
		r.register(&uris(&["app.example.com"]), &patient);

		std::thread::sleep(Duration::from_millis(30));
		assert_eq!(r.prune_stale(), 1);
		let pool = r.lookup("app.example.com").unwrap();
		assert_eq!(pool.len(), 1);
		assert_eq!(pool.endpoints()[0].address.as_str(), "10.0.0.2:8080");
	}

	#[test]
	fn prune_exempts_tls_when_configured() {
		let r = Registry::new(RegistryConfig {
			default_stale_threshold: Duration::from_millis(5),
			prune_tls_routes: false,
		});
		let mut tls = spec("10.0.0.1", 8443);
		tls.use_tls = true;
		r.register(&uris(&["app.example.com"]), &tls);
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.2", 8080));

		std::thread::sleep(Duration::from_millis(30));
		assert_eq!(r.prune_stale(), 1);
		let left = r.lookup("app.example.com").unwrap().endpoints();
		assert_eq!(left.len(), 1);
		assert!(left[0].use_tls);
	}

	#[test]
	fn prune_drops_emptied_pools() {
		let r = Registry::new(RegistryConfig {
			default_stale_threshold: Duration::from_millis(5),
			prune_tls_routes: true,
		});
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.1", 8080));
		std::thread::sleep(Duration::from_millis(30));
		assert_eq!(r.prune_stale(), 1);
		assert_eq!(r.num_routes(), 0);
		assert!(r.lookup("app.example.com").is_none());
	}

	#[test]
	fn snapshot_reflects_contents() {
		let r = Registry::new(RegistryConfig::default());
		r.register(&uris(&["app.example.com"]), &spec("10.0.0.1", 8080));
		let snap = serde_json::to_value(r.snapshot()).unwrap();
		let eps = snap.get("app.example.com").unwrap().as_array().unwrap();
		assert_eq!(eps.len(), 1);
		assert_eq!(eps[0]["address"], "10.0.0.1:8080");
	}

	#[test]
	fn concurrent_register_and_unregister_settle() {
		let r = Arc::new(Registry::new(RegistryConfig::default()));
		let mut handles = vec![];
		for t in 0..4 {
			let r = r.clone();
			handles.push(std::thread::spawn(move || {
				let s = spec(&format!("10.0.{t}.1"), 8080);
				let u = uris(&["churn.example.com"]);
				for _ in 0..200 {
					r.register(&u, &s);
					r.unregister(&u, &s);
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(r.num_endpoints(), 0);
		assert!(r.lookup("churn.example.com").is_none());
	}
}
