use serde::{Deserialize, Serialize};

use crate::proxy::ProxyError;
use crate::types::{Endpoint, EndpointPool, InflightGuard, now_ms};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingAlgorithm {
	#[default]
	RoundRobin,
	LeastConnection,
}

/// Per-request selection inputs. Selection itself never touches the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct Criteria<'a> {
	/// Instance id from the router's affinity cookie.
	pub sticky_instance: Option<&'a str>,
	/// `appGuid:index` targeting from X-CF-APP-INSTANCE.
	pub app_instance: Option<(&'a str, &'a str)>,
	/// Endpoints already attempted for this request.
	pub exclude: &'a [Strng],
	/// Per-endpoint in-flight cap; 0 means unlimited.
	pub max_inflight: usize,
	pub algorithm: BalancingAlgorithm,
	/// Skip endpoints with this many recent consecutive failures (0 = off)...
	pub failure_threshold: usize,
	/// ...unless the failures are older than this window.
	pub failure_window: Duration,
}

#[derive(Debug)]
pub struct Selected {
	pub endpoint: Arc<Endpoint>,
	pub guard: InflightGuard,
}

/// Picks one endpoint from the pool: instance targeting first, then sticky
/// affinity, then the balancing algorithm, skipping endpoints at their
/// connection cap.
pub fn select(pool: &EndpointPool, c: &Criteria) -> Result<Selected, ProxyError> {
	let members = pool.endpoints();
	if members.is_empty() {
		return Err(ProxyError::NoEndpoints);
	}

	if let Some((app, index)) = c.app_instance {
		let target = members
			.iter()
			.find(|e| {
				let meta = e.meta();
				meta.app_id.as_str() == app && meta.instance_index.as_str() == index
			})
			.ok_or(ProxyError::BadInstance)?;
		if c.exclude.contains(&target.address) {
			return Err(ProxyError::NoEndpoints);
		}
		let guard = target
			.try_acquire(c.max_inflight)
			.ok_or(ProxyError::AllAtCapacity)?;
		return Ok(Selected {
			endpoint: target.clone(),
			guard,
		});
	}

	if let Some(instance) = c.sticky_instance {
		let target = members.iter().find(|e| {
			e.instance_id().as_str() == instance && !c.exclude.contains(&e.address)
		});
		if let Some(target) = target {
			if let Some(guard) = target.try_acquire(c.max_inflight) {
				return Ok(Selected {
					endpoint: target.clone(),
					guard,
				});
			}
			// Sticky target saturated; fall back to balancing.
		}
	}

	let now = now_ms();
	let start = pool.next_cursor() % members.len();
	let healthy = |e: &Arc<Endpoint>| !e.in_failure_backoff(now, c.failure_threshold, c.failure_window);
	// Prefer endpoints outside their failure backoff, but never fail a
	// request just because every member is backing off.
	balance(&members, c, start, &healthy)
		.or_else(|err| match err {
			ProxyError::NoEndpoints => balance(&members, c, start, &|_| true),
			other => Err(other),
		})
}

fn balance(
	members: &[Arc<Endpoint>],
	c: &Criteria,
	start: usize,
	eligible: &dyn Fn(&Arc<Endpoint>) -> bool,
) -> Result<Selected, ProxyError> {
	let mut any_eligible = false;
	let order: Vec<&Arc<Endpoint>> = match c.algorithm {
		BalancingAlgorithm::RoundRobin => {
			// The shared cursor only decides where the sweep starts.
			(0..members.len())
				.map(|i| &members[(start + i) % members.len()])
				.collect()
		},
		BalancingAlgorithm::LeastConnection => {
			let mut sorted: Vec<&Arc<Endpoint>> = members.iter().collect();
			sorted.sort_by_key(|e| e.inflight());
			sorted
		},
	};
	for endpoint in order {
		if c.exclude.contains(&endpoint.address) || !eligible(endpoint) {
			continue;
		}
		any_eligible = true;
		if let Some(guard) = endpoint.try_acquire(c.max_inflight) {
			return Ok(Selected {
				endpoint: endpoint.clone(),
				guard,
			});
		}
	}
	if any_eligible {
		// One full sweep and everything usable is at its cap.
		Err(ProxyError::AllAtCapacity)
	} else {
		Err(ProxyError::NoEndpoints)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;

	use super::*;
	use crate::types::EndpointSpec;

	fn pool_of(n: usize) -> (EndpointPool, Vec<Arc<Endpoint>>) {
		let pool = EndpointPool::new(strng::new("app.example.com"));
		let mut eps = vec![];
		for i in 0..n {
			let spec = EndpointSpec {
				host: strng::format!("10.0.0.{i}"),
				port: 8080,
				use_tls: false,
				app_id: strng::new("app-guid"),
				instance_id: strng::format!("id-{i}"),
				instance_index: strng::format!("{i}"),
				server_cert_san: strng::EMPTY,
				tags: BTreeMap::new(),
				route_service_url: None,
				stale_threshold: Duration::ZERO,
			};
			let (_, ep) = pool.upsert(&spec).unwrap();
			eps.push(ep);
		}
		(pool, eps)
	}

	#[test]
	fn round_robin_covers_all_members() {
		let (pool, _) = pool_of(3);
		let c = Criteria::default();
		let mut seen = std::collections::HashSet::new();
		for _ in 0..3 {
			let s = select(&pool, &c).unwrap();
			seen.insert(s.endpoint.address.clone());
			// keep the slot so the next pick moves on
			std::mem::forget(s.guard);
		}
		assert_eq!(seen.len(), 3);
	}

	#[test]
	fn capacity_skipping_and_exhaustion() {
		let (pool, eps) = pool_of(2);
		let c = Criteria {
			max_inflight: 1,
			..Default::default()
		};
		let a = select(&pool, &c).unwrap();
		let b = select(&pool, &c).unwrap();
		assert_ne!(a.endpoint.address, b.endpoint.address);
		let err = select(&pool, &c).unwrap_err();
		assert!(matches!(err, ProxyError::AllAtCapacity));
		drop(a);
		assert_eq!(eps.iter().map(|e| e.inflight()).sum::<usize>(), 1);
		assert!(select(&pool, &c).is_ok());
	}

	#[test]
	fn sticky_prefers_the_matching_instance() {
		let (pool, _) = pool_of(3);
		let c = Criteria {
			sticky_instance: Some("id-1"),
			..Default::default()
		};
		for _ in 0..4 {
			let s = select(&pool, &c).unwrap();
			assert_eq!(s.endpoint.instance_id().as_str(), "id-1");
		}
	}

	#[test]
	fn sticky_miss_falls_back() {
		let (pool, _) = pool_of(2);
		let c = Criteria {
			sticky_instance: Some("departed"),
			..Default::default()
		};
		assert!(select(&pool, &c).is_ok());
	}

	#[test]
	fn sticky_at_capacity_falls_back() {
		let (pool, _) = pool_of(2);
		let c = Criteria {
			sticky_instance: Some("id-0"),
			max_inflight: 1,
			..Default::default()
		};
		let first = select(&pool, &c).unwrap();
		assert_eq!(first.endpoint.instance_id().as_str(), "id-0");
		let second = select(&pool, &c).unwrap();
		assert_eq!(second.endpoint.instance_id().as_str(), "id-1");
	}

	#[test]
	fn app_instance_targeting() {
		let (pool, _) = pool_of(3);
		let c = Criteria {
			app_instance: Some(("app-guid", "2")),
			..Default::default()
		};
		let s = select(&pool, &c).unwrap();
		assert_eq!(s.endpoint.meta().instance_index.as_str(), "2");

		let missing = Criteria {
			app_instance: Some(("app-guid", "9")),
			..Default::default()
		};
		assert!(matches!(
			select(&pool, &missing).unwrap_err(),
			ProxyError::BadInstance
		));

		let wrong_app = Criteria {
			app_instance: Some(("other-guid", "0")),
			..Default::default()
		};
		assert!(matches!(
			select(&pool, &wrong_app).unwrap_err(),
			ProxyError::BadInstance
		));
	}

	#[test]
	fn excluded_endpoints_are_skipped() {
		let (pool, eps) = pool_of(2);
		let exclude = [eps[0].address.clone()];
		let c = Criteria {
			exclude: &exclude,
			..Default::default()
		};
		for _ in 0..3 {
			let s = select(&pool, &c).unwrap();
			assert_eq!(s.endpoint.address, eps[1].address);
		}
		let all = [eps[0].address.clone(), eps[1].address.clone()];
		let c = Criteria {
			exclude: &all,
			..Default::default()
		};
		assert!(matches!(
			select(&pool, &c).unwrap_err(),
			ProxyError::NoEndpoints
		));
	}

	#[test]
	fn failure_backoff_prefers_healthy_members() {
		let (pool, eps) = pool_of(2);
		eps[0].record_failure();
		eps[0].record_failure();
		let c = Criteria {
			failure_threshold: 2,
			failure_window: Duration::from_secs(30),
			..Default::default()
		};
		for _ in 0..3 {
			let s = select(&pool, &c).unwrap();
			assert_eq!(s.endpoint.address, eps[1].address);
		}
		// A pool that is all backoff still serves.
		eps[1].record_failure();
		eps[1].record_failure();
		assert!(select(&pool, &c).is_ok());
	}

	#[test]
	fn least_connection_picks_the_idle_member() {
		let (pool, eps) = pool_of(2);
		let _busy = eps[0].try_acquire(0).unwrap();
		let c = Criteria {
			algorithm: BalancingAlgorithm::LeastConnection,
			..Default::default()
		};
		let s = select(&pool, &c).unwrap();
		assert_eq!(s.endpoint.address, eps[1].address);
	}
}
