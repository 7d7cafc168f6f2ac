use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;

use crate::http::{self, Body, HeaderValue, Request, Response, StatusCode, header, headers};
use crate::proxy::routeservice::RouteServiceStep;
use crate::proxy::selector::{self, Criteria};
use crate::proxy::{ProxyError, selector::Selected};
use crate::telemetry::log::{DropOnLog, LogBody, RequestLog};
use crate::transport::stream::ConnectionInfo;
use crate::types::InflightGuard;
use crate::*;

/// The request dispatcher: one instance per listener, shared across
/// connections. Produces exactly one response per request and releases the
/// selected endpoint's in-flight slot on every exit path (it rides inside the
/// access log, which completes with the response body).
#[derive(Clone)]
pub struct HttpProxy {
	pub inputs: Arc<ProxyInputs>,
}

impl HttpProxy {
	pub async fn proxy(
		&self,
		connection: Arc<ConnectionInfo>,
		req: ::http::Request<Incoming>,
	) -> Response {
		let start = Instant::now();
		let mut log: DropOnLog = RequestLog::new(self.inputs.metrics.clone(), start).into();
		log.with(|l| {
			l.peer_addr = Some(connection.tcp.peer_addr);
			l.tls = connection.tls.is_some();
		});

		let ret = self
			.proxy_internal(&connection, req, log.as_mut().expect("fresh log"))
			.await;
		let resp = match ret {
			Ok(resp) => resp,
			Err(err) => {
				log.with(|l| {
					l.router_error = Some(err.router_error());
					l.error = Some(err.to_string());
				});
				err.as_response(self.inputs.cfg.error_template.as_ref())
			},
		};
		log.with(|l| l.status = Some(resp.status()));
		resp.map(move |b| Body::new(LogBody::new(b, log)))
	}

	async fn proxy_internal(
		&self,
		connection: &ConnectionInfo,
		req: ::http::Request<Incoming>,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;

		if is_healthcheck(&req, &cfg.healthcheck_user_agent) {
			return Ok(self.healthcheck_response());
		}

		let secure = connection.tls.is_some();
		let mut req = req.map(Body::new);
		http::normalize_uri(&mut req, secure).map_err(|_| ProxyError::InvalidRequest)?;

		if header_bytes(req.headers()) > cfg.max_header_bytes {
			return Err(ProxyError::RequestTooLarge);
		}

		let host = http::get_host(&req)?.to_string();
		log.method = Some(req.method().clone());
		log.host = Some(host.clone());
		log.path = Some(req.uri().path().to_string());
		log.version = Some(req.version());

		// The backend hop is always origin-form HTTP/1.1; carry the original
		// authority in Host explicitly (HTTP/2 inbound has none).
		if !req.headers().contains_key(header::HOST) {
			if let Some(authority) = req.uri().authority() {
				if let Ok(hv) = HeaderValue::try_from(authority.as_str()) {
					req.headers_mut().insert(header::HOST, hv);
				}
			}
		}

		let mut req_upgrade = hop_by_hop_headers(&mut req, &cfg.headers.hop_by_hop_filter);

		headers::append_forwarded_for(req.headers_mut(), connection.tcp.peer_addr.ip());
		headers::set_forwarded_proto(
			req.headers_mut(),
			secure,
			cfg.headers.sanitize_forwarded_proto,
			cfg.headers.force_forwarded_proto_https,
		);
		headers::apply_client_cert(
			req.headers_mut(),
			cfg.headers.client_cert_mode,
			connection.tls.as_ref(),
		);
		headers::set_request_start(req.headers_mut());
		log.trace_id = headers::apply_tracing(&cfg.tracing, req.headers_mut());

		let app_instance = parse_app_instance(&req)?;
		let pool = self
			.inputs
			.registry
			.lookup(&host)
			.ok_or(ProxyError::UnknownRoute)?;

		// Routes bound to a route service make a detour through it before any
		// backend sees the request.
		if let Some(rs) = &self.inputs.route_services {
			let route_service_url = pool.endpoints().first().and_then(|e| e.route_service_url());
			if let Some(url) = route_service_url {
				match rs.prepare(&mut req, &url, unix_now())? {
					RouteServiceStep::DispatchToBackend => {},
					RouteServiceStep::ForwardTo(url) => {
						return self.call_route_service(req, &url).await;
					},
				}
			}
		}

		let sticky = headers::request_cookie(req.headers(), cfg.routing.affinity_cookie.as_str());

		let (head, body) = req.into_parts();
		let shared = http::retry::SharedBody::new(body);
		let idempotent = http::retry::is_idempotent(&head.method);
		let mut tried: Vec<Strng> = Vec::new();
		let mut all_dial_failures = true;
		let max_attempts = cfg.routing.max_attempts;

		for attempt in 0..max_attempts {
			let criteria = Criteria {
				sticky_instance: sticky.as_deref(),
				app_instance: app_instance
					.as_ref()
					.map(|(app, index)| (app.as_str(), index.as_str())),
				exclude: &tried,
				max_inflight: cfg.backend.max_conns,
				algorithm: cfg.routing.algorithm,
				failure_threshold: cfg.routing.failure_threshold,
				failure_window: cfg.routing.failure_window,
			};
			let selected = match selector::select(&pool, &criteria) {
				Ok(s) => s,
				Err(ProxyError::NoEndpoints) if !tried.is_empty() => {
					// Candidates exhausted before attempts were.
					break;
				},
				Err(e) => return Err(e),
			};
			tried.push(selected.endpoint.address.clone());
			log.attempts = attempt + 1;
			log.endpoint = Some(selected.endpoint.address.clone());
			log.app_id = Some(selected.endpoint.meta().app_id.clone());
			self.inputs.metrics.upstream_attempts.inc();
			if attempt > 0 {
				self.inputs.metrics.upstream_retries.inc();
			}

			let endpoint = selected.endpoint.clone();
			let attempt_req = Request::from_parts(head.clone(), Body::new(shared.attempt()));
			match self.attempt(selected, attempt_req, &mut req_upgrade, log).await {
				Ok(resp) => return Ok(resp),
				Err(err) => {
					debug!(endpoint = %endpoint.address, attempt, "attempt failed: {err}");
					if err.is_endpoint_fault() {
						endpoint.record_failure();
					}
					all_dial_failures &= err.is_pre_transmit();
					let last = attempt + 1 == max_attempts;
					let retryable = err.is_endpoint_fault()
						&& (err.is_pre_transmit() || (idempotent && shared.replayable()));
					if last || !retryable {
						return Err(finalize(err, &tried, all_dial_failures));
					}
				},
			}
		}
		// The selector ran dry before an attempt succeeded.
		Err(if tried.is_empty() {
			ProxyError::NoEndpoints
		} else {
			ProxyError::BackendUnavailable
		})
	}

	async fn attempt(
		&self,
		selected: Selected,
		req: Request,
		req_upgrade: &mut Option<RequestUpgrade>,
		log: &mut RequestLog,
	) -> Result<Response, ProxyError> {
		let cfg = &self.inputs.cfg;
		let Selected { endpoint, guard } = selected;
		let call = self.inputs.upstream.call(&endpoint, req);
		let mut resp = match cfg.backend.endpoint_timeout {
			Some(t) => tokio::time::timeout(t, call)
				.await
				.map_err(|_| ProxyError::BackendTimeout)??,
			None => call.await?,
		};

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			log.upgrade = true;
			self.inputs.metrics.websocket_upgrades.inc();
			return handle_upgrade(req_upgrade, resp, guard);
		}

		endpoint.record_success();
		headers::strip_hop_by_hop(resp.headers_mut(), &[]);

		if let Some(trigger) =
			headers::find_sticky_trigger(resp.headers(), &cfg.routing.sticky_cookies)
		{
			let instance_id = endpoint.instance_id();
			if !instance_id.is_empty() {
				if let Some(cookie) = headers::sticky_cookie(
					cfg.routing.affinity_cookie.as_str(),
					&instance_id,
					&trigger,
					cfg.routing.secure_cookies,
				) {
					resp.headers_mut().append(header::SET_COOKIE, cookie);
				}
			}
		}

		headers::shape_response_headers(
			resp.headers_mut(),
			&cfg.headers.remove_response,
			&cfg.headers.add_response,
		);

		// The slot stays held until the response body is done; it travels
		// with the access log.
		log.inflight = Some(guard);
		Ok(resp)
	}

	async fn call_route_service(&self, mut req: Request, url: &str) -> Result<Response, ProxyError> {
		let uri: http::Uri = url
			.parse()
			.map_err(|_| ProxyError::RouteServiceFailed(format!("bad route service url {url:?}")))?;
		let authority = uri
			.authority()
			.ok_or_else(|| ProxyError::RouteServiceFailed("route service url has no host".into()))?
			.clone();
		if let Ok(hv) = HeaderValue::try_from(authority.as_str()) {
			req.headers_mut().insert(header::HOST, hv);
		}
		let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
		let scheme = uri.scheme().cloned().unwrap_or(http::Scheme::HTTPS);
		http::modify_req_uri(&mut req, |parts| {
			parts.scheme = Some(scheme);
			parts.authority = Some(authority);
			parts.path_and_query = Some(path.parse()?);
			Ok(())
		})
		.map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?;
		let mut resp = self.inputs.external.call(req).await?;
		headers::strip_hop_by_hop(resp.headers_mut(), &[]);
		Ok(resp)
	}

	fn healthcheck_response(&self) -> Response {
		if *self.inputs.draining.borrow() {
			::http::Response::builder()
				.status(StatusCode::SERVICE_UNAVAILABLE)
				.header(header::CACHE_CONTROL, "private, max-age=0")
				.body(Body::empty())
				.expect("static response builds")
		} else {
			::http::Response::builder()
				.status(StatusCode::OK)
				.header(header::CACHE_CONTROL, "private, max-age=0")
				.body(Body::from("ok\n"))
				.expect("static response builds")
		}
	}
}

struct RequestUpgrade {
	upgrade_type: HeaderValue,
	upgrade: OnUpgrade,
}

/// Strips hop-by-hop headers (plus Connection-listed and configured names),
/// re-adding what a protocol upgrade needs. Captures the client side of the
/// upgrade when one is requested.
fn hop_by_hop_headers(req: &mut Request, extra: &[http::HeaderName]) -> Option<RequestUpgrade> {
	let upgrade_type = headers::upgrade_type(req.headers());
	headers::strip_hop_by_hop(req.headers_mut(), extra);
	if let Some(t) = upgrade_type.clone() {
		req
			.headers_mut()
			.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
		req.headers_mut().insert(header::UPGRADE, t);
	}
	let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	match (upgrade_type, on_upgrade) {
		(Some(upgrade_type), Some(upgrade)) => Some(RequestUpgrade {
			upgrade_type,
			upgrade,
		}),
		_ => None,
	}
}

/// On 101 from the upstream, finish both upgrades and relay bytes until
/// either side closes. Anything else is surfaced to the caller untouched.
fn handle_upgrade(
	req_upgrade: &mut Option<RequestUpgrade>,
	mut resp: Response,
	guard: InflightGuard,
) -> Result<Response, ProxyError> {
	let Some(RequestUpgrade {
		upgrade_type,
		upgrade,
	}) = std::mem::take(req_upgrade)
	else {
		return Err(ProxyError::UpgradeFailed);
	};
	if headers::upgrade_type(resp.headers()).as_ref() != Some(&upgrade_type) {
		return Err(ProxyError::UpgradeFailed);
	}
	let upstream = resp
		.extensions_mut()
		.remove::<OnUpgrade>()
		.ok_or(ProxyError::UpgradeFailed)?;
	tokio::spawn(async move {
		// The in-flight slot is released when both halves are done.
		let _guard = guard;
		let upstream = match upstream.await {
			Ok(u) => u,
			Err(e) => {
				warn!("upstream upgrade failed: {e}");
				return;
			},
		};
		let client = match upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!("client upgrade failed: {e}");
				return;
			},
		};
		let res = route_core::copy::copy_bidirectional(
			&mut TokioIo::new(client),
			&mut TokioIo::new(upstream),
		)
		.await;
		match res {
			Ok(t) => debug!(sent = t.sent, received = t.received, "upgrade relay closed"),
			Err(e) => debug!("upgrade relay error: {e}"),
		}
	});
	Ok(resp)
}

fn is_healthcheck(req: &::http::Request<Incoming>, expected_agent: &str) -> bool {
	req
		.headers()
		.get(header::USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ua| ua == expected_agent)
}

fn header_bytes(headers: &http::HeaderMap) -> usize {
	headers
		.iter()
		.map(|(k, v)| k.as_str().len() + v.as_bytes().len())
		.sum()
}

/// `X-CF-APP-INSTANCE: appGuid:index`; present-but-malformed is a client
/// error, not a fallthrough.
fn parse_app_instance(req: &Request) -> Result<Option<(String, String)>, ProxyError> {
	let Some(value) = req.headers().get(&headers::X_CF_APP_INSTANCE) else {
		return Ok(None);
	};
	let value = value.to_str().map_err(|_| ProxyError::BadInstance)?;
	match value.split_once(':') {
		Some((app, index)) if !app.is_empty() && !index.is_empty() => {
			Ok(Some((app.to_string(), index.to_string())))
		},
		_ => Err(ProxyError::BadInstance),
	}
}

/// Shapes the terminal error after the attempt loop gives up.
fn finalize(err: ProxyError, tried: &[Strng], all_dial_failures: bool) -> ProxyError {
	if tried.len() > 1 && all_dial_failures {
		ProxyError::BackendUnavailable
	} else {
		err
	}
}

fn unix_now() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}
