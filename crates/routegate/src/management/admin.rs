use std::convert::Infallible;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use route_core::drain::DrainWatcher;
use route_core::readiness::Ready;
use tokio::net::TcpListener;

use crate::http::{Body, Response, StatusCode, header};
use crate::store::Registry;
use crate::*;

/// Loopback diagnostics: the routing-table snapshot, metrics, health and a
/// log-level knob. Not part of the data path.
pub struct AdminServer {
	listener: TcpListener,
	state: Arc<AdminState>,
}

struct AdminState {
	auth: Option<(String, String)>,
	registry: Arc<Registry>,
	prometheus: Arc<prometheus_client::registry::Registry>,
	ready: Ready,
}

impl AdminServer {
	pub async fn bind(
		addr: SocketAddr,
		auth: Option<(String, String)>,
		registry: Arc<Registry>,
		prometheus: Arc<prometheus_client::registry::Registry>,
		ready: Ready,
	) -> anyhow::Result<AdminServer> {
		let listener = TcpListener::bind(addr)
			.await
			.with_context(|| format!("binding admin {addr}"))?;
		info!(addr = %addr, "admin listener bound");
		Ok(AdminServer {
			listener,
			state: Arc::new(AdminState {
				auth,
				registry,
				prometheus,
				ready,
			}),
		})
	}

	pub async fn run(self, drain: DrainWatcher) {
		let stopped = drain.wait_for_drain();
		tokio::pin!(stopped);
		loop {
			tokio::select! {
				res = self.listener.accept() => {
					let Ok((stream, _)) = res else { continue };
					let state = self.state.clone();
					tokio::spawn(async move {
						let service = hyper::service::service_fn(move |req| {
							let state = state.clone();
							async move { Ok::<_, Infallible>(state.handle(req).await) }
						});
						let server = crate::proxy::auto_server();
						let _ = server.serve_connection(TokioIo::new(stream), service).await;
					});
				},
				_ = &mut stopped => return,
			}
		}
	}
}

impl AdminState {
	async fn handle(&self, req: ::http::Request<Incoming>) -> Response {
		match (req.method().as_str(), req.uri().path()) {
			("GET", "/healthz") => {
				if self.ready.is_ready() {
					plain(StatusCode::OK, "ok\n")
				} else {
					plain(StatusCode::SERVICE_UNAVAILABLE, "starting\n")
				}
			},
			("GET", "/routes") => {
				if !self.authorized(&req) {
					return unauthorized();
				}
				match serde_json::to_string_pretty(&self.registry.snapshot()) {
					Ok(body) => ::http::Response::builder()
						.status(StatusCode::OK)
						.header(header::CONTENT_TYPE, "application/json")
						.body(Body::from(body))
						.expect("static response builds"),
					Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
				}
			},
			("GET", "/metrics") => {
				let mut out = String::new();
				match prometheus_client::encoding::text::encode(&mut out, &self.prometheus) {
					Ok(()) => plain(StatusCode::OK, out),
					Err(e) => plain(StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")),
				}
			},
			("PUT", "/log-level") => {
				if !self.authorized(&req) {
					return unauthorized();
				}
				let level = req.uri().query().unwrap_or_default().to_string();
				match route_core::telemetry::set_level(&level) {
					Ok(()) => plain(StatusCode::OK, "updated\n"),
					Err(e) => plain(StatusCode::BAD_REQUEST, format!("{e}\n")),
				}
			},
			_ => plain(StatusCode::NOT_FOUND, "not found\n"),
		}
	}

	fn authorized(&self, req: &::http::Request<Incoming>) -> bool {
		let Some((user, pass)) = &self.auth else {
			return true;
		};
		let expected = format!("Basic {}", BASE64.encode(format!("{user}:{pass}")));
		req
			.headers()
			.get(header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|got| got == expected)
	}
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(body.into()))
		.expect("static response builds")
}

fn unauthorized() -> Response {
	::http::Response::builder()
		.status(StatusCode::UNAUTHORIZED)
		.header(header::WWW_AUTHENTICATE, "Basic realm=\"routegate\"")
		.body(Body::empty())
		.expect("static response builds")
}
