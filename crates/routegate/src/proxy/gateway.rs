use std::convert::Infallible;

use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto;
use route_core::drain;
use route_core::drain::DrainWatcher;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::proxy::httpproxy::HttpProxy;
use crate::transport::stream::Socket;
use crate::transport::tls;
use crate::*;

#[cfg(test)]
#[path = "gateway_test.rs"]
mod tests;

/// Owns the accepted listeners and the drain choreography: on drain, the
/// listeners close immediately (new connections are refused), in-flight
/// requests run to completion, and whatever is left at the deadline is
/// forcefully shut down.
pub struct Gateway {
	inputs: Arc<ProxyInputs>,
	drain: DrainWatcher,
}

impl Gateway {
	pub fn new(inputs: Arc<ProxyInputs>, drain: DrainWatcher) -> Gateway {
		Gateway { inputs, drain }
	}

	/// Binds every configured listener, failing fast if any address or
	/// identity is unusable. Bind failures here are the startup-fatal kind.
	pub async fn bind(self) -> anyhow::Result<BoundGateway> {
		let cfg = &self.inputs.cfg;
		let http = TcpListener::bind(cfg.bind_http)
			.await
			.with_context(|| format!("binding {}", cfg.bind_http))?;
		info!(addr = %cfg.bind_http, "http listener bound");

		let tls = match (&cfg.bind_tls, &cfg.server_tls) {
			(Some(addr), Some(settings)) => {
				let config = settings.build().context("building server TLS config")?;
				let listener = TcpListener::bind(addr)
					.await
					.with_context(|| format!("binding {addr}"))?;
				info!(addr = %addr, "tls listener bound");
				Some((listener, config))
			},
			_ => None,
		};
		Ok(BoundGateway {
			inputs: self.inputs,
			drain: self.drain,
			http,
			tls,
		})
	}
}

/// A gateway whose listeners are bound; serves until drained.
pub struct BoundGateway {
	inputs: Arc<ProxyInputs>,
	drain: DrainWatcher,
	http: TcpListener,
	tls: Option<(TcpListener, Arc<ServerConfig>)>,
}

impl BoundGateway {
	pub fn http_addr(&self) -> SocketAddr {
		self.http.local_addr().expect("listener is bound")
	}

	pub fn tls_addr(&self) -> Option<SocketAddr> {
		self
			.tls
			.as_ref()
			.map(|(l, _)| l.local_addr().expect("listener is bound"))
	}

	pub async fn serve(self) {
		let mut js = JoinSet::new();
		js.spawn(Gateway::run_listener(
			self.inputs.clone(),
			self.drain.clone(),
			self.http,
			None,
		));
		if let Some((listener, config)) = self.tls {
			js.spawn(Gateway::run_listener(
				self.inputs.clone(),
				self.drain.clone(),
				listener,
				Some(config),
			));
		}
		drop(self.drain);
		while let Some(res) = js.join_next().await {
			if let Err(e) = res {
				warn!("listener task failed: {e}");
			}
		}
	}
}

impl Gateway {
	async fn run_listener(
		inputs: Arc<ProxyInputs>,
		outer_drain: DrainWatcher,
		listener: TcpListener,
		tls_config: Option<Arc<ServerConfig>>,
	) {
		let addr = listener
			.local_addr()
			.map(|a| a.to_string())
			.unwrap_or_else(|_| "unknown".to_string());
		let component = format!("listener {addr}");
		let deadline = inputs.cfg.drain_timeout;
		let accept = async move |conn_drain: DrainWatcher, force_shutdown: watch::Receiver<()>| {
			// The accept loop itself must not block the connection drain, but
			// each accepted connection must; hence the weak/upgrade split.
			let (mut upgrader, weak) = conn_drain.into_weak();
			let stop = upgrader.upgrade(weak.clone()).wait_for_drain();
			tokio::pin!(stop);
			loop {
				tokio::select! {
					res = listener.accept() => match res {
						Ok((stream, _peer)) => {
							let conn_drain = upgrader.upgrade(weak.clone());
							Self::spawn_connection(
								inputs.clone(),
								stream,
								tls_config.clone(),
								conn_drain,
								force_shutdown.clone(),
							);
						},
						Err(e) => {
							warn!("accept failed: {e}");
							tokio::time::sleep(Duration::from_millis(50)).await;
						},
					},
					release = &mut stop => {
						drop(release);
						break;
					}
				}
			}
			// Refuse new connections from this instant.
			drop(listener);
			upgrader.disable();
			info!(component = addr, "listener closed, draining connections");
			// Stay alive until the drain harness fires the force-shutdown
			// signal (either all connections finished or the deadline hit).
			let mut force_shutdown = force_shutdown;
			let _ = force_shutdown.changed().await;
		};
		drain::run_with_drain(component, outer_drain, deadline, accept).await;
	}

	fn spawn_connection(
		inputs: Arc<ProxyInputs>,
		stream: TcpStream,
		tls_config: Option<Arc<ServerConfig>>,
		conn_drain: DrainWatcher,
		force_shutdown: watch::Receiver<()>,
	) {
		tokio::spawn(async move {
			let socket = match tls_config {
				None => match Socket::from_tcp(stream) {
					Ok(s) => s,
					Err(e) => {
						warn!("failed to prepare connection: {e}");
						return;
					},
				},
				Some(config) => match tls::accept(stream, config).await {
					Ok(s) => s,
					Err(e) => {
						debug!("TLS handshake failed: {e}");
						return;
					},
				},
			};
			Self::serve_connection(inputs, socket, conn_drain, force_shutdown).await;
		});
	}

	async fn serve_connection(
		inputs: Arc<ProxyInputs>,
		socket: Socket,
		conn_drain: DrainWatcher,
		mut force_shutdown: watch::Receiver<()>,
	) {
		let info = Arc::new(socket.info().clone());
		let peer = info.tcp.peer_addr;
		debug!(%peer, tls = info.tls.is_some(), "connection opened");
		let proxy = HttpProxy {
			inputs: inputs.clone(),
		};
		let service = hyper::service::service_fn(move |req| {
			let proxy = proxy.clone();
			let info = info.clone();
			async move { Ok::<_, Infallible>(proxy.proxy(info, req).await) }
		});
		let mut server = auto_server();
		server
			.http1()
			.header_read_timeout(inputs.cfg.request_header_timeout);
		let conn = server.serve_connection_with_upgrades(TokioIo::new(socket), service);
		tokio::pin!(conn);

		let drained = conn_drain.wait_for_drain();
		tokio::pin!(drained);
		// Held until this function returns so the drain completes only when
		// the connection is really done.
		let mut release_guard = None;
		loop {
			tokio::select! {
				release = &mut drained, if release_guard.is_none() => {
					release_guard = Some(release);
					// Nudge the connection closed: Connection: close for
					// HTTP/1, GOAWAY for HTTP/2.
					conn.as_mut().graceful_shutdown();
				},
				_ = force_shutdown.changed() => {
					debug!(%peer, "connection forcefully terminated");
					break;
				},
				res = &mut conn => {
					if let Err(e) = res {
						debug!(%peer, "connection closed with error: {e}");
					}
					break;
				}
			}
		}
		debug!(%peer, "connection completed");
	}
}

pub fn auto_server() -> auto::Builder<hyper_util::rt::TokioExecutor> {
	let mut b = auto::Builder::new(hyper_util::rt::TokioExecutor::new());
	b.http1().timer(hyper_util::rt::TokioTimer::new());
	b.http2().timer(hyper_util::rt::TokioTimer::new());
	b
}
