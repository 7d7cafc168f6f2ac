use std::io::IoSlice;
use std::task;

use hyper_util::client::legacy;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http::{self, header};
use crate::proxy::ProxyError;
use crate::transport::tls::backend_server_name;
use crate::types::Endpoint;
use crate::*;

/// Connection-pool and timeout settings for the backend side.
#[derive(Debug, Clone)]
pub struct Config {
	pub dial_timeout: Duration,
	pub response_header_timeout: Option<Duration>,
	pub idle_timeout: Duration,
	pub max_idle_per_host: usize,
	/// Forces `Connection: close` toward backends and disables pooling.
	pub disable_keep_alives: bool,
	pub tls: Arc<rustls::ClientConfig>,
}

impl Config {
	pub fn testing() -> Config {
		Config {
			dial_timeout: Duration::from_secs(5),
			response_header_timeout: Some(Duration::from_secs(30)),
			idle_timeout: Duration::from_secs(90),
			max_idle_per_host: 16,
			disable_keep_alives: false,
			tls: crate::transport::tls::BackendTlsSettings {
				ca_certs: None,
				cert_path: None,
				key_path: None,
				skip_verification: true,
			}
			.build()
			.expect("insecure client config builds"),
		}
	}
}

/// Issues requests to registered endpoints. Each endpoint caches one pooled
/// hyper client whose connector dials that endpoint alone, so idle-connection
/// reuse is naturally per-endpoint and dies with the registration.
#[derive(Clone)]
pub struct Client {
	cfg: Arc<Config>,
}

/// The per-endpoint pooled client living in `Endpoint::upstream_client`.
pub struct PooledClient {
	inner: legacy::Client<EndpointConnector, http::Body>,
}

impl Debug for PooledClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PooledClient").finish()
	}
}

impl Client {
	pub fn new(cfg: Config) -> Client {
		Client { cfg: Arc::new(cfg) }
	}

	/// Sends `req` to `endpoint`, rewriting the URI to target it. The caller
	/// has already fixed up headers (Host included).
	pub async fn call(
		&self,
		endpoint: &Arc<Endpoint>,
		mut req: http::Request,
	) -> Result<http::Response, ProxyError> {
		let start = Instant::now();
		let use_tls = endpoint.use_tls;
		http::modify_req_uri(&mut req, |uri| {
			uri.scheme = Some(if use_tls {
				http::Scheme::HTTPS
			} else {
				http::Scheme::HTTP
			});
			uri.authority = Some(endpoint.address.as_str().parse()?);
			Ok(())
		})
		.map_err(ProxyError::Processing)?;
		if self.cfg.disable_keep_alives {
			req
				.headers_mut()
				.insert(header::CONNECTION, http::HeaderValue::from_static("close"));
		}
		*req.version_mut() = ::http::Version::HTTP_11;

		let client = endpoint.upstream_client(|| self.build(endpoint));
		let method = req.method().clone();
		let fut = client.inner.request(req);
		let resp = match self.cfg.response_header_timeout {
			Some(t) => match tokio::time::timeout(t, fut).await {
				Ok(res) => res,
				Err(_) => return Err(ProxyError::BackendTimeout),
			},
			None => fut.await,
		};
		let resp = resp.map_err(classify)?;
		debug!(
			endpoint = %endpoint.address,
			method = %method,
			status = resp.status().as_u16(),
			dur = ?start.elapsed(),
			"upstream request complete",
		);
		Ok(resp.map(http::Body::new))
	}

	fn build(&self, endpoint: &Endpoint) -> PooledClient {
		let meta = endpoint.meta();
		let tls = if endpoint.use_tls {
			let server_name = backend_server_name(&meta.server_cert_san, &endpoint.host)
				.unwrap_or_else(|_| {
					ServerName::IpAddress(rustls::pki_types::IpAddr::from(IpAddr::V4(
						Ipv4Addr::LOCALHOST,
					)))
				});
			Some((self.cfg.tls.clone(), server_name))
		} else {
			None
		};
		let connector = EndpointConnector {
			host: endpoint.host.clone(),
			port: endpoint.port,
			dial_timeout: self.cfg.dial_timeout,
			tls,
		};
		let max_idle = if self.cfg.disable_keep_alives {
			0
		} else {
			self.cfg.max_idle_per_host
		};
		let inner = legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
			.pool_timer(TokioTimer::new())
			.pool_idle_timeout(self.cfg.idle_timeout)
			.pool_max_idle_per_host(max_idle)
			.set_host(false)
			.build(connector);
		PooledClient { inner }
	}
}

/// Reaches arbitrary external URLs; only the route-service hop needs this.
#[derive(Clone)]
pub struct ExternalClient {
	inner: legacy::Client<hyper_rustls::HttpsConnector<legacy::connect::HttpConnector>, http::Body>,
}

impl Debug for ExternalClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExternalClient").finish()
	}
}

impl ExternalClient {
	pub fn new() -> anyhow::Result<ExternalClient> {
		let mut roots = rustls::RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().certs {
			let _ = roots.add(cert);
		}
		let tls = rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		let https = hyper_rustls::HttpsConnectorBuilder::new()
			.with_tls_config(tls)
			.https_or_http()
			.enable_http1()
			.build();
		let inner = legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
			.pool_timer(TokioTimer::new())
			.pool_idle_timeout(Duration::from_secs(90))
			.build(https);
		Ok(ExternalClient { inner })
	}

	pub async fn call(&self, req: http::Request) -> Result<http::Response, ProxyError> {
		let resp = self.inner.request(req).await.map_err(|e| {
			// A handshake refusal over protocol versions is its own, documented
			// failure mode.
			let msg = format!("{e:?}");
			if msg.contains("ProtocolVersion") || msg.contains("protocol version") {
				ProxyError::RouteServiceTlsMismatch
			} else {
				ProxyError::RouteServiceFailed(e.to_string())
			}
		})?;
		Ok(resp.map(http::Body::new))
	}
}

/// Maps hyper's transport errors onto the router's attempt outcomes.
fn classify(err: legacy::Error) -> ProxyError {
	if err.is_connect() {
		return ProxyError::DialFailed(err.to_string());
	}
	ProxyError::UpstreamFailed(err.to_string())
}

/// Dials one fixed endpoint, ignoring the request URI. Registered addresses
/// arrive pre-resolved, so anything unparsable is an attempt failure rather
/// than a DNS lookup.
#[derive(Clone)]
struct EndpointConnector {
	host: Strng,
	port: u16,
	dial_timeout: Duration,
	tls: Option<(Arc<rustls::ClientConfig>, ServerName<'static>)>,
}

impl tower::Service<http::Uri> for EndpointConnector {
	type Response = TokioIo<UpstreamStream>;
	type Error = std::io::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut task::Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, _dst: http::Uri) -> Self::Future {
		let this = self.clone();
		Box::pin(async move {
			let host = this.host.trim_start_matches('[').trim_end_matches(']');
			let ip: IpAddr = host.parse().map_err(|_| {
				std::io::Error::new(
					std::io::ErrorKind::InvalidInput,
					format!("endpoint host {:?} is not an address", this.host),
				)
			})?;
			let addr = SocketAddr::from((ip, this.port));
			let stream = tokio::time::timeout(this.dial_timeout, TcpStream::connect(addr))
				.await
				.map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out"))??;
			stream.set_nodelay(true)?;
			match this.tls {
				None => Ok(TokioIo::new(UpstreamStream::Tcp(stream))),
				Some((config, server_name)) => {
					let connector = TlsConnector::from(config);
					let tls = connector.connect(server_name, stream).await?;
					Ok(TokioIo::new(UpstreamStream::Tls(Box::new(tls))))
				},
			}
		})
	}
}

pub enum UpstreamStream {
	Tcp(TcpStream),
	Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection for UpstreamStream {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

impl AsyncRead for UpstreamStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match &mut *self {
			UpstreamStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for UpstreamStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut *self {
			UpstreamStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			UpstreamStream::Tcp(s) => Pin::new(s).poll_flush(cx),
			UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut *self {
			UpstreamStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		match &mut *self {
			UpstreamStream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			UpstreamStream::Tcp(s) => s.is_write_vectored(),
			UpstreamStream::Tls(s) => s.is_write_vectored(),
		}
	}
}
