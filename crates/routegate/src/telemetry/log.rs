use ::http::{Method, StatusCode, Version};
use pin_project_lite::pin_project;

use crate::telemetry::metrics::Metrics;
use crate::types::InflightGuard;
use crate::*;

/// Everything recorded about one proxied request. The log is emitted when the
/// response body finishes streaming (or is dropped), so byte counts and
/// duration cover the whole exchange.
#[derive(Debug)]
pub struct RequestLog {
	metrics: Arc<Metrics>,
	pub start: Instant,
	pub peer_addr: Option<SocketAddr>,
	pub method: Option<Method>,
	pub host: Option<String>,
	pub path: Option<String>,
	pub version: Option<Version>,
	pub status: Option<StatusCode>,
	pub endpoint: Option<Strng>,
	pub app_id: Option<Strng>,
	pub attempts: usize,
	pub router_error: Option<&'static str>,
	pub error: Option<String>,
	pub trace_id: Option<String>,
	pub upgrade: bool,
	pub tls: bool,
	/// Holds the endpoint's in-flight slot until the exchange completes.
	pub inflight: Option<InflightGuard>,
}

impl RequestLog {
	pub fn new(metrics: Arc<Metrics>, start: Instant) -> RequestLog {
		RequestLog {
			metrics,
			start,
			peer_addr: None,
			method: None,
			host: None,
			path: None,
			version: None,
			status: None,
			endpoint: None,
			app_id: None,
			attempts: 0,
			router_error: None,
			error: None,
			trace_id: None,
			upgrade: false,
			tls: false,
			inflight: None,
		}
	}

	fn emit(&mut self) {
		if let Some(status) = self.status {
			self.metrics.record_status(status);
		}
		if let Some(kind) = self.router_error {
			self.metrics.record_router_error(kind);
		}
		let duration = format!("{}ms", self.start.elapsed().as_millis());
		tracing::event!(
			target: "request",
			parent: None,
			tracing::Level::INFO,

			src.addr = self.peer_addr.map(tracing::field::display),
			http.method = self.method.as_ref().map(tracing::field::display),
			http.host = self.host.as_deref(),
			http.path = self.path.as_deref(),
			http.version = self.version.map(tracing::field::debug),
			http.status = self.status.map(|s| s.as_u16()),
			tls = self.tls,
			upgrade = self.upgrade,
			endpoint = self.endpoint.as_deref(),
			app = self.app_id.as_deref(),
			attempts = self.attempts,
			trace.id = self.trace_id.as_deref(),
			router.error = self.router_error,
			error = self.error.as_deref(),

			duration,
		);
	}
}

/// Wrapper that emits the access log exactly once, when dropped.
#[derive(Debug)]
pub struct DropOnLog(Option<RequestLog>);

impl From<RequestLog> for DropOnLog {
	fn from(log: RequestLog) -> Self {
		DropOnLog(Some(log))
	}
}

impl DropOnLog {
	pub fn as_mut(&mut self) -> Option<&mut RequestLog> {
		self.0.as_mut()
	}

	pub fn with(&mut self, f: impl FnOnce(&mut RequestLog)) {
		if let Some(log) = self.0.as_mut() {
			f(log);
		}
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(mut log) = self.0.take() {
			log.emit();
		}
	}
}

pin_project! {
	/// Carries the log (and through it, the endpoint's in-flight slot) until
	/// the response body is fully streamed.
	pub struct LogBody<B> {
		#[pin]
		inner: B,
		log: Option<DropOnLog>,
	}
}

impl<B> LogBody<B> {
	pub fn new(inner: B, log: DropOnLog) -> Self {
		LogBody {
			inner,
			log: Some(log),
		}
	}
}

impl<B: http_body::Body> http_body::Body for LogBody<B> {
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let result = ready!(this.inner.poll_frame(cx));
		if result.is_none() {
			// End of stream: flush the log now rather than at drop, so the
			// record is not delayed by connection keep-alive.
			this.log.take();
		}
		Poll::Ready(result)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}
