pub mod headers;
pub mod retry;

use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

use crate::proxy::ProxyError;
use crate::*;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

/// The one body type requests and responses flow through: a boxed stream of
/// frames, erased so hyper bodies, replay bodies and literals all fit.
pub struct Body(UnsyncBoxBody<Bytes, Error>);

impl Body {
	pub fn new<B>(body: B) -> Body
	where
		B: http_body::Body<Data = Bytes> + Send + 'static,
		B::Error: Into<Error>,
	{
		Body(body.map_err(Into::into).boxed_unsync())
	}

	pub fn empty() -> Body {
		Body::new(http_body_util::Empty::new().map_err(|e| match e {}))
	}
}

impl From<Bytes> for Body {
	fn from(b: Bytes) -> Body {
		Body::new(http_body_util::Full::new(b).map_err(|e| match e {}))
	}
}

impl From<String> for Body {
	fn from(s: String) -> Body {
		Bytes::from(s).into()
	}
}

impl From<&'static str> for Body {
	fn from(s: &'static str) -> Body {
		Bytes::from_static(s.as_bytes()).into()
	}
}

impl http_body::Body for Body {
	type Data = Bytes;
	type Error = Error;

	fn poll_frame(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Bytes>, Error>>> {
		Pin::new(&mut self.0).poll_frame(cx)
	}

	fn is_end_stream(&self) -> bool {
		self.0.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.0.size_hint()
	}
}

impl Debug for Body {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Body").finish()
	}
}

impl Default for Body {
	fn default() -> Self {
		Body::empty()
	}
}

/// The request host, per the normalized URI.
pub fn get_host(req: &Request) -> Result<&str, ProxyError> {
	let host = req.uri().host().ok_or(ProxyError::InvalidRequest)?;
	Ok(strip_port(host))
}

/// Strips a trailing port from an authority-ish string, leaving IPv6
/// literals intact.
pub fn strip_port(auth: &str) -> &str {
	let host_port = auth
		.rsplit('@')
		.next()
		.expect("split yields at least one item");
	if host_port.starts_with('[') {
		match host_port.find(']') {
			Some(i) => &host_port[0..=i],
			None => host_port,
		}
	} else {
		host_port
			.split(':')
			.next()
			.expect("split yields at least one item")
	}
}

/// HTTP/1 requests carry the authority in the Host header rather than the
/// URI; fold it in so downstream code has one place to look.
pub fn normalize_uri(req: &mut Request, secure: bool) -> anyhow::Result<()> {
	if let ::http::Version::HTTP_10 | ::http::Version::HTTP_11 = req.version() {
		if req.uri().authority().is_none() {
			let host = req
				.headers()
				.get(header::HOST)
				.and_then(|h| h.to_str().ok())
				.and_then(|h| h.parse::<Authority>().ok())
				.ok_or_else(|| anyhow::anyhow!("no authority or host"))?;
			let mut parts = std::mem::take(req.uri_mut()).into_parts();
			parts.authority = Some(host);
			if parts.path_and_query.is_none() {
				parts.path_and_query = Some("/".parse().expect("static path"));
			}
			parts.scheme = Some(if secure { Scheme::HTTPS } else { Scheme::HTTP });
			*req.uri_mut() = Uri::from_parts(parts)?;
		}
	}
	Ok(())
}

/// Rewrites the URI in place (scheme/authority swaps for the upstream hop).
pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strip_port_variants() {
		assert_eq!(strip_port("app.example.com:8080"), "app.example.com");
		assert_eq!(strip_port("app.example.com"), "app.example.com");
		assert_eq!(strip_port("[::1]:443"), "[::1]");
		assert_eq!(strip_port("[::1]"), "[::1]");
	}

	#[test]
	fn normalizes_host_header_into_uri() {
		let mut req = ::http::Request::builder()
			.uri("/path?q=1")
			.header(header::HOST, "App.Example.com:8443")
			.body(Body::empty())
			.unwrap();
		normalize_uri(&mut req, true).unwrap();
		assert_eq!(req.uri().scheme(), Some(&Scheme::HTTPS));
		assert_eq!(req.uri().host(), Some("App.Example.com"));
		assert_eq!(req.uri().path(), "/path");
		assert_eq!(get_host(&req).unwrap(), "App.Example.com");
	}
}
