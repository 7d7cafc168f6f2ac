mod gateway;
pub mod httpproxy;
pub mod routeservice;
pub mod selector;

pub use gateway::{Gateway, auto_server};

use crate::http::{Body, HeaderValue, Response, StatusCode};
use crate::*;

/// Why the proxy (as opposed to a backend) is answering a request. The short
/// code is surfaced to clients in `X-Cf-RouterError`.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("no route registered for host")]
	UnknownRoute,
	#[error("no endpoints available for route")]
	NoEndpoints,
	#[error("all endpoints are at their connection capacity")]
	AllAtCapacity,
	#[error("requested app instance does not exist")]
	BadInstance,
	#[error("request is not valid")]
	InvalidRequest,
	#[error("request headers exceed the configured limit")]
	RequestTooLarge,
	#[error("could not dial endpoint: {0}")]
	DialFailed(String),
	#[error("endpoint request failed: {0}")]
	UpstreamFailed(String),
	#[error("every attempted endpoint failed")]
	BackendUnavailable,
	#[error("endpoint did not respond in time")]
	BackendTimeout,
	#[error("endpoint answered the upgrade with a different protocol")]
	UpgradeFailed,
	#[error("route service request failed: {0}")]
	RouteServiceFailed(String),
	#[error("route service signature has expired")]
	RouteServiceExpired,
	#[error("route service does not support the required TLS version")]
	RouteServiceTlsMismatch,
	#[error("request processing failed: {0}")]
	Processing(anyhow::Error),
}

impl ProxyError {
	/// Short code placed in X-Cf-RouterError.
	pub fn router_error(&self) -> &'static str {
		match self {
			ProxyError::UnknownRoute => "unknown_route",
			ProxyError::NoEndpoints | ProxyError::AllAtCapacity => "no_endpoints",
			ProxyError::BadInstance => "bad_instance_id",
			ProxyError::InvalidRequest => "invalid_request",
			ProxyError::RequestTooLarge => "max-request-size-exceeded",
			ProxyError::DialFailed(_) | ProxyError::UpstreamFailed(_) | ProxyError::UpgradeFailed => {
				"endpoint_failure"
			},
			ProxyError::BackendUnavailable => "backend_unavailable",
			ProxyError::BackendTimeout => "backend_timeout",
			ProxyError::RouteServiceFailed(_) | ProxyError::RouteServiceExpired => {
				"route_service_failure"
			},
			ProxyError::RouteServiceTlsMismatch => "protocol_version_not_supported",
			ProxyError::Processing(_) => "endpoint_failure",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::UnknownRoute => StatusCode::NOT_FOUND,
			ProxyError::NoEndpoints | ProxyError::AllAtCapacity => StatusCode::SERVICE_UNAVAILABLE,
			ProxyError::BadInstance | ProxyError::InvalidRequest | ProxyError::RouteServiceExpired => {
				StatusCode::BAD_REQUEST
			},
			ProxyError::RequestTooLarge => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
			ProxyError::DialFailed(_)
			| ProxyError::UpstreamFailed(_)
			| ProxyError::UpgradeFailed
			| ProxyError::BackendUnavailable
			| ProxyError::Processing(_) => StatusCode::BAD_GATEWAY,
			ProxyError::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
			ProxyError::RouteServiceFailed(_) | ProxyError::RouteServiceTlsMismatch => {
				StatusCode::BAD_GATEWAY
			},
		}
	}

	/// Whether this attempt's failure implicates the endpoint (and may be
	/// retried against another) rather than the request.
	pub fn is_endpoint_fault(&self) -> bool {
		matches!(
			self,
			ProxyError::DialFailed(_) | ProxyError::UpstreamFailed(_) | ProxyError::BackendTimeout
		)
	}

	/// Dial-class failures never transmitted anything, so they are safe to
	/// retry regardless of method.
	pub fn is_pre_transmit(&self) -> bool {
		matches!(self, ProxyError::DialFailed(_))
	}

	pub fn as_response(&self, template: Option<&ErrorTemplate>) -> Response {
		let status = self.status();
		let mut builder = ::http::Response::builder()
			.status(status)
			// Proxy-generated errors must never be cached.
			.header(::http::header::CACHE_CONTROL, "no-cache, no-store")
			.header(crate::http::headers::X_CF_ROUTER_ERROR, self.router_error());
		let body = match template {
			Some(t) => {
				builder = builder.header(::http::header::CONTENT_TYPE, t.content_type.clone());
				t.render(status, &self.to_string())
			},
			None => {
				builder = builder.header(::http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
				format!(
					"{} {}: {}.\n",
					status.as_u16(),
					status.canonical_reason().unwrap_or("error"),
					self.router_error()
				)
			},
		};
		builder
			.body(Body::from(body))
			.expect("static response builds")
	}
}

/// A user-supplied error page. `{status}` and `{message}` are substituted.
#[derive(Debug, Clone)]
pub struct ErrorTemplate {
	pub body: String,
	pub content_type: HeaderValue,
}

impl ErrorTemplate {
	pub fn render(&self, status: StatusCode, message: &str) -> String {
		self
			.body
			.replace("{status}", &status.as_u16().to_string())
			.replace("{message}", message)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_responses_carry_router_headers() {
		let resp = ProxyError::UnknownRoute.as_response(None);
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);
		assert_eq!(resp.headers()["x-cf-routererror"], "unknown_route");
		assert_eq!(resp.headers()["cache-control"], "no-cache, no-store");
	}

	#[test]
	fn status_mapping() {
		assert_eq!(ProxyError::NoEndpoints.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(ProxyError::AllAtCapacity.status(), StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(ProxyError::BadInstance.status(), StatusCode::BAD_REQUEST);
		assert_eq!(
			ProxyError::RequestTooLarge.status(),
			StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
		);
		assert_eq!(ProxyError::BackendTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
		assert_eq!(
			ProxyError::BackendUnavailable.status(),
			StatusCode::BAD_GATEWAY
		);
	}

	#[test]
	fn templates_substitute() {
		let t = ErrorTemplate {
			body: "<h1>{status}</h1><p>{message}</p>".to_string(),
			content_type: HeaderValue::from_static("text/html"),
		};
		let resp = t.render(StatusCode::BAD_GATEWAY, "endpoint failed");
		assert_eq!(resp, "<h1>502</h1><p>endpoint failed</p>");
	}
}
