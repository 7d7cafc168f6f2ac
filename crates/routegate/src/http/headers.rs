use std::net::IpAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use headers::HeaderMapExt;
use serde::{Deserialize, Serialize};

use crate::http::{HeaderMap, HeaderName, HeaderValue, header};
use crate::telemetry::trc::{self, TraceParent};
use crate::transport::stream::TlsConnectionInfo;
use crate::*;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_CLIENT_CERT: HeaderName = HeaderName::from_static("x-forwarded-client-cert");
pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");
pub const X_CF_APP_INSTANCE: HeaderName = HeaderName::from_static("x-cf-app-instance");
pub const X_CF_ROUTER_ERROR: HeaderName = HeaderName::from_static("x-cf-routererror");

/// Hop-by-hop headers, stripped in both directions (RFC 2616 §13.5.1, kept
/// for RFC 7230 compatibility).
pub static HOP_HEADERS: [HeaderName; 9] = [
	header::CONNECTION,
	// non-standard but still sent by some clients
	HeaderName::from_static("proxy-connection"),
	HeaderName::from_static("keep-alive"),
	header::PROXY_AUTHENTICATE,
	header::PROXY_AUTHORIZATION,
	header::TE,
	header::TRAILER,
	header::TRANSFER_ENCODING,
	header::UPGRADE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCertMode {
	/// Pass any client-supplied value through untouched.
	#[default]
	AlwaysForward,
	/// Pass the client-supplied value only when the connection presented a
	/// verified certificate.
	Forward,
	/// Strip any inbound value; inject the verified certificate if present.
	SanitizeSet,
	Off,
}

/// Removes the hop-by-hop set plus anything the Connection header enumerates
/// plus the configured extras (RFC 7230 §6.1).
pub fn strip_hop_by_hop(headers: &mut HeaderMap, extra: &[HeaderName]) {
	let listed: Vec<HeaderName> = headers
		.get_all(header::CONNECTION)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.flat_map(|v| v.split(','))
		.filter_map(|name| HeaderName::try_from(name.trim()).ok())
		.collect();
	for h in HOP_HEADERS.iter().chain(listed.iter()).chain(extra.iter()) {
		headers.remove(h);
	}
}

/// Appends the immediate peer to X-Forwarded-For.
pub fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
	let entry = peer.to_string();
	let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
		Some(existing) if !existing.is_empty() => format!("{existing}, {entry}"),
		_ => entry,
	};
	if let Ok(hv) = HeaderValue::try_from(value) {
		headers.insert(X_FORWARDED_FOR, hv);
	}
}

/// X-Forwarded-Proto: pass the client's value through, overwrite with the
/// scheme the client actually connected on, or force https. Force wins.
pub fn set_forwarded_proto(headers: &mut HeaderMap, secure: bool, sanitize: bool, force_https: bool) {
	let value = if force_https {
		"https"
	} else if sanitize || !headers.contains_key(&X_FORWARDED_PROTO) {
		if secure { "https" } else { "http" }
	} else {
		return;
	};
	headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(value));
}

/// X-Forwarded-Client-Cert handling against the inbound TLS state.
pub fn apply_client_cert(
	headers: &mut HeaderMap,
	mode: ClientCertMode,
	tls: Option<&TlsConnectionInfo>,
) {
	let presented = tls.and_then(|t| t.client_cert.as_deref());
	match mode {
		ClientCertMode::Off | ClientCertMode::AlwaysForward => {},
		ClientCertMode::Forward => {
			if presented.is_none() {
				headers.remove(&X_FORWARDED_CLIENT_CERT);
			}
		},
		ClientCertMode::SanitizeSet => {
			headers.remove(&X_FORWARDED_CLIENT_CERT);
			if let Some(der) = presented {
				if let Ok(hv) = HeaderValue::try_from(BASE64.encode(der)) {
					headers.insert(X_FORWARDED_CLIENT_CERT, hv);
				}
			}
		},
	}
}

/// Stamps the request arrival time (epoch milliseconds) if nothing upstream
/// of us already did.
pub fn set_request_start(headers: &mut HeaderMap) {
	if headers.contains_key(&X_REQUEST_START) {
		return;
	}
	let now = std::time::SystemTime::now()
		.duration_since(std::time::SystemTime::UNIX_EPOCH)
		.map(|d| d.as_millis())
		.unwrap_or_default();
	if let Ok(hv) = HeaderValue::try_from(now.to_string()) {
		headers.insert(X_REQUEST_START, hv);
	}
}

#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
	pub enable_b3: bool,
	pub enable_w3c: bool,
	pub tenant_id: Option<Strng>,
}

/// Generates or propagates trace context per configuration. Returns the
/// trace id for the access log.
pub fn apply_tracing(cfg: &TracingConfig, headers: &mut HeaderMap) -> Option<String> {
	let mut trace_id = None;
	if cfg.enable_w3c {
		let next = match TraceParent::from_headers(headers) {
			Some(p) => p.new_span(),
			None => TraceParent::new(),
		};
		next.insert_header(headers);
		let key = trc::tracestate_key(cfg.tenant_id.as_deref());
		let existing = headers
			.get(trc::TRACESTATE)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		let state = trc::prefix_tracestate(existing.as_deref(), &key, &next.span_id());
		if let Ok(hv) = HeaderValue::try_from(state) {
			headers.insert(trc::TRACESTATE, hv);
		}
		trace_id = Some(next.trace_id());
	}
	if cfg.enable_b3 {
		let existing = headers
			.get(trc::B3_TRACE_ID)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		let b3_trace = existing.unwrap_or_else(trc::random_b3_trace_id);
		let b3_span = trc::random_b3_span_id();
		if let Ok(hv) = HeaderValue::try_from(b3_trace.clone()) {
			headers.insert(trc::B3_TRACE_ID, hv);
		}
		if let Ok(hv) = HeaderValue::try_from(b3_span) {
			headers.insert(trc::B3_SPAN_ID, hv);
		}
		trace_id.get_or_insert(b3_trace);
	}
	trace_id
}

/// Configured response-header surgery: removals first, then additions for
/// names not already present.
pub fn shape_response_headers(
	headers: &mut HeaderMap,
	remove: &[HeaderName],
	add: &[(HeaderName, HeaderValue)],
) {
	for name in remove {
		headers.remove(name);
	}
	for (name, value) in add {
		if !headers.contains_key(name) {
			headers.insert(name.clone(), value.clone());
		}
	}
}

/// Finds `name=value` in the request Cookie header(s).
pub fn request_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
	for value in headers.get_all(header::COOKIE) {
		let Ok(value) = value.to_str() else { continue };
		for pair in value.split(';') {
			if let Some((k, v)) = pair.split_once('=') {
				if k.trim() == name {
					return Some(v.trim().to_string());
				}
			}
		}
	}
	None
}

/// A response Set-Cookie whose name matches one of the sticky trigger
/// cookies; carries the attributes the affinity cookie should mirror.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StickyTrigger {
	pub max_age: Option<String>,
	pub expires: Option<String>,
	pub secure: bool,
}

pub fn find_sticky_trigger(headers: &HeaderMap, names: &[Strng]) -> Option<StickyTrigger> {
	for value in headers.get_all(header::SET_COOKIE) {
		let Ok(value) = value.to_str() else { continue };
		let mut parts = value.split(';');
		let Some((name, _)) = parts.next().and_then(|p| p.split_once('=')) else {
			continue;
		};
		if !names.iter().any(|n| n.as_str() == name.trim()) {
			continue;
		}
		let mut trigger = StickyTrigger::default();
		for attr in parts {
			let attr = attr.trim();
			if let Some((k, v)) = attr.split_once('=') {
				match k.trim().to_ascii_lowercase().as_str() {
					"max-age" => trigger.max_age = Some(v.trim().to_string()),
					"expires" => trigger.expires = Some(v.trim().to_string()),
					_ => {},
				}
			} else if attr.eq_ignore_ascii_case("secure") {
				trigger.secure = true;
			}
		}
		return Some(trigger);
	}
	None
}

/// Builds the affinity cookie the router attaches alongside a sticky
/// trigger.
pub fn sticky_cookie(
	name: &str,
	instance_id: &str,
	trigger: &StickyTrigger,
	secure_cookies: bool,
) -> Option<HeaderValue> {
	let mut cookie = format!("{name}={instance_id}; Path=/; HttpOnly");
	if let Some(max_age) = &trigger.max_age {
		cookie.push_str("; Max-Age=");
		cookie.push_str(max_age);
	}
	if let Some(expires) = &trigger.expires {
		cookie.push_str("; Expires=");
		cookie.push_str(expires);
	}
	if trigger.secure || secure_cookies {
		cookie.push_str("; Secure");
	}
	HeaderValue::try_from(cookie).ok()
}

/// Whether the request asks for a protocol upgrade, per its Connection
/// header (RFC 7230 §6.7).
pub fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
	if let Some(con) = headers.typed_get::<headers::Connection>() {
		if con.contains(header::UPGRADE) {
			return headers.get(header::UPGRADE).cloned();
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hm(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut headers = HeaderMap::new();
		for (k, v) in pairs {
			headers.append(
				HeaderName::try_from(*k).unwrap(),
				HeaderValue::try_from(*v).unwrap(),
			);
		}
		headers
	}

	#[test]
	fn forwarded_for_appends() {
		let mut headers = hm(&[("x-forwarded-for", "203.0.113.9")]);
		append_forwarded_for(&mut headers, "10.1.2.3".parse().unwrap());
		assert_eq!(headers[&X_FORWARDED_FOR], "203.0.113.9, 10.1.2.3");

		let mut headers = HeaderMap::new();
		append_forwarded_for(&mut headers, "10.1.2.3".parse().unwrap());
		assert_eq!(headers[&X_FORWARDED_FOR], "10.1.2.3");
	}

	#[test]
	fn forwarded_proto_modes() {
		// passthrough keeps the client value
		let mut headers = hm(&[("x-forwarded-proto", "https")]);
		set_forwarded_proto(&mut headers, false, false, false);
		assert_eq!(headers[&X_FORWARDED_PROTO], "https");

		// sanitize overwrites with the connection scheme
		let mut headers = hm(&[("x-forwarded-proto", "https")]);
		set_forwarded_proto(&mut headers, false, true, false);
		assert_eq!(headers[&X_FORWARDED_PROTO], "http");

		// force-https beats sanitize
		let mut headers = hm(&[("x-forwarded-proto", "http")]);
		set_forwarded_proto(&mut headers, false, true, true);
		assert_eq!(headers[&X_FORWARDED_PROTO], "https");

		// absent header is always filled in
		let mut headers = HeaderMap::new();
		set_forwarded_proto(&mut headers, true, false, false);
		assert_eq!(headers[&X_FORWARDED_PROTO], "https");
	}

	#[test]
	fn client_cert_forward_requires_a_cert() {
		let spoofed = || hm(&[("x-forwarded-client-cert", "spoof")]);
		let with_cert = TlsConnectionInfo {
			server_name: None,
			negotiated_h2: false,
			client_cert: Some(vec![1, 2, 3]),
		};
		let without = TlsConnectionInfo {
			server_name: None,
			negotiated_h2: false,
			client_cert: None,
		};

		let mut headers = spoofed();
		apply_client_cert(&mut headers, ClientCertMode::Forward, Some(&without));
		assert!(!headers.contains_key(&X_FORWARDED_CLIENT_CERT));

		let mut headers = spoofed();
		apply_client_cert(&mut headers, ClientCertMode::Forward, Some(&with_cert));
		assert_eq!(headers[&X_FORWARDED_CLIENT_CERT], "spoof");

		let mut headers = spoofed();
		apply_client_cert(&mut headers, ClientCertMode::SanitizeSet, Some(&with_cert));
		assert_eq!(headers[&X_FORWARDED_CLIENT_CERT], BASE64.encode([1u8, 2, 3]));

		let mut headers = spoofed();
		apply_client_cert(&mut headers, ClientCertMode::SanitizeSet, Some(&without));
		assert!(!headers.contains_key(&X_FORWARDED_CLIENT_CERT));

		let mut headers = spoofed();
		apply_client_cert(&mut headers, ClientCertMode::AlwaysForward, Some(&without));
		assert_eq!(headers[&X_FORWARDED_CLIENT_CERT], "spoof");
	}

	#[test]
	fn hop_by_hop_includes_connection_listed() {
		let mut headers = hm(&[
			("connection", "close, x-custom-hop"),
			("x-custom-hop", "1"),
			("transfer-encoding", "chunked"),
			("te", "trailers"),
			("x-keep", "1"),
		]);
		strip_hop_by_hop(&mut headers, &[HeaderName::from_static("x-filtered")]);
		assert!(!headers.contains_key("connection"));
		assert!(!headers.contains_key("x-custom-hop"));
		assert!(!headers.contains_key("transfer-encoding"));
		assert!(!headers.contains_key("te"));
		assert!(headers.contains_key("x-keep"));
	}

	#[test]
	fn w3c_propagation_with_tenant() {
		let cfg = TracingConfig {
			enable_b3: false,
			enable_w3c: true,
			tenant_id: Some(strng::new("tid")),
		};
		let mut headers = hm(&[
			(
				"traceparent",
				"00-11111111111111111111111111111111-9999999999999999-01",
			),
			("tracestate", "congo=12345678"),
		]);
		let trace_id = apply_tracing(&cfg, &mut headers).unwrap();
		assert_eq!(trace_id, "11111111111111111111111111111111");

		let tp = headers[trc::TRACEPARENT].to_str().unwrap().to_string();
		let parsed = TraceParent::try_from(tp.as_str()).unwrap();
		assert_eq!(parsed.trace_id(), "11111111111111111111111111111111");
		assert_ne!(parsed.span_id(), "9999999999999999");

		let state = headers[trc::TRACESTATE].to_str().unwrap();
		let expected = format!("tid@gorouter={},congo=12345678", parsed.span_id());
		assert_eq!(state, expected);
	}

	#[test]
	fn w3c_generation_when_absent() {
		let cfg = TracingConfig {
			enable_b3: false,
			enable_w3c: true,
			tenant_id: None,
		};
		let mut headers = HeaderMap::new();
		apply_tracing(&cfg, &mut headers).unwrap();
		let tp = headers[trc::TRACEPARENT].to_str().unwrap();
		assert_eq!(tp.len(), 55);
		assert!(tp.starts_with("00-"));
		assert!(tp.ends_with("-01"));
		let state = headers[trc::TRACESTATE].to_str().unwrap();
		assert!(state.starts_with("gorouter="));
	}

	#[test]
	fn b3_propagates_trace_and_refreshes_span() {
		let cfg = TracingConfig {
			enable_b3: true,
			enable_w3c: false,
			tenant_id: None,
		};
		let mut headers = hm(&[
			("x-b3-traceid", "463ac35c9f6413ad48485a3953bb6124"),
			("x-b3-spanid", "a2fb4a1d1a96d312"),
		]);
		apply_tracing(&cfg, &mut headers).unwrap();
		assert_eq!(
			headers[trc::B3_TRACE_ID],
			"463ac35c9f6413ad48485a3953bb6124"
		);
		assert_ne!(headers[trc::B3_SPAN_ID], "a2fb4a1d1a96d312");
	}

	#[test]
	fn sticky_cookie_mirrors_trigger() {
		let headers = hm(&[(
			"set-cookie",
			"JSESSIONID=abc123; Max-Age=3600; Secure; HttpOnly",
		)]);
		let trigger = find_sticky_trigger(&headers, &[strng::new("JSESSIONID")]).unwrap();
		assert_eq!(trigger.max_age.as_deref(), Some("3600"));
		assert!(trigger.secure);

		let cookie = sticky_cookie("VCAP_ID", "instance-1", &trigger, false).unwrap();
		let cookie = cookie.to_str().unwrap();
		assert!(cookie.starts_with("VCAP_ID=instance-1; Path=/; HttpOnly"));
		assert!(cookie.contains("Max-Age=3600"));
		assert!(cookie.contains("Secure"));

		assert!(find_sticky_trigger(&headers, &[strng::new("OTHER")]).is_none());
	}

	#[test]
	fn request_cookie_lookup() {
		let headers = hm(&[("cookie", "a=1; VCAP_ID=ida; b=2")]);
		assert_eq!(request_cookie(&headers, "VCAP_ID").as_deref(), Some("ida"));
		assert_eq!(request_cookie(&headers, "missing"), None);
	}
}
