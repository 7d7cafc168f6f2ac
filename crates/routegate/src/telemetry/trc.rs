use std::fmt;

use rand::Rng;

use crate::http::{HeaderMap, HeaderValue};

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";
pub const B3_TRACE_ID: &str = "x-b3-traceid";
pub const B3_SPAN_ID: &str = "x-b3-spanid";

/// A W3C trace-context parent, https://www.w3.org/TR/trace-context/.
#[derive(Clone, Eq, PartialEq)]
pub struct TraceParent {
	pub version: u8,
	pub trace_id: u128,
	pub span_id: u64,
	pub flags: u8,
}

impl TraceParent {
	/// A fresh sampled context.
	pub fn new() -> Self {
		let mut rng = rand::rng();
		Self {
			version: 0,
			trace_id: rng.random(),
			span_id: rng.random(),
			flags: 1,
		}
	}

	/// Same trace, new span.
	pub fn new_span(&self) -> Self {
		let mut next = self.clone();
		next.span_id = rand::rng().random();
		next
	}

	pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
		headers
			.get(TRACEPARENT)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| TraceParent::try_from(v).ok())
	}

	pub fn insert_header(&self, headers: &mut HeaderMap) {
		if let Ok(hv) = HeaderValue::try_from(format!("{self:?}")) {
			headers.insert(TRACEPARENT, hv);
		}
	}

	pub fn trace_id(&self) -> String {
		format!("{:032x}", self.trace_id)
	}

	pub fn span_id(&self) -> String {
		format!("{:016x}", self.span_id)
	}
}

impl Default for TraceParent {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for TraceParent {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"{:02x}-{:032x}-{:016x}-{:02x}",
			self.version, self.trace_id, self.span_id, self.flags
		)
	}
}

impl TryFrom<&str> for TraceParent {
	type Error = anyhow::Error;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		if value.len() != 55 {
			anyhow::bail!("traceparent length was {}", value.len());
		}
		let segs: Vec<&str> = value.split('-').collect();
		if segs.len() != 4 {
			anyhow::bail!("traceparent should have 4 segments");
		}
		Ok(Self {
			version: u8::from_str_radix(segs[0], 16)?,
			trace_id: u128::from_str_radix(segs[1], 16)?,
			span_id: u64::from_str_radix(segs[2], 16)?,
			flags: u8::from_str_radix(segs[3], 16)?,
		})
	}
}

/// The `tracestate` entry key for this router: `gorouter`, namespaced by
/// tenant id as `<tid>@gorouter` when one is configured.
pub fn tracestate_key(tenant_id: Option<&str>) -> String {
	match tenant_id {
		Some(tid) if !tid.is_empty() => format!("{tid}@gorouter"),
		_ => "gorouter".to_string(),
	}
}

/// Prefixes our entry onto any pre-existing tracestate list.
pub fn prefix_tracestate(existing: Option<&str>, key: &str, span_id: &str) -> String {
	match existing {
		Some(rest) if !rest.is_empty() => format!("{key}={span_id},{rest}"),
		_ => format!("{key}={span_id}"),
	}
}

/// A 64-bit id in the 16-hex form B3 uses.
pub fn random_b3_span_id() -> String {
	format!("{:016x}", rand::rng().random::<u64>())
}

pub fn random_b3_trace_id() -> String {
	format!("{:032x}", rand::rng().random::<u128>())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrips_the_header_form() {
		let tp = TraceParent::try_from("00-11111111111111111111111111111111-9999999999999999-01")
			.unwrap();
		assert_eq!(tp.trace_id(), "11111111111111111111111111111111");
		assert_eq!(tp.span_id(), "9999999999999999");
		assert_eq!(
			format!("{tp:?}"),
			"00-11111111111111111111111111111111-9999999999999999-01"
		);
	}

	#[test]
	fn header_roundtrip() {
		let mut headers = HeaderMap::new();
		assert!(TraceParent::from_headers(&headers).is_none());
		let tp = TraceParent::new();
		tp.insert_header(&mut headers);
		assert_eq!(TraceParent::from_headers(&headers).unwrap(), tp);
	}

	#[test]
	fn new_span_keeps_the_trace() {
		let tp = TraceParent::new();
		let next = tp.new_span();
		assert_eq!(tp.trace_id, next.trace_id);
		assert_ne!(tp.span_id, next.span_id);
	}

	#[test]
	fn rejects_malformed() {
		assert!(TraceParent::try_from("junk").is_err());
		assert!(
			TraceParent::try_from("00-1111111111111111111111111111111x-9999999999999999-01").is_err()
		);
	}

	#[test]
	fn tracestate_prefixing() {
		assert_eq!(tracestate_key(None), "gorouter");
		assert_eq!(tracestate_key(Some("tid")), "tid@gorouter");
		assert_eq!(
			prefix_tracestate(Some("congo=12345678"), "tid@gorouter", "abcdefabcdefabcd"),
			"tid@gorouter=abcdefabcdefabcd,congo=12345678"
		);
		assert_eq!(
			prefix_tracestate(None, "gorouter", "abcdefabcdefabcd"),
			"gorouter=abcdefabcdefabcd"
		);
	}
}
