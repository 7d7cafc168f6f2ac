use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::http::{HeaderName, HeaderValue, Request};
use crate::proxy::ProxyError;
use crate::*;

pub const FORWARDED_URL: HeaderName = HeaderName::from_static("x-cf-forwarded-url");
pub const PROXY_SIGNATURE: HeaderName = HeaderName::from_static("x-cf-proxy-signature");
pub const PROXY_METADATA: HeaderName = HeaderName::from_static("x-cf-proxy-metadata");

/// What the signature seals: where the request was headed and when we sent
/// it off to the route service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignaturePayload {
	pub forwarded_url: String,
	pub issued_at_unix: u64,
}

/// Seals and opens route-service signatures with AES-256-GCM. The key is
/// derived from the shared secret, so any router in the fleet can validate a
/// signature minted by any other.
pub struct SignatureKey {
	key: LessSafeKey,
	rng: SystemRandom,
}

impl Debug for SignatureKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SignatureKey").finish()
	}
}

impl SignatureKey {
	pub fn new(secret: &str) -> SignatureKey {
		let digest = ring::digest::digest(&ring::digest::SHA256, secret.as_bytes());
		let key = UnboundKey::new(&AES_256_GCM, digest.as_ref()).expect("SHA-256 output is 32 bytes");
		SignatureKey {
			key: LessSafeKey::new(key),
			rng: SystemRandom::new(),
		}
	}

	/// Returns (signature, metadata): the sealed payload and the nonce it was
	/// sealed with, both base64url.
	pub fn seal(&self, payload: &SignaturePayload) -> anyhow::Result<(String, String)> {
		let mut nonce_bytes = [0u8; NONCE_LEN];
		self
			.rng
			.fill(&mut nonce_bytes)
			.map_err(|_| anyhow::anyhow!("nonce generation failed"))?;
		let nonce = Nonce::assume_unique_for_key(nonce_bytes);
		let mut buf = serde_json::to_vec(payload)?;
		self
			.key
			.seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
			.map_err(|_| anyhow::anyhow!("sealing failed"))?;
		Ok((B64.encode(&buf), B64.encode(nonce_bytes)))
	}

	pub fn open(&self, signature: &str, metadata: &str) -> anyhow::Result<SignaturePayload> {
		let nonce_bytes = B64.decode(metadata)?;
		let nonce = Nonce::try_assume_unique_for_key(&nonce_bytes)
			.map_err(|_| anyhow::anyhow!("bad nonce length"))?;
		let mut buf = B64.decode(signature)?;
		let plain = self
			.key
			.open_in_place(nonce, Aad::empty(), &mut buf)
			.map_err(|_| anyhow::anyhow!("signature does not validate"))?;
		Ok(serde_json::from_slice(plain)?)
	}
}

#[derive(Debug)]
pub struct RouteServices {
	key: SignatureKey,
	signature_ttl: Duration,
}

/// The dispatcher's verdict on a request whose route carries a route-service
/// URL.
#[derive(Debug, PartialEq)]
pub enum RouteServiceStep {
	/// Returning from the route service; dispatch to a backend.
	DispatchToBackend,
	/// First pass: sign and forward to this URL.
	ForwardTo(String),
}

impl RouteServices {
	pub fn new(secret: &str, signature_ttl: Duration) -> RouteServices {
		RouteServices {
			key: SignatureKey::new(secret),
			signature_ttl,
		}
	}

	/// Classifies the request and, on the first pass, attaches the signature
	/// headers for the route-service hop.
	pub fn prepare(
		&self,
		req: &mut Request,
		route_service_url: &str,
		now_unix: u64,
	) -> Result<RouteServiceStep, ProxyError> {
		let signature = req
			.headers()
			.get(&PROXY_SIGNATURE)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string());
		if let Some(signature) = signature {
			let metadata = req
				.headers()
				.get(&PROXY_METADATA)
				.and_then(|v| v.to_str().ok())
				.unwrap_or_default();
			let payload = self
				.key
				.open(&signature, metadata)
				.map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?;
			if now_unix.saturating_sub(payload.issued_at_unix) > self.signature_ttl.as_secs() {
				return Err(ProxyError::RouteServiceExpired);
			}
			return Ok(RouteServiceStep::DispatchToBackend);
		}

		let forwarded = req.uri().to_string();
		let payload = SignaturePayload {
			forwarded_url: forwarded.clone(),
			issued_at_unix: now_unix,
		};
		let (sig, meta) = self
			.key
			.seal(&payload)
			.map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?;
		let headers = req.headers_mut();
		headers.insert(
			FORWARDED_URL,
			HeaderValue::try_from(forwarded).map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?,
		);
		headers.insert(
			PROXY_SIGNATURE,
			HeaderValue::try_from(sig).map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?,
		);
		headers.insert(
			PROXY_METADATA,
			HeaderValue::try_from(meta).map_err(|e| ProxyError::RouteServiceFailed(e.to_string()))?,
		);
		Ok(RouteServiceStep::ForwardTo(route_service_url.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::http::Body;

	fn request() -> Request {
		::http::Request::builder()
			.uri("https://app.example.com/some/path?q=1")
			.body(Body::empty())
			.unwrap()
	}

	#[test]
	fn seal_open_roundtrip() {
		let key = SignatureKey::new("shared-secret");
		let payload = SignaturePayload {
			forwarded_url: "https://app.example.com/x".into(),
			issued_at_unix: 1000,
		};
		let (sig, meta) = key.seal(&payload).unwrap();
		assert_eq!(key.open(&sig, &meta).unwrap(), payload);
	}

	#[test]
	fn tampered_signatures_fail() {
		let key = SignatureKey::new("shared-secret");
		let payload = SignaturePayload {
			forwarded_url: "https://app.example.com/x".into(),
			issued_at_unix: 1000,
		};
		let (sig, meta) = key.seal(&payload).unwrap();
		assert!(key.open(&sig, "AAAAAAAAAAAAAAAA").is_err());
		assert!(SignatureKey::new("other-secret").open(&sig, &meta).is_err());
	}

	#[test]
	fn first_pass_attaches_headers() {
		let rs = RouteServices::new("secret", Duration::from_secs(60));
		let mut req = request();
		let step = rs
			.prepare(&mut req, "https://rs.example.com/filter", 1000)
			.unwrap();
		assert_eq!(
			step,
			RouteServiceStep::ForwardTo("https://rs.example.com/filter".into())
		);
		assert_eq!(
			req.headers()[&FORWARDED_URL],
			"https://app.example.com/some/path?q=1"
		);
		assert!(req.headers().contains_key(&PROXY_SIGNATURE));
		assert!(req.headers().contains_key(&PROXY_METADATA));
	}

	#[test]
	fn return_pass_dispatches_to_backend() {
		let rs = RouteServices::new("secret", Duration::from_secs(60));
		let mut req = request();
		rs.prepare(&mut req, "https://rs.example.com", 1000).unwrap();
		// The route service echoes the signature headers back at us.
		let step = rs.prepare(&mut req, "https://rs.example.com", 1030).unwrap();
		assert_eq!(step, RouteServiceStep::DispatchToBackend);
	}

	#[test]
	fn expired_signatures_are_rejected() {
		let rs = RouteServices::new("secret", Duration::from_secs(60));
		let mut req = request();
		rs.prepare(&mut req, "https://rs.example.com", 1000).unwrap();
		let err = rs
			.prepare(&mut req, "https://rs.example.com", 2000)
			.unwrap_err();
		assert!(matches!(err, ProxyError::RouteServiceExpired));
	}
}
