mod memory;
mod subscriber;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use memory::MemoryBus;
pub use subscriber::{Subscriber, SubscriberConfig};

use crate::types::EndpointSpec;
use crate::*;

/// Subjects the router exchanges with the bus.
pub const SUBJECT_REGISTER: &str = "router.register";
pub const SUBJECT_UNREGISTER: &str = "router.unregister";
pub const SUBJECT_START: &str = "router.start";

/// A register/unregister frame as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegistryMessage {
	#[serde(default)]
	pub host: String,
	#[serde(default)]
	pub port: u16,
	#[serde(default)]
	pub tls_port: u16,
	#[serde(default)]
	pub uris: Vec<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub tags: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub app: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub private_instance_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub private_instance_index: String,
	#[serde(default)]
	pub stale_threshold_in_seconds: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub route_service_url: Option<String>,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub server_cert_domain_san: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub endpoint_updated_at_ns: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
	#[error("frame is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("frame has no host")]
	MissingHost,
	#[error("frame has neither port nor tls_port")]
	MissingPort,
	#[error("frame has no uris")]
	MissingUris,
}

impl RegistryMessage {
	pub fn decode(payload: &[u8]) -> Result<RegistryMessage, FrameError> {
		Ok(serde_json::from_slice(payload)?)
	}

	/// Validates the frame and lowers it to the registry's endpoint spec plus
	/// the URIs it applies to. A frame carrying both ports registers the TLS
	/// address.
	pub fn to_spec(&self) -> Result<(Vec<Strng>, EndpointSpec), FrameError> {
		if self.host.is_empty() {
			return Err(FrameError::MissingHost);
		}
		if self.port == 0 && self.tls_port == 0 {
			return Err(FrameError::MissingPort);
		}
		if self.uris.is_empty() {
			return Err(FrameError::MissingUris);
		}
		let use_tls = self.tls_port != 0;
		let port = if use_tls { self.tls_port } else { self.port };
		let uris = self.uris.iter().map(strng::new).collect();
		let spec = EndpointSpec {
			host: strng::new(&self.host),
			port,
			use_tls,
			app_id: strng::new(&self.app),
			instance_id: strng::new(&self.private_instance_id),
			instance_index: strng::new(&self.private_instance_index),
			server_cert_san: strng::new(&self.server_cert_domain_san),
			tags: self
				.tags
				.iter()
				.map(|(k, v)| (strng::new(k), strng::new(v)))
				.collect(),
			route_service_url: self.route_service_url.as_deref().map(strng::new),
			stale_threshold: Duration::from_secs(self.stale_threshold_in_seconds),
		};
		Ok((uris, spec))
	}
}

/// The announcement published on (re)connect so backends re-register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMessage {
	pub id: String,
	pub hosts: Vec<String>,
	#[serde(rename = "minimumRegisterIntervalInSeconds")]
	pub minimum_register_interval_in_seconds: u64,
	#[serde(rename = "pruneThresholdInSeconds")]
	pub prune_threshold_in_seconds: u64,
}

/// The message bus itself is an external collaborator; the router only
/// depends on this connect/publish/consume surface.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
	/// Establishes a connection subscribed to `subjects`.
	async fn connect(&self, subjects: &[&str]) -> anyhow::Result<Box<dyn Connection>>;
}

#[async_trait::async_trait]
pub trait Connection: Send {
	async fn publish(&mut self, subject: &str, payload: Bytes) -> anyhow::Result<()>;

	/// The next inbound frame, in arrival order across all subscribed
	/// subjects. None means the connection is gone and the caller should
	/// reconnect.
	async fn next(&mut self) -> Option<(Strng, Bytes)>;
}

/// Resolves the configured bus. Without a URL the router runs against an
/// isolated in-process loopback, which serves nothing but keeps local runs
/// and tests honest.
pub fn transport_for(url: Option<&str>) -> anyhow::Result<Arc<dyn Transport>> {
	match url {
		None => {
			warn!("no message bus configured; using an isolated in-process loopback");
			Ok(Arc::new(MemoryBus::new()))
		},
		Some(url) => anyhow::bail!("no bus client available for {url:?}"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_a_full_frame() {
		let raw = serde_json::json!({
			"host": "10.2.3.4",
			"port": 8080,
			"uris": ["app.example.com", "alias.example.com"],
			"tags": {"component": "web"},
			"app": "app-guid",
			"private_instance_id": "abc123",
			"private_instance_index": "2",
			"stale_threshold_in_seconds": 120,
			"server_cert_domain_san": "",
		});
		let msg = RegistryMessage::decode(raw.to_string().as_bytes()).unwrap();
		let (uris, spec) = msg.to_spec().unwrap();
		assert_eq!(uris.len(), 2);
		assert_eq!(spec.address().as_str(), "10.2.3.4:8080");
		assert!(!spec.use_tls);
		assert_eq!(spec.stale_threshold, Duration::from_secs(120));
	}

	#[test]
	fn tls_port_wins() {
		let msg = RegistryMessage {
			host: "10.2.3.4".into(),
			port: 8080,
			tls_port: 8443,
			uris: vec!["app.example.com".into()],
			..Default::default()
		};
		let (_, spec) = msg.to_spec().unwrap();
		assert!(spec.use_tls);
		assert_eq!(spec.address().as_str(), "10.2.3.4:8443");
	}

	#[test]
	fn rejects_incomplete_frames() {
		let no_host = RegistryMessage {
			port: 8080,
			uris: vec!["a".into()],
			..Default::default()
		};
		assert!(matches!(no_host.to_spec(), Err(FrameError::MissingHost)));

		let no_port = RegistryMessage {
			host: "10.0.0.1".into(),
			uris: vec!["a".into()],
			..Default::default()
		};
		assert!(matches!(no_port.to_spec(), Err(FrameError::MissingPort)));

		assert!(RegistryMessage::decode(b"{not json").is_err());
	}
}
