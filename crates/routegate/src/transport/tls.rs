use std::io::Cursor;
use std::path::{Path, PathBuf};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::transport::stream::Socket;
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
	#[default]
	None,
	Request,
	Require,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MinTlsVersion {
	#[serde(rename = "1.2")]
	#[default]
	V1_2,
	#[serde(rename = "1.3")]
	V1_3,
}

/// Server-side TLS settings, resolved from config at startup. A failure here
/// is fatal: a TLS listener without an identity cannot serve.
#[derive(Debug, Clone)]
pub struct ServerTlsSettings {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	pub min_version: MinTlsVersion,
	pub client_auth: ClientAuth,
	/// Trust anchors for client-certificate validation.
	pub ca_certs: Option<PathBuf>,
	pub client_ca_certs: Option<PathBuf>,
	/// Narrow client-cert trust to `client_ca_certs` alone.
	pub only_trust_client_ca_certs: bool,
	/// Offer h2 alongside http/1.1 via ALPN.
	pub enable_http2: bool,
	/// Restrict the negotiable cipher suites; empty means the provider
	/// defaults.
	pub cipher_suites: Vec<String>,
}

impl ServerTlsSettings {
	pub fn build(&self) -> anyhow::Result<Arc<ServerConfig>> {
		let certs = load_certs(&self.cert_path)?;
		let key = load_key(&self.key_path)?;
		let versions = protocol_versions(self.min_version);
		let provider = provider_with_suites(&self.cipher_suites)?;
		let builder = ServerConfig::builder_with_provider(provider)
			.with_protocol_versions(versions)
			.context("no cipher suite supports the configured protocol versions")?;
		let builder = match self.client_auth {
			ClientAuth::None => builder.with_no_client_auth(),
			mode => {
				let mut roots = RootCertStore::empty();
				if !self.only_trust_client_ca_certs {
					if let Some(path) = &self.ca_certs {
						add_roots(&mut roots, path)?;
					}
				}
				if let Some(path) = &self.client_ca_certs {
					add_roots(&mut roots, path)?;
				}
				if roots.is_empty() {
					anyhow::bail!("client certificates requested but no trust anchors configured");
				}
				let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
				let verifier = if mode == ClientAuth::Request {
					verifier.allow_unauthenticated().build()?
				} else {
					verifier.build()?
				};
				builder.with_client_cert_verifier(verifier)
			},
		};
		let mut config = builder.with_single_cert(certs, key)?;
		config.alpn_protocols = if self.enable_http2 {
			vec![b"h2".to_vec(), b"http/1.1".to_vec()]
		} else {
			vec![b"http/1.1".to_vec()]
		};
		Ok(Arc::new(config))
	}
}

/// Terminates TLS on an accepted stream, capturing the negotiated state.
pub async fn accept(stream: TcpStream, config: Arc<ServerConfig>) -> anyhow::Result<Socket> {
	stream.set_nodelay(true)?;
	let tcp = crate::transport::stream::TcpConnectionInfo {
		peer_addr: stream.peer_addr()?,
		local_addr: stream.local_addr()?,
		start: Instant::now(),
	};
	let acceptor = TlsAcceptor::from(config);
	let tls = acceptor.accept(stream).await?;
	Ok(Socket::from_tls(tcp, tls))
}

/// Client-side TLS toward backends. The trust store and identity are global;
/// only the server name varies per endpoint.
#[derive(Debug, Clone)]
pub struct BackendTlsSettings {
	pub ca_certs: Option<PathBuf>,
	/// Present this identity to backends that request a client certificate.
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	/// Accept any backend certificate. For test environments.
	pub skip_verification: bool,
}

impl BackendTlsSettings {
	pub fn build(&self) -> anyhow::Result<Arc<ClientConfig>> {
		let builder = if self.skip_verification {
			ClientConfig::builder()
				.dangerous()
				.with_custom_certificate_verifier(Arc::new(verify::Insecure::new()))
		} else {
			let mut roots = RootCertStore::empty();
			match &self.ca_certs {
				Some(path) => add_roots(&mut roots, path)?,
				None => {
					for cert in rustls_native_certs::load_native_certs().certs {
						let _ = roots.add(cert);
					}
				},
			}
			ClientConfig::builder().with_root_certificates(roots)
		};
		let config = match (&self.cert_path, &self.key_path) {
			(Some(cert), Some(key)) => {
				builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?
			},
			(None, None) => builder.with_no_client_auth(),
			_ => anyhow::bail!("backend client certificate requires both cert and key"),
		};
		Ok(Arc::new(config))
	}
}

/// The SNI/verification name for an endpoint: its registered SAN when
/// present, else the address host.
pub fn backend_server_name(
	san: &str,
	host: &str,
) -> anyhow::Result<ServerName<'static>> {
	let name = if san.is_empty() { host } else { san };
	Ok(ServerName::try_from(name.to_string())?)
}

fn protocol_versions(min: MinTlsVersion) -> &'static [&'static rustls::SupportedProtocolVersion] {
	static V1_2_AND_UP: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
	static V1_3_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
	match min {
		MinTlsVersion::V1_2 => V1_2_AND_UP,
		MinTlsVersion::V1_3 => V1_3_ONLY,
	}
}

/// The ring provider, narrowed to the named cipher suites when any are
/// configured. Names follow the IANA form rustls uses, e.g.
/// `TLS13_AES_128_GCM_SHA256` or `TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384`.
fn provider_with_suites(names: &[String]) -> anyhow::Result<Arc<rustls::crypto::CryptoProvider>> {
	let mut provider = rustls::crypto::ring::default_provider();
	if !names.is_empty() {
		provider.cipher_suites.retain(|s| {
			let name = format!("{:?}", s.suite());
			names.iter().any(|n| n.eq_ignore_ascii_case(&name))
		});
		if provider.cipher_suites.is_empty() {
			anyhow::bail!("none of the configured cipher suites are supported: {names:?}");
		}
	}
	Ok(Arc::new(provider))
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut Cursor::new(pem)).collect();
	let certs = certs.with_context(|| format!("parsing certificates in {}", path.display()))?;
	if certs.is_empty() {
		anyhow::bail!("no certificates found in {}", path.display());
	}
	Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	rustls_pemfile::private_key(&mut Cursor::new(pem))
		.with_context(|| format!("parsing key in {}", path.display()))?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

fn add_roots(roots: &mut RootCertStore, path: &Path) -> anyhow::Result<()> {
	for cert in load_certs(path)? {
		roots
			.add(cert)
			.with_context(|| format!("adding trust anchor from {}", path.display()))?;
	}
	Ok(())
}

mod verify {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::crypto::CryptoProvider;
	use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
	use rustls::{DigitallySignedStruct, SignatureScheme};

	/// Accepts any server certificate. Only reachable through the explicit
	/// `skip_verification` switch.
	#[derive(Debug)]
	pub struct Insecure(std::sync::Arc<CryptoProvider>);

	impl Insecure {
		pub fn new() -> Insecure {
			Insecure(rustls::crypto::ring::default_provider().into())
		}
	}

	impl ServerCertVerifier for Insecure {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer<'_>,
			_intermediates: &[CertificateDer<'_>],
			_server_name: &ServerName<'_>,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls12_signature(
				message,
				cert,
				dss,
				&self.0.signature_verification_algorithms,
			)
		}

		fn verify_tls13_signature(
			&self,
			message: &[u8],
			cert: &CertificateDer<'_>,
			dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			rustls::crypto::verify_tls13_signature(
				message,
				cert,
				dss,
				&self.0.signature_verification_algorithms,
			)
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			self.0.signature_verification_algorithms.supported_schemes()
		}
	}
}
