use std::io::IoSlice;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::*;

#[derive(Debug, Clone)]
pub struct TcpConnectionInfo {
	pub peer_addr: SocketAddr,
	pub local_addr: SocketAddr,
	pub start: Instant,
}

#[derive(Debug, Clone)]
pub struct TlsConnectionInfo {
	pub server_name: Option<String>,
	pub negotiated_h2: bool,
	/// DER of the verified client certificate, when one was presented.
	pub client_cert: Option<Vec<u8>>,
}

/// What the dispatcher knows about the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
	pub tcp: TcpConnectionInfo,
	pub tls: Option<TlsConnectionInfo>,
}

/// An accepted downstream connection, plaintext or TLS-terminated.
pub struct Socket {
	info: ConnectionInfo,
	inner: SocketType,
}

enum SocketType {
	Tcp(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
	pub fn from_tcp(stream: TcpStream) -> anyhow::Result<Socket> {
		stream.set_nodelay(true)?;
		let info = ConnectionInfo {
			tcp: TcpConnectionInfo {
				peer_addr: to_canonical(stream.peer_addr()?),
				local_addr: to_canonical(stream.local_addr()?),
				start: Instant::now(),
			},
			tls: None,
		};
		Ok(Socket {
			info,
			inner: SocketType::Tcp(stream),
		})
	}

	pub fn from_tls(tcp: TcpConnectionInfo, stream: TlsStream<TcpStream>) -> Socket {
		let (_, conn) = stream.get_ref();
		let tls = TlsConnectionInfo {
			server_name: conn.server_name().map(|s| s.to_string()),
			negotiated_h2: conn.alpn_protocol() == Some(b"h2"),
			client_cert: conn
				.peer_certificates()
				.and_then(|certs| certs.first())
				.map(|c| c.as_ref().to_vec()),
		};
		Socket {
			info: ConnectionInfo {
				tcp,
				tls: Some(tls),
			},
			inner: SocketType::Tls(Box::new(stream)),
		}
	}

	pub fn info(&self) -> &ConnectionInfo {
		&self.info
	}
}

fn to_canonical(addr: SocketAddr) -> SocketAddr {
	SocketAddr::from((addr.ip().to_canonical(), addr.port()))
}

impl AsyncRead for Socket {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			SocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			SocketType::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Socket {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.inner {
			SocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
			SocketType::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			SocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
			SocketType::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match &mut self.inner {
			SocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			SocketType::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		bufs: &[IoSlice<'_>],
	) -> Poll<std::io::Result<usize>> {
		match &mut self.inner {
			SocketType::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
			SocketType::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match &self.inner {
			SocketType::Tcp(s) => s.is_write_vectored(),
			SocketType::Tls(s) => s.is_write_vectored(),
		}
	}
}
