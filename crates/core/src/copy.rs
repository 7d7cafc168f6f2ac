use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Size of each relay buffer. Data is forwarded as it arrives; nothing beyond
/// this buffer is ever held by the proxy.
pub const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct Transferred {
	/// Bytes copied from the downstream (client) side to the upstream side.
	pub sent: u64,
	/// Bytes copied from the upstream side back to the downstream side.
	pub received: u64,
}

/// Relays bytes between the two halves until either side closes or errors.
/// The first error tears down both directions.
pub async fn copy_bidirectional<A, B>(
	downstream: &mut A,
	upstream: &mut B,
) -> std::io::Result<Transferred>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let res =
		tokio::io::copy_bidirectional_with_sizes(downstream, upstream, BUFFER_SIZE, BUFFER_SIZE)
			.await;
	match res {
		Ok((sent, received)) => {
			trace!(sent, received, "relay complete");
			Ok(Transferred { sent, received })
		},
		Err(e) => Err(e),
	}
}
