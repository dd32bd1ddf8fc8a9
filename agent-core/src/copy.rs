use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

/// Byte counters for one spliced connection. A thin reporter interface: callers that want
/// metrics implement recording on top of the returned counts, this module stays numbers-only.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionResult {
	pub sent: u64,
	pub received: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum CopyError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("destination disconnected before all data was written")]
	BackendDisconnected,
	#[error("client disconnected before all data was written")]
	ClientDisconnected,
}

/// Splices two duplex streams until either side closes, returning byte counts for each
/// direction. Used for the WebSocket/raw-TCP upgrade path once a 101 response has been
/// observed: everything past that point is opaque bytes.
pub async fn copy_bidirectional<A, B>(downstream: &mut A, upstream: &mut B) -> Result<ConnectionResult, CopyError>
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	match tokio::io::copy_bidirectional(downstream, upstream).await {
		Ok((sent, received)) => {
			trace!(sent, received, "splice complete");
			Ok(ConnectionResult { sent, received })
		},
		Err(e) => Err(translate(e)),
	}
}

fn translate(e: std::io::Error) -> CopyError {
	use std::io::ErrorKind::*;
	match e.kind() {
		NotConnected | WriteZero => CopyError::BackendDisconnected,
		UnexpectedEof => CopyError::ClientDisconnected,
		_ => CopyError::Io(e),
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	#[tokio::test]
	async fn splices_until_one_side_closes() {
		let (mut a_near, mut a_far) = duplex(64);
		let (mut b_near, mut b_far) = duplex(64);

		let splice = tokio::spawn(async move { copy_bidirectional(&mut a_far, &mut b_far).await });

		tokio::io::AsyncWriteExt::write_all(&mut a_near, b"hello").await.unwrap();
		drop(a_near);

		let mut buf = [0u8; 5];
		tokio::io::AsyncReadExt::read_exact(&mut b_near, &mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");
		drop(b_near);

		let result = splice.await.unwrap().unwrap();
		assert_eq!(result.sent, 5);
	}
}
