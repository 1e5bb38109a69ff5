use bytes::BytesMut;
use rand::{CryptoRng, RngCore};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream that carries the SSH connection.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Reads from the stream into the spare capacity of `buf`.
pub fn poll_read_buf(
    stream: Pin<&mut dyn AsyncReadWrite>,
    cx: &mut Context,
    buf: &mut BytesMut,
) -> Poll<std::io::Result<usize>> {
    tokio_util::io::poll_read_buf(stream, cx, buf)
}

/// Cryptographically secure random number generator used by a session.
///
/// This is implemented for every [`RngCore`] that is also a [`CryptoRng`], such as
/// [`rand::rngs::OsRng`].
pub trait CryptoRngCore: CryptoRng + RngCore {
    /// Upcasts `self` to a plain [`RngCore`].
    fn as_rngcore(&mut self) -> &mut dyn RngCore;
}

impl<T: CryptoRng + RngCore> CryptoRngCore for T {
    fn as_rngcore(&mut self) -> &mut dyn RngCore {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn test_poll_read_buf_appends() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"SSH-2.0-test\r\n").await.unwrap();

        let mut buf = BytesMut::from(&b"prefix "[..]);
        buf.reserve(32);
        let n = std::future::poll_fn(|cx| {
            let stream: Pin<&mut tokio::io::DuplexStream> = Pin::new(&mut b);
            poll_read_buf(stream, cx, &mut buf)
        }).await.unwrap();
        assert_eq!(n, 14);
        assert_eq!(&buf[..], b"prefix SSH-2.0-test\r\n");
    }
}
