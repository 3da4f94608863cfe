//! Bidirectional byte pump between a client and a backend.
//!
//! Each direction is copied by its own loop. When a loop sees end-of-stream
//! or an error on its source it half-closes its destination (if the stream
//! supports it), so the other direction can keep draining until the peer
//! finishes too.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tracing::trace;

const COPY_BUFFER_SIZE: usize = 8192;

/// Optional capability: shutting down only the write direction of a stream.
///
/// Streams that report `true` have an `AsyncWrite::poll_shutdown` that closes
/// the write side while leaving reads open. Everything else keeps the
/// default and the pump skips the shutdown.
pub trait HalfClose {
    fn supports_half_close(&self) -> bool {
        false
    }
}

impl HalfClose for TcpStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl HalfClose for DuplexStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Bytes moved in each direction by [`pump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Copy bytes between `client` and `backend` until both directions finish.
///
/// Copy errors end their own direction only; they are not returned.
pub async fn pump<C, B>(client: C, backend: B) -> PumpStats
where
    C: AsyncRead + AsyncWrite + HalfClose + Unpin,
    B: AsyncRead + AsyncWrite + HalfClose + Unpin,
{
    let client_half_close = client.supports_half_close();
    let backend_half_close = backend.supports_half_close();

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = copy_half(
        &mut client_read,
        &mut backend_write,
        backend_half_close,
        "client_to_backend",
    );
    let downstream = copy_half(
        &mut backend_read,
        &mut client_write,
        client_half_close,
        "backend_to_client",
    );

    let (client_to_backend, backend_to_client) = tokio::join!(upstream, downstream);

    PumpStats {
        client_to_backend,
        backend_to_client,
    }
}

/// Copy `src` into `dst` until EOF or error, then half-close `dst`.
async fn copy_half<R, W>(src: &mut R, dst: &mut W, half_close: bool, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let result: io::Result<()> = async {
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            dst.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;

    if let Err(e) = result {
        trace!(direction, error = %e, "Copy ended with error");
    }

    if half_close {
        if let Err(e) = dst.shutdown().await {
            trace!(direction, error = %e, "Half-close failed");
        }
    }

    total
}
