//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! The sniffer reads just enough of a new connection to parse the first TLS
//! record, pulls the `host_name` entry out of the Server Name extension and
//! hands back a [`SniffedStream`] that replays every consumed byte before
//! reading from the socket again. The backend sees the exact byte stream the
//! client sent.
//!
//! Limits:
//! - sniff timeout: 5s default, covering every read of the handshake phase
//! - buffer cap: one TLS record (5 byte header + 2^14 byte payload)
//! - a ClientHello spanning more than one TLS record is rejected

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::trace;

use super::pump::HalfClose;

/// Default timeout for the whole sniff phase.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest TLS plaintext record payload (RFC 8446 5.1).
pub const MAX_RECORD_LEN: usize = 1 << 14;

/// Default maximum bytes buffered while sniffing: one full record.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = RECORD_HEADER_LEN + MAX_RECORD_LEN;

const RECORD_HEADER_LEN: usize = 5;
const HANDSHAKE_HEADER_LEN: usize = 4;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Reasons a connection could not be sniffed.
#[derive(Debug, Error)]
pub enum SniError {
    /// First bytes are not a TLS handshake record.
    #[error("not a TLS handshake")]
    NotTls,

    /// Looks like TLS but the ClientHello does not parse.
    #[error("malformed ClientHello: {0}")]
    Malformed(&'static str),

    /// Record header declares a length outside the accepted bounds.
    #[error("TLS record length {declared} exceeds limit {limit}")]
    TooLarge { declared: usize, limit: usize },

    /// The handshake did not arrive before the sniff deadline.
    #[error("timed out waiting for ClientHello")]
    Timeout,

    /// Peer closed the connection before a full record arrived.
    #[error("connection closed after {0} bytes")]
    Closed(usize),

    #[error("I/O error while sniffing: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for a complete ClientHello.
    pub timeout: Duration,
    /// Maximum bytes to buffer.
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// SNI inspector for TLS ClientHello parsing.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    /// Create a new SNI inspector with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new SNI inspector with custom configuration.
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Sniff the SNI hostname from `stream`.
    ///
    /// On success returns the stream wrapped so that the bytes consumed here
    /// are read again first, plus the advertised hostname (`None` when the
    /// ClientHello carries no Server Name extension).
    pub async fn sniff<S>(&self, mut stream: S) -> Result<(SniffedStream<S>, Option<String>), SniError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer = Vec::with_capacity(1024);

        let hostname = match timeout(
            self.config.timeout,
            read_client_hello(&mut stream, &mut buffer, self.config.max_bytes),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(SniError::Timeout),
        };

        trace!(buffered = buffer.len(), "ClientHello buffered");
        Ok((SniffedStream::new(buffer, stream), hostname))
    }
}

/// Fill `buffer` until one complete TLS record is present, then parse it.
async fn read_client_hello<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    max_bytes: usize,
) -> Result<Option<String>, SniError> {
    let limit = max_bytes.saturating_sub(RECORD_HEADER_LEN).min(MAX_RECORD_LEN);

    let mut target = RECORD_HEADER_LEN;
    while buffer.len() < target {
        read_more(stream, buffer, target).await?;

        // Reject obvious non-TLS as soon as the first byte is in.
        if buffer[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(SniError::NotTls);
        }
        if buffer.len() >= 2 && buffer[1] != 0x03 {
            return Err(SniError::NotTls);
        }

        if target == RECORD_HEADER_LEN && buffer.len() >= RECORD_HEADER_LEN {
            let declared = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
            if declared == 0 {
                return Err(SniError::Malformed("empty handshake record"));
            }
            if declared > limit {
                return Err(SniError::TooLarge { declared, limit });
            }
            target = RECORD_HEADER_LEN + declared;
        }
    }

    parse_client_hello(&buffer[..target])
}

/// Read once, appending at most up to `target` bytes total.
async fn read_more<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut Vec<u8>,
    target: usize,
) -> Result<(), SniError> {
    let start = buffer.len();
    buffer.resize(target, 0);
    let n = match stream.read(&mut buffer[start..]).await {
        Ok(n) => n,
        Err(e) => {
            buffer.truncate(start);
            return Err(e.into());
        }
    };
    buffer.truncate(start + n);
    if n == 0 {
        return Err(SniError::Closed(start));
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a byte slice.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], SniError> {
        if self.remaining() < len {
            return Err(SniError::Malformed(what));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SniError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, SniError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, SniError> {
        let b = self.take(3, what)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }

    /// Take a length-prefixed block with a one byte length.
    fn block8(&mut self, what: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    /// Take a length-prefixed block with a two byte length.
    fn block16(&mut self, what: &'static str) -> Result<&'a [u8], SniError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

/// Parse the SNI hostname from one complete TLS record holding a ClientHello.
///
/// TLS Record structure:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version
/// - bytes 3-4: record length
/// - bytes 5+: handshake message
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte + variable: session ID
/// - 2 bytes + variable: cipher suites
/// - 1 byte + variable: compression methods
/// - 2 bytes + variable: extensions (optional)
pub(crate) fn parse_client_hello(record: &[u8]) -> Result<Option<String>, SniError> {
    let mut r = Reader::new(record);

    if r.u8("record header")? != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotTls);
    }
    let _version = r.u16("record header")?;
    let payload = r.block16("record payload")?;

    let mut hs = Reader::new(payload);
    if hs.u8("handshake header")? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::Malformed("first handshake message is not a ClientHello"));
    }
    let hello_len = hs.u24("handshake header")?;
    if hello_len > hs.remaining() {
        return Err(SniError::Malformed("ClientHello spans multiple records"));
    }
    let mut hello = Reader::new(hs.take(hello_len, "ClientHello body")?);

    hello.take(2 + 32, "client version and random")?;
    hello.block8("session id")?;
    let suites = hello.block16("cipher suites")?;
    if suites.is_empty() || suites.len() % 2 != 0 {
        return Err(SniError::Malformed("cipher suites"));
    }
    hello.block8("compression methods")?;

    // Extensions are optional (SSLv3/TLS 1.0 era clients).
    if hello.remaining() == 0 {
        return Ok(None);
    }

    let mut extensions = Reader::new(hello.block16("extensions")?);
    if hello.remaining() != 0 {
        return Err(SniError::Malformed("trailing bytes after extensions"));
    }

    while extensions.remaining() > 0 {
        let ext_type = extensions.u16("extension header")?;
        let body = extensions.block16("extension body")?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(body);
        }
    }

    Ok(None)
}

/// Parse the server_name extension body.
///
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name(body: &[u8]) -> Result<Option<String>, SniError> {
    let mut ext = Reader::new(body);
    let mut list = Reader::new(ext.block16("server name list")?);

    while list.remaining() > 0 {
        let name_type = list.u8("server name entry")?;
        let name = list.block16("server name entry")?;

        if name_type == NAME_TYPE_HOST_NAME {
            if name.is_empty() {
                return Ok(None);
            }
            return match std::str::from_utf8(name) {
                Ok(hostname) => Ok(Some(hostname.to_string())),
                Err(_) => Err(SniError::Malformed("host_name is not valid UTF-8")),
            };
        }
    }

    Ok(None)
}

/// A stream that replays the sniffed bytes before reading from the inner
/// stream. Writes go straight to the inner stream.
#[derive(Debug)]
pub struct SniffedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> SniffedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }

    /// Bytes consumed while sniffing.
    pub fn sniffed(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let pos = self.pos;
            let n = (self.prefix.len() - pos).min(buf.remaining());
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: HalfClose> HalfClose for SniffedStream<S> {
    fn supports_half_close(&self) -> bool {
        self.inner.supports_half_close()
    }
}
