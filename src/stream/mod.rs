//! Framed message I/O over the server socket.
//!
//! Every message after the handshake is a one-byte type followed by a
//! four-byte big-endian length that includes itself and excludes the type
//! byte. The stream buffers both directions, enforces the read deadline on
//! every operation, and transparently unwraps the LZ4 envelope once
//! compression has been negotiated.

pub mod inner;
pub mod lz4;

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::errors::Error;
use crate::messages::constants::{
    BACKEND_COMPRESSED_DATA, BACKEND_COMPRESSION_ACK, BACKEND_SET_COMPRESSION, MAX_MESSAGE_SIZE,
};
use crate::messages::frontend;

use inner::StreamInner;
use lz4::Lz4Decoder;

const READ_CHUNK: usize = 8192;

#[derive(Debug)]
pub struct FramedStream {
    inner: StreamInner,
    /// Logical plaintext protocol bytes ready for consumption.
    buf: BytesMut,
    /// Raw socket bytes awaiting envelope decoding while compression is on.
    raw: BytesMut,
    write_buf: BytesMut,
    read_timeout: Option<Duration>,
    decoder: Option<Lz4Decoder>,
    closed: bool,
}

impl FramedStream {
    pub fn new(stream: TcpStream) -> FramedStream {
        FramedStream {
            inner: StreamInner::Plain { stream },
            buf: BytesMut::with_capacity(READ_CHUNK),
            raw: BytesMut::new(),
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            read_timeout: None,
            decoder: None,
            closed: false,
        }
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    pub fn send_byte(&mut self, value: u8) {
        self.write_buf.put_u8(value);
    }

    pub fn send_i16(&mut self, value: i16) {
        self.write_buf.put_i16(value);
    }

    pub fn send_i32(&mut self, value: i32) {
        self.write_buf.put_i32(value);
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.write_buf.put_slice(bytes);
    }

    pub fn send_cstring(&mut self, value: &str) {
        self.write_buf.put_slice(value.as_bytes());
        self.write_buf.put_u8(0);
    }

    /// Number of bytes queued but not yet flushed.
    pub fn pending_send_bytes(&self) -> usize {
        self.write_buf.len()
    }

    /// Write every queued byte to the socket and flush it.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let bytes = self.write_buf.split();
        let deadline = self.read_timeout;
        let write = async {
            self.inner.write_all(&bytes).await?;
            self.inner.flush().await
        };
        let result = match deadline {
            Some(limit) => match timeout(limit, write).await {
                Ok(result) => result,
                Err(_) => {
                    self.closed = true;
                    return Err(Error::Timeout);
                }
            },
            None => write.await,
        };
        if let Err(err) = result {
            self.closed = true;
            return Err(Error::Io(err));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    pub async fn peek_byte(&mut self) -> Result<u8, Error> {
        self.fill(1).await?;
        Ok(self.buf[0])
    }

    pub async fn receive_byte(&mut self) -> Result<u8, Error> {
        self.fill(1).await?;
        Ok(self.buf.get_u8())
    }

    pub async fn receive_i16(&mut self) -> Result<i16, Error> {
        self.fill(2).await?;
        Ok(self.buf.get_i16())
    }

    pub async fn receive_i32(&mut self) -> Result<i32, Error> {
        self.fill(4).await?;
        Ok(self.buf.get_i32())
    }

    /// Receive exactly `n` bytes.
    pub async fn receive(&mut self, n: usize) -> Result<BytesMut, Error> {
        self.fill(n).await?;
        Ok(self.buf.split_to(n))
    }

    /// Receive exactly `n` bytes as UTF-8 text, read in place from the buffer.
    pub async fn receive_string(&mut self, n: usize) -> Result<String, Error> {
        let bytes = self.receive(n).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::ProtocolViolation("received string is not valid UTF-8".into()))
    }

    /// Receive a NUL-terminated UTF-8 string.
    pub async fn receive_cstring(&mut self) -> Result<String, Error> {
        loop {
            if let Some(nul) = self.buf.iter().position(|&b| b == 0) {
                let bytes = self.buf.split_to(nul);
                self.buf.advance(1);
                return String::from_utf8(bytes.to_vec()).map_err(|_| {
                    Error::ProtocolViolation("received string is not valid UTF-8".into())
                });
            }
            let want = self.buf.len() + 1;
            self.fill(want).await?;
        }
    }

    /// True when at least one buffered or socket-ready byte is available
    /// without blocking.
    pub fn has_message_pending(&mut self) -> bool {
        use std::task::{Context, Poll, Waker};

        if !self.buf.is_empty() || !self.raw.is_empty() {
            return true;
        }
        if self.closed {
            return false;
        }

        let waker = Waker::noop();
        let mut cx = Context::from_waker(waker);
        let mut probe = [0u8; READ_CHUNK];
        let mut read_buf = tokio::io::ReadBuf::new(&mut probe);
        match std::pin::Pin::new(&mut self.inner).poll_read(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    self.closed = true;
                    return false;
                }
                if self.decoder.is_some() {
                    self.raw.extend_from_slice(filled);
                } else {
                    self.buf.extend_from_slice(filled);
                }
                true
            }
            Poll::Ready(Err(_)) => {
                self.closed = true;
                false
            }
            Poll::Pending => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Set the read deadline applied to every framed operation; `0` disables it.
    pub fn set_deadline(&mut self, millis: u64) {
        self.read_timeout = if millis == 0 {
            None
        } else {
            Some(Duration::from_millis(millis))
        };
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn get_send_buffer_size(&self) -> Result<usize, Error> {
        let sock = socket2::SockRef::from(self.inner.tcp());
        Ok(sock.send_buffer_size()?)
    }

    pub fn get_receive_buffer_size(&self) -> Result<usize, Error> {
        let sock = socket2::SockRef::from(self.inner.tcp());
        Ok(sock.recv_buffer_size()?)
    }

    pub fn is_tls(&self) -> bool {
        self.inner.is_tls()
    }

    /// Best-effort synchronous write of the goodbye message during drop.
    pub fn try_write_raw(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.inner.try_write(bytes)
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.inner.shutdown().await {
            debug!("Socket shutdown reported {err}");
        }
    }

    // ------------------------------------------------------------------
    // Message layer
    // ------------------------------------------------------------------

    /// Read the next protocol message: its type byte and payload (the bytes
    /// after the length prefix). Compression negotiation messages are consumed
    /// here and never surface to callers.
    pub async fn read_message(&mut self) -> Result<(u8, BytesMut), Error> {
        loop {
            let code = self.receive_byte().await?;
            let len = self.receive_i32().await?;
            if len < 4 || len > MAX_MESSAGE_SIZE {
                self.closed = true;
                return Err(Error::ProtocolViolation(format!(
                    "message '{}' carries invalid length {len}",
                    code as char
                )));
            }
            let payload = self.receive(len as usize - 4).await?;
            match code {
                BACKEND_SET_COMPRESSION | BACKEND_COMPRESSION_ACK => {
                    // Always restart the codec and discard the payload.
                    self.enable_compression();
                    continue;
                }
                _ => return Ok((code, payload)),
            }
        }
    }

    /// Install (or restart) the LZ4 envelope decoder.
    pub fn enable_compression(&mut self) {
        debug!("Compression codec installed on connection stream");
        self.decoder = Some(Lz4Decoder::new());
    }

    pub fn is_compression_active(&self) -> bool {
        self.decoder.is_some()
    }

    // ------------------------------------------------------------------
    // TLS upgrade
    // ------------------------------------------------------------------

    /// Send the SSL request and return the server's one-byte answer.
    /// An `E` answer is expanded into the server's error message.
    pub async fn request_tls(&mut self) -> Result<u8, Error> {
        self.send_bytes(&frontend::ssl_request());
        self.flush().await?;
        let answer = self.receive_byte().await?;
        if answer == b'E' {
            // Pre-v12 servers answer the SSL probe with a full error response.
            let len = self.receive_i32().await?;
            if len >= 4 && len < MAX_MESSAGE_SIZE {
                let mut payload = self.receive(len as usize - 4).await?;
                if let Ok(err) = crate::messages::parse_error_fields(&mut payload, true) {
                    return Err(Error::ConnectionRejected(err.to_string()));
                }
            }
            return Err(Error::ConnectionRejected(
                "server rejected the SSL request".into(),
            ));
        }
        Ok(answer)
    }

    /// Perform the TLS handshake on the same socket and replace the stream.
    /// Must only be called right after an `'S'` answer, with nothing buffered.
    pub async fn upgrade_tls(
        mut self,
        connector: &tokio_native_tls::TlsConnector,
        domain: &str,
    ) -> Result<FramedStream, Error> {
        if !self.buf.is_empty() || !self.raw.is_empty() {
            return Err(Error::ProtocolViolation(
                "unexpected data buffered before TLS handshake".into(),
            ));
        }
        let tcp = match self.inner {
            StreamInner::Plain { stream } => stream,
            StreamInner::Tls { .. } => {
                return Err(Error::WrongState("connection is already encrypted".into()))
            }
        };
        let stream = connector.connect(domain, tcp).await.map_err(|err| {
            warn!("TLS handshake with {domain} failed: {err}");
            Error::Tls(err)
        })?;
        self.inner = StreamInner::Tls { stream };
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Buffer management
    // ------------------------------------------------------------------

    /// Ensure `n` logical bytes are buffered, reading (and decompressing)
    /// as needed. Blocks until satisfied or the deadline fires.
    async fn fill(&mut self, n: usize) -> Result<(), Error> {
        while self.buf.len() < n {
            if self.closed {
                return Err(Error::ConnectionClosed);
            }
            if self.decoder.is_some() {
                self.fill_from_envelope().await?;
            } else {
                // Grow in whole-capacity multiples when a read outsizes the buffer.
                let capacity = self.buf.capacity().max(READ_CHUNK);
                let needed = n - self.buf.len();
                if needed > capacity {
                    self.buf.reserve(capacity * needed.div_ceil(capacity));
                }
                self.read_some_into_buf().await?;
            }
        }
        Ok(())
    }

    /// Read one raw envelope message and append its decompressed payload.
    async fn fill_from_envelope(&mut self) -> Result<(), Error> {
        self.fill_raw(5).await?;
        let code = self.raw[0];
        let len = i32::from_be_bytes([self.raw[1], self.raw[2], self.raw[3], self.raw[4]]);
        if len < 4 || len > MAX_MESSAGE_SIZE {
            self.closed = true;
            return Err(Error::ProtocolViolation(format!(
                "compressed envelope '{}' carries invalid length {len}",
                code as char
            )));
        }
        let total = 5 + len as usize - 4;
        self.fill_raw(total).await?;
        let mut frame = self.raw.split_to(total);
        frame.advance(5);

        match code {
            BACKEND_COMPRESSED_DATA => {
                let decoder = self.decoder.as_mut().expect("decoder is installed");
                let decompressed = decoder.decompress(&frame)?;
                self.buf.extend_from_slice(&decompressed);
                Ok(())
            }
            BACKEND_SET_COMPRESSION | BACKEND_COMPRESSION_ACK => {
                self.enable_compression();
                Ok(())
            }
            other => {
                self.closed = true;
                Err(Error::ProtocolViolation(format!(
                    "unexpected message '{}' inside the compressed stream",
                    other as char
                )))
            }
        }
    }

    async fn fill_raw(&mut self, n: usize) -> Result<(), Error> {
        while self.raw.len() < n {
            let read = self.read_with_deadline(true).await?;
            if read == 0 {
                self.closed = true;
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    async fn read_some_into_buf(&mut self) -> Result<(), Error> {
        let read = self.read_with_deadline(false).await?;
        if read == 0 {
            self.closed = true;
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    async fn read_with_deadline(&mut self, into_raw: bool) -> Result<usize, Error> {
        let target = if into_raw { &mut self.raw } else { &mut self.buf };
        let read = match self.read_timeout {
            Some(limit) => match timeout(limit, self.inner.read_buf(target)).await {
                Ok(result) => result,
                Err(_) => return Err(Error::Timeout),
            },
            None => self.inner.read_buf(target).await,
        };
        read.map_err(|err| {
            self.closed = true;
            Error::Io(err)
        })
    }
}
