//! Line-oriented transport: CRLF command/data reading with bounded buffers,
//! dot-stuffing reversal, and in-place STARTTLS upgrade.
//!
//! Generic over any `AsyncRead + AsyncWrite + Unpin` byte stream so the same
//! transport works over a `TcpStream`, a `UnixStream`, or (in tests) an
//! in-memory duplex pipe. See `spec.md` §4.1.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::SmtpError;

/// The underlying byte stream, either plaintext or upgraded to TLS.
///
/// Mirrors the "upgrade in place" pattern used by production SMTP servers:
/// STARTTLS replaces the plain variant with a TLS-wrapped one without the
/// dispatcher or handler ever seeing the swap.
enum Conn<IO> {
    Plain(IO),
    Tls(Box<TlsStream<IO>>),
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncRead for Conn<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Conn::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncRead + AsyncWrite + Unpin> AsyncWrite for Conn<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Conn::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(io) => Pin::new(io).poll_flush(cx),
            Conn::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Conn::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Manages buffered I/O for a single connection and tracks the two read
/// modes (command-line vs. DATA block) that apply different size caps.
pub struct LineTransport<IO> {
    stream: BufReader<Conn<IO>>,
    line_length_limit: usize,
    data_size_limit: usize,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> LineTransport<IO> {
    pub fn new(io: IO, line_length_limit: usize, data_size_limit: usize) -> Self {
        LineTransport {
            stream: BufReader::new(Conn::Plain(io)),
            line_length_limit,
            data_size_limit,
        }
    }

    /// Whether the connection is currently TLS-protected.
    pub fn is_tls(&self) -> bool {
        matches!(self.stream.get_ref(), Conn::Tls(_))
    }

    /// Reads one CRLF-terminated command line, applying `line_length_limit`.
    ///
    /// On a line exceeding the limit, the full logical line is still
    /// consumed (to keep the protocol in sync) but `SmtpError::LineTooLong`
    /// is returned in place of the line.
    pub async fn read_command_line(&mut self) -> Result<String, SmtpError> {
        let (raw, exceeded) = self.scan_line(Some(self.line_length_limit)).await?;
        if exceeded {
            return Err(SmtpError::LineTooLong);
        }
        Ok(String::from_utf8_lossy(strip_crlf(&raw)).into_owned())
    }

    /// `read_command_line` bounded by an idle timeout.
    pub async fn read_command_line_timeout(&mut self, timeout: Duration) -> Result<String, SmtpError> {
        match tokio::time::timeout(timeout, self.read_command_line()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SmtpError::Timeout),
        }
    }

    /// Reads a full DATA block, reversing dot-stuffing and normalizing line
    /// endings to CRLF, until a line containing exactly `.` is seen.
    ///
    /// Enforces `data_size_limit`: once exceeded, further content is
    /// discarded but the parser keeps reading until the terminator so the
    /// protocol stays in sync, then returns `SmtpError::DataTooLarge`.
    pub async fn read_data_block(&mut self) -> Result<Vec<u8>, SmtpError> {
        let mut content = Vec::new();
        let mut exceeded = false;

        loop {
            let (raw, _) = self.scan_line(None).await?;
            let line = strip_crlf(&raw);
            if line == b"." {
                break;
            }
            let unstuffed: &[u8] = if line.first() == Some(&b'.') { &line[1..] } else { line };

            if !exceeded {
                if content.len() + unstuffed.len() + 2 > self.data_size_limit {
                    exceeded = true;
                } else {
                    content.extend_from_slice(unstuffed);
                    content.extend_from_slice(b"\r\n");
                }
            }
        }

        if exceeded {
            Err(SmtpError::DataTooLarge)
        } else {
            Ok(content)
        }
    }

    pub async fn read_data_block_timeout(&mut self, timeout: Duration) -> Result<Vec<u8>, SmtpError> {
        match tokio::time::timeout(timeout, self.read_data_block()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SmtpError::Timeout),
        }
    }

    /// Writes a single reply line, appending CRLF, and flushes immediately.
    pub async fn write_line(&mut self, line: &str) -> Result<(), SmtpError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes several already-formatted reply lines (continuation hyphens
    /// included by the caller) with a single flush at the end.
    pub async fn write_reply(&mut self, lines: &[String]) -> Result<(), SmtpError> {
        for line in lines {
            self.stream.write_all(line.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads raw PROXY-preamble bytes without CRLF framing assumptions, used
    /// only before the SMTP banner is sent. Returns up to `max` bytes
    /// currently buffered/available without blocking past `timeout`.
    pub async fn peek_preamble(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, SmtpError> {
        let fut = async {
            let buf = self.stream.fill_buf().await?;
            Ok::<Vec<u8>, std::io::Error>(buf[..buf.len().min(max)].to_vec())
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(classify_io_error(e)),
            Err(_elapsed) => Err(SmtpError::Timeout),
        }
    }

    /// Consumes exactly `n` bytes that were previously inspected via
    /// `peek_preamble`, advancing the stream past the PROXY header.
    pub fn consume_preamble(&mut self, n: usize) {
        self.stream.consume(n);
    }

    /// Negotiated TLS parameters, once `is_tls()` is true.
    pub fn tls_info(&self) -> Option<crate::model::TlsInfo> {
        match self.stream.get_ref() {
            Conn::Tls(tls) => {
                let (_, conn) = tls.get_ref();
                Some(crate::model::TlsInfo {
                    protocol_version: conn
                        .protocol_version()
                        .map(|v| format!("{:?}", v))
                        .unwrap_or_default(),
                    cipher_suite: conn
                        .negotiated_cipher_suite()
                        .map(|c| format!("{:?}", c.suite()))
                        .unwrap_or_default(),
                    peer_certificate_present: conn
                        .peer_certificates()
                        .map(|certs| !certs.is_empty())
                        .unwrap_or(false),
                })
            }
            Conn::Plain(_) => None,
        }
    }

    /// Performs the STARTTLS upgrade. Any bytes buffered-but-unconsumed at
    /// the plaintext layer are discarded by dropping the old `BufReader`
    /// (RFC 3207 §6: bytes sent before the handshake are not to be trusted).
    pub async fn upgrade_tls(self, acceptor: &TlsAcceptor) -> Result<Self, SmtpError>
    where
        IO: 'static,
    {
        let LineTransport {
            stream,
            line_length_limit,
            data_size_limit,
        } = self;

        let io = match stream.into_inner() {
            Conn::Plain(io) => io,
            Conn::Tls(_) => return Err(SmtpError::Tls("TLS is already active".to_string())),
        };

        let tls_stream = acceptor
            .accept(io)
            .await
            .map_err(|e| SmtpError::Tls(e.to_string()))?;

        Ok(LineTransport {
            stream: BufReader::new(Conn::Tls(Box::new(tls_stream))),
            line_length_limit,
            data_size_limit,
        })
    }

    /// Scans for the next `\n`-terminated line using `fill_buf`/`consume`
    /// (no per-byte syscalls). When `cap` is set, only the first `cap` bytes
    /// are retained in the returned buffer but every byte up to the
    /// terminator is still consumed from the stream, returning `exceeded =
    /// true` if more than `cap` bytes were seen.
    async fn scan_line(&mut self, cap: Option<usize>) -> Result<(Vec<u8>, bool), SmtpError> {
        let mut out = Vec::new();
        let mut exceeded = false;

        loop {
            let chunk = self.stream.fill_buf().await.map_err(classify_io_error)?;
            if chunk.is_empty() {
                return Err(SmtpError::Eof);
            }

            let newline_at = chunk.iter().position(|&b| b == b'\n');
            let take = newline_at.map_or(chunk.len(), |pos| pos + 1);
            let slice = &chunk[..take];

            if let Some(limit) = cap {
                if out.len() >= limit {
                    exceeded = true;
                } else {
                    let room = limit - out.len();
                    if slice.len() > room {
                        exceeded = true;
                        out.extend_from_slice(&slice[..room]);
                    } else {
                        out.extend_from_slice(slice);
                    }
                }
            } else {
                out.extend_from_slice(slice);
            }

            self.stream.consume(take);

            if newline_at.is_some() {
                break;
            }
        }

        Ok((out, exceeded))
    }
}

fn strip_crlf(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

fn classify_io_error(e: std::io::Error) -> SmtpError {
    if e.kind() == std::io::ErrorKind::ConnectionReset {
        SmtpError::ConnectionReset
    } else {
        SmtpError::Io(e)
    }
}
