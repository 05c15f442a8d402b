//! Typed errors for conditions the dispatcher must discriminate on.
//!
//! Protocol-level outcomes (syntax errors, bad sequencing, auth failure) are
//! represented as plain reply strings per the SMTP reply grammar -- they are
//! normal dispatcher outcomes, not exceptions. `SmtpError` exists for the
//! transport-level conditions that do need typed matching: resource limits,
//! idle/handshake timeouts, and connection loss.

use thiserror::Error;

/// Errors surfaced by the line transport and TLS upgrade machinery.
#[derive(Error, Debug)]
pub enum SmtpError {
    /// A command line exceeded `line_length_limit` before a CRLF was seen.
    #[error("line too long")]
    LineTooLong,

    /// A DATA block exceeded `data_size_limit`.
    #[error("too much mail data")]
    DataTooLarge,

    /// No bytes arrived within the configured idle timeout.
    #[error("timeout waiting for data from client")]
    Timeout,

    /// The peer closed or reset the connection mid-read.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The peer closed the connection cleanly (EOF) mid-read.
    #[error("unexpected end of stream")]
    Eof,

    /// The TLS handshake (STARTTLS upgrade or implicit TLS on accept) failed.
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmtpError {
    /// True for conditions after which the connection cannot continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SmtpError::LineTooLong | SmtpError::DataTooLarge)
    }
}

pub type Result<T> = std::result::Result<T, SmtpError>;
