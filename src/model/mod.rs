//! The per-connection `Session` and per-transaction `Envelope` records, plus
//! the `ProxyInfo` structure produced by the PROXY protocol parser.
//!
//! These are plain data records: all policy lives in the handler, all
//! sequencing lives in the dispatcher. See `spec.md` §3.

use std::collections::HashMap;
use std::net::IpAddr;

/// TLS activation state of a `Session`. Monotonic: once `Active`, a session
/// never returns to `None` for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    None,
    Active,
}

/// Implementation-defined connection metadata exposed once `tls_state` is
/// `Active`. Handlers may use this for logging; the core never gates policy
/// on it beyond the `tls_state` flag itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. "TLSv1.3".
    pub protocol_version: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
    /// Whether the peer presented a client certificate.
    pub peer_certificate_present: bool,
}

/// PROXY protocol address family (`spec.md` §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

/// PROXY protocol transport (`spec.md` §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocolKind {
    Stream,
    Dgram,
    Unknown,
}

/// The structured result of parsing a PROXY v1/v2 preamble.
///
/// A failed or partial parse is represented with `valid = false` and an
/// `error` message rather than by the absence of a `ProxyInfo` -- the
/// dispatcher needs the (possibly partial) original-address data for
/// logging even when the header could not be trusted for policy.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub version: u8,
    pub command: ProxyCommand,
    pub family: ProxyFamily,
    pub protocol: ProxyProtocolKind,
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// Raw bytes that followed the parsed address block (v2 only; unparsed TLVs).
    pub rest_bytes: Vec<u8>,
    /// TLVs keyed by standard name (`ALPN`, `AUTHORITY`, ...) or `xNN` for
    /// unrecognized types, where `NN` is the hex byte.
    pub tlv: HashMap<String, Vec<u8>>,
    pub valid: bool,
    pub error: Option<String>,
}

/// The PROXY v2 command nibble: a real proxied connection vs. a health-check
/// probe that carries no useful address information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Local,
    Proxy,
}

impl ProxyInfo {
    /// Constructs an invalid/unparsed `ProxyInfo` carrying only an error message.
    pub fn invalid(error: impl Into<String>) -> Self {
        ProxyInfo {
            version: 0,
            command: ProxyCommand::Local,
            family: ProxyFamily::Unspec,
            protocol: ProxyProtocolKind::Unknown,
            src_addr: None,
            dst_addr: None,
            src_port: None,
            dst_port: None,
            rest_bytes: Vec::new(),
            tlv: HashMap::new(),
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Per-connection state, created at accept and destroyed at close.
#[derive(Debug, Clone)]
pub struct Session {
    /// Remote endpoint identifier (`host:port` or a UNIX socket path).
    pub peer: String,
    /// Value last accepted via HELO/EHLO/LHLO.
    pub host_name: Option<String>,
    /// True after a successful EHLO/LHLO.
    pub extended_smtp: bool,
    /// PROXY preamble data, if one was consumed for this connection.
    pub proxy_data: Option<ProxyInfo>,
    pub tls_state: TlsState,
    pub tls_info: Option<TlsInfo>,
    /// Opaque identity value returned by a successful AUTH.
    pub auth_identity: Option<String>,
    pub authenticated: bool,
    pub login_failed_count: u32,
}

impl Session {
    pub fn new(peer: impl Into<String>) -> Self {
        Session {
            peer: peer.into(),
            host_name: None,
            extended_smtp: false,
            proxy_data: None,
            tls_state: TlsState::None,
            tls_info: None,
            auth_identity: None,
            authenticated: false,
            login_failed_count: 0,
        }
    }

    /// Resets everything a STARTTLS upgrade must reset, preserving `peer`
    /// and `proxy_data` and marking TLS active.
    pub fn reset_for_starttls(&mut self, tls_info: TlsInfo) {
        self.host_name = None;
        self.extended_smtp = false;
        self.auth_identity = None;
        self.authenticated = false;
        self.login_failed_count = 0;
        self.tls_state = TlsState::Active;
        self.tls_info = Some(tls_info);
    }

    /// Best-effort host part of `peer`, for logging even when PROXY data is absent or invalid.
    pub fn peer_host(&self) -> &str {
        self.peer.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.peer)
    }

    /// Parsed IP address of `peer`, when it is a `host:port` pair with a
    /// numeric host (absent for UNIX socket paths).
    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_host().parse().ok()
    }

    /// Parsed port of `peer`, when it is a `host:port` pair.
    pub fn peer_port(&self) -> Option<u16> {
        self.peer.rsplit_once(':').and_then(|(_, port)| port.parse().ok())
    }
}

/// Per-transaction state: reset at connection start, at `MAIL` after a
/// completed/aborted transaction, and on `RSET`.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: Option<String>,
    pub mail_options: Vec<String>,
    pub rcpt_tos: Vec<String>,
    pub rcpt_options: Vec<Vec<String>>,
    /// Byte payload as received post dot-stuffing/CRLF normalization.
    pub content: Option<Vec<u8>>,
    /// Raw normalized bytes prior to any UTF-8 decoding offered to the handler.
    pub original_content: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mail_from.is_none() && self.rcpt_tos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_accessors_parse_host_and_port() {
        let session = Session::new("192.168.1.10:54321");
        assert_eq!(session.peer_host(), "192.168.1.10");
        assert_eq!(session.peer_ip(), Some("192.168.1.10".parse().unwrap()));
        assert_eq!(session.peer_port(), Some(54321));
    }

    #[test]
    fn peer_accessors_are_none_for_unix_socket_paths() {
        let session = Session::new("/var/run/smtp-core.sock");
        assert_eq!(session.peer_ip(), None);
        assert_eq!(session.peer_port(), None);
    }
}
