//! The contract an embedder implements to supply policy: acceptance,
//! storage, and authentication. See `spec.md` §4.5.
//!
//! Every hook has a default that returns a canonical success status, so an
//! embedder only overrides the hooks it cares about.

use async_trait::async_trait;

use crate::config::Config;
use crate::error::SmtpError;
use crate::model::{Envelope, ProxyInfo, Session};

/// Borrowed view of the owning server passed to every hook, per the
/// "hooks receive the Server by borrowed reference" design note.
pub struct ServerContext<'a> {
    pub config: &'a Config,
}

/// The polymorphic result a hook may produce, matching the `{Status, Lines,
/// Identity, Invalid, Unhandled}` variant described in `spec.md` §9. Most
/// hooks only ever produce `Status`; `handle_EHLO` and `handle_DATA` may
/// produce `Lines`; the `auth_<MECHANISM>` hooks produce `Identity`,
/// `Invalid`, or `Unhandled`.
pub enum HookOutcome {
    Status(String),
    Lines(Vec<String>),
    Identity(String),
    Invalid,
    Unhandled,
}

impl HookOutcome {
    pub fn status(s: impl Into<String>) -> Self {
        HookOutcome::Status(s.into())
    }
}

/// Embedder-supplied policy. All hooks are asynchronous; implementors that
/// have no I/O to perform can simply not override the default.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_helo(
        &self,
        _server: &ServerContext<'_>,
        session: &mut Session,
        _envelope: &mut Envelope,
        hostname: &str,
    ) -> HookOutcome {
        session.host_name = Some(hostname.to_string());
        HookOutcome::status(format!("250 {}", hostname))
    }

    /// `responses` is the core's planned EHLO reply lines (hostname line
    /// plus one per advertised extension); a hook may return a replacement
    /// list verbatim, which the dispatcher honors without re-wrapping.
    async fn handle_ehlo(
        &self,
        _server: &ServerContext<'_>,
        session: &mut Session,
        _envelope: &mut Envelope,
        hostname: &str,
        responses: Vec<String>,
    ) -> HookOutcome {
        session.host_name = Some(hostname.to_string());
        HookOutcome::Lines(responses)
    }

    async fn handle_mail(
        &self,
        _server: &ServerContext<'_>,
        envelope: &mut Envelope,
        address: &str,
        mail_options: &[String],
    ) -> HookOutcome {
        envelope.mail_from = Some(address.to_string());
        envelope.mail_options = mail_options.to_vec();
        HookOutcome::status("250 OK")
    }

    async fn handle_rcpt(
        &self,
        _server: &ServerContext<'_>,
        envelope: &mut Envelope,
        address: &str,
        rcpt_options: &[String],
    ) -> HookOutcome {
        envelope.rcpt_tos.push(address.to_string());
        envelope.rcpt_options.push(rcpt_options.to_vec());
        HookOutcome::status("250 OK")
    }

    /// In LMTP mode a complete implementation returns `HookOutcome::Lines`
    /// with one status per accepted recipient, in order.
    async fn handle_data(
        &self,
        _server: &ServerContext<'_>,
        _session: &mut Session,
        _envelope: &mut Envelope,
    ) -> HookOutcome {
        HookOutcome::status("250 OK: Message accepted for delivery")
    }

    async fn handle_rset(&self, _server: &ServerContext<'_>, _session: &mut Session) -> HookOutcome {
        HookOutcome::status("250 OK")
    }

    async fn handle_noop(&self, _server: &ServerContext<'_>) -> HookOutcome {
        HookOutcome::status("250 OK")
    }

    async fn handle_vrfy(&self, _server: &ServerContext<'_>, _argline: &str) -> HookOutcome {
        HookOutcome::status("252 Cannot VRFY user, but will accept message and attempt delivery")
    }

    async fn handle_quit(&self, _server: &ServerContext<'_>) -> HookOutcome {
        HookOutcome::status("221 Bye")
    }

    async fn handle_auth(&self, _server: &ServerContext<'_>, _session: &mut Session) -> HookOutcome {
        HookOutcome::status("235 2.7.0 Authentication successful")
    }

    /// Runs the credential check for mechanism `name` given the fields
    /// produced by that mechanism's `Mechanism::feed` (e.g. `[authzid,
    /// authcid, passwd]` for PLAIN). The default accepts no mechanism:
    /// `Unhandled` tells the dispatcher to fall back to `504`.
    async fn auth_mechanism(&self, _server: &ServerContext<'_>, _name: &str, _fields: &[String]) -> HookOutcome {
        HookOutcome::Unhandled
    }

    /// Synchronous gate evaluated before the TLS handshake begins.
    fn handle_starttls(&self, _server: &ServerContext<'_>, _session: &Session) -> bool {
        true
    }

    /// Synchronous; default close code is `421 Recv error: <error>`.
    fn handle_exception(&self, error: &SmtpError) -> String {
        format!("421 Recv error: {}", error)
    }

    /// Gate evaluated once a PROXY preamble has been parsed but before the
    /// banner is sent. A falsy return closes the connection without a banner.
    fn handle_proxy(&self, _session: &Session, _proxy_data: &ProxyInfo) -> bool {
        true
    }
}

/// A `Handler` that accepts every command with its default status, used
/// where no policy is needed beyond protocol conformance.
pub struct NullHandler;

#[async_trait]
impl Handler for NullHandler {}
