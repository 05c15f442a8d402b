//! The command dispatcher / state machine: recognizes commands, validates
//! sequencing, calls handler hooks, and emits reply lines. See `spec.md`
//! §4.4 for the full command table and reply text this module implements.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::auth::{builtin_mechanism, drive_exchange, ExchangeOutcome};
use crate::config::Config;
use crate::error::SmtpError;
use crate::handler::{Handler, HookOutcome, ServerContext};
use crate::model::{Envelope, Session, TlsInfo, TlsState};
use crate::proxy;
use crate::transport::LineTransport;

const IDENT: &str = concat!("smtp-core/", env!("CARGO_PKG_VERSION"));

fn ctx(config: &Config) -> ServerContext<'_> {
    ServerContext { config }
}

/// Logical state of a connection, collapsing the spec's `PRE_GREETING /
/// GREETED / HELO_DONE / EHLO_DONE` into `PreHelo` (none of those three
/// distinguish command legality) and folding `DATA_BODY` into the `DATA`
/// command handler rather than persisting it between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    PreHelo,
    PostHelo,
    AfterMail,
    AfterRcpt,
}

enum DispatchOutcome {
    Continue,
    Close,
}

/// Result of attempting a STARTTLS upgrade: on failure the connection and
/// its (possibly partially consumed) transport are simply dropped, per
/// "on failure, the connection is closed; no reply is sent."
enum StartTlsOutcome<IO> {
    Continue(Dispatcher<IO>),
    Closed,
}

/// One per accepted connection. Owns the Session, Envelope, and transport
/// exclusively; no two tasks ever touch the same instance.
pub struct Dispatcher<IO> {
    transport: LineTransport<IO>,
    session: Session,
    envelope: Envelope,
    state: ConnState,
    config: Arc<Config>,
    handler: Arc<dyn Handler>,
    tls_acceptor: Option<Arc<TlsAcceptor>>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> Dispatcher<IO> {
    pub fn new(
        io: IO,
        peer: impl Into<String>,
        config: Arc<Config>,
        handler: Arc<dyn Handler>,
        tls_acceptor: Option<Arc<TlsAcceptor>>,
    ) -> Self {
        let transport = LineTransport::new(io, config.line_length_limit, config.data_size_limit);
        Dispatcher {
            transport,
            session: Session::new(peer),
            envelope: Envelope::new(),
            state: ConnState::PreHelo,
            config,
            handler,
            tls_acceptor,
        }
    }

    /// Constructs a dispatcher whose transport is already TLS-active, for
    /// implicit-TLS (SMTPS) listeners.
    pub fn new_tls(
        session: Session,
        transport: LineTransport<IO>,
        config: Arc<Config>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Dispatcher {
            transport,
            session,
            envelope: Envelope::new(),
            state: ConnState::PreHelo,
            config,
            handler,
            tls_acceptor: None,
        }
    }

    /// Runs the connection to completion: PROXY preamble (if configured),
    /// banner, then the command loop until QUIT, a transport error, or an
    /// idle timeout.
    pub async fn run(mut self) -> Result<(), SmtpError>
    where
        IO: 'static,
    {
        if self.config.proxy_protocol_timeout_secs > 0 {
            match self.consume_proxy_preamble().await {
                Ok(true) => {}
                Ok(false) | Err(_) => return Ok(()),
            }
        }

        let banner = format!("220 {} {}", self.config.server_hostname, IDENT);
        self.transport.write_line(&banner).await?;

        loop {
            let line = match self
                .transport
                .read_command_line_timeout(Duration::from_secs(self.config.command_timeout_secs))
                .await
            {
                Ok(line) => line,
                Err(SmtpError::Timeout) => {
                    let _ = self
                        .transport
                        .write_line("421 Timeout waiting for data from client.")
                        .await;
                    return Ok(());
                }
                Err(SmtpError::Eof) | Err(SmtpError::ConnectionReset) => return Ok(()),
                Err(e) if !e.is_fatal() => {
                    self.transport.write_line("500 5.5.6 line too long").await?;
                    continue;
                }
                Err(other) => {
                    let status = self.handler.handle_exception(&other);
                    let _ = self.transport.write_line(&status).await;
                    return Ok(());
                }
            };

            if line.trim().is_empty() {
                self.transport.write_line("500 Error: bad syntax").await?;
                continue;
            }

            let (verb, argline) = split_command(&line);

            if !self.gate_allows(&verb) {
                self.transport
                    .write_line("530 5.7.0 Authentication required")
                    .await?;
                continue;
            }

            if matches!(verb.as_str(), "MAIL" | "RCPT" | "DATA" | "AUTH" | "STARTTLS")
                && !self.command_allowed(&verb)
            {
                self.transport.write_line(bad_sequence_message(&verb)).await?;
                continue;
            }

            if verb == "STARTTLS" {
                match Self::cmd_starttls(self, argline).await? {
                    StartTlsOutcome::Continue(new_self) => {
                        self = new_self;
                        continue;
                    }
                    StartTlsOutcome::Closed => return Ok(()),
                }
            }

            match self.dispatch(&verb, argline).await? {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Close => return Ok(()),
            }
        }
    }

    fn gate_allows(&self, verb: &str) -> bool {
        if self.config.require_starttls && self.session.tls_state == TlsState::None {
            let allowed = matches!(verb, "EHLO" | "NOOP" | "RSET" | "STARTTLS" | "QUIT" | "HELP");
            if !allowed {
                return false;
            }
        }
        if self.config.auth_required && !self.session.authenticated {
            let allowed = matches!(
                verb,
                "AUTH" | "EHLO" | "HELO" | "LHLO" | "NOOP" | "RSET" | "STARTTLS" | "QUIT" | "HELP"
            );
            if !allowed {
                return false;
            }
        }
        true
    }

    fn command_allowed(&self, verb: &str) -> bool {
        match verb {
            "MAIL" => self.state == ConnState::PostHelo,
            "RCPT" => matches!(self.state, ConnState::AfterMail | ConnState::AfterRcpt),
            "DATA" => self.state == ConnState::AfterRcpt,
            "AUTH" => self.state == ConnState::PostHelo,
            "STARTTLS" => matches!(
                self.state,
                ConnState::PostHelo | ConnState::AfterMail | ConnState::AfterRcpt
            ),
            _ => true,
        }
    }

    async fn dispatch(&mut self, verb: &str, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        match verb {
            "HELO" => self.cmd_helo(argline).await,
            "EHLO" => self.cmd_ehlo(argline).await,
            "LHLO" => self.cmd_lhlo(argline).await,
            "MAIL" => self.cmd_mail(argline).await,
            "RCPT" => self.cmd_rcpt(argline).await,
            "DATA" => self.cmd_data().await,
            "RSET" => self.cmd_rset().await,
            "NOOP" => self.cmd_noop().await,
            "HELP" => self.cmd_help().await,
            "VRFY" => self.cmd_vrfy(argline).await,
            "EXPN" => self.cmd_expn(argline).await,
            "AUTH" => self.cmd_auth(argline).await,
            "QUIT" => self.cmd_quit(argline).await,
            _ => {
                self.transport
                    .write_line("500 Error: command not recognized")
                    .await?;
                Ok(DispatchOutcome::Continue)
            }
        }
    }

    async fn cmd_helo(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        if self.config.lmtp_mode {
            self.transport
                .write_line(r#"500 Error: command "HELO" not recognized"#)
                .await?;
            return Ok(DispatchOutcome::Continue);
        }
        let hostname = argline.trim();
        if hostname.is_empty() {
            self.transport.write_line("501 Syntax: HELO hostname").await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.envelope = Envelope::new();
        let outcome = self
            .handler
            .handle_helo(&ctx(&self.config), &mut self.session, &mut self.envelope, hostname)
            .await;
        self.finish_greeting(outcome, false).await
    }

    async fn cmd_ehlo(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        if self.config.lmtp_mode {
            self.transport
                .write_line(r#"500 Error: command "EHLO" not recognized"#)
                .await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.ehlo_common(argline).await
    }

    async fn cmd_lhlo(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        if !self.config.lmtp_mode {
            self.transport
                .write_line(r#"500 Error: command "LHLO" not recognized"#)
                .await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.ehlo_common(argline).await
    }

    async fn ehlo_common(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        let hostname = argline.trim();
        if hostname.is_empty() {
            self.transport.write_line("501 Syntax: EHLO hostname").await?;
            return Ok(DispatchOutcome::Continue);
        }
        self.envelope = Envelope::new();
        let lines = self.build_ehlo_lines();
        let outcome = self
            .handler
            .handle_ehlo(&ctx(&self.config), &mut self.session, &mut self.envelope, hostname, lines)
            .await;
        self.finish_greeting(outcome, true).await
    }

    async fn finish_greeting(&mut self, outcome: HookOutcome, extended: bool) -> Result<DispatchOutcome, SmtpError> {
        let (lines, success) = match outcome {
            HookOutcome::Status(s) => {
                let ok = s.starts_with('2');
                (vec![s], ok)
            }
            HookOutcome::Lines(lines) => {
                let ok = lines.first().is_some_and(|l| l.starts_with('2'));
                (lines, ok)
            }
            _ => (vec!["500 Internal: unexpected hook result".to_string()], false),
        };
        self.transport.write_reply(&lines).await?;
        if success {
            self.session.extended_smtp = extended;
            self.state = ConnState::PostHelo;
        }
        Ok(DispatchOutcome::Continue)
    }

    fn build_ehlo_lines(&self) -> Vec<String> {
        let mut body = vec![self.config.server_hostname.clone()];
        body.push(format!("SIZE {}", self.config.data_size_limit));
        if self.config.enable_8bitmime {
            body.push("8BITMIME".to_string());
        }
        if self.config.enable_smtputf8 {
            body.push("SMTPUTF8".to_string());
        }
        let mechs = self.advertised_mechanisms();
        if !mechs.is_empty() {
            body.push(format!("AUTH {}", mechs.join(" ")));
        }
        if self.tls_acceptor.is_some() && self.session.tls_state == TlsState::None {
            body.push("STARTTLS".to_string());
        }
        body.push("HELP".to_string());

        let last = body.len() - 1;
        body.into_iter()
            .enumerate()
            .map(|(i, text)| if i == last { format!("250 {}", text) } else { format!("250-{}", text) })
            .collect()
    }

    fn advertised_mechanisms(&self) -> Vec<&'static str> {
        if self.config.auth_require_tls && self.session.tls_state == TlsState::None {
            return Vec::new();
        }
        ["LOGIN", "PLAIN"]
            .into_iter()
            .filter(|m| !self.config.auth_exclude_mechanism.iter().any(|e| e == m))
            .collect()
    }

    async fn write_simple_outcome(&mut self, outcome: HookOutcome) -> Result<bool, SmtpError> {
        match outcome {
            HookOutcome::Status(s) => {
                let ok = s.starts_with('2');
                self.transport.write_line(&s).await?;
                Ok(ok)
            }
            HookOutcome::Lines(lines) => {
                let ok = lines.first().is_some_and(|l| l.starts_with('2'));
                self.transport.write_reply(&lines).await?;
                Ok(ok)
            }
            _ => {
                self.transport
                    .write_line("500 Internal: unexpected hook result")
                    .await?;
                Ok(false)
            }
        }
    }

    async fn cmd_mail(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        let (address, params) = match parse_path_params(argline, "FROM:") {
            Some(v) => v,
            None => {
                self.transport
                    .write_line("501 Syntax error in MAIL FROM parameters")
                    .await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        if !self.session.extended_smtp && !params.is_empty() {
            self.transport
                .write_line("555 MAIL FROM parameters not allowed without EHLO")
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        for param in &params {
            let name = param.split('=').next().unwrap_or("").to_ascii_uppercase();
            match name.as_str() {
                "SIZE" => {
                    let value = param.splitn(2, '=').nth(1).unwrap_or("");
                    match value.parse::<u64>() {
                        Ok(n) if n > self.config.data_size_limit as u64 => {
                            self.transport
                                .write_line("552 Error: message exceeds fixed maximum message size")
                                .await?;
                            return Ok(DispatchOutcome::Continue);
                        }
                        Ok(_) => {}
                        Err(_) => {
                            self.transport
                                .write_line("501 Syntax error in SIZE parameter")
                                .await?;
                            return Ok(DispatchOutcome::Continue);
                        }
                    }
                }
                "BODY" | "AUTH" => {}
                "SMTPUTF8" if self.config.enable_smtputf8 => {}
                _ => {
                    self.transport.write_line("555 Unsupported option").await?;
                    return Ok(DispatchOutcome::Continue);
                }
            }
        }

        self.envelope = Envelope::new();
        let outcome = self
            .handler
            .handle_mail(&ctx(&self.config), &mut self.envelope, &address, &params)
            .await;
        self.write_simple_outcome(outcome).await?;
        if self.envelope.mail_from.is_some() {
            self.state = ConnState::AfterMail;
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_rcpt(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        let (address, params) = match parse_path_params(argline, "TO:") {
            Some(v) => v,
            None => {
                self.transport
                    .write_line("501 Syntax error in RCPT TO parameters")
                    .await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        if !self.session.extended_smtp && !params.is_empty() {
            self.transport
                .write_line("555 RCPT TO parameters not allowed without EHLO")
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        for param in &params {
            let name = param.split('=').next().unwrap_or("").to_ascii_uppercase();
            if !matches!(name.as_str(), "SIZE" | "BODY" | "SMTPUTF8" | "AUTH" | "NOTIFY" | "ORCPT") {
                self.transport.write_line("555 Unsupported option").await?;
                return Ok(DispatchOutcome::Continue);
            }
        }

        let before = self.envelope.rcpt_tos.len();
        let outcome = self
            .handler
            .handle_rcpt(&ctx(&self.config), &mut self.envelope, &address, &params)
            .await;
        self.write_simple_outcome(outcome).await?;
        if self.envelope.rcpt_tos.len() > before {
            self.state = ConnState::AfterRcpt;
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_data(&mut self) -> Result<DispatchOutcome, SmtpError> {
        self.transport
            .write_line("354 Start mail input; end with <CRLF>.<CRLF>")
            .await?;

        let content = match self
            .transport
            .read_data_block_timeout(Duration::from_secs(self.config.command_timeout_secs))
            .await
        {
            Ok(content) => content,
            Err(SmtpError::DataTooLarge) => {
                self.transport.write_line("552 Error: Too much mail data").await?;
                self.envelope = Envelope::new();
                self.state = ConnState::PostHelo;
                return Ok(DispatchOutcome::Continue);
            }
            Err(SmtpError::Timeout) => {
                let _ = self
                    .transport
                    .write_line("421 Timeout waiting for data from client.")
                    .await;
                return Ok(DispatchOutcome::Close);
            }
            Err(e) => return Err(e),
        };

        self.envelope.original_content = Some(content.clone());
        self.envelope.content = Some(content);

        let outcome = self
            .handler
            .handle_data(&ctx(&self.config), &mut self.session, &mut self.envelope)
            .await;

        match outcome {
            HookOutcome::Lines(statuses) if self.config.lmtp_mode => {
                let needed = self.envelope.rcpt_tos.len();
                let mut statuses = statuses;
                while statuses.len() < needed {
                    statuses.push("500 Internal: missing LMTP response".to_string());
                }
                let recipients = self.envelope.rcpt_tos.clone();
                for (addr, status) in recipients.iter().zip(statuses.iter()) {
                    self.transport.write_line(&format_recipient_status(status, addr)).await?;
                }
            }
            HookOutcome::Status(s) => {
                self.transport.write_line(&s).await?;
            }
            HookOutcome::Lines(lines) => {
                self.transport.write_reply(&lines).await?;
            }
            _ => {
                self.transport
                    .write_line("500 Internal: unexpected hook result")
                    .await?;
            }
        }

        self.envelope = Envelope::new();
        self.state = ConnState::PostHelo;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_rset(&mut self) -> Result<DispatchOutcome, SmtpError> {
        let outcome = self.handler.handle_rset(&ctx(&self.config), &mut self.session).await;
        self.envelope = Envelope::new();
        self.state = if self.session.host_name.is_some() {
            ConnState::PostHelo
        } else {
            ConnState::PreHelo
        };
        self.write_simple_outcome(outcome).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_noop(&mut self) -> Result<DispatchOutcome, SmtpError> {
        let outcome = self.handler.handle_noop(&ctx(&self.config)).await;
        self.write_simple_outcome(outcome).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_help(&mut self) -> Result<DispatchOutcome, SmtpError> {
        self.transport
            .write_line("214 2.0.0 See RFC 5321 and RFC 2033 for command syntax")
            .await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_vrfy(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        let outcome = self.handler.handle_vrfy(&ctx(&self.config), argline).await;
        self.write_simple_outcome(outcome).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_expn(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        let outcome = self.handler.handle_vrfy(&ctx(&self.config), argline).await;
        self.write_simple_outcome(outcome).await?;
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_quit(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        if !argline.trim().is_empty() {
            self.transport.write_line("501 Syntax: QUIT").await?;
            return Ok(DispatchOutcome::Continue);
        }
        let outcome = self.handler.handle_quit(&ctx(&self.config)).await;
        self.write_simple_outcome(outcome).await?;
        Ok(DispatchOutcome::Close)
    }

    async fn cmd_auth(&mut self, argline: &str) -> Result<DispatchOutcome, SmtpError> {
        if self.session.authenticated {
            self.transport.write_line("503 Already authenticated").await?;
            return Ok(DispatchOutcome::Continue);
        }
        if self.config.auth_require_tls && self.session.tls_state != TlsState::Active {
            self.transport
                .write_line("538 5.7.11 Encryption required for requested authentication mechanism")
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        let mut parts = argline.split_whitespace();
        let name = match parts.next() {
            Some(name) => name.to_ascii_uppercase(),
            None => {
                self.transport.write_line("501 Syntax: AUTH mechanism").await?;
                return Ok(DispatchOutcome::Continue);
            }
        };
        let initial_response = parts.next();

        if self.config.auth_exclude_mechanism.iter().any(|m| m == &name) {
            self.transport
                .write_line("504 5.5.4 Unrecognized authentication type")
                .await?;
            return Ok(DispatchOutcome::Continue);
        }

        let mut mechanism = match builtin_mechanism(&name) {
            Some(m) => m,
            None => {
                self.transport
                    .write_line("504 5.5.4 Unrecognized authentication type")
                    .await?;
                return Ok(DispatchOutcome::Continue);
            }
        };

        let outcome = drive_exchange(&mut self.transport, mechanism.as_mut(), initial_response).await?;
        match outcome {
            ExchangeOutcome::Aborted => {
                self.transport.write_line("501 Auth aborted").await?;
            }
            ExchangeOutcome::Malformed => {
                self.transport.write_line("501 5.5.2 Invalid base64 data").await?;
            }
            ExchangeOutcome::Completed(fields) => {
                let verdict = self
                    .handler
                    .auth_mechanism(&ctx(&self.config), &name, &fields)
                    .await;
                match verdict {
                    HookOutcome::Identity(identity) => {
                        self.session.authenticated = true;
                        self.session.auth_identity = Some(identity);
                        let greeting = self.handler.handle_auth(&ctx(&self.config), &mut self.session).await;
                        self.write_simple_outcome(greeting).await?;
                    }
                    HookOutcome::Invalid | HookOutcome::Unhandled => {
                        self.session.login_failed_count += 1;
                        if self.session.login_failed_count >= self.config.auth_max_attempts {
                            let _ = self
                                .transport
                                .write_line("421 4.7.0 Too many authentication failures")
                                .await;
                            return Ok(DispatchOutcome::Close);
                        }
                        self.transport
                            .write_line("535 5.7.8 Authentication credentials invalid")
                            .await?;
                    }
                    _ => {
                        self.transport
                            .write_line("500 Internal: unexpected hook result")
                            .await?;
                    }
                }
            }
        }
        Ok(DispatchOutcome::Continue)
    }

    async fn cmd_starttls(mut self, argline: &str) -> Result<StartTlsOutcome<IO>, SmtpError>
    where
        IO: 'static,
    {
        if !argline.trim().is_empty() {
            self.transport.write_line("501 Syntax: STARTTLS").await?;
            return Ok(StartTlsOutcome::Continue(self));
        }
        if self.session.tls_state == TlsState::Active {
            self.transport.write_line("503 5.5.1 Already using TLS").await?;
            return Ok(StartTlsOutcome::Continue(self));
        }
        let acceptor = match self.tls_acceptor.clone() {
            Some(acceptor) => acceptor,
            None => {
                self.transport
                    .write_line("454 TLS not available due to temporary reason")
                    .await?;
                return Ok(StartTlsOutcome::Continue(self));
            }
        };
        if !self.handler.handle_starttls(&ctx(&self.config), &self.session) {
            self.transport
                .write_line("454 TLS not available due to temporary reason")
                .await?;
            return Ok(StartTlsOutcome::Continue(self));
        }

        self.transport.write_line("220 Ready to start TLS").await?;

        let new_transport = match self.transport.upgrade_tls(&acceptor).await {
            Ok(t) => t,
            Err(_) => return Ok(StartTlsOutcome::Closed),
        };

        let tls_info = new_transport.tls_info().unwrap_or(TlsInfo {
            protocol_version: "unknown".to_string(),
            cipher_suite: "unknown".to_string(),
            peer_certificate_present: false,
        });

        let mut dispatcher = Dispatcher {
            transport: new_transport,
            session: self.session,
            envelope: Envelope::new(),
            state: ConnState::PreHelo,
            config: self.config,
            handler: self.handler,
            tls_acceptor: self.tls_acceptor,
        };
        dispatcher.session.reset_for_starttls(tls_info);

        Ok(StartTlsOutcome::Continue(dispatcher))
    }

    async fn consume_proxy_preamble(&mut self) -> Result<bool, SmtpError> {
        let timeout = Duration::from_secs(self.config.proxy_protocol_timeout_secs);
        let head = self.transport.peek_preamble(256, timeout).await?;

        if proxy::looks_like_v2(&head) {
            if head.len() < 16 {
                return Ok(false);
            }
            let len = u16::from_be_bytes([head[14], head[15]]) as usize;
            let total = 16 + len;
            let full = if head.len() >= total {
                head
            } else {
                self.transport.peek_preamble(total, timeout).await?
            };
            if full.len() < total {
                return Ok(false);
            }
            let info = proxy::parse_v2(&full[..total]);
            self.transport.consume_preamble(total);
            if !info.valid {
                return Ok(false);
            }
            self.session.proxy_data = Some(info.clone());
            Ok(self.handler.handle_proxy(&self.session, &info))
        } else if proxy::looks_like_v1(&head) {
            let nl = match head.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => return Ok(false),
            };
            let line = String::from_utf8_lossy(&head[..nl]);
            let line = line.trim_end_matches('\r');
            let info = proxy::parse_v1(line);
            self.transport.consume_preamble(nl + 1);
            if !info.valid {
                return Ok(false);
            }
            self.session.proxy_data = Some(info.clone());
            Ok(self.handler.handle_proxy(&self.session, &info))
        } else {
            Ok(false)
        }
    }
}

fn bad_sequence_message(verb: &str) -> &'static str {
    match verb {
        "MAIL" => "503 Error: send HELO first",
        "RCPT" => "503 Error: need MAIL command",
        "DATA" => "503 Error: need RCPT command",
        "AUTH" => "503 Error: send HELO first",
        "STARTTLS" => "503 Error: send HELO first",
        _ => "503 Error: bad sequence of commands",
    }
}

fn split_command(line: &str) -> (String, &str) {
    match line.find(' ') {
        Some(idx) => (line[..idx].to_ascii_uppercase(), line[idx + 1..].trim_start()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

/// Parses `FROM:<addr> PARAM=VAL ...` / `TO:<addr> PARAM=VAL ...`, tolerating
/// a bracket-less address (some clients omit them for the null path).
fn parse_path_params(argline: &str, prefix: &str) -> Option<(String, Vec<String>)> {
    let trimmed = argline.trim_start();
    if trimmed.len() < prefix.len() || !trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = trimmed[prefix.len()..].trim_start();

    let (address, remainder) = if let Some(start) = rest.find('<') {
        let end = rest[start..].find('>')? + start;
        (rest[start + 1..end].to_string(), rest[end + 1..].trim_start())
    } else {
        match rest.find(' ') {
            Some(idx) => (rest[..idx].to_string(), rest[idx + 1..].trim_start()),
            None => (rest.to_string(), ""),
        }
    };

    let params = remainder.split_whitespace().map(|s| s.to_string()).collect();
    Some((address, params))
}

/// Formats a handler-provided LMTP per-recipient status (e.g. `"250 OK"`)
/// into the wire form `"250 2.1.5 <addr> OK"`.
fn format_recipient_status(status: &str, addr: &str) -> String {
    let mut parts = status.splitn(2, ' ');
    let code = parts.next().unwrap_or("250");
    let rest = parts.next().unwrap_or("OK");
    let enhanced = match code.chars().next() {
        Some('2') => "2.1.5",
        Some('4') => "4.3.0",
        _ => "5.3.0",
    };
    format!("{} {} <{}> {}", code, enhanced, addr, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NullHandler;
    use async_trait::async_trait;
    use base64::Engine as _;
    use tokio::io::{duplex, AsyncWriteExt};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            auth_require_tls: false,
            ..Config::default()
        })
    }

    async fn run_script(config: Arc<Config>, handler: Arc<dyn Handler>, script: &[u8]) -> Vec<u8> {
        let (mut client, server) = duplex(1 << 16);
        let dispatcher = Dispatcher::new(server, "127.0.0.1:12345", config, handler, None);
        let run = tokio::spawn(dispatcher.run());
        client.write_all(script).await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        use tokio::io::AsyncReadExt;
        client.read_to_end(&mut out).await.unwrap();
        run.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn scenario_1_full_transaction() {
        let out = run_script(
            test_config(),
            Arc::new(NullHandler),
            b"EHLO example.org\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@y>\r\nDATA\r\nHello\r\n.\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("220 "));
        assert!(text.contains("250-localhost"));
        assert!(text.contains("354 Start mail input"));
        assert!(text.contains("250 OK: Message accepted for delivery"));
        assert!(text.contains("221 Bye"));
    }

    #[tokio::test]
    async fn scenario_2_helo_rejects_esmtp_params() {
        let out = run_script(
            test_config(),
            Arc::new(NullHandler),
            b"HELO foo\r\nMAIL FROM:<a@x> BODY=8BITMIME\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("250 foo"));
        assert!(text.contains("555 "));
    }

    #[tokio::test]
    async fn scenario_3_size_over_limit() {
        let config = Arc::new(Config {
            data_size_limit: 1_048_576,
            auth_require_tls: false,
            ..Config::default()
        });
        let out = run_script(
            config,
            Arc::new(NullHandler),
            b"EHLO foo\r\nMAIL FROM:<a@x> SIZE=999999999\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("552 "));
    }

    #[tokio::test]
    async fn scenario_4_data_without_rcpt() {
        let out = run_script(test_config(), Arc::new(NullHandler), b"EHLO foo\r\nDATA\r\nQUIT\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("503 Error: need RCPT command"));
    }

    struct LmtpTwoStatusHandler;

    #[async_trait]
    impl Handler for LmtpTwoStatusHandler {
        async fn handle_data(
            &self,
            _server: &ServerContext<'_>,
            _session: &mut Session,
            _envelope: &mut Envelope,
        ) -> HookOutcome {
            HookOutcome::Lines(vec!["250 OK".to_string(), "450 try later".to_string()])
        }
    }

    #[tokio::test]
    async fn scenario_6_lmtp_per_recipient_statuses() {
        let config = Arc::new(Config {
            lmtp_mode: true,
            auth_require_tls: false,
            ..Config::default()
        });
        let out = run_script(
            config,
            Arc::new(LmtpTwoStatusHandler),
            b"LHLO foo\r\nMAIL FROM:<a@x>\r\nRCPT TO:<r1>\r\nRCPT TO:<r2>\r\nDATA\r\nbody\r\n.\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("250 2.1.5 <r1> OK"));
        assert!(text.contains("450 4.3.0 <r2> try later"));
    }

    #[tokio::test]
    async fn auth_required_blocks_mail_before_login() {
        let config = Arc::new(Config {
            auth_required: true,
            auth_require_tls: false,
            ..Config::default()
        });
        let out = run_script(
            config,
            Arc::new(NullHandler),
            b"EHLO foo\r\nMAIL FROM:<a@x>\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("530 5.7.0 Authentication required"));
    }

    #[tokio::test]
    async fn ehlo_omits_auth_when_require_tls_and_plaintext() {
        let config = Arc::new(Config {
            auth_require_tls: true,
            ..Config::default()
        });
        let out = run_script(config, Arc::new(NullHandler), b"EHLO foo\r\nQUIT\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("AUTH "));
    }

    struct CredentialHandler;

    #[async_trait]
    impl Handler for CredentialHandler {
        async fn auth_mechanism(&self, _server: &ServerContext<'_>, _name: &str, fields: &[String]) -> HookOutcome {
            if fields.get(1).map(String::as_str) == Some("user") && fields.get(2).map(String::as_str) == Some("pass")
            {
                HookOutcome::Identity("user".to_string())
            } else {
                HookOutcome::Invalid
            }
        }
    }

    #[tokio::test]
    async fn auth_plain_success_calls_handle_auth() {
        let initial = base64::engine::general_purpose::STANDARD.encode(b"\0user\0pass");
        let script = format!("EHLO foo\r\nAUTH PLAIN {}\r\nQUIT\r\n", initial);
        let out = run_script(test_config(), Arc::new(CredentialHandler), script.as_bytes()).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("235 2.7.0 Authentication successful"));
    }

    #[tokio::test]
    async fn auth_unrecognized_mechanism_returns_504() {
        let out = run_script(test_config(), Arc::new(NullHandler), b"EHLO foo\r\nAUTH BOGUS\r\nQUIT\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("504 5.5.4"));
    }

    #[tokio::test]
    async fn auth_excluded_mechanism_returns_504() {
        let config = Arc::new(Config {
            auth_require_tls: false,
            auth_exclude_mechanism: vec!["PLAIN".to_string()],
            ..Config::default()
        });
        let out = run_script(config, Arc::new(NullHandler), b"EHLO foo\r\nAUTH PLAIN\r\nQUIT\r\n").await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("504 5.5.4"));
    }

    #[tokio::test]
    async fn auth_requires_tls_returns_538() {
        let out = run_script(
            Arc::new(Config::default()),
            Arc::new(NullHandler),
            b"EHLO foo\r\nAUTH PLAIN\r\nQUIT\r\n",
        )
        .await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("538 5.7.11"));
    }

    #[tokio::test]
    async fn auth_failures_increment_login_failed_count_then_close() {
        let config = Arc::new(Config {
            auth_require_tls: false,
            auth_max_attempts: 2,
            ..Config::default()
        });
        let bad = base64::engine::general_purpose::STANDARD.encode(b"\0bob\0wrong");
        let script = format!("EHLO foo\r\nAUTH PLAIN {bad}\r\nAUTH PLAIN {bad}\r\nQUIT\r\n");
        let out = run_script(config, Arc::new(NullHandler), script.as_bytes()).await;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("535 5.7.8"));
        assert!(text.contains("421 4.7.0"));
        assert!(!text.contains("221 Bye"));
    }

    #[tokio::test]
    async fn starttls_upgrade_resets_session_and_reencrypts_traffic() {
        rustls::crypto::aws_lc_rs::default_provider().install_default().ok();

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_der = cert.der().clone();
        let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der());

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], rustls::pki_types::PrivateKeyDer::Pkcs8(key_der))
            .unwrap();
        let acceptor = Arc::new(TlsAcceptor::from(Arc::new(server_config)));

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert_der).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let (client_io, server_io) = duplex(1 << 16);
        let dispatcher = Dispatcher::new(server_io, "127.0.0.1:12345", test_config(), Arc::new(NullHandler), Some(acceptor));
        let run = tokio::spawn(dispatcher.run());

        let mut reader = tokio::io::BufReader::new(client_io);

        async fn read_line(reader: &mut (impl tokio::io::AsyncBufRead + Unpin)) -> String {
            use tokio::io::AsyncBufReadExt;
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            line
        }

        assert!(read_line(&mut reader).await.starts_with("220 "));

        {
            use tokio::io::AsyncWriteExt;
            reader.get_mut().write_all(b"EHLO client.example\r\n").await.unwrap();
        }
        loop {
            let line = read_line(&mut reader).await;
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        {
            use tokio::io::AsyncWriteExt;
            reader.get_mut().write_all(b"STARTTLS\r\n").await.unwrap();
        }
        assert!(read_line(&mut reader).await.starts_with("220 Ready to start TLS"));

        let client_plain = reader.into_inner();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap().to_owned();
        let mut client_tls = connector.connect(server_name, client_plain).await.unwrap();

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_tls.write_all(b"EHLO client.example\r\n").await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client_tls.read(&mut buf).await.unwrap();
        let post_upgrade_ehlo = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(post_upgrade_ehlo.starts_with("250-"));
        assert!(!post_upgrade_ehlo.contains("STARTTLS"));

        client_tls.write_all(b"QUIT\r\n").await.unwrap();
        let n = client_tls.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("221 Bye"));

        run.await.unwrap().unwrap();
    }
}
