//! The AUTH (RFC 4954) SASL exchange engine.
//!
//! A [`Mechanism`] is a small state machine rather than a coroutine: `start`
//! produces the first challenge (if any), and `feed` consumes one Base64
//! client line at a time until it reports [`MechanismEvent::Complete`] with
//! the credential fields to hand to the embedder's `auth_<MECHANISM>` hook.
//! See `spec.md` §4.3 and the co-routine note in §9.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::SmtpError;
use crate::transport::LineTransport;
use tokio::io::{AsyncRead, AsyncWrite};

/// One step of a mechanism's state machine.
pub enum MechanismEvent {
    /// Send `334 <challenge>` and read one more client line.
    Challenge(String),
    /// The exchange is complete; these are the decoded fields to pass to the
    /// matching `auth_<MECHANISM>` handler hook.
    Complete(Vec<String>),
}

/// Why a mechanism rejected a client line outright (before even reaching the
/// handler's credential check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismError {
    MalformedBase64,
}

/// A pluggable SASL mechanism. Built-ins are [`PlainMechanism`] and
/// [`LoginMechanism`]; an embedder may register others under different
/// names via its own `auth_<NAME>` hook plus a `Mechanism` impl.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Produces the first step. `initial_response` is the Base64 blob that
    /// followed the mechanism name on the `AUTH` command line, if any.
    fn start(&mut self, initial_response: Option<&str>) -> Result<MechanismEvent, MechanismError>;

    /// Feeds one decoded client line (the caller has already handled `*`
    /// abort and overall framing; `line` is still Base64-encoded).
    fn feed(&mut self, line: &str) -> Result<MechanismEvent, MechanismError>;
}

/// `AUTH PLAIN`: a single response of `authzid \0 authcid \0 passwd`.
#[derive(Default)]
pub struct PlainMechanism;

impl Mechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn start(&mut self, initial_response: Option<&str>) -> Result<MechanismEvent, MechanismError> {
        match initial_response {
            Some(resp) => self.feed(resp),
            None => Ok(MechanismEvent::Challenge(String::new())),
        }
    }

    fn feed(&mut self, line: &str) -> Result<MechanismEvent, MechanismError> {
        let decoded = decode_b64(line)?;
        let parts: Vec<&[u8]> = decoded.splitn(3, |&b| b == 0).collect();
        let [authzid, authcid, passwd] = parts.as_slice() else {
            return Err(MechanismError::MalformedBase64);
        };
        Ok(MechanismEvent::Complete(vec![
            String::from_utf8_lossy(authzid).into_owned(),
            String::from_utf8_lossy(authcid).into_owned(),
            String::from_utf8_lossy(passwd).into_owned(),
        ]))
    }
}

/// `AUTH LOGIN`: server prompts `Username:` then `Password:`, each answered
/// with a Base64-encoded displayable string.
#[derive(Default)]
pub struct LoginMechanism {
    username: Option<String>,
}

impl Mechanism for LoginMechanism {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn start(&mut self, initial_response: Option<&str>) -> Result<MechanismEvent, MechanismError> {
        match initial_response {
            Some(resp) => {
                let username = decode_b64_str(resp)?;
                self.username = Some(username);
                Ok(MechanismEvent::Challenge(BASE64.encode("Password:")))
            }
            None => Ok(MechanismEvent::Challenge(BASE64.encode("Username:"))),
        }
    }

    fn feed(&mut self, line: &str) -> Result<MechanismEvent, MechanismError> {
        if self.username.is_none() {
            self.username = Some(decode_b64_str(line)?);
            return Ok(MechanismEvent::Challenge(BASE64.encode("Password:")));
        }
        let password = decode_b64_str(line)?;
        let username = self.username.take().unwrap_or_default();
        Ok(MechanismEvent::Complete(vec![username, password]))
    }
}

fn decode_b64(line: &str) -> Result<Vec<u8>, MechanismError> {
    BASE64
        .decode(line.trim())
        .map_err(|_| MechanismError::MalformedBase64)
}

fn decode_b64_str(line: &str) -> Result<String, MechanismError> {
    let bytes = decode_b64(line)?;
    String::from_utf8(bytes).map_err(|_| MechanismError::MalformedBase64)
}

/// Outcome of driving a full mechanism exchange over the wire, before the
/// handler's credential check runs.
pub enum ExchangeOutcome {
    /// The mechanism finished; these fields go to `auth_<MECHANISM>`.
    Completed(Vec<String>),
    /// The client sent a lone `*`.
    Aborted,
    /// A client line failed to Base64-decode.
    Malformed,
}

/// Drives `mechanism` to completion over `transport`, writing `334`
/// challenge lines and reading client responses. Does not itself write the
/// terminal `235`/`535` reply; the caller does that once the handler's
/// credential check has run.
pub async fn drive_exchange<IO: AsyncRead + AsyncWrite + Unpin>(
    transport: &mut LineTransport<IO>,
    mechanism: &mut dyn Mechanism,
    initial_response: Option<&str>,
) -> Result<ExchangeOutcome, SmtpError> {
    let mut event = match mechanism.start(initial_response) {
        Ok(event) => event,
        Err(MechanismError::MalformedBase64) => return Ok(ExchangeOutcome::Malformed),
    };

    loop {
        match event {
            MechanismEvent::Complete(fields) => return Ok(ExchangeOutcome::Completed(fields)),
            MechanismEvent::Challenge(challenge) => {
                transport.write_line(&format!("334 {}", challenge)).await?;
                let line = transport.read_command_line().await?;
                if line.trim() == "*" {
                    return Ok(ExchangeOutcome::Aborted);
                }
                event = match mechanism.feed(&line) {
                    Ok(event) => event,
                    Err(MechanismError::MalformedBase64) => return Ok(ExchangeOutcome::Malformed),
                };
            }
        }
    }
}

/// Constructs the built-in mechanism named `name` (case-insensitive), if any.
pub fn builtin_mechanism(name: &str) -> Option<Box<dyn Mechanism>> {
    match name.to_ascii_uppercase().as_str() {
        "PLAIN" => Some(Box::new(PlainMechanism)),
        "LOGIN" => Some(Box::new(LoginMechanism::default())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn plain_decodes_three_fields() {
        let mut mech = PlainMechanism;
        let resp = BASE64.encode(b"authz\0user\0pass");
        let event = mech.feed(&resp).unwrap();
        match event {
            MechanismEvent::Complete(fields) => {
                assert_eq!(fields, vec!["authz".to_string(), "user".to_string(), "pass".to_string()])
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn plain_rejects_malformed_base64() {
        let mut mech = PlainMechanism;
        assert_eq!(mech.feed("not base64!!!").unwrap_err(), MechanismError::MalformedBase64);
    }

    #[test]
    fn login_prompts_then_completes() {
        let mut mech = LoginMechanism::default();
        match mech.start(None).unwrap() {
            MechanismEvent::Challenge(c) => assert_eq!(c, BASE64.encode("Username:")),
            _ => panic!("expected Challenge"),
        }
        match mech.feed(&BASE64.encode("alice")).unwrap() {
            MechanismEvent::Challenge(c) => assert_eq!(c, BASE64.encode("Password:")),
            _ => panic!("expected Challenge"),
        }
        match mech.feed(&BASE64.encode("hunter2")).unwrap() {
            MechanismEvent::Complete(fields) => {
                assert_eq!(fields, vec!["alice".to_string(), "hunter2".to_string()])
            }
            _ => panic!("expected Complete"),
        }
    }

    #[tokio::test]
    async fn drive_exchange_aborts_on_star() {
        let (mut client, server) = duplex(4096);
        let mut transport = LineTransport::new(server, 1001, 1024);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"*\r\n").await.unwrap();
        });
        let mut mech = LoginMechanism::default();
        let outcome = drive_exchange(&mut transport, &mut mech, None).await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Aborted));
    }

    #[tokio::test]
    async fn drive_exchange_completes_plain_with_initial_response() {
        let (_client, server) = duplex(4096);
        let mut transport = LineTransport::new(server, 1001, 1024);
        let mut mech = PlainMechanism;
        let initial = BASE64.encode(b"\0user\0pass");
        let outcome = drive_exchange(&mut transport, &mut mech, Some(&initial)).await.unwrap();
        match outcome {
            ExchangeOutcome::Completed(fields) => {
                assert_eq!(fields, vec!["".to_string(), "user".to_string(), "pass".to_string()])
            }
            _ => panic!("expected Completed"),
        }
    }
}
