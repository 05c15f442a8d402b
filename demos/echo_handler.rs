//! A minimal `Handler` wired into the demo binary: accepts every recipient
//! and logs the envelope once DATA completes. Not a shipped reference
//! handler, just enough policy for the binary to be runnable.

use async_trait::async_trait;
use log::info;

use smtp_core::handler::{Handler, HookOutcome, ServerContext};
use smtp_core::model::{Envelope, Session};

#[derive(Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle_data(
        &self,
        _server: &ServerContext<'_>,
        session: &mut Session,
        envelope: &mut Envelope,
    ) -> HookOutcome {
        let bytes = envelope.content.as_ref().map(Vec::len).unwrap_or(0);
        info!(
            "accepted message from {:?} to {:?} ({} bytes) via {}",
            envelope.mail_from, envelope.rcpt_tos, bytes, session.peer
        );
        HookOutcome::status("250 OK: Message accepted for delivery")
    }
}
