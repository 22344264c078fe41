//! One SMTP transaction against one candidate host.
//!
//! Failures are folded into the envelope's per-recipient error state
//! rather than propagated: a 5xx reply is recorded fatal, anything
//! else transient. Connection-level trouble before any recipient is
//! settled becomes a whole-transaction error so the next host (or the
//! next retry pass) gets another go.

use std::time::Duration;

use tracing::{debug, warn};

use mailway_smtp::{ClientError, SmtpClient};
use mailway_spool::Envelope;

use crate::dns::MailHost;

/// Per-operation deadline for the outbound dialogue.
const OP_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Attempt delivery of the envelope's pending recipients to one host.
///
/// Returns `true` when the host was reached and the dialogue counts as
/// a real attempt; `false` when the connection never came up.
pub async fn attempt_host(
    host: MailHost,
    envelope: &mut Envelope,
    body: &[u8],
    local_domain: &str,
) -> bool {
    let mut client = match SmtpClient::connect(host.ip, host.port, OP_DEADLINE).await {
        Ok(client) => client,
        Err(err) => {
            debug!("{}: connect failed: {err}", host.ip);
            envelope.record_error("", err.to_string(), err.is_permanent());
            return false;
        }
    };

    if let Err(err) = client.hello(local_domain).await {
        envelope.record_error("", err.to_string(), err.is_permanent());
        return true;
    }
    if let Err(err) = client.mail_from(&envelope.sender).await {
        envelope.record_error("", err.to_string(), err.is_permanent());
        return true;
    }

    let mut accepted = Vec::new();
    for recipient in envelope.pending().to_vec() {
        match client.rcpt_to(&recipient).await {
            Ok(_) => accepted.push(recipient),
            Err(err @ ClientError::Rejected(_)) => {
                debug!("{recipient}: rejected: {err}");
                envelope.record_error(&recipient, err.to_string(), err.is_permanent());
            }
            Err(err) => {
                // The dialogue itself broke; nothing on this host is settled.
                envelope.record_error("", err.to_string(), false);
                return true;
            }
        }
    }
    if accepted.is_empty() {
        let _ = client.quit().await;
        return true;
    }

    let outcome = async {
        client.data().await?;
        client.send_body(body).await
    }
    .await;
    match outcome {
        Ok(_) => {
            for recipient in accepted {
                debug!("Delivered to {recipient}");
                envelope.delivered(&recipient);
            }
            envelope.clear_transaction_error();
            let _ = client.quit().await;
            true
        }
        Err(err) => {
            warn!("{}: transaction failed: {err}", host.ip);
            envelope.record_error("", err.to_string(), err.is_permanent());
            true
        }
    }
}
