//! Delivery status notifications.
//!
//! A bounce is just another queued message: a fresh id suffixed `.0`,
//! a synthesized plain-text body with an excerpt of the original, and
//! an envelope addressed back at the original sender, scheduled
//! immediately. A bounce whose would-be recipient is our own origin
//! address is suppressed, so bounces never bounce.

use std::path::Path;

use tokio::fs;
use tracing::{debug, warn};

use mailway_common::address::{self, MessageId};
use mailway_spool::{BounceRequest, Envelope, QueueName, Record};

use crate::error::DeliveryError;

/// Lines of the original message quoted in the notification, capped
/// here or at the header/body separator, whichever comes first.
const EXCERPT_LINES: usize = 100;

/// Write the notification for `request` into the queue directory.
/// Returns the new message id, or `None` when the bounce is
/// suppressed. Partially written files are purged on failure.
///
/// # Errors
///
/// Returns an error when the message or envelope cannot be written.
pub async fn generate(
    queue: &Path,
    request: &BounceRequest,
) -> Result<Option<String>, DeliveryError> {
    if request.sender == request.origin {
        debug!("Suppressing bounce of a bounce for {}", request.origin);
        return Ok(None);
    }
    let Some(domain) = address::domain_of(&request.sender) else {
        warn!("CFGERR: bounce target has no domain: {}", request.sender);
        return Ok(None);
    };

    let id = MessageId::generate().bounce();
    let name = QueueName {
        id: id.clone(),
        domain: domain.to_string(),
        schedule: 0,
    };
    let message_path = queue.join(name.content_name());
    let envelope_path = queue.join(name.file_name());

    let written: Result<(), DeliveryError> = async {
        fs::write(&message_path, compose(request, &id).await?).await?;
        let record = Record {
            sender: request.origin.clone(),
            recipients: vec![request.sender.clone()],
            attempted: 0,
            origin: request.origin.clone(),
        };
        Envelope::create(queue, &name, &record).await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        warn!("Bounce for {} failed: {err}", request.sender);
        let _ = fs::remove_file(&message_path).await;
        let _ = fs::remove_file(&envelope_path).await;
        return Err(err);
    }
    debug!("Bounced {} recipient(s) to {}", request.recipients.len(), request.sender);
    Ok(Some(id))
}

async fn compose(request: &BounceRequest, id: &str) -> Result<Vec<u8>, DeliveryError> {
    let mut message = Vec::with_capacity(2048);
    let push = |message: &mut Vec<u8>, text: &str| message.extend_from_slice(text.as_bytes());

    push(&mut message, &format!("From: {}\r\n", request.origin));
    push(&mut message, &format!("To: {}\r\n", request.sender));
    push(&mut message, "Subject: Delivery Status Notification (Failure)\r\n");
    push(&mut message, &format!("Message-ID: <{id}>\r\n"));
    push(&mut message, &format!("Date: {}\r\n", chrono::Local::now().to_rfc2822()));
    push(&mut message, "Content-Type: text/plain; charset=ISO-8859-1\r\n");
    push(&mut message, "Content-Transfer-Encoding: quoted-printable\r\n\r\n");
    push(&mut message, "Delivery to the following recipient(s) failed:\r\n\r\n");
    for recipient in &request.recipients {
        push(&mut message, &format!("    {recipient}\r\n"));
    }
    push(
        &mut message,
        "\r\nWe have tried our best to deliver this message, unfortunately=\r\n\
         it didn't work.  The last error encountered was:\r\n\r\n",
    );
    push(&mut message, &format!("    {}\r\n\r\n", request.error));
    push(
        &mut message,
        "Please check if you have used the correct recipient address, or=\r\n\
         contact the other email provider for further information=\r\n\
         about the cause of this error.\r\n",
    );
    push(&mut message, "\r\n----- Original message -----\r\n\r\n");

    let original = fs::read(&request.content).await?;
    for line in original.split_inclusive(|byte| *byte == b'\n').take(EXCERPT_LINES) {
        if line == b"\r\n" {
            break;
        }
        message.extend_from_slice(line);
    }
    Ok(message)
}
