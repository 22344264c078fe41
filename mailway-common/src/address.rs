//! Address normalization and queue message identifiers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::base36;

/// Identifier for a submission or bounce in the queue.
///
/// Format: `<base36 epoch-seconds>.<base36 microseconds><base36 entropy>`.
/// The creation time of any queue file is recoverable from the portion
/// before the first dot, which drives queue expiration. Committed
/// submissions carry a numeric transaction suffix (`.1`, `.2`, ...);
/// bounce-generated messages are suffixed `.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh identifier from the current wall clock.
    #[must_use]
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let micros = u64::from(now.subsec_micros());
        let entropy = rand::rng().random_range(0..1024u64);
        Self(format!(
            "{}.{}{}",
            base36::encode(now.as_secs()),
            base36::encode(micros),
            base36::encode(entropy)
        ))
    }

    /// Identifier for a bounce message derived from this id.
    #[must_use]
    pub fn bounce(&self) -> String {
        format!("{}.0", self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decode the creation time (epoch seconds) embedded in a queue id.
///
/// Works for plain ids as well as suffixed forms like `abc123.1`.
#[must_use]
pub fn created_epoch(id: &str) -> Option<u64> {
    let secs = id.split('.').next()?;
    base36::decode(secs)
}

/// Split an SMTP command parameter of the form `FROM:<user@Example.COM>`
/// into its verb and a normalized address.
///
/// The verb is upper-cased; angle brackets are optional; only the domain
/// part of the address is case-folded. Returns `None` when the parameter
/// carries no `:` separator at all.
#[must_use]
pub fn normalize(param: &str) -> Option<(String, String)> {
    let (verb, rest) = param.split_once(':')?;
    let verb = verb.trim().to_ascii_uppercase();

    let rest = rest.rsplit_once('<').map_or(rest, |(_, tail)| tail);
    let addr = rest.split_once('>').map_or(rest, |(head, _)| head).trim();

    let addr = match addr.split_once('@') {
        Some((local, domain)) if !domain.is_empty() => {
            format!("{local}@{}", domain.to_ascii_lowercase())
        }
        _ => addr.split('@').next().unwrap_or_default().to_string(),
    };
    Some((verb, addr))
}

/// The domain part of an address, if it has one.
#[must_use]
pub fn domain_of(addr: &str) -> Option<&str> {
    match addr.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => Some(domain),
        _ => None,
    }
}
