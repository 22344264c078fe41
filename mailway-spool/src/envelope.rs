//! The persistent transfer unit of the queue.
//!
//! Identity and scheduling live in the file name, not the file body:
//! `<id>@<domain>@<base36 epoch-seconds>.env`, paired with `<id>.msg`
//! holding the message body. The body may be shared by several
//! envelopes split per destination domain at submission time.
//!
//! Claiming an eligible envelope atomically renames it to a name
//! encoding `now + lock`; rename exclusivity is the only mutual
//! exclusion in the queue, so two concurrent scans can never both
//! process the same file. A crash after the claim simply leaves the
//! envelope to become eligible again when the lock window elapses
//! (at-least-once, not exactly-once).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use mailway_common::base36;

use crate::error::{Result, SpoolError};

/// The persisted envelope fields, exactly as serialized to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "Sender")]
    pub sender: String,
    #[serde(rename = "Recipients")]
    pub recipients: Vec<String>,
    #[serde(rename = "Attempted")]
    pub attempted: u32,
    #[serde(rename = "Origin")]
    pub origin: String,
}

/// Parsed form of an envelope file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueName {
    pub id: String,
    pub domain: String,
    /// Epoch seconds before which the envelope is not eligible.
    pub schedule: u64,
}

impl QueueName {
    /// Parse `<id>@<domain>@<base36>.env`. The id may contain dots but
    /// never `@`.
    #[must_use]
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".env")?;
        let mut parts = stem.split('@');
        let (id, domain, stamp) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || id.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self {
            id: id.to_string(),
            domain: domain.to_string(),
            schedule: base36::decode(stamp)?,
        })
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}@{}@{}.env", self.id, self.domain, base36::encode(self.schedule))
    }

    #[must_use]
    pub fn content_name(&self) -> String {
        format!("{}.msg", self.id)
    }
}

/// A tagged delivery error for one recipient, or for the transaction as
/// a whole (empty recipient key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryNote {
    pub message: String,
    /// Permanent: no further retry will be made for this target.
    pub fatal: bool,
}

/// What the flush step wants bounced. Produced as data so the bounce
/// generator stays out of the queue model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceRequest {
    /// Recipients that definitively failed.
    pub recipients: Vec<String>,
    /// The last error encountered for them.
    pub error: String,
    /// Original sender; the bounce is addressed here.
    pub sender: String,
    /// Administrative return address of this hop.
    pub origin: String,
    /// Original message body, for the excerpt.
    pub content: PathBuf,
}

/// Scheduling policy the flush step applies.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    /// Backoff schedule in seconds; its length is the attempt budget.
    pub retries: Vec<u64>,
    /// Re-lock window for claims and soft passes.
    pub relock: Duration,
    /// Archive directory for terminal files, instead of deletion.
    pub archive: Option<PathBuf>,
}

/// A loaded, claimed envelope.
#[derive(Debug)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
    pub attempted: u32,
    pub origin: String,
    name: QueueName,
    path: PathBuf,
    content: PathBuf,
    errors: AHashMap<String, DeliveryNote>,
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Remove a file, or move it into the archive directory when one is
/// configured. A file that is already gone is not an error. Every
/// terminal disposition in the queue goes through here so the archive
/// switch is honored uniformly.
///
/// # Errors
///
/// Returns an error when the file cannot be removed or moved.
pub async fn dispose(path: &Path, archive: Option<&Path>) -> Result<()> {
    let outcome = if let Some(dir) = archive {
        fs::create_dir_all(dir).await?;
        let dest = dir.join(path.file_name().unwrap_or_default());
        fs::rename(path, dest).await
    } else {
        fs::remove_file(path).await
    };
    match outcome {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Envelope {
    /// Write a fresh envelope record into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be serialized or written.
    pub async fn create(dir: &Path, name: &QueueName, record: &Record) -> Result<PathBuf> {
        let path = dir.join(name.file_name());
        fs::write(&path, serde_json::to_vec(record)?).await?;
        Ok(path)
    }

    /// Load an envelope file, claiming it for `lock` when eligible.
    ///
    /// Returns `Ok(None)` without touching the file when its embedded
    /// schedule is still in the future. An eligible load verifies the
    /// paired body file exists, decodes the record, and (for a non-zero
    /// `lock`) atomically renames the file to encode `now + lock`, so
    /// any concurrent scan skips it until the window elapses.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed names, missing content, or I/O
    /// and decode failures.
    pub async fn load(path: &Path, lock: Duration) -> Result<Option<Self>> {
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| SpoolError::InvalidName(path.display().to_string()))?;
        let mut name = QueueName::parse(file_name)
            .ok_or_else(|| SpoolError::InvalidName(file_name.to_string()))?;

        let now = epoch_now();
        if name.schedule > now {
            debug!("On hold: {file_name}");
            return Ok(None);
        }

        let content = path.with_file_name(name.content_name());
        if fs::metadata(&content).await.is_err() {
            return Err(SpoolError::MissingContent(content));
        }

        let record: Record = serde_json::from_slice(&fs::read(path).await?)?;

        let path = if lock.is_zero() {
            path.to_path_buf()
        } else {
            name.schedule = now + lock.as_secs();
            let claimed = path.with_file_name(name.file_name());
            fs::rename(path, &claimed).await?;
            claimed
        };

        Ok(Some(Self {
            sender: record.sender,
            recipients: record.recipients,
            attempted: record.attempted,
            origin: record.origin,
            name,
            path,
            content,
            errors: AHashMap::new(),
        }))
    }

    /// Destination domain, as encoded in the file name.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.name.domain
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.name.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shared message body file.
    #[must_use]
    pub fn content_path(&self) -> &Path {
        &self.content
    }

    /// Recipients still awaiting delivery.
    #[must_use]
    pub fn pending(&self) -> &[String] {
        &self.recipients
    }

    /// Record a delivery error for one recipient, or for the whole
    /// transaction when `recipient` is empty.
    pub fn record_error(&mut self, recipient: &str, message: impl Into<String>, fatal: bool) {
        self.errors.insert(
            recipient.to_string(),
            DeliveryNote {
                message: message.into(),
                fatal,
            },
        );
    }

    /// Drop a previously recorded whole-transaction error, after a
    /// later host accepted the mail.
    pub fn clear_transaction_error(&mut self) {
        self.errors.remove("");
    }

    /// Mark one recipient as delivered: removed from the pending set
    /// together with any error recorded against it.
    pub fn delivered(&mut self, recipient: &str) {
        self.recipients.retain(|pending| pending != recipient);
        self.errors.remove(recipient);
    }

    fn record(&self) -> Record {
        Record {
            sender: self.sender.clone(),
            recipients: self.recipients.clone(),
            attempted: self.attempted,
            origin: self.origin.clone(),
        }
    }

    fn bounce_request(&self, recipients: Vec<String>, error: String) -> BounceRequest {
        BounceRequest {
            recipients,
            error,
            sender: self.sender.clone(),
            origin: self.origin.clone(),
            content: self.content.clone(),
        }
    }

    /// Terminal step after a delivery pass.
    ///
    /// `final_attempt` marks a real attempt (backoff indexed by the
    /// attempt counter); a soft pass reschedules by the re-lock window
    /// instead. Fatal errors and an exhausted retry budget turn into
    /// [`BounceRequest`]s; surviving recipients are rewritten under a
    /// new schedule; an emptied envelope is retired, along with its
    /// body once no sibling envelope references it.
    ///
    /// # Errors
    ///
    /// Returns an error when the rewritten or retired files cannot be
    /// managed on disk.
    pub async fn flush(
        mut self,
        final_attempt: bool,
        policy: &QueuePolicy,
    ) -> Result<Vec<BounceRequest>> {
        if final_attempt {
            self.attempted += 1;
        }
        let exhausted = self.attempted as usize >= policy.retries.len();
        let mut bounces = Vec::new();

        if let Some(note) = self.errors.get("").cloned() {
            if note.fatal || exhausted {
                let failed = std::mem::take(&mut self.recipients);
                if !failed.is_empty() {
                    bounces.push(self.bounce_request(failed, note.message));
                }
            }
            // A transient whole-transaction error within budget leaves
            // the recipient set intact for the next attempt.
        } else {
            let mut fatal_notes: Vec<(String, String)> = Vec::new();
            let mut last_transient: Option<String> = None;
            // Walk in stored recipient order so the quoted error is
            // stable across runs.
            for recipient in &self.recipients {
                let Some(note) = self.errors.get(recipient) else {
                    continue;
                };
                if note.fatal {
                    fatal_notes.push((recipient.clone(), note.message.clone()));
                } else {
                    last_transient = Some(note.message.clone());
                }
            }
            for (recipient, message) in fatal_notes {
                self.recipients.retain(|pending| *pending != recipient);
                bounces.push(self.bounce_request(vec![recipient], message));
            }
            if exhausted && !self.recipients.is_empty() {
                let error =
                    last_transient.unwrap_or_else(|| "Retry limit exceeded".to_string());
                let failed = std::mem::take(&mut self.recipients);
                bounces.push(self.bounce_request(failed, error));
            }
        }

        if self.recipients.is_empty() {
            self.retire(policy).await?;
        } else {
            let delay = if final_attempt {
                let index = (self.attempted.max(1) as usize - 1).min(policy.retries.len() - 1);
                policy.retries[index]
            } else {
                policy.relock.as_secs()
            };
            self.reschedule(delay).await?;
        }

        Ok(bounces)
    }

    /// Rewrite the envelope under a schedule `delay` seconds out and
    /// remove the old file.
    async fn reschedule(mut self, delay: u64) -> Result<()> {
        let old = self.path.clone();
        self.name.schedule = epoch_now() + delay;
        let next = old.with_file_name(self.name.file_name());
        fs::write(&next, serde_json::to_vec(&self.record())?).await?;
        fs::remove_file(&old).await?;
        debug!(
            "Rescheduled {} (+{delay}s, attempt {})",
            self.name.id, self.attempted
        );
        Ok(())
    }

    /// Remove (or archive) the envelope; the body follows once no other
    /// envelope in the directory still references it.
    async fn retire(self, policy: &QueuePolicy) -> Result<()> {
        let dir = self
            .path
            .parent()
            .map_or_else(PathBuf::new, Path::to_path_buf);
        dispose(&self.path, policy.archive.as_deref()).await?;

        let prefix = format!("{}@", self.name.id);
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(sibling) = entry.file_name().to_str()
                && sibling.starts_with(&prefix)
                && sibling.ends_with(".env")
            {
                return Ok(());
            }
        }
        dispose(&self.content, policy.archive.as_deref()).await?;
        debug!("Retired {}", self.name.id);
        Ok(())
    }
}
