//! On-disk layout of the mail spool.
//!
//! ```text
//! <root>/inbound/<session-id>/   per-session staging, one transaction
//!                                per sequence number
//! <root>/outbound/               committed envelopes and message bodies
//! ```
//!
//! Staged files use a transaction-local id (`<seq>@<domain>@0.env`,
//! `<seq>.msg`); commit renames them into `outbound/` under the
//! session's message id (`<id>.<seq>@…`), making acceptance a set of
//! atomic renames within one filesystem.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::envelope::QueueName;
use crate::error::Result;

/// Handle to the spool root directory.
#[derive(Debug, Clone)]
pub struct Spool {
    root: PathBuf,
}

impl Spool {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn inbound(&self) -> PathBuf {
        self.root.join("inbound")
    }

    #[must_use]
    pub fn outbound(&self) -> PathBuf {
        self.root.join("outbound")
    }

    /// Staging directory for one inbound session.
    #[must_use]
    pub fn staging_dir(&self, session: &str) -> PathBuf {
        self.inbound().join(session)
    }

    /// Create the spool directories when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when a directory cannot be created.
    pub async fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(self.inbound()).await?;
        fs::create_dir_all(self.outbound()).await?;
        Ok(())
    }

    /// Commit every transaction staged under `session` into the
    /// outbound queue, prefixing file names with the session id.
    /// Returns the number of envelopes committed. The staging
    /// directory is removed afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when a staged file cannot be moved into place.
    pub async fn commit(&self, session: &str) -> Result<usize> {
        let staging = self.staging_dir(session);
        let outbound = self.outbound();
        let mut committed = 0;

        let mut entries = match fs::read_dir(&staging).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Some(staged) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            let dest = outbound.join(format!("{session}.{staged}"));
            fs::rename(entry.path(), dest).await?;
            if staged.ends_with(".env") {
                committed += 1;
            }
        }
        fs::remove_dir(&staging).await?;
        debug!("Committed {committed} envelope(s) for {session}");
        Ok(committed)
    }

    /// Drop everything staged for `session` without committing.
    ///
    /// # Errors
    ///
    /// Returns an error when the staging directory cannot be removed.
    pub async fn discard(&self, session: &str) -> Result<()> {
        match fs::remove_dir_all(self.staging_dir(session)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All envelope files currently in the outbound queue, eligible or
    /// not. Files that do not parse as queue names are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue directory cannot be read.
    pub async fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let mut entries = fs::read_dir(self.outbound()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(".env")
            {
                if QueueName::parse(name).is_some() {
                    found.push(entry.path());
                } else {
                    warn!("Unparseable queue file: {name}");
                }
            }
        }
        Ok(found)
    }

    /// Remove (or archive) `.msg` files in the outbound queue that no
    /// envelope references any longer, e.g. after a crash between an
    /// envelope's retirement and its body's. Returns the number swept.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue cannot be read or a file
    /// cannot be removed.
    pub async fn sweep_orphans(&self, archive: Option<&Path>) -> Result<usize> {
        let outbound = self.outbound();
        let mut bodies = Vec::new();
        let mut referenced = ahash::AHashSet::new();

        let mut entries = fs::read_dir(&outbound).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".msg") {
                bodies.push((id.to_string(), entry.path()));
            } else if let Some(parsed) = QueueName::parse(&name) {
                referenced.insert(parsed.id);
            }
        }

        let mut swept = 0;
        for (id, path) in bodies {
            if !referenced.contains(&id) {
                warn!("Sweeping orphaned body: {id}.msg");
                crate::envelope::dispose(&path, archive).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}
