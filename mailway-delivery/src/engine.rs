//! The queue sweeper: finds eligible envelopes, drives deliveries under
//! a bounded worker pool, and turns definitive failures into bounces.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::fs;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use mailway_common::address;
use mailway_common::config::Config;
use mailway_spool::{dispose, Envelope, QueueName, QueuePolicy, Spool};

use crate::dns::Resolver;
use crate::error::DeliveryError;
use crate::{bounce, transaction};

/// Continuous outbound delivery over one spool.
pub struct DeliveryEngine {
    spool: Spool,
    resolver: Resolver,
    /// Smart-host mode when non-empty: these replace MX resolution.
    gateways: Vec<String>,
    policy: QueuePolicy,
    /// Envelopes older than this are purged without notification.
    expiration: Duration,
    scan_interval: Duration,
    /// Caps concurrent delivery tasks.
    slots: Arc<Semaphore>,
}

impl DeliveryEngine {
    /// # Errors
    ///
    /// Returns an error when the DNS resolver cannot be initialized.
    pub fn new(config: &Config, spool: Spool) -> Result<Self, DeliveryError> {
        Ok(Self {
            spool,
            resolver: Resolver::new()?,
            gateways: config.gateways.clone(),
            policy: QueuePolicy {
                retries: config.retries.clone(),
                relock: config.relock(),
                archive: config.archive.clone(),
            },
            expiration: config.expiration(),
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            slots: Arc::new(Semaphore::new(config.max_deliveries)),
        })
    }

    /// Sweep the queue forever at the configured interval.
    pub async fn run(self) {
        let engine = Arc::new(self);
        info!(
            "Delivery engine started (interval {}s, horizon {}s)",
            engine.scan_interval.as_secs(),
            engine.expiration.as_secs()
        );
        let mut ticker = tokio::time::interval(engine.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = engine.sweep().await {
                warn!("RUNERR: queue sweep failed: {err}");
            }
        }
    }

    /// One pass over the queue: purge the expired, dispatch the
    /// eligible, and collect orphaned bodies.
    ///
    /// # Errors
    ///
    /// Returns an error when the queue directory cannot be read or the
    /// orphan sweep fails; per-envelope failures only log.
    pub async fn sweep(self: &Arc<Self>) -> Result<(), DeliveryError> {
        let now = epoch_now();
        let found = self.spool.scan().await?;
        debug!("Queue sweep: {} envelope(s)", found.len());

        let mut tasks = Vec::new();
        for path in found {
            let Some(name) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(QueueName::parse)
            else {
                continue;
            };
            if self.expired(&name, now) {
                warn!("Purging expired envelope: {}", name.file_name());
                if let Err(err) = dispose(&path, self.policy.archive.as_deref()).await {
                    warn!("RUNERR: {err}");
                }
                continue;
            }
            if name.schedule > now {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                break;
            };
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                engine.deliver_one(&path).await;
                drop(permit);
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        self.spool
            .sweep_orphans(self.policy.archive.as_deref())
            .await?;
        Ok(())
    }

    fn expired(&self, name: &QueueName, now: u64) -> bool {
        address::created_epoch(&name.id)
            .is_some_and(|created| now.saturating_sub(created) > self.expiration.as_secs())
    }

    /// Claim, attempt, and flush one envelope. Every failure is folded
    /// into the envelope; nothing escalates past the log.
    async fn deliver_one(&self, path: &Path) {
        let mut envelope = match Envelope::load(path, self.policy.relock).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(err) => {
                warn!("RUNERR: {err}");
                return;
            }
        };
        debug!(
            "Delivering {} to {} ({} pending)",
            envelope.id(),
            envelope.domain(),
            envelope.pending().len()
        );

        let made_attempt = self.attempt(&mut envelope).await;
        let queue = self.spool.outbound();
        match envelope.flush(made_attempt, &self.policy).await {
            Ok(requests) => {
                for request in requests {
                    if let Err(err) = bounce::generate(&queue, &request).await {
                        warn!("RUNERR: {err}");
                    }
                }
            }
            Err(err) => warn!("RUNERR: {err}"),
        }
    }

    /// Resolve hosts and run transactions until nothing is pending or
    /// the candidates run out. Returns whether any host was reached.
    async fn attempt(&self, envelope: &mut Envelope) -> bool {
        let hosts = if self.gateways.is_empty() {
            self.resolver.mail_hosts(envelope.domain()).await
        } else {
            self.resolver.gateway_hosts(&self.gateways).await
        };
        let hosts = match hosts {
            Ok(hosts) => hosts,
            Err(err) => {
                envelope.record_error("", err.to_string(), err.is_permanent());
                return false;
            }
        };

        let body = match fs::read(envelope.content_path()).await {
            Ok(body) => body,
            Err(err) => {
                // The body vanished under us; nothing can be sent.
                envelope.record_error("", err.to_string(), true);
                return false;
            }
        };

        let local_domain = address::domain_of(&envelope.origin)
            .unwrap_or("localhost")
            .to_string();
        let mut reached = false;
        for host in hosts {
            if envelope.pending().is_empty() {
                break;
            }
            if transaction::attempt_host(host, envelope, &body, &local_domain).await {
                reached = true;
            }
        }
        reached
    }
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
