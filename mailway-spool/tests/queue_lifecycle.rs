#![allow(clippy::unwrap_used)]

use std::time::Duration;

use tempfile::TempDir;
use tokio::fs;

use mailway_spool::{Envelope, QueueName, QueuePolicy, Record, Spool};

fn policy(retries: &[u64]) -> QueuePolicy {
    QueuePolicy {
        retries: retries.to_vec(),
        relock: Duration::from_secs(3600),
        archive: None,
    }
}

fn record(recipients: &[&str]) -> Record {
    Record {
        sender: "orders@shop.test".to_string(),
        recipients: recipients.iter().map(ToString::to_string).collect(),
        attempted: 0,
        origin: "postmaster@relay.test".to_string(),
    }
}

async fn stage(dir: &std::path::Path, id: &str, domain: &str, rec: &Record) -> std::path::PathBuf {
    let name = QueueName {
        id: id.to_string(),
        domain: domain.to_string(),
        schedule: 0,
    };
    fs::write(dir.join(name.content_name()), b"Subject: hi\r\n\r\nbody\r\n")
        .await
        .unwrap();
    Envelope::create(dir, &name, rec).await.unwrap()
}

#[tokio::test]
async fn future_schedule_is_left_untouched() {
    let tmp = TempDir::new().unwrap();
    let name = QueueName {
        id: "abc.def".to_string(),
        domain: "example.net".to_string(),
        schedule: u64::MAX / 2,
    };
    fs::write(tmp.path().join(name.content_name()), b"x").await.unwrap();
    let path = Envelope::create(tmp.path(), &name, &record(&["a@example.net"]))
        .await
        .unwrap();

    let loaded = Envelope::load(&path, Duration::from_secs(600)).await.unwrap();
    assert!(loaded.is_none());
    assert!(fs::metadata(&path).await.is_ok(), "file must not be renamed");
}

#[tokio::test]
async fn claim_renames_the_schedule_forward() {
    let tmp = TempDir::new().unwrap();
    let rec = record(&["a@example.net"]);
    let path = stage(tmp.path(), "abc.def", "example.net", &rec).await;

    let env = Envelope::load(&path, Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(env.sender, rec.sender);
    assert_eq!(env.pending(), rec.recipients.as_slice());
    assert_eq!(env.domain(), "example.net");

    // The original name is gone; the claimed one is in the future.
    assert!(fs::metadata(&path).await.is_err());
    let claimed = QueueName::parse(
        env.path().file_name().unwrap().to_str().unwrap(),
    )
    .unwrap();
    assert!(claimed.schedule > 0);
    assert_eq!(claimed.id, "abc.def");

    // Another scan finds it on hold.
    let again = Envelope::load(env.path(), Duration::from_secs(600))
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn missing_body_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let name = QueueName {
        id: "no.body".to_string(),
        domain: "example.net".to_string(),
        schedule: 0,
    };
    let path = Envelope::create(tmp.path(), &name, &record(&["a@example.net"]))
        .await
        .unwrap();
    assert!(Envelope::load(&path, Duration::ZERO).await.is_err());
}

#[tokio::test]
async fn transient_error_reschedules_with_backoff() {
    let tmp = TempDir::new().unwrap();
    let path = stage(tmp.path(), "t.one", "example.net", &record(&["a@example.net"])).await;
    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    env.record_error("", "connection refused", false);

    let bounces = env.flush(true, &policy(&[900, 1800])).await.unwrap();
    assert!(bounces.is_empty());

    let remaining = fs::read_dir(tmp.path()).await.unwrap();
    let mut entries = remaining;
    let mut env_name = None;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_str().unwrap().to_string();
        if name.ends_with(".env") {
            env_name = Some(QueueName::parse(&name).unwrap());
        }
    }
    let env_name = env_name.expect("rescheduled envelope present");
    assert!(env_name.schedule > 0, "schedule moved into the future");

    let back: Record =
        serde_json::from_slice(&fs::read(tmp.path().join(env_name.file_name())).await.unwrap())
            .unwrap();
    assert_eq!(back.attempted, 1);
}

#[tokio::test]
async fn fatal_error_bounces_everyone_and_retires() {
    let tmp = TempDir::new().unwrap();
    let path = stage(
        tmp.path(),
        "f.all",
        "example.net",
        &record(&["a@example.net", "b@example.net"]),
    )
    .await;
    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    let content = env.content_path().to_path_buf();
    env.record_error("", "554 no SMTP service here", true);

    let bounces = env.flush(true, &policy(&[900, 1800])).await.unwrap();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].recipients, vec!["a@example.net", "b@example.net"]);
    assert_eq!(bounces[0].error, "554 no SMTP service here");
    assert_eq!(bounces[0].sender, "orders@shop.test");

    // Envelope and body both removed.
    assert!(fs::metadata(&content).await.is_err());
    let mut entries = fs::read_dir(tmp.path()).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_budget_bounces_transient_failures() {
    let tmp = TempDir::new().unwrap();
    let path = stage(tmp.path(), "x.out", "example.net", &record(&["a@example.net"])).await;
    // One retry allowed; this flush is the second attempt.
    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    env.attempted = 1;
    env.record_error("", "connection timed out", false);

    let bounces = env.flush(true, &policy(&[900])).await.unwrap();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].error, "connection timed out");
}

#[tokio::test]
async fn exhausted_bounce_quotes_the_last_recipient_error() {
    let tmp = TempDir::new().unwrap();
    let path = stage(
        tmp.path(),
        "d.ord",
        "example.net",
        &record(&["a@example.net", "b@example.net"]),
    )
    .await;
    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    env.record_error("a@example.net", "451 greylisted, try later", false);
    env.record_error("b@example.net", "connection timed out", false);

    let bounces = env.flush(true, &policy(&[900])).await.unwrap();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].recipients, vec!["a@example.net", "b@example.net"]);
    // Recipient order decides which transient error is quoted.
    assert_eq!(bounces[0].error, "connection timed out");
}

#[tokio::test]
async fn per_recipient_rejection_bounces_only_that_recipient() {
    let tmp = TempDir::new().unwrap();
    let path = stage(
        tmp.path(),
        "p.one",
        "example.net",
        &record(&["good@example.net", "bad@example.net"]),
    )
    .await;
    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    env.record_error("bad@example.net", "550 no such user", true);
    env.delivered("good@example.net");

    let bounces = env.flush(true, &policy(&[900, 1800])).await.unwrap();
    assert_eq!(bounces.len(), 1);
    assert_eq!(bounces[0].recipients, vec!["bad@example.net"]);
    assert_eq!(bounces[0].error, "550 no such user");

    // Nothing left to deliver, so the queue is empty.
    let mut entries = fs::read_dir(tmp.path()).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
}

#[tokio::test]
async fn shared_body_survives_until_last_envelope_retires() {
    let tmp = TempDir::new().unwrap();
    let rec_a = record(&["a@alpha.test"]);
    let rec_b = record(&["b@beta.test"]);
    let path_a = stage(tmp.path(), "sh.ared", "alpha.test", &rec_a).await;
    let name_b = QueueName {
        id: "sh.ared".to_string(),
        domain: "beta.test".to_string(),
        schedule: 0,
    };
    let path_b = Envelope::create(tmp.path(), &name_b, &rec_b).await.unwrap();
    let body = tmp.path().join("sh.ared.msg");

    let mut env = Envelope::load(&path_a, Duration::ZERO).await.unwrap().unwrap();
    env.delivered("a@alpha.test");
    env.flush(true, &policy(&[900])).await.unwrap();
    assert!(fs::metadata(&body).await.is_ok(), "sibling still references body");

    let mut env = Envelope::load(&path_b, Duration::ZERO).await.unwrap().unwrap();
    env.delivered("b@beta.test");
    env.flush(true, &policy(&[900])).await.unwrap();
    assert!(fs::metadata(&body).await.is_err(), "last retirement removes body");
}

#[tokio::test]
async fn archive_keeps_terminal_files() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("archive");
    let path = stage(tmp.path(), "ar.one", "example.net", &record(&["a@example.net"])).await;

    let mut env = Envelope::load(&path, Duration::ZERO).await.unwrap().unwrap();
    env.delivered("a@example.net");
    let mut pol = policy(&[900]);
    pol.archive = Some(archive.clone());
    env.flush(true, &pol).await.unwrap();

    assert!(fs::metadata(archive.join("ar.one.msg")).await.is_ok());
}

#[tokio::test]
async fn commit_moves_staged_transactions_into_outbound() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.path());
    spool.ensure_layout().await.unwrap();

    let staging = spool.staging_dir("k9.zz1");
    fs::create_dir_all(&staging).await.unwrap();
    fs::write(staging.join("1@example.net@0.env"), b"{}").await.unwrap();
    fs::write(staging.join("1.msg"), b"body").await.unwrap();
    fs::write(staging.join("2@other.test@0.env"), b"{}").await.unwrap();
    fs::write(staging.join("2.msg"), b"body").await.unwrap();

    let committed = spool.commit("k9.zz1").await.unwrap();
    assert_eq!(committed, 2);
    assert!(fs::metadata(spool.outbound().join("k9.zz1.1@example.net@0.env"))
        .await
        .is_ok());
    assert!(fs::metadata(spool.outbound().join("k9.zz1.2.msg")).await.is_ok());
    assert!(fs::metadata(&staging).await.is_err(), "staging dir removed");

    // Committed names still parse, with the session id folded in.
    let parsed = QueueName::parse("k9.zz1.1@example.net@0.env").unwrap();
    assert_eq!(parsed.id, "k9.zz1.1");
}

#[tokio::test]
async fn discard_is_quiet_when_nothing_is_staged() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.path());
    spool.ensure_layout().await.unwrap();
    spool.discard("never-seen").await.unwrap();
}

#[tokio::test]
async fn scan_skips_unparseable_names() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.path());
    spool.ensure_layout().await.unwrap();
    fs::write(spool.outbound().join("good@x.test@0.env"), b"{}").await.unwrap();
    fs::write(spool.outbound().join("junk.env"), b"{}").await.unwrap();
    fs::write(spool.outbound().join("good.msg"), b"b").await.unwrap();

    let found = spool.scan().await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].to_str().unwrap().contains("good@x.test"));
}

#[tokio::test]
async fn orphan_sweep_removes_unreferenced_bodies() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.path());
    spool.ensure_layout().await.unwrap();
    fs::write(spool.outbound().join("kept@x.test@0.env"), b"{}").await.unwrap();
    fs::write(spool.outbound().join("kept.msg"), b"b").await.unwrap();
    fs::write(spool.outbound().join("orphan.msg"), b"b").await.unwrap();

    let swept = spool.sweep_orphans(None).await.unwrap();
    assert_eq!(swept, 1);
    assert!(fs::metadata(spool.outbound().join("kept.msg")).await.is_ok());
    assert!(fs::metadata(spool.outbound().join("orphan.msg")).await.is_err());
}
