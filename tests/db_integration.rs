//! PostgreSQL-backed integration tests.
//!
//! Gated on `TEST_DATABASE_URL`; without it every test prints a skip
//! note and passes. Run single-threaded, since each test truncates the
//! shared tables:
//!
//! ```bash
//! TEST_DATABASE_URL=postgres://... cargo test --test db_integration -- --test-threads=1
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use xrfcore::db::ConnectTokenRecord;
use xrfcore::db::{
    make_owner_for_write, Database, QuantSummary, RoiRecord, UserGroupRecord, QUANT_OBJECT_TYPE,
};
use xrfcore::elector;
use xrfcore::jobs::JobTracker;
use xrfcore::notify::{LogMailer, NotificationRouter};
use xrfcore::now_unix;
use xrfcore::sessions::{Principal, SessionRegistry};
use xrfcore::wire::{
    JobState, JobStatusMsg, QuantCreateParams, QuantParams, Update, UserNotification, WsMessage,
};

macro_rules! require_db {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("Skipping: TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

async fn clean_db(url: &str) -> Database {
    let db = Database::connect(url).await.expect("test db unreachable");
    db.ensure_schema().await.expect("schema");
    for table in [
        "job_statuses",
        "ownership",
        "user_groups",
        "users",
        "notifications",
        "connect_tokens",
        "job_handlers",
        "quant_summaries",
        "rois",
    ] {
        sqlx::query(&format!("TRUNCATE TABLE {}", table))
            .execute(db.pool())
            .await
            .expect("truncate");
    }
    db
}

fn map_params(name: &str, scan_id: &str, elements: &[&str]) -> QuantCreateParams {
    QuantCreateParams {
        command: "map".to_string(),
        name: name.to_string(),
        scan_id: scan_id.to_string(),
        elements: elements.iter().map(|e| e.to_string()).collect(),
        detector_config: "PIXL/v7".to_string(),
        parameters: String::new(),
        run_time_sec: 60,
        pmcs: vec![1, -1, 3],
        roi_ids: Vec::new(),
        include_dwells: false,
        quant_mode: "Combined".to_string(),
    }
}

fn token(id: &str, user_id: &str, expiry: i64) -> ConnectTokenRecord {
    ConnectTokenRecord {
        id: id.to_string(),
        expiry_unix_sec: expiry,
        user_id: user_id.to_string(),
        user_name: "Test User".to_string(),
        email: format!("{}@example.com", user_id),
        permissions: vec!["read:data".to_string()],
    }
}

#[tokio::test]
async fn connect_token_is_single_use() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    db.create_connect_token(&token("tok1", "u1", now + 10), now)
        .await
        .unwrap();

    let first = db.consume_connect_token("tok1", now).await.unwrap();
    assert_eq!(first.unwrap().user_id, "u1");
    let second = db.consume_connect_token("tok1", now).await.unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn expired_connect_token_is_rejected_and_swept() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    db.create_connect_token(&token("old", "u1", now - 5), now - 20)
        .await
        .unwrap();
    assert!(db.consume_connect_token("old", now).await.unwrap().is_none());

    // The sweep happened; creating a fresh token finds a clean table.
    db.create_connect_token(&token("fresh", "u2", now + 10), now)
        .await
        .unwrap();
    let got = db.consume_connect_token("fresh", now).await.unwrap();
    assert_eq!(got.unwrap().user_id, "u2");
}

#[tokio::test]
async fn job_lifecycle_preserves_start_time() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let tracker = JobTracker::new(db.clone(), 1);

    let job = tracker
        .add_job(
            "quant",
            "quant",
            "scan1",
            "u1",
            "my quant",
            vec!["Fe".to_string()],
            60,
            Arc::new(|_: JobStatusMsg| {}),
        )
        .await
        .unwrap();
    assert!(job.job_id.starts_with("quant-"));
    assert_eq!(job.status, JobState::Starting);
    assert!(tracker.is_tracked(&job.job_id));
    assert!(!tracker.is_tracked("quant-somewhere-else"));

    tracker
        .update_job(&job.job_id, JobState::Running, "Nodes running", "log-1")
        .await
        .unwrap();
    tracker
        .complete_job(
            &job.job_id,
            true,
            "Quantification complete",
            "out.bin",
            vec!["node00001_stdout.log".to_string()],
        )
        .await
        .unwrap();

    let row = db.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobState::Complete);
    assert_eq!(row.start_unix_sec, job.start_unix_sec);
    assert_eq!(row.log_id, "log-1");
    assert_eq!(row.output_file_path, "out.bin");
    assert!(row.end_unix_sec >= row.start_unix_sec);

    let mine = db.list_jobs_for_user("u1").await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].job_id, job.job_id);
    assert!(db.list_jobs_for_user("u2").await.unwrap().is_empty());
}

#[tokio::test]
async fn notification_inbox_round_trip() {
    let url = require_db!();
    let db = clean_db(&url).await;

    let n = UserNotification {
        id: "quant-done-j1-u1".to_string(),
        subject: "Quantification done".to_string(),
        contents: "done".to_string(),
        from: "Data platform".to_string(),
        link: "quant/j1".to_string(),
        timestamp_unix_sec: now_unix(),
        notification_type: "quant-complete".to_string(),
    };
    db.insert_notification("u1", &n).await.unwrap();
    // Duplicate ids are absorbed.
    db.insert_notification("u1", &n).await.unwrap();

    let inbox = db.list_notifications("u1").await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].subject, "Quantification done");
    assert!(db.list_notifications("u2").await.unwrap().is_empty());

    db.dismiss_notification("quant-done-j1-u1").await.unwrap();
    // Dismissal is idempotent.
    db.dismiss_notification("quant-done-j1-u1").await.unwrap();
    assert!(db.list_notifications("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn quant_summary_and_ownership_commit_together() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    let job = JobStatusMsg {
        job_id: "quant-deadbeef".to_string(),
        job_type: "quant".to_string(),
        job_item_id: "scan1".to_string(),
        requestor_user_id: "u1".to_string(),
        name: "calcite check".to_string(),
        elements: vec!["Ca".to_string()],
        status: JobState::Complete,
        message: "Quantification complete".to_string(),
        start_unix_sec: now,
        last_update_unix_sec: now,
        end_unix_sec: now,
        output_file_path: "q.bin".to_string(),
        log_id: String::new(),
        other_log_files: Vec::new(),
    };
    let summary = QuantSummary {
        id: job.job_id.clone(),
        scan_id: "scan1".to_string(),
        name: "calcite check".to_string(),
        requestor_user_id: "u1".to_string(),
        elements: vec!["Ca".to_string()],
        status: job,
        params: QuantParams::Map(map_params("calcite check", "scan1", &["Ca"])),
    };
    let owner = make_owner_for_write(&summary.id, QUANT_OBJECT_TYPE, "u1", now);
    db.insert_quant_with_ownership(&summary, &owner).await.unwrap();

    // Creator sees it, strangers do not.
    db.check_access("u1", &summary.id, false).await.unwrap();
    assert!(db.check_access("intruder", &summary.id, false).await.is_err());

    assert!(db
        .quant_name_exists("u1", "scan1", "calcite check")
        .await
        .unwrap());
    assert!(!db
        .quant_name_exists("u1", "scan1", "some other name")
        .await
        .unwrap());

    let listed = db.list_quants_for_scan("scan1").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "calcite check");

    // Stored creation parameters come back typed.
    let got = db.get_quant(&summary.id).await.unwrap().unwrap();
    match got.params {
        QuantParams::Map(p) => assert_eq!(p.pmcs, vec![1, -1, 3]),
        other => panic!("wrong params variant: {:?}", other),
    }

    let batch = db
        .get_quants_by_ids(&[summary.id.clone(), "quant-unknown".to_string()])
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, summary.id);
}

#[tokio::test]
async fn quant_delete_removes_summary_and_ownership() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    let job = JobStatusMsg {
        job_id: "quant-gone".to_string(),
        job_type: "quant".to_string(),
        job_item_id: "scan1".to_string(),
        requestor_user_id: "u1".to_string(),
        name: "short lived".to_string(),
        elements: vec!["Fe".to_string()],
        status: JobState::Complete,
        message: String::new(),
        start_unix_sec: now,
        last_update_unix_sec: now,
        end_unix_sec: now,
        output_file_path: "q.bin".to_string(),
        log_id: String::new(),
        other_log_files: Vec::new(),
    };
    let summary = QuantSummary {
        id: job.job_id.clone(),
        scan_id: "scan1".to_string(),
        name: "short lived".to_string(),
        requestor_user_id: "u1".to_string(),
        elements: vec!["Fe".to_string()],
        status: job,
        params: QuantParams::Map(map_params("short lived", "scan1", &["Fe"])),
    };
    let owner = make_owner_for_write(&summary.id, QUANT_OBJECT_TYPE, "u1", now);
    db.insert_quant_with_ownership(&summary, &owner).await.unwrap();

    db.delete_quant(&summary.id).await.unwrap();
    assert!(db.get_quant(&summary.id).await.unwrap().is_none());
    // The ownership row went with it.
    assert!(db.check_access("u1", &summary.id, false).await.is_err());
}

#[tokio::test]
async fn group_grants_access_and_blocks_deletion_while_referenced() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    db.create_group(&UserGroupRecord {
        id: "geologists".to_string(),
        name: "Geologists".to_string(),
        description: String::new(),
        created_by: "admin".to_string(),
        admin_user_ids: vec!["admin".to_string()],
        member_user_ids: vec!["viewer1".to_string()],
        member_group_ids: Vec::new(),
        viewer_user_ids: Vec::new(),
        viewer_group_ids: Vec::new(),
        joinable: false,
        created_unix_sec: now,
    })
    .await
    .unwrap();

    let job = JobStatusMsg {
        job_id: "quant-shared".to_string(),
        job_type: "quant".to_string(),
        job_item_id: "scan1".to_string(),
        requestor_user_id: "u1".to_string(),
        name: "shared quant".to_string(),
        elements: vec!["Fe".to_string()],
        status: JobState::Complete,
        message: String::new(),
        start_unix_sec: now,
        last_update_unix_sec: now,
        end_unix_sec: now,
        output_file_path: "q.bin".to_string(),
        log_id: String::new(),
        other_log_files: Vec::new(),
    };
    let summary = QuantSummary {
        id: job.job_id.clone(),
        scan_id: "scan1".to_string(),
        name: "shared quant".to_string(),
        requestor_user_id: "u1".to_string(),
        elements: vec!["Fe".to_string()],
        status: job,
        params: QuantParams::Map(map_params("shared quant", "scan1", &["Fe"])),
    };
    let mut owner = make_owner_for_write(&summary.id, QUANT_OBJECT_TYPE, "u1", now);
    owner.viewers.group_ids.push("geologists".to_string());
    db.insert_quant_with_ownership(&summary, &owner).await.unwrap();

    // Group membership grants view access.
    db.check_access("viewer1", &summary.id, false).await.unwrap();
    assert!(db.check_access("viewer1", &summary.id, true).await.is_err());

    // The group cannot be deleted while an ownership row grants
    // through it.
    assert!(db.delete_group("geologists").await.is_err());
    db.delete_quant(&summary.id).await.unwrap();
    db.delete_group("geologists").await.unwrap();
    assert!(db.delete_group("geologists").await.is_err());
}

#[tokio::test]
async fn roi_rows_round_trip() {
    let url = require_db!();
    let db = clean_db(&url).await;

    db.insert_roi(&RoiRecord {
        id: "roi-1".to_string(),
        scan_id: "scan1".to_string(),
        name: "crater rim".to_string(),
        scan_entry_indexes_encoded: vec![3, -1, 2, 40],
    })
    .await
    .unwrap();

    let got = db.get_roi("roi-1").await.unwrap().unwrap();
    assert_eq!(got.name, "crater rim");
    assert_eq!(got.scan_entry_indexes_encoded, vec![3, -1, 2, 40]);
    assert!(db.get_roi("roi-2").await.unwrap().is_none());

    // Upsert in place.
    db.insert_roi(&RoiRecord {
        id: "roi-1".to_string(),
        scan_id: "scan1".to_string(),
        name: "crater rim v2".to_string(),
        scan_entry_indexes_encoded: vec![7],
    })
    .await
    .unwrap();
    let got = db.get_roi("roi-1").await.unwrap().unwrap();
    assert_eq!(got.name, "crater rim v2");
}

#[tokio::test]
async fn election_runs_callback_on_exactly_one_instance() {
    let url = require_db!();
    let db = clean_db(&url).await;

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_a = Arc::clone(&fired);
    let fired_b = Arc::clone(&fired);

    // Both instances claim before either re-reads; last writer wins.
    let (won_a, won_b) = tokio::join!(
        elector::handle_once(&db, "quant-j9", "inst-a", move || async move {
            fired_a.fetch_add(1, Ordering::SeqCst);
        }),
        elector::handle_once(&db, "quant-j9", "inst-b", move || async move {
            fired_b.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let (won_a, won_b) = (won_a.unwrap(), won_b.unwrap());
    assert!(won_a != won_b, "exactly one instance must win");

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Day-old election rows are sweepable garbage.
    let pruned = db.prune_job_handlers(now_unix() + 1).await.unwrap();
    assert_eq!(pruned, 1);
    assert!(db.get_job_handler("quant-j9").await.unwrap().is_none());
}

#[tokio::test]
async fn notification_fans_out_to_live_sessions_and_inboxes() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let sessions = Arc::new(SessionRegistry::new());
    let router = NotificationRouter::new(
        db.clone(),
        Arc::clone(&sessions),
        Arc::new(LogMailer),
        "inst-test".to_string(),
    );

    let mut rx = sessions.attach(
        "sess-live",
        Principal {
            user_id: "live".to_string(),
            name: "Live".to_string(),
            email: "live@example.com".to_string(),
            permissions: Vec::new(),
        },
    );
    sessions.set_subscribed("sess-live");

    let n = UserNotification {
        id: "quant-done-j1".to_string(),
        subject: "Quantification done".to_string(),
        contents: "done".to_string(),
        from: "Data platform".to_string(),
        link: "quant/j1".to_string(),
        timestamp_unix_sec: 0,
        notification_type: "quant-complete".to_string(),
    };
    router
        .send_notification(&["live".to_string(), "offline".to_string()], n)
        .await
        .unwrap();

    // The live subscribed session got the push and no inbox row.
    match rx.try_recv().unwrap() {
        WsMessage::Update(Update::Notification(got)) => {
            assert_eq!(got.id, "quant-done-j1");
            assert!(got.timestamp_unix_sec > 0);
        }
        other => panic!("wrong frame: {:?}", other),
    }
    assert_eq!(db.count_notifications("live").await.unwrap(), 0);

    // The offline user got a per-user inbox row instead.
    assert_eq!(db.count_notifications("offline").await.unwrap(), 1);
    let inbox = db.list_notifications("offline").await.unwrap();
    assert_eq!(inbox[0].id, "quant-done-j1-offline");

    router.dismiss("quant-done-j1-offline").await.unwrap();
    assert_eq!(db.count_notifications("offline").await.unwrap(), 0);
}

#[tokio::test]
async fn users_are_created_lazily_and_updated() {
    let url = require_db!();
    let db = clean_db(&url).await;
    let now = now_unix();

    assert!(db.get_user("u1").await.unwrap().is_none());
    let created = db
        .get_or_create_user("u1", "Ada", "ada@example.com", now)
        .await
        .unwrap();
    assert_eq!(created.name, "Ada");

    // Re-attach with a fresh display name updates the record in place.
    let updated = db
        .get_or_create_user("u1", "Ada L.", "ada@example.com", now + 5)
        .await
        .unwrap();
    assert_eq!(updated.name, "Ada L.");
    assert_eq!(updated.created_unix_sec, created.created_unix_sec);
}
