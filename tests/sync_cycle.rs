use anyhow::{anyhow, Result};
use quote_sync::config::{self, SyncSettings};
use quote_sync::db;
use quote_sync::model::{CategoryFilter, ConflictMode, Quote, RemoteQuote, SyncState};
use quote_sync::remote::RemoteService;
use quote_sync::sync::{
    ConflictChoice, Delivery, Resolution, SyncEngine, SyncError, SyncOutcome,
};
use quote_sync::outbox::Outbox;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn settings(mode: ConflictMode) -> SyncSettings {
    let mut cfg = config::parse(config::example()).unwrap();
    cfg.sync.conflict_mode = mode;
    cfg.sync
}

fn rq(id: &str, text: &str, category: &str) -> RemoteQuote {
    RemoteQuote {
        id: id.into(),
        text: text.into(),
        category: category.into(),
    }
}

/// Scripted remote: each call pops the next response, falling back to a
/// success (empty set for fetches, an echo for posts).
#[derive(Clone, Default)]
struct RecordingRemote {
    fetch_responses: Arc<Mutex<VecDeque<Result<Vec<RemoteQuote>>>>>,
    post_responses: Arc<Mutex<VecDeque<Result<String>>>>,
    posts: Arc<Mutex<Vec<Quote>>>,
    fetches: Arc<Mutex<usize>>,
    /// When set, posts never complete.
    stall_posts: Arc<AtomicBool>,
}

impl RecordingRemote {
    async fn push_fetch(&self, response: Result<Vec<RemoteQuote>>) {
        self.fetch_responses.lock().await.push_back(response);
    }

    async fn push_post(&self, response: Result<String>) {
        self.post_responses.lock().await.push_back(response);
    }

    async fn posts(&self) -> Vec<Quote> {
        self.posts.lock().await.clone()
    }

    async fn fetches(&self) -> usize {
        *self.fetches.lock().await
    }
}

#[async_trait::async_trait]
impl RemoteService for RecordingRemote {
    async fn fetch_quotes(&self) -> Result<Vec<RemoteQuote>> {
        *self.fetches.lock().await += 1;
        self.fetch_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn post_quote(&self, quote: &Quote) -> Result<RemoteQuote> {
        self.posts.lock().await.push(quote.clone());
        if self.stall_posts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let id = self
            .post_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok("101".into()))?;
        Ok(RemoteQuote {
            id,
            text: quote.text.clone(),
            category: quote.category.clone(),
        })
    }
}

async fn engine_with(
    pool: &sqlx::SqlitePool,
    remote: &RecordingRemote,
    mode: ConflictMode,
) -> SyncEngine {
    SyncEngine::open(pool.clone(), Arc::new(remote.clone()), &settings(mode))
        .await
        .unwrap()
}

async fn local_quotes(engine: &SyncEngine) -> Vec<Quote> {
    engine.store().lock().await.quotes().to_vec()
}

#[tokio::test]
async fn submit_delivers_immediately_when_remote_is_up() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;

    let sub = engine
        .submit_quote("Well done is better than well said.", "Wisdom")
        .await
        .unwrap();
    assert_eq!(
        sub.delivery,
        Delivery::Delivered {
            remote_id: "101".into()
        }
    );
    assert_eq!(engine.unsynced_count().await, 0);
    assert_eq!(remote.posts().await, vec![sub.quote.clone()]);
    assert_eq!(
        engine.store().lock().await.find(&sub.quote.text),
        Some(&sub.quote)
    );
}

#[tokio::test]
async fn failed_delivery_queues_once_and_next_success_removes_it() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;

    // An older entry that stays undeliverable throughout.
    remote.push_post(Err(anyhow!("offline"))).await;
    let other = engine
        .submit_quote("Queued first and never delivered.", "Misc")
        .await
        .unwrap();

    remote.push_post(Err(anyhow!("offline"))).await;
    let sub = engine
        .submit_quote("Knowledge is power, if shared.", "Wisdom")
        .await
        .unwrap();
    let Delivery::Queued { outbox_id } = sub.delivery else {
        panic!("expected the quote to be queued");
    };
    let Delivery::Queued {
        outbox_id: other_id,
    } = other.delivery
    else {
        panic!("expected the quote to be queued");
    };

    {
        let outbox = engine.outbox().lock().await;
        let matching: Vec<_> = outbox
            .entries()
            .iter()
            .filter(|e| e.quote == sub.quote)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id, outbox_id);
    }

    // Next cycle: the older entry fails again, the newer one goes through.
    remote.push_post(Err(anyhow!("still offline"))).await;
    remote.push_post(Ok("202".into())).await;
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.flush.delivered, 1);
    assert_eq!(report.flush.requeued, 1);

    let outbox = engine.outbox().lock().await;
    let ids: Vec<_> = outbox.entries().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![other_id]);
}

#[tokio::test]
async fn auto_merge_applies_remote_precedence() {
    let pool = setup_pool().await;
    db::set_json(
        &pool,
        db::KEY_QUOTES,
        &vec![
            Quote::new("A: shared between both sides", "Local"),
            Quote::new("B: only on this device", "Local"),
        ],
    )
    .await
    .unwrap();
    let remote = RecordingRemote::default();
    remote
        .push_fetch(Ok(vec![
            rq("1", "A: shared between both sides", "User 1"),
            rq("2", "C: only on the server", "User 2"),
        ]))
        .await;
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(
        report.outcome,
        SyncOutcome::AutoMerged {
            added: 1,
            replaced: 1
        }
    );
    let expected = vec![
        Quote::new("B: only on this device", "Local"),
        Quote::new("A: shared between both sides", "User 1"),
        Quote::new("C: only on the server", "User 2"),
    ];
    assert_eq!(local_quotes(&engine).await, expected);
    assert_eq!(engine.state(), SyncState::Idle);

    let stored: Vec<Quote> = db::get_json(&pool, db::KEY_QUOTES).await.unwrap().unwrap();
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn matching_remote_set_reports_no_change_and_leaves_storage_identical() {
    let pool = setup_pool().await;
    db::set_json(
        &pool,
        db::KEY_QUOTES,
        &vec![
            Quote::new("Already synced quote one", "User 1"),
            Quote::new("Local only quote two", "Life"),
        ],
    )
    .await
    .unwrap();
    let before = db::get_item(&pool, db::KEY_QUOTES).await.unwrap();

    let remote = RecordingRemote::default();
    remote
        .push_fetch(Ok(vec![rq("1", "Already synced quote one", "User 1")]))
        .await;
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;
    let local_before = local_quotes(&engine).await;

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::NoChange);
    assert_eq!(local_quotes(&engine).await, local_before);
    assert_eq!(db::get_item(&pool, db::KEY_QUOTES).await.unwrap(), before);
}

#[tokio::test]
async fn fetch_failure_leaves_everything_alone() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;

    {
        let mut store = engine.store().lock().await;
        store
            .select_category(CategoryFilter::parse("Work"))
            .await
            .unwrap();
    }
    remote.push_post(Err(anyhow!("offline"))).await;
    engine
        .submit_quote("Queued while the network was down.", "Work")
        .await
        .unwrap();

    let quotes_before = local_quotes(&engine).await;
    let outbox_before: Vec<_> = engine
        .outbox()
        .lock()
        .await
        .entries()
        .iter()
        .map(|e| (e.id, e.quote.clone()))
        .collect();

    remote.push_post(Err(anyhow!("offline"))).await;
    remote.push_fetch(Err(anyhow!("connection refused"))).await;
    let report = engine.run_cycle().await.unwrap();
    match report.outcome {
        SyncOutcome::FetchFailed { reason } => assert!(reason.contains("connection refused")),
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(local_quotes(&engine).await, quotes_before);
    let outbox_after: Vec<_> = engine
        .outbox()
        .lock()
        .await
        .entries()
        .iter()
        .map(|e| (e.id, e.quote.clone()))
        .collect();
    assert_eq!(outbox_after, outbox_before);
    assert_eq!(
        db::get_item(&pool, db::KEY_LAST_SELECTED_CATEGORY)
            .await
            .unwrap()
            .as_deref(),
        Some("work")
    );
    assert_eq!(
        engine.store().lock().await.selected_category(),
        &CategoryFilter::Named("work".into())
    );
    assert_eq!(engine.state(), SyncState::Idle);
}

#[tokio::test]
async fn manual_mode_applies_only_selected_changes() {
    let pool = setup_pool().await;
    db::set_json(
        &pool,
        db::KEY_QUOTES,
        &vec![
            Quote::new("Shared text, server wins", "Local"),
            Quote::new("Shared text, local kept", "Local"),
        ],
    )
    .await
    .unwrap();
    let remote = RecordingRemote::default();
    remote
        .push_fetch(Ok(vec![
            rq("1", "Shared text, server wins", "User 1"),
            rq("2", "Shared text, local kept", "User 1"),
            rq("3", "Accepted new quote", "User 2"),
            rq("4", "Ignored new quote", "User 2"),
        ]))
        .await;
    let engine = engine_with(&pool, &remote, ConflictMode::Manual).await;

    let report = engine.run_cycle().await.unwrap();
    let SyncOutcome::AwaitingResolution(diff) = report.outcome else {
        panic!("expected a pending diff");
    };
    assert_eq!(diff.new.len(), 2);
    assert_eq!(diff.conflicts.len(), 2);
    assert_eq!(engine.state(), SyncState::AwaitingResolution);
    // nothing applied yet
    assert_eq!(local_quotes(&engine).await.len(), 2);

    let summary = engine
        .resolve(
            Resolution::default()
                .accept("Accepted new quote")
                .choose("Shared text, server wins", ConflictChoice::UseRemote)
                .choose("Shared text, local kept", ConflictChoice::KeepLocal),
        )
        .await
        .unwrap();
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.replaced, 1);
    assert_eq!(engine.state(), SyncState::Idle);
    assert!(engine.pending_diff().is_none());

    assert_eq!(
        local_quotes(&engine).await,
        vec![
            Quote::new("Shared text, server wins", "User 1"),
            Quote::new("Shared text, local kept", "Local"),
            Quote::new("Accepted new quote", "User 2"),
        ]
    );
}

#[tokio::test]
async fn manual_accept_all_and_dismiss() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    remote
        .push_fetch(Ok(vec![rq("1", "Remote quote one", "User 1")]))
        .await;
    remote
        .push_fetch(Ok(vec![rq("2", "Remote quote two", "User 2")]))
        .await;
    let engine = engine_with(&pool, &remote, ConflictMode::Manual).await;
    let seeded = local_quotes(&engine).await.len();

    engine.run_cycle().await.unwrap();
    engine.dismiss().unwrap();
    assert_eq!(engine.state(), SyncState::Idle);
    assert_eq!(local_quotes(&engine).await.len(), seeded);
    assert_eq!(engine.dismiss(), Err(SyncError::NothingPending));

    engine.run_cycle().await.unwrap();
    let summary = engine.accept_all().await.unwrap();
    assert_eq!(summary.accepted, 1);
    let quotes = local_quotes(&engine).await;
    assert_eq!(quotes.len(), seeded + 1);
    assert_eq!(quotes.last().unwrap().text, "Remote quote two");

    let err = engine.accept_all().await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<SyncError>(),
        Some(&SyncError::NothingPending)
    );
}

#[tokio::test]
async fn submitted_work_quote_is_only_drawn_by_work_filter() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;
    engine
        .submit_quote("Hard work beats talent when talent is lazy.", "Work")
        .await
        .unwrap();

    let mut store = engine.store().lock().await;
    let mut rng = rand::rng();
    for _ in 0..100 {
        let q = store
            .filter_quotes(CategoryFilter::parse("Work"), &mut rng)
            .await
            .unwrap()
            .unwrap();
        assert!(q.category.eq_ignore_ascii_case("work"));
    }
}

#[tokio::test]
async fn invalid_submission_is_rejected_without_side_effects() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;
    let before = local_quotes(&engine).await;

    let err = engine.submit_quote("too short", "Work").await.unwrap_err();
    assert!(err
        .downcast_ref::<quote_sync::store::ValidationError>()
        .is_some());
    assert_eq!(local_quotes(&engine).await, before);
    assert!(remote.posts().await.is_empty());
    assert_eq!(engine.unsynced_count().await, 0);
}

#[tokio::test]
async fn outbox_survives_restart() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    remote.push_post(Err(anyhow!("offline"))).await;
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;
    engine
        .submit_quote("Written before the process restarted.", "Misc")
        .await
        .unwrap();
    drop(engine);

    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;
    assert_eq!(engine.unsynced_count().await, 1);
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.flush.delivered, 1);
    assert_eq!(engine.unsynced_count().await, 0);
    assert_eq!(remote.fetches().await, 1);
}

#[tokio::test]
async fn cancelled_delivery_keeps_quotes_queued() {
    let pool = setup_pool().await;
    let remote = RecordingRemote::default();
    let engine = engine_with(&pool, &remote, ConflictMode::Auto).await;

    remote.push_post(Err(anyhow!("offline"))).await;
    let first = engine
        .submit_quote("Queued while the server was unreachable.", "Misc")
        .await
        .unwrap();
    assert!(matches!(first.delivery, Delivery::Queued { .. }));

    remote.stall_posts.store(true, Ordering::SeqCst);
    let cycle = tokio::time::timeout(Duration::from_millis(200), engine.run_cycle()).await;
    assert!(cycle.is_err());
    assert_eq!(engine.unsynced_count().await, 1);

    let submit = tokio::time::timeout(
        Duration::from_millis(200),
        engine.submit_quote("Second quote queued while offline", "Misc"),
    )
    .await;
    assert!(submit.is_err());

    let reloaded = Outbox::load(pool.clone()).await.unwrap();
    let texts: Vec<&str> = reloaded
        .entries()
        .iter()
        .map(|e| e.quote.text.as_str())
        .collect();
    assert_eq!(
        texts,
        vec![
            "Queued while the server was unreachable.",
            "Second quote queued while offline"
        ]
    );

    // once the server answers again both entries go out exactly once
    remote.stall_posts.store(false, Ordering::SeqCst);
    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.flush.delivered, 2);
    assert_eq!(engine.unsynced_count().await, 0);
}
