//! Concurrent claims: a task is handed to exactly one worker.

use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

use invoice_ingest::{
    db::{self, memory::MemoryStore, queries::PgStore, repository::{DocumentStore, TaskQueue}},
    models::{document::{Document, DocumentStatus}, task::TaskStatus},
};

#[tokio::test]
async fn test_two_claims_race_for_one_task() {
    let store = MemoryStore::new();
    let document = Document::new(Uuid::new_v4(), "org/a.pdf", "application/pdf");
    store.insert_document(&document).await.unwrap();
    let task = store.enqueue(document.id, 0, 3).await.unwrap();

    let (a, b) = tokio::join!(store.claim_next(120), store.claim_next(120));
    let claimed: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, task.id);
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(
        store.document(document.id).await.unwrap().status,
        DocumentStatus::Processing
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_workers_claim_each_task_once() {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..5 {
        let document = Document::new(Uuid::new_v4(), "org/b.pdf", "application/pdf");
        store.insert_document(&document).await.unwrap();
        store.enqueue(document.id, 0, 3).await.unwrap();
    }

    let handles = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim_next(120).await })
    });
    let mut claimed: Vec<Uuid> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .map(|task| task.id)
        .collect();

    assert_eq!(claimed.len(), 5);
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 5);
}

/// Same race against PostgreSQL.
///
/// Needs a database reachable through `DATABASE_URL`.
#[tokio::test]
#[ignore] // Run with: cargo test --test claim_race_test -- --ignored
async fn test_postgres_claim_is_exclusive() {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = db::init_pool(&database_url).await.expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    let store = PgStore::new(pool);

    let document = Document::new(Uuid::new_v4(), "org/race.pdf", "application/pdf");
    store.insert_document(&document).await.unwrap();
    // Highest priority so rows left by other runs do not win the claim.
    let task = store.enqueue(document.id, i32::MAX, 3).await.unwrap();

    let (a, b) = tokio::join!(store.claim_next(120), store.claim_next(120));
    let ours: Vec<_> = [a.unwrap(), b.unwrap()]
        .into_iter()
        .flatten()
        .filter(|t| t.id == task.id)
        .collect();
    assert_eq!(ours.len(), 1);

    let stored = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Processing);
    assert_eq!(stored.attempts, 1);
    assert!(stored.started_at.is_some());

    store.complete(task.id).await.unwrap();
    let doc = store.get_document(document.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Processing);
}
