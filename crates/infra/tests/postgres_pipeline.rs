//! The same pipeline against Postgres-backed stores.
//!
//! Skipped unless `FOLIO_TEST_DATABASE_URL` points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use folio_catalog::{Book, BookCommand, CreateBook, LikeBook};
use folio_core::{AccountId, AggregateId, ExpectedVersion, TenantId, Translations};
use folio_infra::event_store::{PostgresEventStore, migrate};
use folio_infra::notifications::{AggregateFilter, NotificationBus, Subscription};
use folio_infra::projections::{
    BOOK_SEARCH, BookSearchProjection, BookSearchRow, EngineConfig, PostgresCheckpointStore,
    ProjectionEngine, Visibility,
};
use folio_infra::read_model::PostgresTenantStore;
use folio_infra::StreamRuntime;

async fn pool() -> Option<PgPool> {
    let url = std::env::var("FOLIO_TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    migrate(&pool).await.ok()?;
    Some(pool)
}

/// Fresh tenant per run; the database outlives the test.
fn fresh_tenant() -> TenantId {
    let suffix = Uuid::now_v7().simple().to_string();
    TenantId::parse(&format!("pg-{}", &suffix[suffix.len() - 12..])).unwrap()
}

#[tokio::test]
async fn likes_are_projected_through_postgres() {
    let Some(pool) = pool().await else { return };
    folio_observability::init();

    let store = Arc::new(PostgresEventStore::new(pool.clone()));
    let rows: PostgresTenantStore<BookSearchRow> =
        PostgresTenantStore::new(pool.clone(), "rm_book_search").unwrap();
    let books = Arc::new(BookSearchProjection::new(rows));
    let bus = NotificationBus::new();

    let mut engine = ProjectionEngine::new(
        store.clone(),
        Arc::new(PostgresCheckpointStore::new(pool.clone())),
        bus.clone(),
        EngineConfig {
            poll_interval_ms: 20,
            ..EngineConfig::default()
        },
    );
    engine.register(books.clone()).unwrap();
    let engine = engine.start();

    let runtime = StreamRuntime::new(store);
    let acme = fresh_tenant();
    let id = AggregateId::new();
    runtime
        .execute::<Book>(
            &acme,
            id,
            ExpectedVersion::NoStream,
            BookCommand::CreateBook(CreateBook {
                default_language: "en".to_string(),
                title: Translations::single("en", "Dune").unwrap(),
                description: Translations::new(),
                author: "Frank Herbert".to_string(),
                tags: vec![],
                occurred_at: Utc::now(),
            }),
        )
        .await
        .unwrap();

    let mut last = 0;
    for _ in 0..3 {
        let like = BookCommand::LikeBook(LikeBook {
            account_id: AccountId::new(),
            occurred_at: Utc::now(),
        });
        last = runtime
            .execute_latest::<Book>(&acme, id, like, 4)
            .await
            .unwrap()
            .new_version;
    }

    bus.subscribe_filter(
        Subscription::new(acme.clone(), AggregateFilter::Id(id))
            .min_version(last)
            .projection(BOOK_SEARCH),
    )
    .wait(Duration::from_secs(10))
    .await
    .unwrap();

    let row = books.get(&acme, id, Visibility::Public).await.unwrap().unwrap();
    assert_eq!(row.like_count, 3);
    assert_eq!(row.version, 4);

    assert_eq!(engine.rebuild(BOOK_SEARCH, &acme).await.unwrap(), 4);
    let rebuilt = books.get(&acme, id, Visibility::Public).await.unwrap().unwrap();
    assert_eq!(rebuilt, row);

    engine.shutdown().await;
}
