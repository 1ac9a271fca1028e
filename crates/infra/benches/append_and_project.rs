use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use folio_catalog::{Book, BookCommand, BookCreated, BookEvent, BookId, BookLiked, CreateBook, LikeBook};
use folio_core::{AccountId, AggregateId, ExpectedVersion, TenantId, Translations};
use folio_infra::event_store::{AppendRequest, EventStore, InMemoryEventStore, NewEvent, RecordedEvent};
use folio_infra::projections::BookSearchRow;
use folio_infra::StreamRuntime;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn tenant() -> TenantId {
    TenantId::parse("bench").unwrap()
}

fn create_book() -> BookCommand {
    BookCommand::CreateBook(CreateBook {
        default_language: "en".to_string(),
        title: Translations::single("en", "Dune").unwrap(),
        description: Translations::new(),
        author: "Frank Herbert".to_string(),
        tags: vec!["sci-fi".to_string()],
        occurred_at: Utc::now(),
    })
}

fn liked(tenant_id: &TenantId, book_id: AggregateId) -> BookEvent {
    BookEvent::BookLiked(BookLiked {
        tenant_id: tenant_id.clone(),
        book_id: BookId(book_id),
        account_id: AccountId::new(),
        occurred_at: Utc::now(),
    })
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("command_execution_latency");

    group.bench_function("create_book_fresh", |b| {
        let runtime = StreamRuntime::new(InMemoryEventStore::new());
        let acme = tenant();
        b.to_async(&rt).iter(|| async {
            black_box(
                runtime
                    .execute::<Book>(&acme, AggregateId::new(), ExpectedVersion::NoStream, create_book())
                    .await
                    .unwrap(),
            );
        });
    });

    for history in [10u64, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("like_with_history", history),
            &history,
            |b, &history| {
                let runtime = StreamRuntime::new(InMemoryEventStore::new());
                let acme = tenant();
                let id = AggregateId::new();
                rt.block_on(async {
                    runtime
                        .execute::<Book>(&acme, id, ExpectedVersion::NoStream, create_book())
                        .await
                        .unwrap();
                    for _ in 1..history {
                        let like = BookCommand::LikeBook(LikeBook {
                            account_id: AccountId::new(),
                            occurred_at: Utc::now(),
                        });
                        runtime.execute_latest::<Book>(&acme, id, like, 1).await.unwrap();
                    }
                });

                b.to_async(&rt).iter(|| async {
                    let like = BookCommand::LikeBook(LikeBook {
                        account_id: AccountId::new(),
                        occurred_at: Utc::now(),
                    });
                    black_box(runtime.execute_latest::<Book>(&acme, id, like, 1).await.unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            &batch_size,
            |b, &size| {
                let store = InMemoryEventStore::new();
                let acme = tenant();

                b.to_async(&rt).iter(|| async {
                    let id = AggregateId::new();
                    let events = (0..size)
                        .map(|_| NewEvent::from_typed(&liked(&acme, id)).unwrap())
                        .collect();
                    black_box(
                        store
                            .append(
                                &acme,
                                AppendRequest {
                                    aggregate_id: id,
                                    aggregate_type: "catalog.book".to_string(),
                                    expected_version: ExpectedVersion::NoStream,
                                    events,
                                    unique_claims: vec![],
                                },
                            )
                            .await
                            .unwrap(),
                    );
                });
            },
        );
    }

    group.finish();
}

fn bench_book_search_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("book_search_fold");

    for event_count in [10u64, 100, 1000, 10000] {
        let acme = tenant();
        let id = AggregateId::new();
        let created = BookEvent::BookCreated(BookCreated {
            tenant_id: acme.clone(),
            book_id: BookId(id),
            default_language: "en".to_string(),
            title: Translations::single("en", "Dune").unwrap(),
            description: Translations::new(),
            author: "Frank Herbert".to_string(),
            tags: vec![],
            occurred_at: Utc::now(),
        });
        let events: Vec<RecordedEvent> = (1..=event_count)
            .map(|n| {
                let payload = if n == 1 { created.clone() } else { liked(&acme, id) };
                let new = NewEvent::from_typed(&payload).unwrap();
                RecordedEvent {
                    global_position: n,
                    event_id: new.event_id,
                    tenant_id: acme.clone(),
                    aggregate_id: id,
                    aggregate_type: "catalog.book".to_string(),
                    sequence_number: n,
                    event_type: new.event_type,
                    event_version: new.event_version,
                    occurred_at: new.occurred_at,
                    committed_at: Utc::now(),
                    payload: new.payload,
                }
            })
            .collect();

        group.throughput(Throughput::Elements(event_count));
        group.bench_with_input(
            BenchmarkId::new("rebuild_row_from_events", event_count),
            &events,
            |b, events| {
                b.iter(|| {
                    let mut row = None;
                    for event in events {
                        if let Some(next) = BookSearchRow::fold(row.clone(), event).unwrap() {
                            row = Some(next);
                        }
                    }
                    black_box(row)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_event_append_throughput,
    bench_book_search_fold
);
criterion_main!(benches);
