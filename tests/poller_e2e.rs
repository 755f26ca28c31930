use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use activity_feed::fanin;
use activity_feed::{
    BatchOutcome, CursorKey, CursorStore, DocumentSource, InMemoryStores, MonotonicSeq, PollerConfig, SourceKind,
    SourcePoller, SourceRecord, WritableSource,
};

const NS: &str = "poll";

fn poller(stores: &InMemoryStores, kind: SourceKind, batch_size: usize) -> SourcePoller {
    let source: Arc<dyn DocumentSource> = stores.collection(kind);
    let cursors: Arc<dyn CursorStore> = stores.cursors.clone();
    SourcePoller::new(
        PollerConfig::new(NS, kind, batch_size, Duration::from_millis(10)),
        source,
        cursors,
    )
}

async fn insert_bookmarks(stores: &InMemoryStores, seqs: impl IntoIterator<Item = u64>) {
    for s in seqs {
        stores
            .bookmarks
            .insert(SourceRecord::bookmark("u", &format!("f{s}")).with_seq(MonotonicSeq::new(s)))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn emits_every_record_once_in_sequence_order() {
    let stores = InMemoryStores::new();
    // Inserted out of order; delivery follows the sequence.
    insert_bookmarks(&stores, (1..=25).rev()).await;

    let (tx, mut rx) = fanin::bounded(64);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller(&stores, SourceKind::Bookmark, 10).run(tx, cancel.clone()));

    let mut seen = Vec::new();
    while seen.len() < 25 {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.get(&cancel))
            .await
            .unwrap()
            .unwrap();
        seen.push(event.seq.get());
    }
    assert_eq!(seen, (1..=25).collect::<Vec<_>>());

    // Nothing more shows up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_get().is_none());

    cancel.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.delivered, 25);
    assert_eq!(stats.skipped, 0);

    let key = CursorKey::last_seq(NS, SourceKind::Bookmark);
    assert_eq!(stores.cursors.value(&key).unwrap(), Some(MonotonicSeq::new(25)));
}

#[tokio::test]
async fn restart_resumes_after_persisted_cursor() {
    let stores = InMemoryStores::new();
    insert_bookmarks(&stores, 1..=5).await;

    let (tx, mut rx) = fanin::bounded(16);
    let cancel = CancellationToken::new();

    let mut first = poller(&stores, SourceKind::Bookmark, 3);
    let outcome = first.poll_batch(&tx, &cancel).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Full { delivered: 3 });
    drop(first);

    let mut second = poller(&stores, SourceKind::Bookmark, 3);
    assert_eq!(second.load_cursor().await.unwrap(), MonotonicSeq::new(3));
    let outcome = second.poll_batch(&tx, &cancel).await.unwrap();
    assert_eq!(outcome, BatchOutcome::Partial { delivered: 2 });

    let mut seen = Vec::new();
    while let Some(event) = rx.try_get() {
        seen.push(event.seq.get());
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn malformed_record_between_valid_ones_is_skipped() {
    let stores = InMemoryStores::new();
    stores
        .ratings
        .insert(SourceRecord::rating("u", "f1", 4).with_seq(MonotonicSeq::new(1)))
        .await
        .unwrap();
    let mut fields = activity_feed::Document::new();
    fields.insert("user_id".to_string(), serde_json::json!("u"));
    fields.insert("film_score".to_string(), serde_json::json!(5));
    stores
        .ratings
        .insert(SourceRecord::unsequenced(fields).with_seq(MonotonicSeq::new(2)))
        .await
        .unwrap();
    stores
        .ratings
        .insert(SourceRecord::rating("u", "f3", 6).with_seq(MonotonicSeq::new(3)))
        .await
        .unwrap();

    let (tx, mut rx) = fanin::bounded(16);
    let cancel = CancellationToken::new();
    let mut poller = poller(&stores, SourceKind::Rating, 100);
    poller.poll_batch(&tx, &cancel).await.unwrap();

    let first = rx.try_get().unwrap();
    let second = rx.try_get().unwrap();
    assert!(rx.try_get().is_none());
    assert_eq!(first.payload.film_id(), "f1");
    assert_eq!(second.payload.film_id(), "f3");
    assert_eq!(poller.stats().skipped, 1);

    let key = CursorKey::last_seq(NS, SourceKind::Rating);
    assert_eq!(stores.cursors.value(&key).unwrap(), Some(MonotonicSeq::new(3)));
}

#[tokio::test]
async fn full_queue_never_drops_events() {
    let stores = InMemoryStores::new();
    insert_bookmarks(&stores, 1..=40).await;

    let (tx, mut rx) = fanin::bounded(2);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller(&stores, SourceKind::Bookmark, 7).run(tx, cancel.clone()));

    let mut seen = Vec::new();
    while seen.len() < 40 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        let event = tokio::time::timeout(Duration::from_secs(2), rx.get(&cancel))
            .await
            .unwrap()
            .unwrap();
        seen.push(event.seq.get());
        assert!(rx.len() <= 2);
    }
    assert_eq!(seen, (1..=40).collect::<Vec<_>>());

    cancel.cancel();
    assert_eq!(handle.await.unwrap().unwrap().delivered, 40);
}

#[tokio::test]
async fn cancellation_stops_a_poller_blocked_on_a_full_queue() {
    let stores = InMemoryStores::new();
    insert_bookmarks(&stores, 1..=5).await;

    let (tx, _rx) = fanin::bounded(1);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(poller(&stores, SourceKind::Bookmark, 10).run(tx, cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.delivered, 1);
}
