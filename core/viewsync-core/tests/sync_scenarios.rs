//! End-to-end behavior of views, notifications and subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use viewsync_core::channel::{ChannelManager, Inbound, InboundSender, Link, Transport};
use viewsync_core::config::ChannelConfig;
use viewsync_core::view::{FieldPredicates, Mutation, StatusScope, ViewDescriptor, ViewPage};
use viewsync_core::{
    poll_once, AuthContext, EventOutcome, MemoryRowStore, NotificationCache, RowSource, RowWrite,
    SyncEngine, TransportError, ViewRegistry, NOTIFICATION_CAPACITY,
};
use viewsync_protocol::{
    decode_frame, ClientFrame, EventKind, NotificationRecord, RawFrame, Row, ServerEvent,
};

fn active_view(page_size: u32) -> ViewDescriptor {
    ViewDescriptor::new("products", page_size)
        .expect("descriptor")
        .with_status(StatusScope::Active)
}

fn ids(page: &ViewPage) -> Vec<String> {
    page.rows().iter().filter_map(Row::id).collect()
}

fn notification(n: usize) -> NotificationRecord {
    NotificationRecord {
        id: format!("n{n}"),
        recipient_id: "u1".to_string(),
        created_at: Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap(),
        is_read: false,
        payload: Value::Null,
    }
}

#[test]
fn upsert_into_uncached_first_page() {
    let registry = ViewRegistry::default();
    let view = active_view(2);
    let _sub = registry.subscribe(&view, |_, _| {});
    assert!(registry.snapshot(&view).is_none());

    registry.apply(
        "products",
        &[Mutation::Upsert(Row::new().with("id", "r1").with("status", "active"))],
    );

    let page = registry.snapshot(&view).expect("page");
    assert_eq!(ids(&page), vec!["r1"]);
    assert_eq!(page.total(), 1);
    assert_eq!(page.total_pages(), 1);
}

#[test]
fn remove_from_first_page_shrinks_totals() {
    let registry = ViewRegistry::default();
    let view = active_view(2);
    let _sub = registry.subscribe(&view, |_, _| {});
    let rows = vec![
        Row::new().with("id", "r2").with("status", "active"),
        Row::new().with("id", "r1").with("status", "active"),
    ];
    registry.store_page(&view, ViewPage::new(rows, 5, 1, 2));
    assert_eq!(registry.snapshot(&view).expect("page").total_pages(), 3);

    registry.apply("products", &[Mutation::Remove("r2".to_string())]);

    let page = registry.snapshot(&view).expect("page");
    assert_eq!(ids(&page), vec!["r1"]);
    assert_eq!(page.total(), 4);
    assert_eq!(page.total_pages(), 2);
}

#[test]
fn full_notification_cache_evicts_oldest() {
    let cache = NotificationCache::new();
    for n in 1..=NOTIFICATION_CAPACITY {
        cache.insert("u1", notification(n));
    }
    cache.insert("u1", notification(51));

    let entries = cache.list("u1");
    assert_eq!(entries.len(), 50);
    assert_eq!(entries[0].id, "n51");
    assert!(entries.iter().all(|entry| entry.id != "n1"));
}

/// Accepts every connection and never delivers anything.
#[derive(Default)]
struct DeadEndTransport {
    sessions: Mutex<Vec<InboundSender>>,
}

impl Transport for DeadEndTransport {
    fn open(
        &self,
        _timeout: Duration,
        inbound: InboundSender,
    ) -> Result<Arc<dyn Link>, TransportError> {
        self.sessions.lock().expect("sessions").push(inbound);
        Ok(Arc::new(DeadEndLink))
    }
}

struct DeadEndLink;

impl Link for DeadEndLink {
    fn emit(&self, _frame: &ClientFrame) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&self) {}
}

#[test]
fn double_unsubscribe_across_teardown() {
    let manager = ChannelManager::new(
        Arc::new(DeadEndTransport::default()),
        ChannelConfig {
            reconnect_base_ms: 10,
            reconnect_max_ms: 20,
            ..ChannelConfig::default()
        },
    );
    let channel = manager.connect();
    assert!(channel.wait_connected(Duration::from_secs(5)));
    let sub = channel.subscribe(EventKind::ResourceUpsert, |_| {});

    sub.unsubscribe();
    drop(channel);
    drop(manager);
    sub.unsubscribe();
}

#[test]
fn redelivered_events_are_idempotent() {
    let engine = SyncEngine::new("u1", ViewRegistry::default());
    let view = active_view(3);
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    let _sub = engine.views().subscribe(&view, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let frame = RawFrame::new(
        "resource:upsert:batch",
        json!({
            "resourceType": "products",
            "rows": [
                { "id": 1, "status": "active" },
                { "id": "2", "status": "ACTIVE" },
                "garbage"
            ]
        }),
    );
    let event = decode_frame(&frame).expect("decode");
    assert_eq!(engine.handle_event(&event), EventOutcome::ViewsChanged(1));
    assert_eq!(engine.handle_event(&event), EventOutcome::Ignored);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    let page = engine.views().snapshot(&view).expect("page");
    assert_eq!(ids(&page), vec!["2", "1"]);
    assert_eq!(page.total(), 2);

    let new_note = ServerEvent::NotificationNew(notification(1));
    engine.handle_event(&new_note);
    engine.handle_event(&new_note);
    assert_eq!(engine.recent_notifications().len(), 1);
}

#[test]
fn paging_invariants_hold_under_mixed_mutations() {
    let registry = ViewRegistry::default();
    let view = active_view(4);
    let _sub = registry.subscribe(&view, |_, _| {});

    for step in 0..200usize {
        let id = format!("r{}", step % 13);
        let mutation = match step % 5 {
            0 | 1 => Mutation::Upsert(Row::new().with("id", id).with("status", "active")),
            2 => Mutation::Upsert(Row::new().with("id", id).with("status", "inactive")),
            3 => Mutation::Remove(id),
            _ => Mutation::Upsert(
                Row::new()
                    .with("id", id)
                    .with("status", "active")
                    .with("deletedAt", "2024-01-01T00:00:00Z"),
            ),
        };
        registry.apply("products", &[mutation]);

        if let Some(page) = registry.snapshot(&view) {
            assert!(page.rows().len() <= 4);
            assert!(page.total() >= page.rows().len() as u64);
            let mut seen = ids(&page);
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), page.rows().len(), "duplicate row ids on page");
        }
    }
}

#[test]
fn polling_feeds_the_same_views_as_push() {
    let predicates = Arc::new(FieldPredicates::new());
    let store = Arc::new(MemoryRowStore::new("products", predicates));
    store.seed(vec![Row::new().with("id", "seed").with("status", "active")]);

    let engine = SyncEngine::new("u1", ViewRegistry::default());
    let view = active_view(10);
    let _sub = engine.views().subscribe(&view, |_, _| {});
    let loaded = engine
        .views()
        .load(&view, store.as_ref() as &dyn RowSource)
        .expect("load");
    assert_eq!(loaded.total(), 1);

    let editor = AuthContext::new("editor")
        .with_permission("products.create")
        .with_permission("products.delete");
    store
        .write(
            &editor,
            RowWrite::Create(Row::new().with("id", "fresh").with("status", "active")),
        )
        .expect("create");
    store
        .write(&editor, RowWrite::Delete("seed".to_string()))
        .expect("soft delete");

    assert_eq!(poll_once(&engine, store.as_ref()), 2);
    let page = engine.views().snapshot(&view).expect("page");
    assert_eq!(ids(&page), vec!["fresh"]);
    assert_eq!(page.total(), 1);

    // A pushed copy of an already polled change is a no-op.
    let pushed = ServerEvent::ResourceUpsert {
        resource_type: "products".to_string(),
        row: Row::new().with("id", "fresh").with("status", "active"),
    };
    assert_eq!(engine.handle_event(&pushed), EventOutcome::Ignored);
    assert_eq!(store.fetch_page(&view).expect("fetch"), *page);
}

#[test]
fn inbound_frames_are_plain_data() {
    let frame = RawFrame::new("notification:deleted", json!({ "id": 7 }));
    let inbound = Inbound::Frame(frame.clone());
    assert_eq!(inbound, Inbound::Frame(frame));
}
