//! The single entry point that routes decoded events into view caches and
//! the notification cache.
//!
//! The engine is scoped to one recipient: notification events addressed to
//! anyone else are dropped. It does not own the channel; [`SyncEngine::attach`]
//! wires it to a [`ChannelHandle`] and [`spawn_poller`] wires it to a
//! [`ChangeFeed`] when no push channel is available.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use viewsync_protocol::{EventKind, NotificationRecord, ServerEvent, ViewScope};

use crate::channel::{ChannelHandle, Subscription};
use crate::config::{PollingConfig, SyncConfig};
use crate::notifications::NotificationCache;
use crate::store::ChangeFeed;
use crate::ticker::Ticker;
use crate::view::{Mutation, ViewDescriptor, ViewPage, ViewRegistry, ViewSubscription};

/// What one event did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Number of open views whose page changed.
    ViewsChanged(usize),
    NotificationsChanged,
    Ignored,
}

pub struct SyncEngine {
    recipient_id: String,
    views: ViewRegistry,
    notifications: Arc<NotificationCache>,
}

impl SyncEngine {
    pub fn new(recipient_id: impl Into<String>, views: ViewRegistry) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            views,
            notifications: Arc::new(NotificationCache::new()),
        }
    }

    pub fn from_config(recipient_id: impl Into<String>, config: &SyncConfig) -> Self {
        Self::new(recipient_id, ViewRegistry::new(config.views.quiescence()))
    }

    pub fn recipient_id(&self) -> &str {
        &self.recipient_id
    }

    pub fn views(&self) -> &ViewRegistry {
        &self.views
    }

    pub fn notifications(&self) -> &Arc<NotificationCache> {
        &self.notifications
    }

    /// Notifications for this engine's recipient, newest first.
    pub fn recent_notifications(&self) -> Vec<NotificationRecord> {
        self.notifications.list(&self.recipient_id)
    }

    pub fn handle_event(&self, event: &ServerEvent) -> EventOutcome {
        match event {
            ServerEvent::ResourceUpsert { resource_type, row } => {
                self.apply(resource_type, &[Mutation::Upsert(row.clone())])
            }
            ServerEvent::ResourceUpsertBatch {
                resource_type,
                rows,
                rejected,
            } => {
                warn_rejected(resource_type, event.kind(), *rejected);
                let mutations: Vec<Mutation> = rows.iter().cloned().map(Mutation::Upsert).collect();
                self.apply(resource_type, &mutations)
            }
            ServerEvent::ResourceRemove { resource_type, id } => {
                self.apply(resource_type, &[Mutation::Remove(id.clone())])
            }
            ServerEvent::ResourceRemoveBatch {
                resource_type,
                ids,
                rejected,
            } => {
                warn_rejected(resource_type, event.kind(), *rejected);
                let mutations: Vec<Mutation> = ids.iter().cloned().map(Mutation::Remove).collect();
                self.apply(resource_type, &mutations)
            }
            ServerEvent::NotificationNew(record) => {
                if !self.is_mine(record) {
                    return EventOutcome::Ignored;
                }
                self.notifications.insert(&self.recipient_id, record.clone());
                EventOutcome::NotificationsChanged
            }
            ServerEvent::NotificationUpdated(record) => {
                if !self.is_mine(record) {
                    return EventOutcome::Ignored;
                }
                let replacement = record.clone();
                match self
                    .notifications
                    .update(&self.recipient_id, &record.id, move |current| {
                        *current = replacement
                    }) {
                    Some(_) => EventOutcome::NotificationsChanged,
                    None => {
                        debug!(id = %record.id, "Update for uncached notification ignored");
                        EventOutcome::Ignored
                    }
                }
            }
            ServerEvent::NotificationDeleted { id } => {
                if self.notifications.remove(&self.recipient_id, id) {
                    EventOutcome::NotificationsChanged
                } else {
                    EventOutcome::Ignored
                }
            }
            ServerEvent::NotificationsSync(records) => {
                let mine: Vec<NotificationRecord> = records
                    .iter()
                    .filter(|record| self.is_mine(record))
                    .cloned()
                    .collect();
                self.notifications.replace_all(&self.recipient_id, mine);
                EventOutcome::NotificationsChanged
            }
        }
    }

    /// Registers a handler for every event kind on `channel`. Keep the
    /// returned subscriptions alive for as long as events should flow.
    pub fn attach(self: &Arc<Self>, channel: &ChannelHandle) -> Vec<Subscription> {
        EventKind::ALL
            .iter()
            .map(|kind| {
                let engine = Arc::clone(self);
                channel.subscribe(*kind, move |event| {
                    engine.handle_event(event);
                })
            })
            .collect()
    }

    /// Opens a view and scopes the channel to it. The view stays open, and
    /// joined, until the returned guard and every other guard for the same
    /// descriptor are dropped.
    pub fn open_view<F>(
        &self,
        channel: &ChannelHandle,
        descriptor: &ViewDescriptor,
        listener: F,
    ) -> OpenView
    where
        F: Fn(&ViewDescriptor, &Arc<ViewPage>) + Send + Sync + 'static,
    {
        let subscription = self.views.subscribe(descriptor, listener);
        let scope = ViewScope::new(descriptor.resource_type(), descriptor.view_key());
        channel.join_view(scope.clone());
        OpenView {
            subscription,
            scope,
            views: self.views.clone(),
            channel: channel.clone(),
        }
    }

    fn apply(&self, resource_type: &str, mutations: &[Mutation]) -> EventOutcome {
        match self.views.apply(resource_type, mutations) {
            0 => EventOutcome::Ignored,
            changed => EventOutcome::ViewsChanged(changed),
        }
    }

    fn is_mine(&self, record: &NotificationRecord) -> bool {
        if record.recipient_id == self.recipient_id {
            return true;
        }
        debug!(
            id = %record.id,
            recipient_id = %record.recipient_id,
            "Dropping notification for another recipient"
        );
        false
    }
}

fn warn_rejected(resource_type: &str, kind: EventKind, rejected: usize) {
    if rejected > 0 {
        warn!(
            resource_type = %resource_type,
            event = %kind,
            rejected,
            "Skipped malformed batch members"
        );
    }
}

/// An open view bound to a channel. See [`SyncEngine::open_view`].
pub struct OpenView {
    subscription: ViewSubscription,
    scope: ViewScope,
    views: ViewRegistry,
    channel: ChannelHandle,
}

impl OpenView {
    pub fn descriptor(&self) -> &ViewDescriptor {
        self.subscription.descriptor()
    }

    pub fn page(&self) -> Option<Arc<ViewPage>> {
        self.views.snapshot(self.subscription.descriptor())
    }
}

impl Drop for OpenView {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        if self.views.subscriber_count(self.subscription.descriptor()) == 0 {
            self.channel.leave_view(&self.scope);
        }
    }
}

/// Drives `engine` from `feed` on an interval. Feed errors are logged and
/// retried on the next tick.
pub fn spawn_poller(
    engine: Arc<SyncEngine>,
    feed: Arc<dyn ChangeFeed>,
    interval: Duration,
) -> std::io::Result<Ticker> {
    Ticker::spawn("viewsync-poller", interval, move || {
        poll_once(&engine, feed.as_ref());
    })
}

/// Starts the poller when `[polling]` is enabled.
pub fn spawn_configured_poller(
    engine: Arc<SyncEngine>,
    feed: Arc<dyn ChangeFeed>,
    config: &PollingConfig,
) -> std::io::Result<Option<Ticker>> {
    if !config.enabled {
        return Ok(None);
    }
    spawn_poller(engine, feed, config.interval()).map(Some)
}

/// One polling pass. Returns how many events were applied.
pub fn poll_once(engine: &SyncEngine, feed: &dyn ChangeFeed) -> usize {
    match feed.poll_changes() {
        Ok(events) => {
            for event in &events {
                engine.handle_event(event);
            }
            if !events.is_empty() {
                debug!(events = events.len(), "Applied polled changes");
            }
            events.len()
        }
        Err(err) => {
            warn!(error = %err, "Change feed poll failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use viewsync_protocol::Row;

    fn note(id: &str, recipient: &str) -> NotificationRecord {
        NotificationRecord {
            id: id.to_string(),
            recipient_id: recipient.to_string(),
            created_at: Utc::now(),
            is_read: false,
            payload: Value::Null,
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new("u1", ViewRegistry::default())
    }

    #[test]
    fn foreign_notifications_are_dropped() {
        let engine = engine();
        assert_eq!(
            engine.handle_event(&ServerEvent::NotificationNew(note("n1", "u2"))),
            EventOutcome::Ignored
        );
        assert!(engine.recent_notifications().is_empty());
    }

    #[test]
    fn notification_lifecycle() {
        let engine = engine();
        engine.handle_event(&ServerEvent::NotificationNew(note("n1", "u1")));
        engine.handle_event(&ServerEvent::NotificationNew(note("n2", "u1")));

        let mut read = note("n1", "u1");
        read.is_read = true;
        assert_eq!(
            engine.handle_event(&ServerEvent::NotificationUpdated(read)),
            EventOutcome::NotificationsChanged
        );
        assert_eq!(engine.notifications().unread_count("u1"), 1);

        assert_eq!(
            engine.handle_event(&ServerEvent::NotificationUpdated(note("ghost", "u1"))),
            EventOutcome::Ignored
        );
        assert_eq!(
            engine.handle_event(&ServerEvent::NotificationDeleted { id: "n2".into() }),
            EventOutcome::NotificationsChanged
        );
        assert_eq!(
            engine.handle_event(&ServerEvent::NotificationDeleted { id: "n2".into() }),
            EventOutcome::Ignored
        );

        engine.handle_event(&ServerEvent::NotificationsSync(vec![
            note("s1", "u1"),
            note("s2", "u9"),
        ]));
        let ids: Vec<_> = engine
            .recent_notifications()
            .into_iter()
            .map(|record| record.id)
            .collect();
        assert_eq!(ids, vec!["s1".to_string()]);
    }

    #[test]
    fn configured_poller_runs_only_when_enabled() {
        use crate::permissions::{AuthContext, SUPER_ADMIN_ROLE};
        use crate::store::{MemoryRowStore, RowWrite};
        use crate::view::FieldPredicates;
        use std::time::Instant;

        let engine = Arc::new(engine());
        let store = Arc::new(MemoryRowStore::new("products", Arc::new(FieldPredicates::new())));
        let disabled = PollingConfig::default();
        assert!(spawn_configured_poller(Arc::clone(&engine), store.clone(), &disabled)
            .expect("spawn")
            .is_none());

        let view = ViewDescriptor::new("products", 5).expect("descriptor");
        let _sub = engine.views().subscribe(&view, |_, _| {});
        let admin = AuthContext::new("root").with_role(SUPER_ADMIN_ROLE);
        store
            .write(&admin, RowWrite::Create(Row::new().with("id", "a").with("status", "active")))
            .expect("create");

        let enabled = PollingConfig {
            enabled: true,
            interval_ms: 10,
        };
        let poller = spawn_configured_poller(Arc::clone(&engine), store.clone(), &enabled)
            .expect("spawn")
            .expect("poller");
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.views().snapshot(&view).is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(poller);
        assert_eq!(engine.views().snapshot(&view).expect("page").total(), 1);
    }

    #[test]
    fn resource_events_reach_open_views() {
        let engine = engine();
        let view = ViewDescriptor::new("products", 10).expect("descriptor");
        let _sub = engine.views().subscribe(&view, |_, _| {});

        let outcome = engine.handle_event(&ServerEvent::ResourceUpsertBatch {
            resource_type: "products".into(),
            rows: vec![
                Row::new().with("id", "a").with("status", "active"),
                Row::new().with("id", "b").with("status", "active"),
            ],
            rejected: 1,
        });
        assert_eq!(outcome, EventOutcome::ViewsChanged(1));

        let outcome = engine.handle_event(&ServerEvent::ResourceRemoveBatch {
            resource_type: "products".into(),
            ids: vec!["a".into(), "zzz".into()],
            rejected: 0,
        });
        assert_eq!(outcome, EventOutcome::ViewsChanged(1));
        assert_eq!(engine.views().snapshot(&view).expect("page").total(), 1);

        assert_eq!(
            engine.handle_event(&ServerEvent::ResourceRemove {
                resource_type: "orders".into(),
                id: "b".into(),
            }),
            EventOutcome::Ignored
        );
    }
}
