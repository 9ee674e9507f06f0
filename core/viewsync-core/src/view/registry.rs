//! Index of open view caches, keyed by normalized descriptor.
//!
//! Views sharing a descriptor share one entry and one page. An entry lives
//! exactly as long as it has subscribers; the last [`ViewSubscription`] to
//! drop discards the cached page.
//!
//! Locking: one mutex guards the entry map. Listeners are always invoked
//! after the lock is released, with an `Arc<ViewPage>` snapshot, so a
//! listener may call back into the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use super::descriptor::ViewDescriptor;
use super::page::ViewPage;
use super::predicates::{FieldPredicates, ViewPredicates};
use super::reconciler::{reconcile_batch, Mutation, Reconciled};
use crate::error::Result;
use crate::store::RowSource;
use crate::ticker::Ticker;

pub type ViewListener = Arc<dyn Fn(&ViewDescriptor, &Arc<ViewPage>) + Send + Sync>;

type Notification = (ViewDescriptor, Arc<ViewPage>, Vec<ViewListener>);

struct ViewEntry {
    page: Option<Arc<ViewPage>>,
    listeners: Vec<(u64, ViewListener)>,
    /// Last page handed to listeners.
    notified: Option<Arc<ViewPage>>,
    /// Set while a debounced notification is pending.
    last_change: Option<Instant>,
}

impl ViewEntry {
    fn listener_fns(&self) -> Vec<ViewListener> {
        self.listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

struct RegistryInner {
    views: Mutex<HashMap<ViewDescriptor, ViewEntry>>,
    predicates: RwLock<HashMap<String, Arc<dyn ViewPredicates>>>,
    default_predicates: Arc<dyn ViewPredicates>,
    quiescence: Duration,
    next_listener_id: AtomicU64,
}

#[derive(Clone)]
pub struct ViewRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ViewRegistry {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ViewRegistry {
    /// `quiescence` is the debounce window; zero notifies on every change.
    pub fn new(quiescence: Duration) -> Self {
        Self::with_default_predicates(quiescence, Arc::new(FieldPredicates::new()))
    }

    pub fn with_default_predicates(
        quiescence: Duration,
        default_predicates: Arc<dyn ViewPredicates>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                views: Mutex::new(HashMap::new()),
                predicates: RwLock::new(HashMap::new()),
                default_predicates,
                quiescence,
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn register_predicates(&self, resource_type: &str, predicates: Arc<dyn ViewPredicates>) {
        self.inner
            .predicates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(resource_type.to_string(), predicates);
    }

    pub fn predicates_for(&self, resource_type: &str) -> Arc<dyn ViewPredicates> {
        self.inner
            .predicates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(resource_type)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.inner.default_predicates))
    }

    pub fn subscribe<F>(&self, descriptor: &ViewDescriptor, listener: F) -> ViewSubscription
    where
        F: Fn(&ViewDescriptor, &Arc<ViewPage>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut views = self.lock();
        views
            .entry(descriptor.clone())
            .or_insert_with(|| ViewEntry {
                page: None,
                listeners: Vec::new(),
                notified: None,
                last_change: None,
            })
            .listeners
            .push((id, Arc::new(listener)));
        debug!(
            resource_type = %descriptor.resource_type(),
            view_key = %descriptor.view_key(),
            "View subscribed"
        );
        ViewSubscription {
            id,
            descriptor: descriptor.clone(),
            registry: Arc::downgrade(&self.inner),
            released: AtomicBool::new(false),
        }
    }

    pub fn subscriber_count(&self, descriptor: &ViewDescriptor) -> usize {
        self.lock()
            .get(descriptor)
            .map_or(0, |entry| entry.listeners.len())
    }

    /// Number of distinct open views.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self, descriptor: &ViewDescriptor) -> Option<Arc<ViewPage>> {
        self.lock().get(descriptor).and_then(|entry| entry.page.clone())
    }

    /// Installs a freshly fetched page. Ignored for views nobody has open.
    pub fn store_page(&self, descriptor: &ViewDescriptor, page: ViewPage) -> bool {
        let page = Arc::new(page);
        let notification = {
            let mut views = self.lock();
            let Some(entry) = views.get_mut(descriptor) else {
                return false;
            };
            if entry.page.as_deref() == Some(&*page) {
                return true;
            }
            entry.page = Some(Arc::clone(&page));
            entry.notified = Some(Arc::clone(&page));
            entry.last_change = None;
            (descriptor.clone(), page, entry.listener_fns())
        };
        fire(vec![notification]);
        true
    }

    /// Returns the cached page, fetching it through `source` on a miss.
    pub fn load(&self, descriptor: &ViewDescriptor, source: &dyn RowSource) -> Result<Arc<ViewPage>> {
        if let Some(page) = self.snapshot(descriptor) {
            return Ok(page);
        }
        let page = source.fetch_page(descriptor)?;
        self.store_page(descriptor, page.clone());
        Ok(self.snapshot(descriptor).unwrap_or_else(|| Arc::new(page)))
    }

    /// Drops the cached page so the next [`ViewRegistry::load`] re-fetches.
    pub fn invalidate(&self, descriptor: &ViewDescriptor) -> bool {
        self.lock()
            .get_mut(descriptor)
            .and_then(|entry| entry.page.take())
            .is_some()
    }

    pub fn invalidate_resource(&self, resource_type: &str) -> usize {
        self.lock()
            .iter_mut()
            .filter(|(descriptor, _)| descriptor.resource_type() == resource_type)
            .filter_map(|(_, entry)| entry.page.take())
            .count()
    }

    /// Fans `mutations` out to every open view of `resource_type`. Returns
    /// how many views changed.
    pub fn apply(&self, resource_type: &str, mutations: &[Mutation]) -> usize {
        if mutations.is_empty() {
            return 0;
        }
        let predicates = self.predicates_for(resource_type);
        let immediate = self.inner.quiescence.is_zero();
        let now = Instant::now();
        let mut notifications = Vec::new();
        let mut changed = 0;

        {
            let mut views = self.lock();
            for (descriptor, entry) in views
                .iter_mut()
                .filter(|(descriptor, _)| descriptor.resource_type() == resource_type)
            {
                let outcome = reconcile_batch(
                    descriptor,
                    entry.page.as_deref(),
                    mutations,
                    predicates.as_ref(),
                );
                if let Reconciled::Changed(page) = outcome {
                    let page = Arc::new(page);
                    entry.page = Some(Arc::clone(&page));
                    changed += 1;
                    if immediate {
                        entry.notified = Some(Arc::clone(&page));
                        notifications.push((descriptor.clone(), page, entry.listener_fns()));
                    } else {
                        entry.last_change = Some(now);
                    }
                }
            }
        }

        if changed > 0 {
            debug!(
                resource_type = %resource_type,
                mutations = mutations.len(),
                views_changed = changed,
                "Applied mutations to views"
            );
        }
        fire(notifications);
        changed
    }

    /// Delivers debounced notifications whose quiescence window has elapsed
    /// as of `now`. Returns how many views were notified.
    pub fn flush_due(&self, now: Instant) -> usize {
        let quiescence = self.inner.quiescence;
        self.flush_where(|last_change| now.saturating_duration_since(last_change) >= quiescence)
    }

    /// Delivers every pending notification regardless of the window.
    pub fn flush_all(&self) -> usize {
        self.flush_where(|_| true)
    }

    pub fn spawn_flusher(&self, interval: Duration) -> std::io::Result<Ticker> {
        let registry = Arc::downgrade(&self.inner);
        Ticker::spawn("viewsync-view-flusher", interval, move || {
            if let Some(inner) = registry.upgrade() {
                ViewRegistry { inner }.flush_due(Instant::now());
            }
        })
    }

    fn flush_where<P>(&self, due: P) -> usize
    where
        P: Fn(Instant) -> bool,
    {
        let mut notifications: Vec<Notification> = Vec::new();
        {
            let mut views = self.lock();
            for (descriptor, entry) in views.iter_mut() {
                if !entry.last_change.map_or(false, &due) {
                    continue;
                }
                entry.last_change = None;
                let Some(page) = entry.page.clone() else {
                    continue;
                };
                // Changes that cancelled out within the window.
                if entry.notified.as_deref() == Some(&*page) {
                    continue;
                }
                entry.notified = Some(Arc::clone(&page));
                notifications.push((descriptor.clone(), page, entry.listener_fns()));
            }
        }
        let count = notifications.len();
        fire(notifications);
        count
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ViewDescriptor, ViewEntry>> {
        lock_views(&self.inner)
    }
}

fn lock_views(inner: &RegistryInner) -> MutexGuard<'_, HashMap<ViewDescriptor, ViewEntry>> {
    inner
        .views
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fire(notifications: Vec<Notification>) {
    for (descriptor, page, listeners) in notifications {
        for listener in listeners {
            listener(&descriptor, &page);
        }
    }
}

/// Keeps a view open. Dropping it (or calling
/// [`ViewSubscription::unsubscribe`]) releases the listener; releasing
/// twice is a no-op.
pub struct ViewSubscription {
    id: u64,
    descriptor: ViewDescriptor,
    registry: Weak<RegistryInner>,
    released: AtomicBool,
}

impl ViewSubscription {
    pub fn descriptor(&self) -> &ViewDescriptor {
        &self.descriptor
    }

    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut views = lock_views(&inner);
        let Some(entry) = views.get_mut(&self.descriptor) else {
            return;
        };
        entry.listeners.retain(|(id, _)| *id != self.id);
        if entry.listeners.is_empty() {
            views.remove(&self.descriptor);
            debug!(
                resource_type = %self.descriptor.resource_type(),
                view_key = %self.descriptor.view_key(),
                "View discarded after last subscriber left"
            );
        }
    }
}

impl Drop for ViewSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::descriptor::StatusScope;
    use std::sync::atomic::AtomicUsize;
    use viewsync_protocol::Row;

    fn products(page_size: u32) -> ViewDescriptor {
        ViewDescriptor::new("products", page_size)
            .unwrap()
            .with_status(StatusScope::Active)
    }

    fn active(id: &str) -> Row {
        Row::new().with("id", id).with("status", "active")
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&ViewDescriptor, &Arc<ViewPage>) + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        (count, move |_: &ViewDescriptor, _: &Arc<ViewPage>| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn shared_descriptor_shares_entry_until_last_unsubscribe() {
        let registry = ViewRegistry::default();
        let view = products(2);
        let first = registry.subscribe(&view, |_, _| {});
        let second = registry.subscribe(&view, |_, _| {});
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.subscriber_count(&view), 2);

        registry.apply("products", &[Mutation::Upsert(active("r1"))]);
        drop(first);
        assert!(registry.snapshot(&view).is_some());

        second.unsubscribe();
        second.unsubscribe();
        assert!(registry.is_empty());
        assert!(registry.snapshot(&view).is_none());
    }

    #[test]
    fn notifies_only_changed_views() {
        let registry = ViewRegistry::default();
        let (active_count, on_active) = counter();
        let (inactive_count, on_inactive) = counter();
        let _active = registry.subscribe(&products(2), on_active);
        let _inactive = registry.subscribe(
            &products(2).with_status(StatusScope::Inactive),
            on_inactive,
        );

        assert_eq!(registry.apply("products", &[Mutation::Upsert(active("r1"))]), 1);
        assert_eq!(registry.apply("products", &[Mutation::Upsert(active("r1"))]), 0);
        assert_eq!(registry.apply("orders", &[Mutation::Upsert(active("r1"))]), 0);
        assert_eq!(active_count.load(Ordering::SeqCst), 1);
        assert_eq!(inactive_count.load(Ordering::SeqCst), 0);
        assert!(registry
            .snapshot(&products(2).with_status(StatusScope::Inactive))
            .is_none());
    }

    #[test]
    fn batch_notifies_once() {
        let registry = ViewRegistry::default();
        let (count, listener) = counter();
        let _view = registry.subscribe(&products(5), listener);
        let batch: Vec<_> = ["a", "b", "c"].iter().map(|id| Mutation::Upsert(active(id))).collect();
        registry.apply("products", &batch);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.snapshot(&products(5)).unwrap().total(), 3);
    }

    #[test]
    fn debounce_coalesces_until_quiescent() {
        let registry = ViewRegistry::new(Duration::from_millis(200));
        let (count, listener) = counter();
        let _view = registry.subscribe(&products(5), listener);

        registry.apply("products", &[Mutation::Upsert(active("a"))]);
        registry.apply("products", &[Mutation::Upsert(active("b"))]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.flush_due(Instant::now()), 0);

        let later = Instant::now() + Duration::from_millis(250);
        assert_eq!(registry.flush_due(later), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.flush_all(), 0);
    }

    #[test]
    fn debounce_skips_changes_that_cancel_out() {
        let registry = ViewRegistry::new(Duration::from_millis(50));
        let view = products(5);
        let (count, listener) = counter();
        let _sub = registry.subscribe(&view, listener);
        registry.store_page(&view, ViewPage::empty_for(&view));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert_eq!(registry.apply("products", &[Mutation::Upsert(active("a"))]), 1);
        assert_eq!(registry.apply("products", &[Mutation::Remove("a".to_string())]), 1);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(registry.flush_due(later), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.flush_all(), 0);

        registry.apply("products", &[Mutation::Upsert(active("b"))]);
        assert_eq!(registry.flush_all(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_drops_page_but_keeps_subscribers() {
        let registry = ViewRegistry::default();
        let view = products(2);
        let _sub = registry.subscribe(&view, |_, _| {});
        registry.apply("products", &[Mutation::Upsert(active("a"))]);
        assert!(registry.invalidate(&view));
        assert!(!registry.invalidate(&view));
        assert_eq!(registry.subscriber_count(&view), 1);
        assert!(registry.snapshot(&view).is_none());
    }

    #[test]
    fn store_page_ignores_closed_views() {
        let registry = ViewRegistry::default();
        let view = products(2);
        assert!(!registry.store_page(&view, ViewPage::empty_for(&view)));
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_may_reenter_registry() {
        let registry = ViewRegistry::default();
        let view = products(2);
        let inner = registry.clone();
        let observed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&observed);
        let _sub = registry.subscribe(&view, move |descriptor, _| {
            let total = inner.snapshot(descriptor).map_or(0, |page| page.total());
            seen.store(total as usize, Ordering::SeqCst);
        });
        registry.apply("products", &[Mutation::Upsert(active("a"))]);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
