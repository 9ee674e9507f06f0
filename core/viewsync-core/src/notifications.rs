//! Bounded per-recipient notification buffer.
//!
//! A fast-path read accelerator in front of durable storage, not the system
//! of record: absence here proves nothing. Each recipient holds at most
//! [`NOTIFICATION_CAPACITY`] records, newest first; inserting past the bound
//! evicts from the tail (strict FIFO by arrival, not LRU).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use viewsync_protocol::NotificationRecord;

pub const NOTIFICATION_CAPACITY: usize = 50;

#[derive(Default)]
pub struct NotificationCache {
    recipients: Mutex<HashMap<String, VecDeque<NotificationRecord>>>,
}

impl NotificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `record`, evicting the oldest entries beyond capacity.
    ///
    /// A redelivered record (same id) replaces its earlier copy so
    /// at-least-once delivery never produces duplicates.
    pub fn insert(&self, recipient_id: &str, record: NotificationRecord) {
        let mut recipients = self.lock();
        let entries = recipients.entry(recipient_id.to_string()).or_default();
        if let Some(index) = entries.iter().position(|entry| entry.id == record.id) {
            entries.remove(index);
        }
        entries.push_front(record);
        entries.truncate(NOTIFICATION_CAPACITY);
    }

    /// Applies `mutator` in place and returns the updated record.
    pub fn update<F>(&self, recipient_id: &str, id: &str, mutator: F) -> Option<NotificationRecord>
    where
        F: FnOnce(&mut NotificationRecord),
    {
        let mut recipients = self.lock();
        let entry = recipients
            .get_mut(recipient_id)?
            .iter_mut()
            .find(|entry| entry.id == id)?;
        mutator(entry);
        Some(entry.clone())
    }

    pub fn remove(&self, recipient_id: &str, id: &str) -> bool {
        let mut recipients = self.lock();
        let Some(entries) = recipients.get_mut(recipient_id) else {
            return false;
        };
        let Some(index) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        entries.remove(index);
        if entries.is_empty() {
            recipients.remove(recipient_id);
        }
        true
    }

    /// Full replace, used for resync after a reconnect. `records` are taken
    /// newest first; anything past capacity is dropped.
    pub fn replace_all(&self, recipient_id: &str, records: Vec<NotificationRecord>) {
        let mut recipients = self.lock();
        if records.is_empty() {
            recipients.remove(recipient_id);
            return;
        }
        let mut entries: VecDeque<NotificationRecord> = VecDeque::with_capacity(NOTIFICATION_CAPACITY);
        for record in records {
            if entries.len() == NOTIFICATION_CAPACITY {
                break;
            }
            if !entries.iter().any(|entry| entry.id == record.id) {
                entries.push_back(record);
            }
        }
        recipients.insert(recipient_id.to_string(), entries);
    }

    pub fn list(&self, recipient_id: &str) -> Vec<NotificationRecord> {
        self.lock()
            .get(recipient_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, recipient_id: &str, id: &str) -> Option<NotificationRecord> {
        self.lock()
            .get(recipient_id)?
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn len(&self, recipient_id: &str) -> usize {
        self.lock().get(recipient_id).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, recipient_id: &str) -> bool {
        self.len(recipient_id) == 0
    }

    pub fn unread_count(&self, recipient_id: &str) -> usize {
        self.lock()
            .get(recipient_id)
            .map_or(0, |entries| entries.iter().filter(|entry| !entry.is_read).count())
    }

    /// Returns how many records flipped to read.
    pub fn mark_all_read(&self, recipient_id: &str) -> usize {
        let mut recipients = self.lock();
        let Some(entries) = recipients.get_mut(recipient_id) else {
            return 0;
        };
        let mut changed = 0;
        for entry in entries.iter_mut().filter(|entry| !entry.is_read) {
            entry.is_read = true;
            changed += 1;
        }
        changed
    }

    pub fn clear_recipient(&self, recipient_id: &str) -> bool {
        self.lock().remove(recipient_id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<NotificationRecord>>> {
        // A poisoned buffer is still a valid buffer; keep serving it.
        self.recipients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
