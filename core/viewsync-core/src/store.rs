//! Row sources: where view pages come from on a cache miss, and where the
//! polling fallback reads changes from.
//!
//! [`MemoryRowStore`] is the in-process implementation used by tests and the
//! `viewsync-tap` tool. Its writes are permission-gated and each one records
//! the event a server would have pushed, so a poller can replay them.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};
use viewsync_protocol::{Row, ServerEvent};

use crate::error::{Result, SyncError};
use crate::permissions::{authorize, permission_for, Action, AuthContext, AuthContextSource};
use crate::view::{ViewDescriptor, ViewPage, ViewPredicates, DELETED_AT_FIELD};

/// Unpolled changes kept by a [`MemoryRowStore`]; older ones are discarded.
pub const CHANGE_LOG_CAPACITY: usize = 1024;

/// Fetches one page of a view from the authoritative store.
pub trait RowSource: Send + Sync {
    fn fetch_page(&self, descriptor: &ViewDescriptor) -> Result<ViewPage>;
}

/// Pull-based change source for when no push channel is available.
pub trait ChangeFeed: Send + Sync {
    /// Returns changes since the previous call, oldest first.
    fn poll_changes(&self) -> Result<Vec<ServerEvent>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Create(Row),
    Update(Row),
    /// Soft delete: stamps the deleted-at field.
    Delete(String),
    Restore(String),
    HardDelete(String),
}

impl RowWrite {
    pub fn action(&self) -> Action {
        match self {
            RowWrite::Create(_) => Action::Create,
            RowWrite::Update(_) => Action::Update,
            RowWrite::Delete(_) => Action::Delete,
            RowWrite::Restore(_) => Action::Restore,
            RowWrite::HardDelete(_) => Action::HardDelete,
        }
    }
}

#[derive(Default)]
struct StoreState {
    /// Newest first, matching the order new rows appear at a view's head.
    rows: Vec<Row>,
    changes: VecDeque<ServerEvent>,
}

pub struct MemoryRowStore {
    resource_type: String,
    predicates: Arc<dyn ViewPredicates>,
    state: Mutex<StoreState>,
}

impl MemoryRowStore {
    pub fn new(resource_type: impl Into<String>, predicates: Arc<dyn ViewPredicates>) -> Self {
        Self {
            resource_type: resource_type.into(),
            predicates,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Loads initial rows without recording changes. Rows without an id are
    /// skipped.
    pub fn seed<I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = Row>,
    {
        let mut state = self.lock();
        let mut seeded = 0;
        for row in rows {
            if self.predicates.row_id(&row).is_none() {
                warn!(resource_type = %self.resource_type, "Skipping seed row without id");
                continue;
            }
            state.rows.push(row);
            seeded += 1;
        }
        seeded
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Row> {
        let state = self.lock();
        self.position(&state, id).map(|index| state.rows[index].clone())
    }

    /// Applies a write on behalf of `ctx`. Requires `<resource>.<action>`.
    ///
    /// Returns the row as stored, or `None` after a hard delete.
    pub fn write(&self, ctx: &AuthContext, write: RowWrite) -> Result<Option<Row>> {
        authorize(ctx, &permission_for(&self.resource_type, write.action()))?;

        let mut state = self.lock();
        let (stored, event) = match write {
            RowWrite::Create(row) => {
                let id = self.require_id(&row)?;
                if self.position(&state, &id).is_some() {
                    return Err(SyncError::RowSource {
                        context: format!("create {}/{}", self.resource_type, id),
                        details: "row already exists".to_string(),
                    });
                }
                state.rows.insert(0, row.clone());
                (Some(row.clone()), self.upsert_event(row))
            }
            RowWrite::Update(row) => {
                let id = self.require_id(&row)?;
                let index = self.require_position(&state, &id)?;
                state.rows[index] = row.clone();
                (Some(row.clone()), self.upsert_event(row))
            }
            RowWrite::Delete(id) => {
                let index = self.require_position(&state, &id)?;
                let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                state.rows[index].set(DELETED_AT_FIELD, stamp.into());
                let row = state.rows[index].clone();
                (Some(row.clone()), self.upsert_event(row))
            }
            RowWrite::Restore(id) => {
                let index = self.require_position(&state, &id)?;
                state.rows[index].remove(DELETED_AT_FIELD);
                let row = state.rows[index].clone();
                (Some(row.clone()), self.upsert_event(row))
            }
            RowWrite::HardDelete(id) => {
                let index = self.require_position(&state, &id)?;
                state.rows.remove(index);
                let event = ServerEvent::ResourceRemove {
                    resource_type: self.resource_type.clone(),
                    id,
                };
                (None, event)
            }
        };
        debug!(
            resource_type = %self.resource_type,
            subject_id = %ctx.subject_id,
            event = %event.kind(),
            "Row write applied"
        );
        if state.changes.len() == CHANGE_LOG_CAPACITY {
            state.changes.pop_front();
            warn!(
                resource_type = %self.resource_type,
                capacity = CHANGE_LOG_CAPACITY,
                "Change log full; discarding oldest unpolled change"
            );
        }
        state.changes.push_back(event);
        Ok(stored)
    }

    /// Like [`MemoryRowStore::write`], resolving the subject's grants first.
    pub fn write_as(
        &self,
        contexts: &dyn AuthContextSource,
        subject_id: &str,
        write: RowWrite,
    ) -> Result<Option<Row>> {
        let ctx = contexts.load_auth_context(subject_id)?;
        self.write(&ctx, write)
    }

    fn upsert_event(&self, row: Row) -> ServerEvent {
        ServerEvent::ResourceUpsert {
            resource_type: self.resource_type.clone(),
            row,
        }
    }

    fn require_id(&self, row: &Row) -> Result<String> {
        self.predicates
            .row_id(row)
            .ok_or_else(|| SyncError::RowSource {
                context: format!("write {}", self.resource_type),
                details: "row has no id".to_string(),
            })
    }

    fn position(&self, state: &StoreState, id: &str) -> Option<usize> {
        state
            .rows
            .iter()
            .position(|row| self.predicates.row_id(row).as_deref() == Some(id))
    }

    fn require_position(&self, state: &StoreState, id: &str) -> Result<usize> {
        self.position(state, id).ok_or_else(|| SyncError::RowNotFound {
            resource_type: self.resource_type.clone(),
            id: id.to_string(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RowSource for MemoryRowStore {
    fn fetch_page(&self, descriptor: &ViewDescriptor) -> Result<ViewPage> {
        if descriptor.resource_type() != self.resource_type {
            return Ok(ViewPage::empty_for(descriptor));
        }
        let state = self.lock();
        let matching: Vec<&Row> = state
            .rows
            .iter()
            .filter(|row| self.predicates.includes(row, descriptor))
            .collect();
        let page_size = descriptor.page_size() as usize;
        let offset = (descriptor.page() as usize - 1).saturating_mul(page_size);
        let rows = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|row| (*row).clone())
            .collect();
        Ok(ViewPage::new(
            rows,
            matching.len() as u64,
            descriptor.page(),
            descriptor.page_size(),
        ))
    }
}

impl ChangeFeed for MemoryRowStore {
    fn poll_changes(&self) -> Result<Vec<ServerEvent>> {
        Ok(self.lock().changes.drain(..).collect())
    }
}

/// Reads a JSON array of row objects. Non-object members are rejected.
pub fn load_rows_file(path: &Path) -> Result<Vec<Row>> {
    let content = fs_err::read_to_string(path).map_err(|err| SyncError::Io {
        context: format!("Failed to read rows {}", path.display()),
        source: err,
    })?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(&content).map_err(|err| SyncError::Json {
            context: format!("Failed to parse rows {}", path.display()),
            source: err,
        })?;
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            Row::from_value(value).ok_or_else(|| SyncError::RowSource {
                context: format!("{} row {}", path.display(), index),
                details: "row must be a JSON object".to_string(),
            })
        })
        .collect()
}
