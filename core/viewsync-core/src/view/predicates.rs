//! Row predicates the reconciler evaluates against a descriptor.
//!
//! The reconciler never interprets row fields itself; it asks a
//! [`ViewPredicates`] implementation. [`FieldPredicates`] covers the common
//! admin-table layout (a `status` column plus a soft-delete timestamp).

use serde_json::Value;
use std::collections::BTreeMap;
use viewsync_protocol::Row;

use super::descriptor::{StatusScope, ViewDescriptor};

pub trait ViewPredicates: Send + Sync {
    fn matches_status(&self, row: &Row, scope: StatusScope) -> bool;

    fn matches_search(&self, row: &Row, search_text: Option<&str>) -> bool;

    fn matches_filters(&self, row: &Row, filters: &BTreeMap<String, String>) -> bool;

    fn row_id(&self, row: &Row) -> Option<String> {
        row.id()
    }

    fn includes(&self, row: &Row, descriptor: &ViewDescriptor) -> bool {
        self.matches_status(row, descriptor.status_scope())
            && self.matches_search(row, descriptor.search_text())
            && self.matches_filters(row, descriptor.column_filters())
    }
}

pub const STATUS_FIELD: &str = "status";
pub const DELETED_AT_FIELD: &str = "deletedAt";

#[derive(Debug, Clone)]
pub struct FieldPredicates {
    status_field: String,
    deleted_field: String,
    search_fields: Vec<String>,
}

impl Default for FieldPredicates {
    fn default() -> Self {
        Self {
            status_field: STATUS_FIELD.to_string(),
            deleted_field: DELETED_AT_FIELD.to_string(),
            search_fields: Vec::new(),
        }
    }
}

impl FieldPredicates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts search to these fields. With none, every scalar field is searched.
    pub fn with_search_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status_field(mut self, field: impl Into<String>) -> Self {
        self.status_field = field.into();
        self
    }

    pub fn with_deleted_field(mut self, field: impl Into<String>) -> Self {
        self.deleted_field = field.into();
        self
    }

    fn is_deleted(&self, row: &Row) -> bool {
        row.get(&self.deleted_field)
            .map(|value| !value.is_null())
            .unwrap_or(false)
    }

    fn status_is(&self, row: &Row, expected: &str) -> bool {
        row.get(&self.status_field)
            .and_then(Value::as_str)
            .map(|status| status.eq_ignore_ascii_case(expected))
            .unwrap_or(false)
    }
}

impl ViewPredicates for FieldPredicates {
    fn matches_status(&self, row: &Row, scope: StatusScope) -> bool {
        match scope {
            StatusScope::Active => !self.is_deleted(row) && self.status_is(row, "active"),
            StatusScope::Inactive => !self.is_deleted(row) && self.status_is(row, "inactive"),
            StatusScope::Deleted => self.is_deleted(row),
            StatusScope::All => !self.is_deleted(row),
        }
    }

    fn matches_search(&self, row: &Row, search_text: Option<&str>) -> bool {
        let Some(needle) = search_text.map(str::to_lowercase) else {
            return true;
        };
        let contains = |value: &Value| {
            scalar_text(value)
                .map(|text| text.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        if self.search_fields.is_empty() {
            row.fields().values().any(contains)
        } else {
            self.search_fields
                .iter()
                .filter_map(|field| row.get(field))
                .any(contains)
        }
    }

    fn matches_filters(&self, row: &Row, filters: &BTreeMap<String, String>) -> bool {
        filters.iter().all(|(column, expected)| {
            row.get(column)
                .and_then(scalar_text)
                .map(|actual| actual == *expected)
                .unwrap_or(false)
        })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
