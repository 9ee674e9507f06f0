//! Normalized view descriptors.
//!
//! Two requests for "the same view" must collapse to one cache entry, so a
//! descriptor can only be built through normalizing setters: search text is
//! trimmed (blank means none), filter keys are kept sorted, and filters with
//! empty values are dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, SyncError};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StatusScope {
    #[default]
    Active,
    Inactive,
    Deleted,
    All,
}

impl StatusScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusScope::Active => "active",
            StatusScope::Inactive => "inactive",
            StatusScope::Deleted => "deleted",
            StatusScope::All => "all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(StatusScope::Active),
            "inactive" => Some(StatusScope::Inactive),
            "deleted" => Some(StatusScope::Deleted),
            "all" => Some(StatusScope::All),
            _ => None,
        }
    }
}

impl fmt::Display for StatusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDescriptor {
    resource_type: String,
    status_scope: StatusScope,
    search_text: Option<String>,
    column_filters: BTreeMap<String, String>,
    page: u32,
    page_size: u32,
}

impl ViewDescriptor {
    /// Page 1 of the active rows of `resource_type`.
    pub fn new(resource_type: impl Into<String>, page_size: u32) -> Result<Self> {
        let resource_type = resource_type.into().trim().to_string();
        if resource_type.is_empty() {
            return Err(SyncError::InvalidDescriptor(
                "resource type is required".to_string(),
            ));
        }
        if page_size == 0 {
            return Err(SyncError::InvalidDescriptor(
                "page size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            resource_type,
            status_scope: StatusScope::default(),
            search_text: None,
            column_filters: BTreeMap::new(),
            page: 1,
            page_size,
        })
    }

    pub fn with_status(mut self, status_scope: StatusScope) -> Self {
        self.status_scope = status_scope;
        self
    }

    pub fn with_search(mut self, search_text: Option<&str>) -> Self {
        self.search_text = search_text
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        self
    }

    /// Sets one column filter; an empty value removes it.
    pub fn with_filter(mut self, column: &str, value: &str) -> Self {
        let column = column.trim();
        let value = value.trim();
        if column.is_empty() {
            return self;
        }
        if value.is_empty() {
            self.column_filters.remove(column);
        } else {
            self.column_filters
                .insert(column.to_string(), value.to_string());
        }
        self
    }

    pub fn with_filters<'a, I>(self, filters: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        filters
            .into_iter()
            .fold(self, |descriptor, (column, value)| {
                descriptor.with_filter(column, value)
            })
    }

    pub fn with_page(mut self, page: u32) -> Result<Self> {
        if page == 0 {
            return Err(SyncError::InvalidDescriptor(
                "page must be at least 1".to_string(),
            ));
        }
        self.page = page;
        Ok(self)
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    pub fn status_scope(&self) -> StatusScope {
        self.status_scope
    }

    pub fn search_text(&self) -> Option<&str> {
        self.search_text.as_deref()
    }

    pub fn column_filters(&self) -> &BTreeMap<String, String> {
        &self.column_filters
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Stable string form of the normalized descriptor, sent as `viewKey`
    /// when joining a view on the channel. Excludes the resource type, which
    /// travels alongside it.
    pub fn view_key(&self) -> String {
        let mut parts = vec![format!("status={}", self.status_scope)];
        if let Some(search) = &self.search_text {
            parts.push(format!("q={}", escape_component(search)));
        }
        for (column, value) in &self.column_filters {
            parts.push(format!(
                "f.{}={}",
                escape_component(column),
                escape_component(value)
            ));
        }
        parts.push(format!("page={}", self.page));
        parts.push(format!("size={}", self.page_size));
        parts.join("&")
    }
}

fn escape_component(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '=' => escaped.push_str("%3D"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
