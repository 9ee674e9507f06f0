use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use viewsync_protocol::Row;

use super::descriptor::ViewDescriptor;

/// One cached page of a view.
///
/// `rows.len() <= page_size` always holds; `total_pages` is derived from
/// `total` on every read and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPage {
    rows: Vec<Row>,
    total: u64,
    page: u32,
    page_size: u32,
}

impl ViewPage {
    /// Rows beyond `page_size` are truncated, and `total` never reports
    /// fewer rows than the page holds.
    pub fn new(mut rows: Vec<Row>, total: u64, page: u32, page_size: u32) -> Self {
        let page_size = page_size.max(1);
        rows.truncate(page_size as usize);
        let total = total.max(rows.len() as u64);
        Self {
            rows,
            total,
            page: page.max(1),
            page_size,
        }
    }

    pub fn empty_for(descriptor: &ViewDescriptor) -> Self {
        Self::new(
            Vec::new(),
            0,
            descriptor.page(),
            descriptor.page_size(),
        )
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn total_pages(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.page_size))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.total == 0
    }

    pub(super) fn replace_row(&mut self, index: usize, row: Row) {
        self.rows[index] = row;
    }

    pub(super) fn remove_row(&mut self, index: usize) {
        self.rows.remove(index);
        self.total = self.total.saturating_sub(1);
    }

    pub(super) fn insert_head(&mut self, row: Row) {
        self.rows.insert(0, row);
        self.rows.truncate(self.page_size as usize);
        self.total += 1;
    }
}

impl Serialize for ViewPage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ViewPage", 5)?;
        state.serialize_field("rows", &self.rows)?;
        state.serialize_field("total", &self.total)?;
        state.serialize_field("page", &self.page)?;
        state.serialize_field("pageSize", &self.page_size)?;
        state.serialize_field("totalPages", &self.total_pages())?;
        state.end()
    }
}
