//! Applies one row mutation to one cached view page.
//!
//! Pure functions: the current page is borrowed, and a change produces a new
//! [`ViewPage`] value, so readers holding the old page never observe a
//! half-applied update. "Changed" is decided by value: re-applying an
//! identical upsert reports [`Reconciled::Unchanged`].
//!
//! Upsert rules, with `included` = status && search && filters match:
//!
//! | row on page | included | outcome                                        |
//! |-------------|----------|------------------------------------------------|
//! | yes         | yes      | replace in place, total unchanged              |
//! | yes         | no       | remove, total - 1                              |
//! | no          | yes      | page 1: insert at head, truncate, total + 1    |
//! | no          | yes      | page > 1: unchanged until re-fetched           |
//! | no          | no       | unchanged                                      |
//!
//! A missing page (cache miss) is treated as an empty page for page 1 only
//! when the row is included; anything else leaves the miss alone.

use viewsync_protocol::Row;

use super::descriptor::ViewDescriptor;
use super::page::ViewPage;
use super::predicates::ViewPredicates;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Upsert(Row),
    Remove(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    Unchanged,
    Changed(ViewPage),
}

impl Reconciled {
    pub fn is_changed(&self) -> bool {
        matches!(self, Reconciled::Changed(_))
    }
}

pub fn reconcile(
    descriptor: &ViewDescriptor,
    current: Option<&ViewPage>,
    mutation: &Mutation,
    predicates: &dyn ViewPredicates,
) -> Reconciled {
    match mutation {
        Mutation::Upsert(row) => reconcile_upsert(descriptor, current, row, predicates),
        Mutation::Remove(id) => reconcile_remove(current, id, predicates),
    }
}

pub fn reconcile_upsert(
    descriptor: &ViewDescriptor,
    current: Option<&ViewPage>,
    row: &Row,
    predicates: &dyn ViewPredicates,
) -> Reconciled {
    let Some(id) = predicates.row_id(row) else {
        tracing::warn!(
            resource_type = %descriptor.resource_type(),
            "Ignoring upsert for row without id"
        );
        return Reconciled::Unchanged;
    };
    let included = predicates.includes(row, descriptor);

    match current.and_then(|page| position_of(page, &id, predicates).map(|index| (page, index))) {
        Some((page, index)) if included => {
            if page.rows()[index] == *row {
                return Reconciled::Unchanged;
            }
            let mut next = page.clone();
            next.replace_row(index, row.clone());
            Reconciled::Changed(next)
        }
        Some((page, index)) => {
            let mut next = page.clone();
            next.remove_row(index);
            Reconciled::Changed(next)
        }
        None if !included => Reconciled::Unchanged,
        // Deeper pages accept staleness; only page 1 self-heals on insert.
        None if descriptor.page() != 1 => Reconciled::Unchanged,
        None => {
            let mut next = current
                .cloned()
                .unwrap_or_else(|| ViewPage::empty_for(descriptor));
            next.insert_head(row.clone());
            Reconciled::Changed(next)
        }
    }
}

pub fn reconcile_remove(
    current: Option<&ViewPage>,
    id: &str,
    predicates: &dyn ViewPredicates,
) -> Reconciled {
    let Some(page) = current else {
        return Reconciled::Unchanged;
    };
    match position_of(page, id, predicates) {
        Some(index) => {
            let mut next = page.clone();
            next.remove_row(index);
            Reconciled::Changed(next)
        }
        None => Reconciled::Unchanged,
    }
}

/// Applies `mutations` in order and reports a single outcome, so
/// subscribers hear about a batch at most once.
pub fn reconcile_batch(
    descriptor: &ViewDescriptor,
    current: Option<&ViewPage>,
    mutations: &[Mutation],
    predicates: &dyn ViewPredicates,
) -> Reconciled {
    let mut working: Option<ViewPage> = None;
    for mutation in mutations {
        let base = working.as_ref().or(current);
        if let Reconciled::Changed(next) = reconcile(descriptor, base, mutation, predicates) {
            working = Some(next);
        }
    }

    match (working, current) {
        (None, _) => Reconciled::Unchanged,
        (Some(next), Some(previous)) if next == *previous => Reconciled::Unchanged,
        // Net no-op on a cache miss must stay a miss.
        (Some(next), None) if next.is_empty() => Reconciled::Unchanged,
        (Some(next), _) => Reconciled::Changed(next),
    }
}

fn position_of(page: &ViewPage, id: &str, predicates: &dyn ViewPredicates) -> Option<usize> {
    page.rows()
        .iter()
        .position(|row| predicates.row_id(row).as_deref() == Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::descriptor::StatusScope;
    use crate::view::predicates::FieldPredicates;

    fn active_view(page: u32, page_size: u32) -> ViewDescriptor {
        ViewDescriptor::new("products", page_size)
            .unwrap()
            .with_status(StatusScope::Active)
            .with_page(page)
            .unwrap()
    }

    fn row(id: &str, status: &str) -> Row {
        Row::new().with("id", id).with("status", status)
    }

    fn changed(result: Reconciled) -> ViewPage {
        match result {
            Reconciled::Changed(page) => page,
            Reconciled::Unchanged => panic!("expected a change"),
        }
    }

    fn ids(page: &ViewPage) -> Vec<String> {
        page.rows().iter().filter_map(Row::id).collect()
    }

    #[test]
    fn upsert_into_missing_page_one_creates_page() {
        let view = active_view(1, 2);
        let page = changed(reconcile_upsert(
            &view,
            None,
            &row("r1", "active"),
            &FieldPredicates::new(),
        ));
        assert_eq!(ids(&page), vec!["r1"]);
        assert_eq!(page.total(), 1);
        assert_eq!(page.total_pages(), 1);
    }

    #[test]
    fn excluded_upsert_on_cache_miss_stays_miss() {
        let view = active_view(1, 2);
        let result = reconcile_upsert(&view, None, &row("r1", "inactive"), &FieldPredicates::new());
        assert_eq!(result, Reconciled::Unchanged);
    }

    #[test]
    fn update_in_place_keeps_position_and_total() {
        let view = active_view(1, 3);
        let current = ViewPage::new(
            vec![row("a", "active"), row("b", "active"), row("c", "active")],
            7,
            1,
            3,
        );
        let updated = row("b", "active").with("name", "renamed");
        let page = changed(reconcile_upsert(&view, Some(&current), &updated, &FieldPredicates::new()));
        assert_eq!(ids(&page), vec!["a", "b", "c"]);
        assert_eq!(page.rows()[1], updated);
        assert_eq!(page.total(), 7);
    }

    #[test]
    fn identical_upsert_is_unchanged() {
        let view = active_view(1, 2);
        let current = ViewPage::new(vec![row("a", "active")], 1, 1, 2);
        let result = reconcile_upsert(&view, Some(&current), &row("a", "active"), &FieldPredicates::new());
        assert_eq!(result, Reconciled::Unchanged);
    }

    #[test]
    fn upsert_that_stops_matching_removes_row() {
        let view = active_view(1, 2);
        let current = ViewPage::new(vec![row("a", "active"), row("b", "active")], 5, 1, 2);
        let page = changed(reconcile_upsert(
            &view,
            Some(&current),
            &row("a", "inactive"),
            &FieldPredicates::new(),
        ));
        assert_eq!(ids(&page), vec!["b"]);
        assert_eq!(page.total(), 4);
        assert_eq!(page.total_pages(), 2);
    }

    #[test]
    fn insert_on_page_one_truncates_tail() {
        let view = active_view(1, 2);
        let current = ViewPage::new(vec![row("a", "active"), row("b", "active")], 2, 1, 2);
        let page = changed(reconcile_upsert(&view, Some(&current), &row("c", "active"), &FieldPredicates::new()));
        assert_eq!(ids(&page), vec!["c", "a"]);
        assert_eq!(page.total(), 3);
        assert_eq!(page.total_pages(), 2);
    }

    #[test]
    fn insert_on_deeper_page_is_ignored() {
        let view = active_view(2, 2);
        let current = ViewPage::new(vec![row("a", "active")], 3, 2, 2);
        let result = reconcile_upsert(&view, Some(&current), &row("c", "active"), &FieldPredicates::new());
        assert_eq!(result, Reconciled::Unchanged);
    }

    #[test]
    fn row_without_id_is_a_no_op() {
        let view = active_view(1, 2);
        let result = reconcile_upsert(
            &view,
            None,
            &Row::new().with("status", "active"),
            &FieldPredicates::new(),
        );
        assert_eq!(result, Reconciled::Unchanged);
    }

    #[test]
    fn remove_decrements_total() {
        let current = ViewPage::new(vec![row("r2", "active"), row("r1", "active")], 5, 1, 2);
        let page = changed(reconcile_remove(Some(&current), "r2", &FieldPredicates::new()));
        assert_eq!(ids(&page), vec!["r1"]);
        assert_eq!(page.total(), 4);
        assert_eq!(page.total_pages(), 2);
    }

    #[test]
    fn remove_of_absent_row_is_unchanged() {
        let current = ViewPage::new(vec![row("r1", "active")], 1, 1, 2);
        let predicates = FieldPredicates::new();
        assert_eq!(reconcile_remove(Some(&current), "zz", &predicates), Reconciled::Unchanged);
        assert_eq!(reconcile_remove(None, "r1", &predicates), Reconciled::Unchanged);
    }

    #[test]
    fn batch_skips_bad_members_and_keeps_going() {
        let view = active_view(1, 3);
        let mutations = vec![
            Mutation::Upsert(row("a", "active")),
            Mutation::Upsert(Row::new().with("status", "active")),
            Mutation::Remove("missing".to_string()),
            Mutation::Upsert(row("b", "active")),
        ];
        let page = changed(reconcile_batch(&view, None, &mutations, &FieldPredicates::new()));
        assert_eq!(ids(&page), vec!["b", "a"]);
        assert_eq!(page.total(), 2);
    }

    #[test]
    fn batch_that_nets_out_reports_unchanged() {
        let view = active_view(1, 3);
        let current = ViewPage::new(vec![row("a", "active")], 1, 1, 3);
        let mutations = vec![
            Mutation::Upsert(row("a", "inactive")),
            Mutation::Upsert(row("a", "active")),
        ];
        assert_eq!(
            reconcile_batch(&view, Some(&current), &mutations, &FieldPredicates::new()),
            Reconciled::Unchanged
        );

        let on_miss = vec![
            Mutation::Upsert(row("x", "active")),
            Mutation::Remove("x".to_string()),
        ];
        assert_eq!(
            reconcile_batch(&view, None, &on_miss, &FieldPredicates::new()),
            Reconciled::Unchanged
        );
    }
}
