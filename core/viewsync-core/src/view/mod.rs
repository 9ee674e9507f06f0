//! Paginated, filtered resource views kept in sync with pushed mutations.

mod descriptor;
mod page;
mod predicates;
mod reconciler;
mod registry;

pub use descriptor::{StatusScope, ViewDescriptor};
pub use page::ViewPage;
pub use predicates::{FieldPredicates, ViewPredicates, DELETED_AT_FIELD, STATUS_FIELD};
pub use reconciler::{
    reconcile, reconcile_batch, reconcile_remove, reconcile_upsert, Mutation, Reconciled,
};
pub use registry::{ViewListener, ViewRegistry, ViewSubscription};
