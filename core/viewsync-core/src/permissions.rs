//! Permission evaluation.
//!
//! Two primitives, [`can_perform`] and [`can_perform_any`], gate every
//! mutation. Higher-level gates (create/update/delete/restore/hard-delete)
//! are expressed by calling one of them with the permission named by
//! [`permission_for`]. Policy definition lives elsewhere; this module only
//! evaluates.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Result, SyncError};

/// Role that short-circuits every check to `true`.
pub const SUPER_ADMIN_ROLE: &str = "super_admin";

/// Subject identity and grants, read once per operation from the session
/// provider. Never mutated here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub subject_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl AuthContext {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn is_super_admin(&self) -> bool {
        self.roles.contains(SUPER_ADMIN_ROLE)
    }
}

/// Source of [`AuthContext`]s keyed by subject id.
pub trait AuthContextSource: Send + Sync {
    fn load_auth_context(&self, subject_id: &str) -> Result<AuthContext>;
}

/// Fixed set of contexts, for tools and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthContexts {
    contexts: HashMap<String, AuthContext>,
}

impl StaticAuthContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ctx: AuthContext) -> Self {
        self.contexts.insert(ctx.subject_id.clone(), ctx);
        self
    }
}

impl AuthContextSource for StaticAuthContexts {
    fn load_auth_context(&self, subject_id: &str) -> Result<AuthContext> {
        self.contexts
            .get(subject_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSubject(subject_id.to_string()))
    }
}

/// Check a single permission.
///
/// # Rules
/// - **Super-admin role**: always allowed
/// - **Otherwise**: allowed iff `required` is in the permission set
#[inline]
pub fn can_perform(ctx: &AuthContext, required: &str) -> bool {
    ctx.is_super_admin() || ctx.permissions.contains(required)
}

/// Check that at least one of `required` is granted.
///
/// # Rules
/// - **Empty `required`**: always denied, super-admin included
/// - **Super-admin role**: allowed
/// - **Otherwise**: allowed iff `required` intersects the permission set
#[inline]
pub fn can_perform_any<I, S>(ctx: &AuthContext, required: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut required = required.into_iter().peekable();
    if required.peek().is_none() {
        return false;
    }
    if ctx.is_super_admin() {
        return true;
    }
    required.any(|permission| ctx.permissions.contains(permission.as_ref()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
    Restore,
    HardDelete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Restore => "restore",
            Action::HardDelete => "hard_delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission constant for an action on a resource type, e.g. `products.create`.
pub fn permission_for(resource_type: &str, action: Action) -> String {
    format!("{}.{}", resource_type, action.as_str())
}

#[inline]
pub fn can_mutate(ctx: &AuthContext, resource_type: &str, action: Action) -> bool {
    can_perform(ctx, &permission_for(resource_type, action))
}

/// Gate for write paths: denial is logged and returned as
/// [`SyncError::AuthorizationDenied`].
pub fn authorize(ctx: &AuthContext, permission: &str) -> Result<()> {
    if can_perform(ctx, permission) {
        return Ok(());
    }
    tracing::warn!(
        subject_id = %ctx.subject_id,
        permission = %permission,
        "Authorization denied"
    );
    Err(SyncError::AuthorizationDenied {
        subject_id: ctx.subject_id.clone(),
        permission: permission.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor() -> AuthContext {
        AuthContext::new("u1")
            .with_role("editor")
            .with_permission("products.create")
            .with_permission("products.update")
    }

    #[test]
    fn single_permission_requires_grant() {
        let ctx = editor();
        assert!(can_perform(&ctx, "products.create"));
        assert!(!can_perform(&ctx, "products.hard_delete"));
    }

    #[test]
    fn any_requires_intersection() {
        let ctx = editor();
        assert!(can_perform_any(&ctx, ["orders.view", "products.update"]));
        assert!(!can_perform_any(&ctx, ["orders.view", "orders.update"]));
    }

    #[test]
    fn empty_required_set_is_never_vacuously_true() {
        let ctx = editor().with_permission("*");
        assert!(!can_perform_any(&ctx, Vec::<String>::new()));
        assert!(!can_perform_any(&AuthContext::default(), [] as [&str; 0]));
    }

    #[test]
    fn super_admin_overrides_grants_but_not_empty_sets() {
        let ctx = AuthContext::new("root").with_role(SUPER_ADMIN_ROLE);
        assert!(can_perform(&ctx, "anything.at_all"));
        assert!(can_perform_any(&ctx, ["x"]));
        assert!(!can_perform_any(&ctx, [] as [&str; 0]));
    }

    #[test]
    fn permission_names_follow_resource_dot_action() {
        assert_eq!(permission_for("products", Action::HardDelete), "products.hard_delete");
        assert!(can_mutate(&editor(), "products", Action::Update));
        assert!(!can_mutate(&editor(), "products", Action::Restore));
    }

    #[test]
    fn authorize_reports_denied_permission() {
        match authorize(&editor(), "products.delete") {
            Err(SyncError::AuthorizationDenied {
                subject_id,
                permission,
            }) => {
                assert_eq!(subject_id, "u1");
                assert_eq!(permission, "products.delete");
            }
            other => panic!("expected denial, got {:?}", other),
        }
        assert!(authorize(&editor(), "products.create").is_ok());
    }
}
