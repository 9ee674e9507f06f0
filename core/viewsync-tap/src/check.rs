use clap::Args;
use viewsync_core::permissions::{can_perform, can_perform_any, AuthContext};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Permission to require, repeatable
    #[arg(long = "require", value_name = "PERMISSION", required = true)]
    pub required: Vec<String>,

    /// Pass if any required permission is held instead of all of them
    #[arg(long)]
    pub any: bool,

    #[arg(long, default_value = "cli")]
    pub subject: String,

    /// Role held by the subject, repeatable
    #[arg(long = "role", value_name = "ROLE")]
    pub roles: Vec<String>,

    /// Permission granted to the subject, repeatable
    #[arg(long = "permission", value_name = "PERMISSION")]
    pub permissions: Vec<String>,
}

/// Prints `allowed` or `denied` and returns whether access was allowed.
pub fn run(args: &CheckArgs) -> Result<bool, String> {
    let ctx = context(args);
    let allowed = evaluate(&ctx, &args.required, args.any);
    tracing::debug!(
        subject_id = %ctx.subject_id,
        required = ?args.required,
        any = args.any,
        allowed,
        "Permission check"
    );
    println!("{}", if allowed { "allowed" } else { "denied" });
    Ok(allowed)
}

fn context(args: &CheckArgs) -> AuthContext {
    let ctx = args
        .roles
        .iter()
        .fold(AuthContext::new(args.subject.as_str()), |ctx, role| {
            ctx.with_role(role.as_str())
        });
    args.permissions
        .iter()
        .fold(ctx, |ctx, permission| ctx.with_permission(permission.as_str()))
}

fn evaluate(ctx: &AuthContext, required: &[String], any: bool) -> bool {
    if any {
        can_perform_any(ctx, required)
    } else {
        !required.is_empty() && required.iter().all(|permission| can_perform(ctx, permission))
    }
}
