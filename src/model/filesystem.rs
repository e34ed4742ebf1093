use super::catalog::{EntityType, JobContext, TransitionRule};
use super::{Catalog, DependOn, Dependencies, Entity, EntityKind, EntityRef};
use crate::cache::ObjectCache;
use crate::state_machine::{LockRequest, Step};

pub const STATES: &[&str] = &["unavailable", "stopped", "available", "removed", "forgotten"];
pub const INITIAL_STATE: &str = "unavailable";

/// MGS states in which the MGS holds configuration for its filesystems.
const MGS_CONFIGURED: &[&str] = &["registered", "unmounted", "mounted"];

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(
        EntityType::new(EntityKind::Filesystem)
            .state_deps(state_deps)
            .available(available),
    );

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Filesystem,
            "start_stopped_filesystem",
            &["stopped"],
            "available",
            "Start filesystem",
        )
        .deps(start_deps),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Filesystem,
            "start_unavailable_filesystem",
            &["unavailable"],
            "available",
            "Make available filesystem",
        )
        .deps(start_deps),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Filesystem,
            "stop_unavailable_filesystem",
            &["unavailable"],
            "stopped",
            "Stop filesystem",
        )
        .deps(|ctx| {
            let mut deps = ticket_dep(ctx, "revoked");
            for target in ctx.cache.filesystem_targets(ctx.entity.id.id) {
                deps.push(
                    DependOn::new(target, "unmounted").acceptable_except(&["mounted"]),
                );
            }
            Ok(Dependencies::all(deps))
        }),
    );
    catalog.register_rule(TransitionRule::new(
        EntityKind::Filesystem,
        "make_filesystem_unavailable",
        &["available"],
        "unavailable",
        "Make unavailable filesystem",
    ));
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Filesystem,
            "remove_filesystem",
            &["stopped"],
            "removed",
            "Remove filesystem",
        )
        .confirm()
        .deps(|ctx| {
            let mut deps = ticket_dep(ctx, "revoked");
            if let Some(mgs) = ctx.cache.mgs_of(ctx.entity) {
                if MGS_CONFIGURED.contains(&mgs.state.as_str()) {
                    deps.push(DependOn::new(mgs, "unmounted"));
                }
            }
            Ok(Dependencies::all(deps))
        })
        .locks(|ctx| match ctx.cache.mgs_of(ctx.entity) {
            Some(mgs) => vec![LockRequest::write(mgs.id, "unmounted", "unmounted")],
            None => Vec::new(),
        })
        .steps(|ctx| {
            let Some(mgs) = ctx.cache.mgs_of(ctx.entity) else {
                return Ok(Vec::new());
            };
            if !MGS_CONFIGURED.contains(&mgs.state.as_str()) {
                return Ok(Vec::new());
            }
            let host = mgs
                .target()
                .and_then(|t| t.effective_host())
                .ok_or_else(|| format!("{} has no host", mgs.label))?;
            let mgs_attrs = mgs.target().map(|t| t.device_path.clone()).unwrap_or_default();
            Ok(vec![
                Step::new("purge_configuration", ctx.cache.fqdn(host)?)
                    .arg("device", mgs_attrs)
                    .arg("filesystem_name", name(ctx)?)
                    .idempotent(),
            ])
        })
        .on_success(|ctx, fs| {
            let live: Vec<&str> = ctx
                .cache
                .filesystem_targets(fs.id.id)
                .into_iter()
                .filter(|t| t.state != "removed" && t.state != "forgotten")
                .map(|t| t.label.as_str())
                .collect();
            if !live.is_empty() {
                return Err(format!(
                    "{} still has live targets: {}",
                    fs.label,
                    live.join(", ")
                ));
            }
            fs.mark_deleted();
            Ok(Vec::new())
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Filesystem,
            "forget_filesystem",
            &["unavailable", "stopped", "available"],
            "forgotten",
            "Forget filesystem",
        )
        .confirm()
        .on_success(|_, fs| {
            fs.mark_deleted();
            Ok(Vec::new())
        }),
    );

    catalog.register_dependents(EntityKind::Filesystem, dependents);
}

fn start_deps(ctx: &JobContext<'_>) -> Result<Dependencies, String> {
    let mut deps = ticket_dep(ctx, "granted");
    if let Some(mgs) = ctx.cache.mgs_of(ctx.entity) {
        deps.push(DependOn::new(mgs, "mounted"));
    }
    for target in ctx.cache.filesystem_targets(ctx.entity.id.id) {
        deps.push(DependOn::new(target, "mounted"));
    }
    Ok(Dependencies::all(deps))
}

fn ticket_dep(ctx: &JobContext<'_>, state: &str) -> Vec<DependOn> {
    ctx.cache
        .ticket_of_filesystem(ctx.entity.id.id)
        .map(|t| DependOn::new(t, state))
        .into_iter()
        .collect()
}

fn state_deps(cache: &ObjectCache, fs: &Entity, state: &str) -> Dependencies {
    if state == "removed" || state == "forgotten" {
        return Dependencies::none();
    }
    let gone = if fs.immutable { "forgotten" } else { "removed" };
    match cache.mgs_of(fs) {
        Some(mgs) => DependOn::new(mgs, "mounted")
            .acceptable_except(&["removed", "forgotten"])
            .fix(gone)
            .into(),
        None => Dependencies::none(),
    }
}

/// An unavailable filesystem with nothing mounted is already as good as
/// stopped; a ticket-controlled filesystem cannot be removed.
fn available(cache: &ObjectCache, fs: &Entity, states: Vec<String>) -> Vec<String> {
    let any_mounted = cache
        .filesystem_targets(fs.id.id)
        .into_iter()
        .chain(cache.mgs_of(fs))
        .any(|t| t.state == "mounted");
    let ticketed = cache.ticket_of_filesystem(fs.id.id).is_some();
    states
        .into_iter()
        .filter(|s| !(s == "stopped" && fs.state == "unavailable" && !any_mounted))
        .filter(|s| !(s == "removed" && ticketed))
        .collect()
}

/// MDTs, OSTs, client mounts and the filesystem ticket.
fn dependents(cache: &ObjectCache, fs: &Entity) -> Vec<EntityRef> {
    let mut out: Vec<EntityRef> = cache
        .filesystem_targets(fs.id.id)
        .into_iter()
        .map(|e| e.id)
        .collect();
    if let Some(attrs) = fs.filesystem() {
        out.extend(
            cache
                .client_mounts_of_filesystem(&attrs.name)
                .into_iter()
                .map(|e| e.id),
        );
    }
    out.extend(cache.ticket_of_filesystem(fs.id.id).map(|e| e.id));
    out
}

fn name(ctx: &JobContext<'_>) -> Result<String, String> {
    ctx.entity
        .filesystem()
        .map(|f| f.name.clone())
        .ok_or_else(|| format!("{} has no filesystem attributes", ctx.entity.id))
}
