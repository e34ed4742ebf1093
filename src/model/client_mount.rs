use super::catalog::{EntityType, JobContext, TransitionRule};
use super::{Catalog, ClientMountAttrs, DependOn, Dependencies, Entity, EntityKind, EntityRef};
use crate::cache::ObjectCache;
use crate::state_machine::Step;

pub const STATES: &[&str] = &["unmounted", "mounted", "removed"];
pub const INITIAL_STATE: &str = "unmounted";

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(EntityType::new(EntityKind::ClientMount).state_deps(state_deps));

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::ClientMount,
            "mount_client",
            &["unmounted"],
            "mounted",
            "Mount",
        )
        .describe(|ctx| describe("Mount", ctx))
        .deps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            Ok(match ctx.cache.lnet_for_host(attrs.host) {
                Some(lnet) => DependOn::new(lnet, "lnet_up").into(),
                None => Dependencies::none(),
            })
        })
        .steps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            Ok(vec![
                Step::new("mount_lustre_filesystems", ctx.cache.fqdn(attrs.host)?)
                    .arg("filesystem", attrs.filesystem.as_str())
                    .arg("mountpoints", attrs.mountpoints.clone())
                    .idempotent(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::ClientMount,
            "unmount_client",
            &["mounted"],
            "unmounted",
            "Unmount",
        )
        .describe(|ctx| describe("Unmount", ctx))
        .confirm()
        .steps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            Ok(vec![
                Step::new("unmount_lustre_filesystems", ctx.cache.fqdn(attrs.host)?)
                    .arg("filesystem", attrs.filesystem.as_str())
                    .arg("mountpoints", attrs.mountpoints.clone())
                    .idempotent(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::ClientMount,
            "remove_client",
            &["unmounted"],
            "removed",
            "Remove",
        )
        .confirm()
        .on_success(|_, mount| {
            mount.mark_deleted();
            Ok(Vec::new())
        }),
    );
}

fn state_deps(cache: &ObjectCache, mount: &Entity, state: &str) -> Dependencies {
    let Some(attrs) = mount.client_mount() else {
        return Dependencies::none();
    };
    if state == "removed" {
        return Dependencies::none();
    }
    let fs = cache.filesystem_by_name(&attrs.filesystem);
    let mut deps = Vec::new();

    if state == "mounted" {
        if let Some(lnet) = cache.lnet_for_host(attrs.host) {
            deps.push(DependOn::new(lnet, "lnet_up").fix("unmounted"));
        }
        if let Some(fs) = fs {
            deps.push(DependOn::new(fs, "available").fix("unmounted"));
        }
    }
    if let Some(fs) = fs {
        deps.push(
            DependOn::new(fs, "available")
                .acceptable_except(&["removed", "forgotten"])
                .fix("removed"),
        );
    }
    deps.push(
        DependOn::on(EntityRef::host(attrs.host), "managed")
            .acceptable_except(&["removed"])
            .fix("removed"),
    );

    Dependencies::all(deps)
}

fn attrs<'a>(mount: &'a Entity) -> Result<&'a ClientMountAttrs, String> {
    mount
        .client_mount()
        .ok_or_else(|| format!("{} has no client mount attributes", mount.id))
}

fn describe(verb: &str, ctx: &JobContext<'_>) -> String {
    let Some(attrs) = ctx.entity.client_mount() else {
        return format!("{verb} {}", ctx.entity.label);
    };
    let host = ctx
        .cache
        .get(EntityRef::host(attrs.host))
        .map(|h| h.label.as_str())
        .unwrap_or("unknown host");
    format!("{verb} {} on {host}", attrs.filesystem)
}
