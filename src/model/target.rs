use serde_json::Value;

use super::catalog::{AdvertisedJob, EntityType, JobContext, TransitionRule};
use super::{
    Catalog, DependOn, Dependencies, Entity, EntityAttrs, EntityKind, EntityRef, TargetAttrs,
    TargetRole,
};
use crate::cache::ObjectCache;
use crate::state_machine::{LockRequest, Step};

pub const STATES: &[&str] = &[
    "unformatted",
    "formatted",
    "registered",
    "unmounted",
    "mounted",
    "removed",
    "forgotten",
];
pub const INITIAL_STATE: &str = "unformatted";

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(
        EntityType::new(EntityKind::Target)
            .state_deps(state_deps)
            .available(available),
    );

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "format_target",
            &["unformatted"],
            "formatted",
            "Format",
        )
        .steps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            Ok(vec![
                Step::new("format_target", fqdn(ctx)?)
                    .arg("device", attrs.device_path.as_str())
                    .arg("target_name", attrs.name.as_str())
                    .arg("target_types", role_arg(attrs.role)),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "register_target",
            &["formatted"],
            "registered",
            "Register",
        )
        .steps(|ctx| {
            Ok(vec![
                Step::new("register_target", fqdn(ctx)?)
                    .arg("device", attrs(ctx.entity)?.device_path.as_str())
                    .idempotent(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "configure_target",
            &["registered"],
            "unmounted",
            "Configure",
        )
        .steps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            let mut steps = Vec::new();
            for host in &attrs.hosts {
                steps.push(
                    Step::new("configure_target_ha", ctx.cache.fqdn(*host)?)
                        .arg("target_name", attrs.name.as_str())
                        .arg("device", attrs.device_path.as_str())
                        .idempotent(),
                );
            }
            Ok(steps)
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "start_target",
            &["unmounted"],
            "mounted",
            "Start",
        )
        .deps(|ctx| {
            if let Some(ticket) = ctx.cache.ticket_for_target(ctx.entity) {
                return Ok(DependOn::new(ticket, "granted").into());
            }
            let host = active_host(ctx.entity)?;
            Ok(match ctx.cache.lnet_for_host(host) {
                Some(lnet) => DependOn::new(lnet, "lnet_up").into(),
                None => Dependencies::none(),
            })
        })
        .steps(|ctx| {
            Ok(vec![
                Step::new("mount_target", fqdn(ctx)?)
                    .arg("target_name", attrs(ctx.entity)?.name.as_str())
                    .idempotent(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "stop_target",
            &["mounted"],
            "unmounted",
            "Stop",
        )
        .confirm()
        .steps(|ctx| {
            Ok(vec![
                Step::new("unmount_target", fqdn(ctx)?)
                    .arg("target_name", attrs(ctx.entity)?.name.as_str())
                    .idempotent(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "remove_target",
            &["unformatted", "formatted", "registered", "unmounted"],
            "removed",
            "Remove",
        )
        .confirm()
        .steps(|ctx| {
            let attrs = attrs(ctx.entity)?;
            let mut steps = Vec::new();
            for host in &attrs.hosts {
                steps.push(
                    Step::new("unconfigure_target_ha", ctx.cache.fqdn(*host)?)
                        .arg("target_name", attrs.name.as_str())
                        .idempotent(),
                );
            }
            Ok(steps)
        })
        .on_success(|_, target| {
            target.mark_deleted();
            Ok(Vec::new())
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Target,
            "forget_target",
            &["unmounted", "mounted"],
            "forgotten",
            "Forget",
        )
        .deps(|ctx| {
            if ctx.entity.immutable {
                Ok(Dependencies::none())
            } else {
                Err("only externally managed targets can be forgotten".to_string())
            }
        })
        .on_success(|_, target| {
            target.mark_deleted();
            Ok(Vec::new())
        }),
    );

    catalog.register_advertised(
        AdvertisedJob::new(EntityKind::Target, "failover_target", "Fail over")
            .confirm()
            .deps(|ctx| {
                let host = failover_host(ctx)?;
                let mut deps = vec![DependOn::new(ctx.entity, "mounted")];
                if let Some(lnet) = ctx.cache.lnet_for_host(host) {
                    deps.push(DependOn::new(lnet, "lnet_up"));
                }
                Ok(Dependencies::all(deps))
            })
            .locks(|ctx| vec![LockRequest::write(ctx.entity.id, "mounted", "mounted")])
            .steps(|ctx| {
                let host = failover_host(ctx)?;
                Ok(vec![
                    Step::new("failover_target", ctx.cache.fqdn(host)?)
                        .arg("target_name", attrs(ctx.entity)?.name.as_str())
                        .arg("ha_label", attrs(ctx.entity)?.name.as_str()),
                ])
            })
            .on_success(|ctx, target| {
                let host = failover_host(ctx)?;
                if let EntityAttrs::Target(attrs) = &mut target.attrs {
                    attrs.active_host = Some(host);
                }
                Ok(Vec::new())
            }),
    );

    catalog.register_dependents(EntityKind::Target, dependents);
}

/// MDTs never offer removal from the UI; only externally managed targets
/// may be forgotten.
fn available(_cache: &ObjectCache, target: &Entity, states: Vec<String>) -> Vec<String> {
    let role = target.target().map(|t| t.role);
    states
        .into_iter()
        .filter(|s| s != "forgotten")
        .filter(|s| !(s == "removed" && role == Some(TargetRole::Mdt)))
        .collect()
}

fn state_deps(cache: &ObjectCache, target: &Entity, state: &str) -> Dependencies {
    let Some(attrs) = target.target() else {
        return Dependencies::none();
    };
    if state == "removed" || state == "forgotten" {
        return Dependencies::none();
    }
    let gone = if target.immutable { "forgotten" } else { "removed" };
    let mut deps = Vec::new();

    if state == "mounted" {
        if let Some(lnet) = attrs.effective_host().and_then(|h| cache.lnet_for_host(h)) {
            deps.push(DependOn::new(lnet, "lnet_up").fix("unmounted"));
        }
    }

    for host in &attrs.hosts {
        if let Some(lnet) = cache.lnet_for_host(*host) {
            deps.push(
                DependOn::new(lnet, "lnet_down")
                    .acceptable_except(&["unconfigured"])
                    .fix(gone),
            );
        }
    }

    if let Some(fs) = attrs.filesystem {
        deps.push(
            DependOn::on(EntityRef::filesystem(fs), "available")
                .acceptable_except(&["removed", "forgotten"])
                .fix(gone),
        );
    }

    Dependencies::all(deps)
}

/// Filesystems served by an MGS.
fn dependents(cache: &ObjectCache, target: &Entity) -> Vec<EntityRef> {
    match target.target() {
        Some(attrs) if attrs.role == TargetRole::Mgs => cache
            .filesystems_using_mgs(target.id.id)
            .into_iter()
            .map(|e| e.id)
            .collect(),
        _ => Vec::new(),
    }
}

/// The host named in the `host` argument, or the first candidate host the
/// target is not currently on.
fn failover_host(ctx: &JobContext<'_>) -> Result<u64, String> {
    let attrs = attrs(ctx.entity)?;
    let current = attrs.effective_host();
    let host = match ctx.args.get("host") {
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| format!("bad host id {n}"))?,
        Some(other) => return Err(format!("'host' must be a host id, got {other}")),
        None => attrs
            .hosts
            .iter()
            .copied()
            .find(|h| Some(*h) != current)
            .ok_or_else(|| format!("{} has no failover host", ctx.entity.label))?,
    };
    if !attrs.hosts.contains(&host) {
        return Err(format!("host {host} cannot mount {}", ctx.entity.label));
    }
    if Some(host) == current {
        return Err(format!("{} is already on host {host}", ctx.entity.label));
    }
    Ok(host)
}

fn attrs(target: &Entity) -> Result<&TargetAttrs, String> {
    target
        .target()
        .ok_or_else(|| format!("{} has no target attributes", target.id))
}

fn active_host(target: &Entity) -> Result<u64, String> {
    attrs(target)?
        .effective_host()
        .ok_or_else(|| format!("{} has no host", target.label))
}

fn fqdn(ctx: &JobContext<'_>) -> Result<String, String> {
    ctx.cache.fqdn(active_host(ctx.entity)?)
}

fn role_arg(role: TargetRole) -> &'static str {
    match role {
        TargetRole::Mgs => "mgs",
        TargetRole::Mdt => "mdt",
        TargetRole::Ost => "ost",
    }
}
