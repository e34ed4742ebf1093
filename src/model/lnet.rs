use serde_json::Value;

use super::catalog::{AdvertisedJob, EntityType, JobContext, TransitionRule};
use super::{Catalog, DependOn, Dependencies, Entity, EntityAttrs, EntityKind, EntityRef};
use crate::cache::ObjectCache;
use crate::state_machine::{LockRequest, Step};

pub const STATES: &[&str] = &["unconfigured", "lnet_unloaded", "lnet_down", "lnet_up"];
pub const INITIAL_STATE: &str = "unconfigured";

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(EntityType::new(EntityKind::LnetConfiguration).state_deps(state_deps));

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "enable_lnet",
            &["unconfigured"],
            "lnet_unloaded",
            "Enable LNet on",
        )
        .describe(|ctx| format!("Enable LNet on {}", host_label(ctx)))
        .deps(|ctx| {
            let host = EntityRef::host(host_id(ctx.entity)?);
            Ok(DependOn::on(host, "packages_installed")
                .acceptable(&["packages_installed", "managed"])
                .fix("packages_installed")
                .into())
        })
        .steps(|ctx| Ok(vec![Step::new("enable_lnet", fqdn(ctx)?).idempotent()])),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "load_lnet",
            &["lnet_unloaded"],
            "lnet_down",
            "Load LNet module on",
        )
        .describe(|ctx| format!("Load LNet module on {}", host_label(ctx)))
        .steps(|ctx| {
            let host = fqdn(ctx)?;
            Ok(vec![
                Step::new("load_lnet", host.clone()).idempotent(),
                Step::new("get_lnet_state", host).idempotent().local_state(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "start_lnet",
            &["lnet_down"],
            "lnet_up",
            "Start LNet on",
        )
        .describe(|ctx| format!("Start LNet on {}", host_label(ctx)))
        .steps(|ctx| {
            let host = fqdn(ctx)?;
            Ok(vec![
                Step::new("start_lnet", host.clone()).idempotent(),
                Step::new("get_lnet_state", host).idempotent().local_state(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "stop_lnet",
            &["lnet_up"],
            "lnet_down",
            "Stop LNet on",
        )
        .describe(|ctx| format!("Stop LNet on {}", host_label(ctx)))
        .steps(|ctx| {
            let host = fqdn(ctx)?;
            Ok(vec![
                Step::new("stop_lnet", host.clone()).idempotent(),
                Step::new("get_lnet_state", host).idempotent().local_state(),
            ])
        }),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "unload_lnet",
            &["lnet_down"],
            "lnet_unloaded",
            "Unload LNet module on",
        )
        .describe(|ctx| format!("Unload LNet module on {}", host_label(ctx)))
        .steps(|ctx| Ok(vec![Step::new("unload_lnet", fqdn(ctx)?).idempotent()])),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::LnetConfiguration,
            "unconfigure_lnet",
            &["lnet_unloaded"],
            "unconfigured",
            "Unconfigure LNet on",
        )
        .describe(|ctx| format!("Unconfigure LNet on {}", host_label(ctx)))
        .steps(|ctx| Ok(vec![Step::new("unconfigure_lnet", fqdn(ctx)?).idempotent()])),
    );

    catalog.register_advertised(
        AdvertisedJob::new(
            EntityKind::LnetConfiguration,
            "configure_lnet",
            "Configure LNet on",
        )
        .deps(|ctx| {
            Ok(DependOn::new(ctx.entity, "lnet_unloaded")
                .acceptable_except(&["unconfigured"])
                .into())
        })
        .locks(|ctx| {
            vec![LockRequest::write(
                ctx.entity.id,
                &ctx.entity.state,
                &ctx.entity.state,
            )]
        })
        .steps(configure_steps)
        .on_success(|ctx, lnet| {
            let nids = requested_nids(ctx)?;
            if let EntityAttrs::LnetConfiguration(attrs) = &mut lnet.attrs {
                attrs.nids = nids;
            }
            Ok(Vec::new())
        }),
    );

    catalog.register_dependents(EntityKind::LnetConfiguration, dependents);
}

/// Writes the new NIDs, then brings LNet back to the state it was in.
fn configure_steps(ctx: &JobContext<'_>) -> Result<Vec<Step>, String> {
    let host = fqdn(ctx)?;
    let nids = requested_nids(ctx)?;
    let mut steps = vec![
        Step::new("configure_lnet", host.clone())
            .arg("nids", nids)
            .idempotent()
            .local_state(),
    ];
    let state = ctx.entity.state.as_str();
    if state != "lnet_unloaded" {
        steps.push(Step::new("load_lnet", host.clone()).idempotent());
    }
    if state == "lnet_up" {
        steps.push(Step::new("start_lnet", host.clone()).idempotent());
    }
    steps.push(Step::new("get_lnet_state", host).idempotent().local_state());
    Ok(steps)
}

fn requested_nids(ctx: &JobContext<'_>) -> Result<Vec<String>, String> {
    match ctx.args.get("nids") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("nid {v} is not a string"))
            })
            .collect(),
        Some(other) => Err(format!("'nids' must be a list, got {other}")),
        None => Err("missing 'nids' argument".to_string()),
    }
}

/// A configured network needs a deployed host.
fn state_deps(_cache: &ObjectCache, lnet: &Entity, state: &str) -> Dependencies {
    let Some(attrs) = lnet.lnet() else {
        return Dependencies::none();
    };
    if state == "unconfigured" {
        return Dependencies::none();
    }
    DependOn::on(EntityRef::host(attrs.host), "managed")
        .acceptable_except(&["undeployed", "removed"])
        .fix("unconfigured")
        .into()
}

/// Targets and client mounts on the configuration's host.
fn dependents(cache: &ObjectCache, lnet: &Entity) -> Vec<EntityRef> {
    let Some(attrs) = lnet.lnet() else {
        return Vec::new();
    };
    cache
        .targets_on_host(attrs.host)
        .into_iter()
        .chain(cache.client_mounts_on_host(attrs.host))
        .map(|e| e.id)
        .collect()
}

fn host_id(lnet: &Entity) -> Result<u64, String> {
    lnet.lnet()
        .map(|l| l.host)
        .ok_or_else(|| format!("{} has no LNet attributes", lnet.id))
}

fn fqdn(ctx: &JobContext<'_>) -> Result<String, String> {
    ctx.cache.fqdn(host_id(ctx.entity)?)
}

fn host_label(ctx: &JobContext<'_>) -> String {
    host_id(ctx.entity)
        .ok()
        .and_then(|id| ctx.cache.get(EntityRef::host(id)))
        .map(|h| h.label.clone())
        .unwrap_or_else(|| ctx.entity.label.clone())
}
