use super::catalog::{EntityType, JobContext, TransitionRule};
use super::{Catalog, Entity, EntityKind, EntityRef};
use crate::cache::ObjectCache;
use crate::state_machine::Step;

pub const STATES: &[&str] = &[
    "undeployed",
    "unconfigured",
    "packages_installed",
    "managed",
    "removed",
];
pub const INITIAL_STATE: &str = "unconfigured";

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(EntityType::new(EntityKind::Host));

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Host,
            "deploy_host",
            &["undeployed"],
            "unconfigured",
            "Deploy agent to",
        )
        .steps(|ctx| Ok(vec![Step::new("deploy_agent", fqdn(ctx)?)])),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Host,
            "install_packages",
            &["unconfigured"],
            "packages_installed",
            "Install packages on",
        )
        .steps(|ctx| Ok(vec![Step::new("install_packages", fqdn(ctx)?).idempotent()])),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Host,
            "setup_host",
            &["packages_installed"],
            "managed",
            "Set up managed host",
        )
        .steps(|ctx| Ok(vec![Step::new("setup_managed_host", fqdn(ctx)?).idempotent()])),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Host,
            "remove_host",
            &["unconfigured", "packages_installed", "managed"],
            "removed",
            "Remove host",
        )
        .confirm()
        .steps(|ctx| Ok(vec![Step::new("remove_server_conf", fqdn(ctx)?).idempotent()]))
        .on_success(|_, host| {
            host.mark_deleted();
            Ok(Vec::new())
        }),
    );

    catalog.register_dependents(EntityKind::Host, dependents);
}

fn fqdn(ctx: &JobContext<'_>) -> Result<String, String> {
    ctx.entity
        .host()
        .map(|h| h.fqdn.clone())
        .ok_or_else(|| format!("{} has no host attributes", ctx.entity.id))
}

/// LNet configuration, client mounts and targets living on the host.
fn dependents(cache: &ObjectCache, host: &Entity) -> Vec<EntityRef> {
    let id = host.id.id;
    cache
        .lnet_for_host(id)
        .into_iter()
        .chain(cache.client_mounts_on_host(id))
        .chain(cache.targets_on_host(id))
        .map(|e| e.id)
        .collect()
}
