use super::catalog::{EntityType, JobContext, TransitionRule};
use super::{Catalog, DependOn, Dependencies, Entity, EntityKind, EntityRef, TicketScope};
use crate::cache::ObjectCache;
use crate::state_machine::Step;

pub const STATES: &[&str] = &["revoked", "granted", "forgotten"];
pub const INITIAL_STATE: &str = "revoked";

pub(super) fn register(catalog: &mut Catalog) {
    catalog.register_type(EntityType::new(EntityKind::Ticket).state_deps(state_deps));

    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Ticket,
            "grant_ticket",
            &["revoked"],
            "granted",
            "Grant ticket",
        )
        .steps(|ctx| resource_step(ctx, "start_resource")),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Ticket,
            "revoke_ticket",
            &["granted"],
            "revoked",
            "Revoke ticket",
        )
        .steps(|ctx| resource_step(ctx, "stop_resource")),
    );
    catalog.register_rule(
        TransitionRule::new(
            EntityKind::Ticket,
            "forget_ticket",
            &["granted", "revoked"],
            "forgotten",
            "Forget ticket",
        )
        .on_success(|_, ticket| {
            ticket.mark_deleted();
            Ok(Vec::new())
        }),
    );

    catalog.register_dependents(EntityKind::Ticket, dependents);
}

/// Tickets are cluster resources; the agent on the MGS host drives them.
fn resource_step(ctx: &JobContext<'_>, operation: &str) -> Result<Vec<Step>, String> {
    let ticket = ctx
        .entity
        .ticket()
        .ok_or_else(|| format!("{} has no ticket attributes", ctx.entity.id))?;
    if !ticket.resource_controlled {
        return Err(format!("ticket {} is not resource controlled", ticket.name));
    }
    let mgs = match ticket.scope {
        TicketScope::Master { mgs } => mgs,
        TicketScope::Filesystem { filesystem } => ctx
            .cache
            .get(EntityRef::filesystem(filesystem))
            .and_then(|f| f.filesystem())
            .map(|f| f.mgs)
            .ok_or_else(|| format!("filesystem {filesystem} is not known"))?,
    };
    let host = ctx
        .cache
        .get(EntityRef::target(mgs))
        .and_then(|t| t.target())
        .and_then(|t| t.effective_host())
        .ok_or_else(|| format!("MGS {mgs} has no host"))?;
    Ok(vec![
        Step::new(operation, ctx.cache.fqdn(host)?)
            .arg("ha_label", ticket.ha_label.as_str())
            .idempotent(),
    ])
}

/// A granted filesystem ticket needs the master ticket of its MGS.
fn state_deps(cache: &ObjectCache, ticket: &Entity, state: &str) -> Dependencies {
    if state != "granted" {
        return Dependencies::none();
    }
    let Some(TicketScope::Filesystem { filesystem }) = ticket.ticket().map(|t| &t.scope) else {
        return Dependencies::none();
    };
    let master = cache
        .get(EntityRef::filesystem(*filesystem))
        .and_then(|f| f.filesystem())
        .and_then(|f| cache.master_ticket_of_mgs(f.mgs));
    match master {
        Some(master) => DependOn::new(master, "granted").fix("revoked").into(),
        None => Dependencies::none(),
    }
}

/// Filesystem tickets under a master ticket.
fn dependents(cache: &ObjectCache, ticket: &Entity) -> Vec<EntityRef> {
    match ticket.ticket().map(|t| &t.scope) {
        Some(TicketScope::Master { mgs }) => cache
            .filesystem_tickets_of_mgs(*mgs)
            .into_iter()
            .map(|e| e.id)
            .collect(),
        _ => Vec::new(),
    }
}
