//! In-memory snapshot of every managed entity and the relationships between
//! them.
//!
//! The cache has a single writer (the scheduler, under its state lock). Each
//! completed job is applied as one batch of entity updates, and every batch
//! bumps the generation counter so planned jobs can record which snapshot
//! they were resolved against.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::error::SchedulerError;
use crate::model::{
    Catalog, DependentLookup, Entity, EntityKind, EntityRef, TargetRole, TicketScope,
};

#[derive(Clone, Default)]
pub struct ObjectCache {
    entities: BTreeMap<EntityRef, Entity>,
    dependents: HashMap<EntityKind, Vec<DependentLookup>>,
    generation: u64,
}

impl ObjectCache {
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            entities: BTreeMap::new(),
            dependents: catalog.dependent_lookups(),
            generation: 0,
        }
    }

    pub fn from_entities(
        catalog: &Catalog,
        entities: impl IntoIterator<Item = Entity>,
    ) -> Result<Self, SchedulerError> {
        let mut cache = Self::new(catalog);
        for entity in entities {
            cache.insert(entity)?;
        }
        Ok(cache)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: EntityRef) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn require(&self, id: EntityRef) -> Result<&Entity, SchedulerError> {
        self.entities
            .get(&id)
            .ok_or(SchedulerError::EntityNotFound(id))
    }

    pub fn state_of(&self, id: EntityRef) -> Option<&str> {
        self.entities.get(&id).map(|e| e.state.as_str())
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities of `kind` that have not been deleted.
    pub fn live(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities
            .range(EntityRef::new(kind, 0)..=EntityRef::new(kind, u64::MAX))
            .map(|(_, e)| e)
            .filter(|e| e.not_deleted)
    }

    /// Adds or replaces an entity after validating it against its kind.
    pub fn insert(&mut self, entity: Entity) -> Result<(), SchedulerError> {
        validate(&entity)?;
        self.entities.insert(entity.id, entity);
        self.generation += 1;
        Ok(())
    }

    /// Applies a batch of updates as one mutation. Either every update is
    /// valid and all are applied, or nothing changes.
    pub fn apply(&mut self, updates: &[Entity]) -> Result<u64, SchedulerError> {
        for entity in updates {
            validate(entity)?;
        }
        for entity in updates {
            debug!(entity = %entity.id, state = %entity.state, "cache update");
            self.entities.insert(entity.id, entity.clone());
        }
        self.generation += 1;
        Ok(self.generation)
    }

    /// Entities that may hold dependency descriptors on `entity`, per the
    /// reverse-dependency registry.
    pub fn dependents(&self, entity: &Entity) -> Vec<EntityRef> {
        let mut out: Vec<EntityRef> = Vec::new();
        if let Some(lookups) = self.dependents.get(&entity.id.kind) {
            for lookup in lookups {
                for dependent in lookup(self, entity) {
                    if dependent != entity.id && !out.contains(&dependent) {
                        out.push(dependent);
                    }
                }
            }
        }
        out
    }

    pub fn fqdn(&self, host: u64) -> Result<String, String> {
        self.get(EntityRef::host(host))
            .and_then(|e| e.host())
            .map(|h| h.fqdn.clone())
            .ok_or_else(|| format!("host {host} is not known"))
    }

    pub fn lnet_for_host(&self, host: u64) -> Option<&Entity> {
        self.live(EntityKind::LnetConfiguration)
            .find(|e| e.lnet().is_some_and(|l| l.host == host))
    }

    /// Targets any of whose candidate hosts is `host`.
    pub fn targets_on_host(&self, host: u64) -> Vec<&Entity> {
        self.live(EntityKind::Target)
            .filter(|e| e.target().is_some_and(|t| t.hosts.contains(&host)))
            .collect()
    }

    /// MDTs and OSTs of a filesystem. The MGS is not included.
    pub fn filesystem_targets(&self, filesystem: u64) -> Vec<&Entity> {
        self.live(EntityKind::Target)
            .filter(|e| e.target().is_some_and(|t| t.filesystem == Some(filesystem)))
            .collect()
    }

    pub fn mgs_of(&self, filesystem: &Entity) -> Option<&Entity> {
        let mgs = filesystem.filesystem()?.mgs;
        self.get(EntityRef::target(mgs))
    }

    pub fn filesystems_using_mgs(&self, mgs: u64) -> Vec<&Entity> {
        self.live(EntityKind::Filesystem)
            .filter(|e| e.filesystem().is_some_and(|f| f.mgs == mgs))
            .collect()
    }

    pub fn filesystem_by_name(&self, name: &str) -> Option<&Entity> {
        self.live(EntityKind::Filesystem)
            .find(|e| e.filesystem().is_some_and(|f| f.name == name))
    }

    pub fn client_mounts_on_host(&self, host: u64) -> Vec<&Entity> {
        self.live(EntityKind::ClientMount)
            .filter(|e| e.client_mount().is_some_and(|m| m.host == host))
            .collect()
    }

    pub fn client_mounts_of_filesystem(&self, name: &str) -> Vec<&Entity> {
        self.live(EntityKind::ClientMount)
            .filter(|e| e.client_mount().is_some_and(|m| m.filesystem == name))
            .collect()
    }

    pub fn ticket_of_filesystem(&self, filesystem: u64) -> Option<&Entity> {
        self.live(EntityKind::Ticket).find(|e| {
            e.ticket()
                .is_some_and(|t| t.scope == TicketScope::Filesystem { filesystem })
        })
    }

    pub fn master_ticket_of_mgs(&self, mgs: u64) -> Option<&Entity> {
        self.live(EntityKind::Ticket)
            .find(|e| e.ticket().is_some_and(|t| t.scope == TicketScope::Master { mgs }))
    }

    /// Filesystem tickets whose filesystem is served by `mgs`.
    pub fn filesystem_tickets_of_mgs(&self, mgs: u64) -> Vec<&Entity> {
        self.live(EntityKind::Ticket)
            .filter(|e| match e.ticket().map(|t| &t.scope) {
                Some(TicketScope::Filesystem { filesystem }) => self
                    .get(EntityRef::filesystem(*filesystem))
                    .and_then(|f| f.filesystem())
                    .is_some_and(|f| f.mgs == mgs),
                _ => false,
            })
            .collect()
    }

    /// The ticket controlling a target, if it is resource controlled.
    pub fn ticket_for_target(&self, target: &Entity) -> Option<&Entity> {
        let attrs = target.target()?;
        let ticket = match attrs.role {
            TargetRole::Mgs => self.master_ticket_of_mgs(target.id.id),
            TargetRole::Mdt | TargetRole::Ost => {
                self.ticket_of_filesystem(attrs.filesystem?)
            }
        }?;
        ticket
            .ticket()
            .is_some_and(|t| t.resource_controlled)
            .then_some(ticket)
    }
}

/// Checks that an entity's attributes and state belong to its kind.
pub fn validate(entity: &Entity) -> Result<(), SchedulerError> {
    let kind = entity.id.kind;
    if entity.attrs.kind() != kind {
        return Err(SchedulerError::InvalidEntity {
            entity: entity.id,
            message: format!("attributes are for a {}", entity.attrs.kind()),
        });
    }
    if !kind.has_state(&entity.state) {
        return Err(SchedulerError::InvalidState {
            entity: entity.id,
            state: entity.state.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::demo_cluster;
    use crate::model::{EntityAttrs, HostAttrs};

    fn cache() -> ObjectCache {
        let catalog = Catalog::standard();
        ObjectCache::from_entities(&catalog, demo_cluster()).unwrap()
    }

    #[test]
    fn rejects_state_outside_the_kind_state_set() {
        let mut cache = cache();
        let bad = Entity::new(
            EntityRef::host(99),
            "bogus",
            "mounted",
            EntityAttrs::Host(HostAttrs { fqdn: "bogus".into() }),
        );
        assert!(matches!(
            cache.insert(bad),
            Err(SchedulerError::InvalidState { .. })
        ));
    }

    #[test]
    fn rejects_attributes_of_another_kind() {
        let mut cache = cache();
        let bad = Entity::new(
            EntityRef::lnet(99),
            "bogus",
            "unconfigured",
            EntityAttrs::Host(HostAttrs { fqdn: "bogus".into() }),
        );
        assert!(matches!(
            cache.insert(bad),
            Err(SchedulerError::InvalidEntity { .. })
        ));
    }

    #[test]
    fn apply_is_all_or_nothing_and_bumps_generation() {
        let mut cache = cache();
        let before = cache.generation();
        let mut host = cache.get(EntityRef::host(1)).unwrap().clone();
        host.set_state("removed");
        let mut bad = host.clone();
        bad.id = EntityRef::host(2);
        bad.state = "lnet_up".into();

        assert!(cache.apply(&[host.clone(), bad]).is_err());
        assert_eq!(cache.state_of(EntityRef::host(1)), Some("managed"));
        assert_eq!(cache.generation(), before);

        let generation = cache.apply(&[host]).unwrap();
        assert_eq!(generation, before + 1);
        assert_eq!(cache.state_of(EntityRef::host(1)), Some("removed"));
    }

    #[test]
    fn relationship_queries_follow_attributes() {
        let cache = cache();
        let fs = cache.filesystem_by_name("testfs").unwrap();
        assert_eq!(cache.mgs_of(fs).unwrap().id, EntityRef::target(1));
        assert_eq!(cache.filesystem_targets(fs.id.id).len(), 2);
        assert_eq!(
            cache.lnet_for_host(1).unwrap().id,
            EntityRef::lnet(1)
        );
        assert_eq!(cache.client_mounts_of_filesystem("testfs").len(), 1);
    }

    #[test]
    fn lnet_dependents_are_targets_and_mounts_on_its_host() {
        let cache = cache();
        let lnet = cache.get(EntityRef::lnet(3)).unwrap();
        let dependents = cache.dependents(lnet);
        assert!(dependents.contains(&EntityRef::client_mount(1)));
        assert!(dependents.iter().all(|d| matches!(
            d.kind,
            EntityKind::Target | EntityKind::ClientMount
        )));
    }
}
