use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use super::{Dependencies, Entity, EntityKind, EntityRef};
use super::{client_mount, filesystem, host, lnet, target, ticket};
use crate::cache::ObjectCache;
use crate::state_machine::{LockRequest, Step, StepArgs};

/// Everything a job hook may look at while a job is being planned or
/// completed.
pub struct JobContext<'a> {
    pub cache: &'a ObjectCache,
    pub entity: &'a Entity,
    pub args: &'a StepArgs,
}

pub type DescribeFn = fn(&JobContext<'_>) -> String;
pub type DepsFn = fn(&JobContext<'_>) -> Result<Dependencies, String>;
pub type StepsFn = fn(&JobContext<'_>) -> Result<Vec<Step>, String>;
pub type LocksFn = fn(&JobContext<'_>) -> Vec<LockRequest>;
/// Runs after the job's last step succeeded and its state change has been
/// applied to the `&mut Entity`. Returns further entity updates to commit in
/// the same transaction.
pub type SuccessFn = fn(&JobContext<'_>, &mut Entity) -> Result<Vec<Entity>, String>;

/// Descriptors an entity requires of others while it sits in `state`.
pub type StateDepsFn = fn(&ObjectCache, &Entity, &str) -> Dependencies;
/// Business-rule filter over the states reachable from the current one.
pub type AvailableFn = fn(&ObjectCache, &Entity, Vec<String>) -> Vec<String>;
/// Given a dependency entity, returns the entities that may depend on it.
pub type DependentLookup = fn(&ObjectCache, &Entity) -> Vec<EntityRef>;

#[derive(Clone, Copy)]
pub struct JobHooks {
    pub describe: Option<DescribeFn>,
    pub deps: DepsFn,
    pub steps: StepsFn,
    pub locks: Option<LocksFn>,
    pub on_success: Option<SuccessFn>,
}

impl Default for JobHooks {
    fn default() -> Self {
        Self {
            describe: None,
            deps: |_| Ok(Dependencies::none()),
            steps: |_| Ok(Vec::new()),
            locks: None,
            on_success: None,
        }
    }
}

/// Per-kind registration.
#[derive(Clone, Copy)]
pub struct EntityType {
    pub kind: EntityKind,
    pub state_deps: StateDepsFn,
    pub available: Option<AvailableFn>,
}

impl EntityType {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            state_deps: |_, _, _| Dependencies::none(),
            available: None,
        }
    }

    pub fn state_deps(mut self, f: StateDepsFn) -> Self {
        self.state_deps = f;
        self
    }

    pub fn available(mut self, f: AvailableFn) -> Self {
        self.available = Some(f);
        self
    }
}

/// Template for a state-changing job: moves an entity of `kind` from any of
/// `from` to `to`.
#[derive(Clone)]
pub struct TransitionRule {
    pub name: &'static str,
    pub kind: EntityKind,
    pub from: &'static [&'static str],
    pub to: &'static str,
    pub verb: &'static str,
    pub requires_confirmation: bool,
    pub hooks: JobHooks,
}

impl TransitionRule {
    pub fn new(
        kind: EntityKind,
        name: &'static str,
        from: &'static [&'static str],
        to: &'static str,
        verb: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            from,
            to,
            verb,
            requires_confirmation: false,
            hooks: JobHooks::default(),
        }
    }

    pub fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn describe(mut self, f: DescribeFn) -> Self {
        self.hooks.describe = Some(f);
        self
    }

    pub fn deps(mut self, f: DepsFn) -> Self {
        self.hooks.deps = f;
        self
    }

    pub fn steps(mut self, f: StepsFn) -> Self {
        self.hooks.steps = f;
        self
    }

    pub fn locks(mut self, f: LocksFn) -> Self {
        self.hooks.locks = Some(f);
        self
    }

    pub fn on_success(mut self, f: SuccessFn) -> Self {
        self.hooks.on_success = Some(f);
        self
    }

    pub fn description(&self, ctx: &JobContext<'_>) -> String {
        match self.hooks.describe {
            Some(f) => f(ctx),
            None => format!("{} {}", self.verb, ctx.entity.label),
        }
    }
}

/// Template for a job that runs steps against an entity without changing
/// its state.
#[derive(Clone)]
pub struct AdvertisedJob {
    pub name: &'static str,
    pub kind: EntityKind,
    pub verb: &'static str,
    pub requires_confirmation: bool,
    pub hooks: JobHooks,
}

impl AdvertisedJob {
    pub fn new(kind: EntityKind, name: &'static str, verb: &'static str) -> Self {
        Self {
            name,
            kind,
            verb,
            requires_confirmation: false,
            hooks: JobHooks::default(),
        }
    }

    pub fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn deps(mut self, f: DepsFn) -> Self {
        self.hooks.deps = f;
        self
    }

    pub fn steps(mut self, f: StepsFn) -> Self {
        self.hooks.steps = f;
        self
    }

    pub fn locks(mut self, f: LocksFn) -> Self {
        self.hooks.locks = Some(f);
        self
    }

    pub fn on_success(mut self, f: SuccessFn) -> Self {
        self.hooks.on_success = Some(f);
        self
    }

    pub fn description(&self, ctx: &JobContext<'_>) -> String {
        match self.hooks.describe {
            Some(f) => f(ctx),
            None => format!("{} {}", self.verb, ctx.entity.label),
        }
    }
}

/// Registry of entity types, transition rules, advertised jobs and
/// reverse-dependency lookups.
///
/// Every kind registers itself explicitly; [`Catalog::standard`] wires up the
/// kinds this crate ships.
#[derive(Clone, Default)]
pub struct Catalog {
    types: BTreeMap<EntityKind, EntityType>,
    rules: Vec<TransitionRule>,
    advertised: BTreeMap<&'static str, AdvertisedJob>,
    dependents: HashMap<EntityKind, Vec<DependentLookup>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut catalog = Self::new();
        host::register(&mut catalog);
        lnet::register(&mut catalog);
        target::register(&mut catalog);
        filesystem::register(&mut catalog);
        client_mount::register(&mut catalog);
        ticket::register(&mut catalog);
        catalog
    }

    pub fn register_type(&mut self, entity_type: EntityType) {
        self.types.insert(entity_type.kind, entity_type);
    }

    pub fn register_rule(&mut self, rule: TransitionRule) {
        debug_assert!(rule.kind.has_state(rule.to), "{}: bad to-state", rule.name);
        debug_assert!(
            rule.from.iter().all(|s| rule.kind.has_state(s)),
            "{}: bad from-state",
            rule.name
        );
        self.rules.push(rule);
    }

    pub fn register_advertised(&mut self, job: AdvertisedJob) {
        self.advertised.insert(job.name, job);
    }

    /// Declares that entities found by `lookup` may depend on entities of
    /// kind `dependency`.
    pub fn register_dependents(&mut self, dependency: EntityKind, lookup: DependentLookup) {
        self.dependents.entry(dependency).or_default().push(lookup);
    }

    pub fn entity_type(&self, kind: EntityKind) -> Option<&EntityType> {
        self.types.get(&kind)
    }

    pub fn rule(&self, name: &str) -> Option<&TransitionRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn rules_for(&self, kind: EntityKind) -> impl Iterator<Item = &TransitionRule> {
        self.rules.iter().filter(move |r| r.kind == kind)
    }

    pub fn advertised(&self, name: &str) -> Option<&AdvertisedJob> {
        self.advertised.get(name)
    }

    /// Copy of the reverse-dependency table, for the object cache.
    pub fn dependent_lookups(&self) -> HashMap<EntityKind, Vec<DependentLookup>> {
        self.dependents.clone()
    }

    /// Descriptors `entity` requires while it is in `state`.
    pub fn state_deps(&self, cache: &ObjectCache, entity: &Entity, state: &str) -> Dependencies {
        match self.types.get(&entity.id.kind) {
            Some(t) => (t.state_deps)(cache, entity, state),
            None => Dependencies::none(),
        }
    }

    /// Shortest sequence of rules taking an entity of `kind` from `from` to
    /// `to`. Ties are broken by rule registration order.
    pub fn route(&self, kind: EntityKind, from: &str, to: &str) -> Option<Vec<&TransitionRule>> {
        if from == to {
            return Some(Vec::new());
        }

        let mut parent: HashMap<&str, (&str, &TransitionRule)> = HashMap::new();
        let mut seen: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<&str> = VecDeque::from([from]);

        while let Some(state) = queue.pop_front() {
            for rule in self.rules_for(kind).filter(|r| r.from.contains(&state)) {
                if seen.insert(rule.to) {
                    parent.insert(rule.to, (state, rule));
                    if rule.to == to {
                        return Some(Self::unwind(&parent, from, to));
                    }
                    queue.push_back(rule.to);
                }
            }
        }
        None
    }

    fn unwind<'a>(
        parent: &HashMap<&str, (&str, &'a TransitionRule)>,
        from: &str,
        to: &str,
    ) -> Vec<&'a TransitionRule> {
        let mut route = Vec::new();
        let mut cursor = to;
        while cursor != from {
            let (prev, rule) = parent[cursor];
            route.push(rule);
            cursor = prev;
        }
        route.reverse();
        route
    }

    /// States an entity can be asked to reach from its current state, after
    /// the kind's business rules have been applied.
    pub fn available_states(&self, cache: &ObjectCache, entity: &Entity) -> Vec<String> {
        let kind = entity.id.kind;
        let reachable: Vec<String> = kind
            .states()
            .iter()
            .filter(|s| **s != entity.state)
            .filter(|s| !entity.immutable || **s == "forgotten")
            .filter(|s| self.route(kind, &entity.state, s).is_some())
            .map(|s| s.to_string())
            .collect();

        if entity.immutable {
            return reachable;
        }
        match self.types.get(&kind).and_then(|t| t.available) {
            Some(filter) => filter(cache, entity, reachable),
            None => reachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_walks_lnet_states_in_order() {
        let catalog = Catalog::standard();
        let route = catalog
            .route(EntityKind::LnetConfiguration, "unconfigured", "lnet_up")
            .unwrap();
        let hops: Vec<(&str, &str)> = route.iter().map(|r| (r.name, r.to)).collect();
        assert_eq!(
            hops,
            vec![
                ("enable_lnet", "lnet_unloaded"),
                ("load_lnet", "lnet_down"),
                ("start_lnet", "lnet_up"),
            ]
        );
    }

    #[test]
    fn route_to_same_state_is_empty_and_unknown_is_none() {
        let catalog = Catalog::standard();
        assert!(catalog
            .route(EntityKind::ClientMount, "mounted", "mounted")
            .unwrap()
            .is_empty());
        assert!(catalog
            .route(EntityKind::ClientMount, "removed", "mounted")
            .is_none());
    }

    #[test]
    fn every_rule_is_registered_once() {
        let catalog = Catalog::standard();
        let mut names: Vec<&str> = EntityKind::ALL
            .iter()
            .flat_map(|k| catalog.rules_for(*k).map(|r| r.name))
            .collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(catalog.advertised("configure_lnet").is_some());
        assert!(catalog.advertised("failover_target").is_some());
    }

    #[test]
    fn every_kind_has_a_registered_type() {
        let catalog = Catalog::standard();
        for kind in EntityKind::ALL {
            assert!(catalog.entity_type(kind).is_some(), "{kind}");
        }
    }
}
