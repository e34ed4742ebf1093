use std::fmt;

use super::{Entity, EntityRef};

/// Requires `entity` to be in one of `acceptable_states`.
///
/// When the requirement is unmet before a job runs, the resolver drives
/// `entity` to `required_state`. When a planned transition would move
/// `entity` out of the acceptable set, the entity that *declared* this
/// dependency is driven to `fix_state` first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependOn {
    pub entity: EntityRef,
    pub required_state: String,
    pub acceptable_states: Vec<String>,
    pub fix_state: Option<String>,
}

impl DependOn {
    pub fn new(entity: &Entity, required_state: &str) -> Self {
        Self::on(entity.id, required_state)
    }

    pub fn on(entity: EntityRef, required_state: &str) -> Self {
        Self {
            entity,
            required_state: required_state.to_string(),
            acceptable_states: vec![required_state.to_string()],
            fix_state: None,
        }
    }

    pub fn acceptable(mut self, states: &[&str]) -> Self {
        self.acceptable_states = states.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Accept every state of the entity's kind except `excluded`.
    pub fn acceptable_except(mut self, excluded: &[&str]) -> Self {
        self.acceptable_states = self.entity.kind.states_except(excluded);
        self
    }

    pub fn fix(mut self, state: &str) -> Self {
        self.fix_state = Some(state.to_string());
        self
    }

    pub fn accepts(&self, state: &str) -> bool {
        self.acceptable_states.iter().any(|s| s == state)
    }
}

impl fmt::Display for DependOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in [{}]", self.entity, self.acceptable_states.join(", "))
    }
}

/// A composition of [`DependOn`] descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependencies {
    On(DependOn),
    All(Vec<Dependencies>),
    /// Satisfied by any member. When none is, the first member is the one
    /// the resolver tries to satisfy.
    Any(Vec<Dependencies>),
}

impl Dependencies {
    pub fn none() -> Self {
        Dependencies::All(Vec::new())
    }

    pub fn all(deps: impl IntoIterator<Item = DependOn>) -> Self {
        Dependencies::All(deps.into_iter().map(Dependencies::On).collect())
    }

    pub fn any(deps: impl IntoIterator<Item = DependOn>) -> Self {
        Dependencies::Any(deps.into_iter().map(Dependencies::On).collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Dependencies::On(_) => false,
            Dependencies::All(v) | Dependencies::Any(v) => v.iter().all(|d| d.is_empty()),
        }
    }

    /// Every descriptor in the tree, depth first.
    pub fn leaves(&self) -> Vec<&DependOn> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a DependOn>) {
        match self {
            Dependencies::On(d) => out.push(d),
            Dependencies::All(v) | Dependencies::Any(v) => {
                for d in v {
                    d.collect_leaves(out);
                }
            }
        }
    }

    /// Evaluates the tree given a lookup of each entity's state.
    /// Entities the lookup does not know about never satisfy a descriptor.
    pub fn satisfied(&self, state_of: &impl Fn(EntityRef) -> Option<String>) -> bool {
        match self {
            Dependencies::On(d) => state_of(d.entity).is_some_and(|s| d.accepts(&s)),
            Dependencies::All(v) => v.iter().all(|d| d.satisfied(state_of)),
            Dependencies::Any(v) => v.is_empty() || v.iter().any(|d| d.satisfied(state_of)),
        }
    }
}

impl From<DependOn> for Dependencies {
    fn from(value: DependOn) -> Self {
        Dependencies::On(value)
    }
}
