//! Managed entities: hosts, LNet configurations, targets, filesystems, client
//! mounts and HA tickets.
//!
//! Every entity is a finite-state object. The per-kind state sets live in the
//! kind modules; the transition rules, dependency descriptors and
//! reverse-dependency lookups are registered into a [`Catalog`].

mod catalog;
mod client_mount;
mod deps;
mod filesystem;
mod host;
mod lnet;
mod target;
mod ticket;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use catalog::{
    AdvertisedJob, AvailableFn, Catalog, DependentLookup, DepsFn, DescribeFn, EntityType,
    JobContext, JobHooks, LocksFn, StateDepsFn, StepsFn, SuccessFn, TransitionRule,
};
pub use deps::{DependOn, Dependencies};

/// The kinds of entity the scheduler manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Host,
    LnetConfiguration,
    Target,
    Filesystem,
    ClientMount,
    Ticket,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Host,
        EntityKind::LnetConfiguration,
        EntityKind::Target,
        EntityKind::Filesystem,
        EntityKind::ClientMount,
        EntityKind::Ticket,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Host => "host",
            EntityKind::LnetConfiguration => "lnet_configuration",
            EntityKind::Target => "target",
            EntityKind::Filesystem => "filesystem",
            EntityKind::ClientMount => "client_mount",
            EntityKind::Ticket => "ticket",
        }
    }

    /// Ordered list of valid states for this kind.
    pub fn states(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Host => host::STATES,
            EntityKind::LnetConfiguration => lnet::STATES,
            EntityKind::Target => target::STATES,
            EntityKind::Filesystem => filesystem::STATES,
            EntityKind::ClientMount => client_mount::STATES,
            EntityKind::Ticket => ticket::STATES,
        }
    }

    pub fn initial_state(&self) -> &'static str {
        match self {
            EntityKind::Host => host::INITIAL_STATE,
            EntityKind::LnetConfiguration => lnet::INITIAL_STATE,
            EntityKind::Target => target::INITIAL_STATE,
            EntityKind::Filesystem => filesystem::INITIAL_STATE,
            EntityKind::ClientMount => client_mount::INITIAL_STATE,
            EntityKind::Ticket => ticket::INITIAL_STATE,
        }
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states().contains(&state)
    }

    /// All states of this kind except the ones listed.
    pub fn states_except(&self, excluded: &[&str]) -> Vec<String> {
        self.states()
            .iter()
            .filter(|s| !excluded.contains(s))
            .map(|s| s.to_string())
            .collect()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" | "server" => Ok(EntityKind::Host),
            "lnet_configuration" | "lnet" => Ok(EntityKind::LnetConfiguration),
            "target" | "mgt" | "mdt" | "ost" => Ok(EntityKind::Target),
            "filesystem" | "fs" => Ok(EntityKind::Filesystem),
            "client_mount" | "mount" => Ok(EntityKind::ClientMount),
            "ticket" => Ok(EntityKind::Ticket),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// Identity of an entity: its kind plus a per-kind numeric id.
///
/// Rendered and parsed as `kind:id`, e.g. `lnet_configuration:3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityRef {
    pub const fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub const fn host(id: u64) -> Self {
        Self::new(EntityKind::Host, id)
    }

    pub const fn lnet(id: u64) -> Self {
        Self::new(EntityKind::LnetConfiguration, id)
    }

    pub const fn target(id: u64) -> Self {
        Self::new(EntityKind::Target, id)
    }

    pub const fn filesystem(id: u64) -> Self {
        Self::new(EntityKind::Filesystem, id)
    }

    pub const fn client_mount(id: u64) -> Self {
        Self::new(EntityKind::ClientMount, id)
    }

    pub const fn ticket(id: u64) -> Self {
        Self::new(EntityKind::Ticket, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected `kind:id`, got '{s}'"))?;
        let kind = kind.parse::<EntityKind>()?;
        let id = id
            .parse::<u64>()
            .map_err(|e| format!("bad entity id in '{s}': {e}"))?;
        Ok(Self { kind, id })
    }
}

impl TryFrom<String> for EntityRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityRef> for String {
    fn from(value: EntityRef) -> Self {
        value.to_string()
    }
}

/// Role of a Lustre target. MGS targets are shared between filesystems;
/// MDTs and OSTs belong to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Mgs,
    Mdt,
    Ost,
}

impl fmt::Display for TargetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRole::Mgs => write!(f, "MGT"),
            TargetRole::Mdt => write!(f, "MDT"),
            TargetRole::Ost => write!(f, "OST"),
        }
    }
}

/// What an HA ticket controls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketScope {
    /// Controls the MGS and every filesystem ticket under it.
    Master { mgs: u64 },
    /// Controls a single filesystem.
    Filesystem { filesystem: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAttrs {
    pub fqdn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnetAttrs {
    pub host: u64,
    #[serde(default)]
    pub nids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAttrs {
    pub role: TargetRole,
    pub name: String,
    /// Owning filesystem for MDTs and OSTs.
    #[serde(default)]
    pub filesystem: Option<u64>,
    /// Hosts able to mount the target, primary first.
    #[serde(default)]
    pub hosts: Vec<u64>,
    #[serde(default)]
    pub active_host: Option<u64>,
    #[serde(default)]
    pub device_path: String,
}

impl TargetAttrs {
    /// The host the target is (or would be) mounted on.
    pub fn effective_host(&self) -> Option<u64> {
        self.active_host.or_else(|| self.hosts.first().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttrs {
    pub name: String,
    pub mgs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMountAttrs {
    pub host: u64,
    /// Filesystem name; mounts reference filesystems by name.
    pub filesystem: String,
    #[serde(default)]
    pub mountpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketAttrs {
    pub name: String,
    pub ha_label: String,
    pub scope: TicketScope,
    #[serde(default = "default_true")]
    pub resource_controlled: bool,
}

/// Kind-specific attributes. The variant always matches the kind of the
/// owning entity's [`EntityRef`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityAttrs {
    Host(HostAttrs),
    LnetConfiguration(LnetAttrs),
    Target(TargetAttrs),
    Filesystem(FilesystemAttrs),
    ClientMount(ClientMountAttrs),
    Ticket(TicketAttrs),
}

impl EntityAttrs {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityAttrs::Host(_) => EntityKind::Host,
            EntityAttrs::LnetConfiguration(_) => EntityKind::LnetConfiguration,
            EntityAttrs::Target(_) => EntityKind::Target,
            EntityAttrs::Filesystem(_) => EntityKind::Filesystem,
            EntityAttrs::ClientMount(_) => EntityKind::ClientMount,
            EntityAttrs::Ticket(_) => EntityKind::Ticket,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A stateful, manageable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityRef,
    pub label: String,
    pub state: String,
    #[serde(default = "Utc::now")]
    pub state_modified_at: DateTime<Utc>,
    /// Externally managed: the only reachable state is `forgotten`.
    #[serde(default)]
    pub immutable: bool,
    /// Cleared when the entity is removed; removed entities stay on record.
    #[serde(default = "default_true")]
    pub not_deleted: bool,
    pub attrs: EntityAttrs,
}

impl Entity {
    pub fn new(id: EntityRef, label: impl Into<String>, state: &str, attrs: EntityAttrs) -> Self {
        Self {
            id,
            label: label.into(),
            state: state.to_string(),
            state_modified_at: Utc::now(),
            immutable: false,
            not_deleted: true,
            attrs,
        }
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn host(&self) -> Option<&HostAttrs> {
        match &self.attrs {
            EntityAttrs::Host(a) => Some(a),
            _ => None,
        }
    }

    pub fn lnet(&self) -> Option<&LnetAttrs> {
        match &self.attrs {
            EntityAttrs::LnetConfiguration(a) => Some(a),
            _ => None,
        }
    }

    pub fn target(&self) -> Option<&TargetAttrs> {
        match &self.attrs {
            EntityAttrs::Target(a) => Some(a),
            _ => None,
        }
    }

    pub fn filesystem(&self) -> Option<&FilesystemAttrs> {
        match &self.attrs {
            EntityAttrs::Filesystem(a) => Some(a),
            _ => None,
        }
    }

    pub fn client_mount(&self) -> Option<&ClientMountAttrs> {
        match &self.attrs {
            EntityAttrs::ClientMount(a) => Some(a),
            _ => None,
        }
    }

    pub fn ticket(&self) -> Option<&TicketAttrs> {
        match &self.attrs {
            EntityAttrs::Ticket(a) => Some(a),
            _ => None,
        }
    }

    /// Records a state change. Callers are responsible for having checked
    /// that `state` belongs to the kind's state set.
    pub fn set_state(&mut self, state: &str) {
        if self.state != state {
            self.state = state.to_string();
            self.state_modified_at = Utc::now();
        }
    }

    pub fn mark_deleted(&mut self) {
        self.not_deleted = false;
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_ref_parses_aliases() {
        assert_eq!("lnet:3".parse::<EntityRef>().unwrap(), EntityRef::lnet(3));
        assert_eq!("fs:1".parse::<EntityRef>().unwrap(), EntityRef::filesystem(1));
        assert_eq!(
            EntityRef::client_mount(7).to_string(),
            "client_mount:7"
        );
        assert!("target".parse::<EntityRef>().is_err());
        assert!("volume:1".parse::<EntityRef>().is_err());
    }

    #[test]
    fn every_kind_has_its_initial_state_in_its_state_set() {
        for kind in EntityKind::ALL {
            assert!(kind.has_state(kind.initial_state()), "{kind}");
        }
    }

    #[test]
    fn states_except_preserves_order() {
        assert_eq!(
            EntityKind::ClientMount.states_except(&["mounted"]),
            vec!["unmounted".to_string(), "removed".to_string()]
        );
    }

    #[test]
    fn entity_deserializes_from_toml_with_defaults() {
        let entity: Entity = toml::from_str(
            r#"
            id = "target:4"
            label = "fs1-OST0000"
            state = "mounted"

            [attrs]
            type = "target"
            role = "ost"
            name = "fs1-OST0000"
            filesystem = 1
            hosts = [2, 3]
            "#,
        )
        .unwrap();
        assert_eq!(entity.id, EntityRef::target(4));
        assert!(entity.not_deleted);
        assert!(!entity.immutable);
        let target = entity.target().unwrap();
        assert_eq!(target.role, TargetRole::Ost);
        assert_eq!(target.effective_host(), Some(2));
    }
}
