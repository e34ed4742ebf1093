//! Cluster fixtures: entity lists loaded from TOML to seed a store.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{
    ClientMountAttrs, Entity, EntityAttrs, EntityRef, FilesystemAttrs, HostAttrs, LnetAttrs,
    TargetAttrs, TargetRole,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFixture {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl ClusterFixture {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing fixture {}", path.display()))
    }

    pub fn demo() -> Self {
        Self {
            entities: demo_cluster(),
        }
    }
}

/// A small running cluster: one MGS/MDS server, one OSS and one client,
/// all with LNet up and the `testfs` filesystem mounted everywhere.
pub fn demo_cluster() -> Vec<Entity> {
    let mut entities = Vec::new();

    for (id, name) in [(1, "mds1"), (2, "oss1"), (3, "client1")] {
        entities.push(Entity::new(
            EntityRef::host(id),
            name,
            "managed",
            EntityAttrs::Host(HostAttrs {
                fqdn: format!("{name}.local"),
            }),
        ));
        entities.push(Entity::new(
            EntityRef::lnet(id),
            format!("LNet on {name}"),
            "lnet_up",
            EntityAttrs::LnetConfiguration(LnetAttrs {
                host: id,
                nids: vec![format!("10.0.0.{id}@tcp")],
            }),
        ));
    }

    let target = |id: u64, role: TargetRole, name: &str, filesystem: Option<u64>, host: u64| {
        Entity::new(
            EntityRef::target(id),
            name,
            "mounted",
            EntityAttrs::Target(TargetAttrs {
                role,
                name: name.to_string(),
                filesystem,
                hosts: vec![host],
                active_host: Some(host),
                device_path: format!("/dev/disk/by-id/target{id}"),
            }),
        )
    };
    entities.push(target(1, TargetRole::Mgs, "MGS", None, 1));
    entities.push(target(2, TargetRole::Mdt, "testfs-MDT0000", Some(1), 1));
    entities.push(target(3, TargetRole::Ost, "testfs-OST0000", Some(1), 2));

    entities.push(Entity::new(
        EntityRef::filesystem(1),
        "testfs",
        "available",
        EntityAttrs::Filesystem(FilesystemAttrs {
            name: "testfs".into(),
            mgs: 1,
        }),
    ));
    entities.push(Entity::new(
        EntityRef::client_mount(1),
        "testfs on client1",
        "mounted",
        EntityAttrs::ClientMount(ClientMountAttrs {
            host: 3,
            filesystem: "testfs".into(),
            mountpoints: vec!["/mnt/testfs".into()],
        }),
    ));

    entities
}
