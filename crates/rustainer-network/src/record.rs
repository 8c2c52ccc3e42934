//! Per-container network records.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rustainer_common::{ContainerId, RustainerPaths};
use serde::{Deserialize, Serialize};

use crate::naming::ResourceNames;
use crate::portmap::PortMapping;

/// Progress of a container through attach and detach.
///
/// Attach states are ordered; a record in state `S` owns every host
/// resource created by the states before it, and possibly some of `S`'s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachState {
    /// No resources.
    Unattached,
    /// Address reserved.
    Allocating,
    /// Namespace exists.
    NamespaceCreated,
    /// Veth pair exists, container end inside the namespace, host end on the bridge.
    VethWired,
    /// Container end addressed and routed.
    AddressAssigned,
    /// Shared and per-container NAT rules present.
    NatEnsured,
    /// Attached.
    Ready,
    /// Teardown in progress.
    Detaching,
}

impl AttachState {
    /// Whether the container is fully attached.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether an attach or detach is in flight.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        !matches!(self, Self::Ready | Self::Unattached)
    }
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unattached => "unattached",
            Self::Allocating => "allocating",
            Self::NamespaceCreated => "namespace_created",
            Self::VethWired => "veth_wired",
            Self::AddressAssigned => "address_assigned",
            Self::NatEnsured => "nat_ensured",
            Self::Ready => "ready",
            Self::Detaching => "detaching",
        };
        f.write_str(s)
    }
}

/// What the manager knows about one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNetworkRecord {
    /// Container ID.
    pub container_id: ContainerId,
    /// Namespace name.
    pub namespace: String,
    /// Host-side veth.
    pub veth_host: String,
    /// Container-side veth.
    pub veth_container: String,
    /// Assigned address.
    pub ip: Ipv4Addr,
    /// Current state.
    pub state: AttachState,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// When the attach started.
    pub attached_at: DateTime<Utc>,
}

impl ContainerNetworkRecord {
    /// A fresh record in [`AttachState::Allocating`].
    #[must_use]
    pub fn new(
        container_id: ContainerId,
        names: ResourceNames,
        ip: Ipv4Addr,
        ports: Vec<PortMapping>,
    ) -> Self {
        Self {
            container_id,
            namespace: names.namespace,
            veth_host: names.veth_host,
            veth_container: names.veth_container,
            ip,
            state: AttachState::Allocating,
            ports,
            attached_at: Utc::now(),
        }
    }
}

/// Network details returned by a successful attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Container address.
    pub ip: Ipv4Addr,
    /// Default gateway.
    pub gateway: Ipv4Addr,
    /// Subnet prefix length.
    pub prefix_len: u8,
    /// Namespace name.
    pub namespace: String,
    /// Namespace path for the process supervisor to join.
    pub namespace_path: PathBuf,
}

impl NetworkInfo {
    pub(crate) fn new(record: &ContainerNetworkRecord, gateway: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            ip: record.ip,
            gateway,
            prefix_len,
            namespace: record.namespace.clone(),
            namespace_path: RustainerPaths::netns(&record.namespace),
        }
    }
}
