//! # rustainer-network
//!
//! Network lifecycle for Rustainer containers.
//!
//! Each attached container gets its own network namespace, joined to a
//! single host bridge through a veth pair, with masquerade and forward
//! rules so it can reach external networks. [`NetworkLifecycleManager`]
//! drives the per-container state machine, rolls back partial setup, and
//! reconciles away anything tagged with the reserved prefix that it no
//! longer tracks.
//!
//! All host mutation goes through the [`HostNetwork`] trait.
//! [`CommandHost`] shells out to `ip` and `iptables`; [`mock::MockHost`]
//! keeps the same state in memory.

#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod hooks;
pub mod host;
pub mod ipam;
pub mod manager;
pub mod mock;
pub mod naming;
pub mod nat;
pub mod netns;
pub mod portmap;
pub mod reconcile;
pub mod record;
pub mod sysctl;
pub mod veth;

pub use bridge::{BridgeHandle, BridgeManager};
pub use config::{NetworkConfig, WaitPolicy};
pub use hooks::{ContainerHooks, NoopHooks};
pub use host::{CommandHost, HostNetwork};
pub use ipam::AddressAllocator;
pub use manager::{AttachRequest, NetworkLifecycleManager};
pub use naming::{Naming, ResourceNames, RuleTag};
pub use nat::{NatRuleSet, RuleDescriptor, Table};
pub use netns::NamespaceHandle;
pub use portmap::{PortMapper, PortMapping, Protocol};
pub use reconcile::ReconcileReport;
pub use record::{AttachState, ContainerNetworkRecord, NetworkInfo};
pub use sysctl::SysctlTuner;
pub use veth::VethPair;
