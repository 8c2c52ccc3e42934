//! Virtual ethernet pair management.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use rustainer_common::{RustainerError, RustainerResult};

use crate::host::HostNetwork;
use crate::netns::NamespaceHandle;

/// Virtual ethernet pair.
///
/// Both ends start in the root namespace. Only the container end is ever
/// moved; the host end stays behind and is enslaved to the bridge.
pub struct VethPair {
    host_net: Arc<dyn HostNetwork>,
    /// Host-side interface name.
    pub host: String,
    /// Container-side interface name.
    pub container: String,
}

impl VethPair {
    /// Create a new veth pair and bring the host end up.
    ///
    /// If the host end cannot be brought up the pair is deleted again.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::AlreadyExists`] if either name is taken.
    pub async fn create(
        host_net: Arc<dyn HostNetwork>,
        host_name: &str,
        container_name: &str,
    ) -> RustainerResult<Self> {
        tracing::debug!(host = host_name, container = container_name, "Creating veth pair");
        host_net.add_veth_pair(host_name, container_name).await?;

        let pair = Self::open(host_net, host_name, container_name);
        if let Err(e) = pair.host_net.set_link_up(None, &pair.host).await {
            if let Err(cleanup) = pair.delete_host_end().await {
                tracing::warn!(iface = %pair.host, error = %cleanup, "Failed to remove half-configured veth pair");
            }
            return Err(e);
        }
        Ok(pair)
    }

    /// Handle to an existing (or possibly absent) pair, for teardown.
    pub fn open(host_net: Arc<dyn HostNetwork>, host_name: &str, container_name: &str) -> Self {
        Self {
            host_net,
            host: host_name.to_string(),
            container: container_name.to_string(),
        }
    }

    /// Move the container side into a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::InterfaceNotFound`] if the container end is
    /// not in the root namespace.
    pub async fn move_to_namespace(&self, ns: &NamespaceHandle) -> RustainerResult<()> {
        tracing::debug!(iface = %self.container, netns = %ns.name(), "Moving to netns");
        self.host_net
            .move_link_to_netns(&self.container, ns.name())
            .await
    }

    /// Configure the container end from inside its namespace.
    ///
    /// Assigns the address, brings the interface and loopback up, and
    /// points the default route at the gateway. Re-running against an
    /// already configured interface succeeds.
    ///
    /// # Errors
    ///
    /// Returns the first host error.
    pub async fn assign_address(
        &self,
        ns: &NamespaceHandle,
        address: Ipv4Net,
        gateway: Ipv4Addr,
    ) -> RustainerResult<()> {
        let netns = Some(ns.name());
        tracing::debug!(iface = %self.container, netns = %ns.name(), ip = %address, "Assigning address");

        match self
            .host_net
            .add_address(netns, &self.container, address)
            .await
        {
            Ok(()) | Err(RustainerError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
        self.host_net.set_link_up(netns, &self.container).await?;
        self.host_net.set_link_up(netns, "lo").await?;
        self.host_net.set_default_route(ns.name(), gateway).await
    }

    /// Delete the host end, which also destroys its peer.
    ///
    /// Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns the host error for anything other than absence.
    pub async fn delete_host_end(&self) -> RustainerResult<bool> {
        match self.host_net.delete_link(&self.host).await {
            Ok(()) => {
                tracing::debug!(iface = %self.host, "Deleted veth pair");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(iface = %self.host, "Veth already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for VethPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VethPair")
            .field("host", &self.host)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFailure, MockHost, MockOp};
    use rustainer_common::ContainerId;

    async fn setup() -> (Arc<MockHost>, NamespaceHandle, VethPair) {
        let host = Arc::new(MockHost::new());
        let ns = NamespaceHandle::create(host.clone(), "rst-c1", ContainerId::new("c1").unwrap())
            .await
            .unwrap();
        let pair = VethPair::create(host.clone(), "rst0000000ah", "rst0000000ac")
            .await
            .unwrap();
        (host, ns, pair)
    }

    #[tokio::test]
    async fn only_container_end_moves() {
        let (host, ns, pair) = setup().await;
        pair.move_to_namespace(&ns).await.unwrap();
        assert!(host.root_links().contains(&"rst0000000ah".to_string()));
        assert_eq!(host.links_in("rst-c1"), vec!["rst0000000ac"]);
        assert!(host.is_up(None, "rst0000000ah"));
    }

    #[tokio::test]
    async fn address_is_set_inside_namespace() {
        let (host, ns, pair) = setup().await;
        pair.move_to_namespace(&ns).await.unwrap();
        let addr: Ipv4Net = "172.18.0.2/16".parse().unwrap();
        let gateway = Ipv4Addr::new(172, 18, 0, 1);
        pair.assign_address(&ns, addr, gateway).await.unwrap();
        pair.assign_address(&ns, addr, gateway).await.unwrap();

        assert_eq!(host.addresses(Some("rst-c1"), "rst0000000ac"), vec![addr]);
        assert!(host.is_up(Some("rst-c1"), "lo"));
        assert_eq!(host.default_route("rst-c1"), Some(gateway));
    }

    #[tokio::test]
    async fn address_before_move_fails() {
        let (_host, ns, pair) = setup().await;
        let err = pair
            .assign_address(&ns, "172.18.0.2/16".parse().unwrap(), Ipv4Addr::new(172, 18, 0, 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn failed_link_up_removes_pair() {
        let host = Arc::new(MockHost::new());
        host.inject(MockOp::LinkUp, MockFailure::Command);
        assert!(VethPair::create(host.clone(), "rst0000000bh", "rst0000000bc")
            .await
            .is_err());
        assert_eq!(host.root_links(), vec!["lo"]);
    }

    #[tokio::test]
    async fn delete_is_tolerant() {
        let (host, _ns, pair) = setup().await;
        assert!(pair.delete_host_end().await.unwrap());
        assert!(!pair.delete_host_end().await.unwrap());
        assert_eq!(host.root_links(), vec!["lo"]);
    }
}
