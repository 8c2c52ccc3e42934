//! Linux bridge management.
//!
//! One bridge per host carries every container's host-side veth. It is
//! created lazily on the first Attach and only deleted when no container
//! record remains.

use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use rustainer_common::{RustainerError, RustainerResult};

use crate::host::HostNetwork;

/// State of the bridge after [`BridgeManager::ensure_bridge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeHandle {
    /// Bridge device name.
    pub name: String,
    /// Gateway address assigned to the bridge.
    pub gateway: Ipv4Addr,
    /// Container subnet.
    pub subnet: Ipv4Net,
    /// Whether the device was created by this call.
    pub created: bool,
}

/// Owns the shared bridge device and its gateway address.
pub struct BridgeManager {
    host: Arc<dyn HostNetwork>,
    name: String,
    gateway: Ipv4Net,
}

impl BridgeManager {
    /// Create a manager for a bridge with a gateway address in CIDR form.
    pub fn new(host: Arc<dyn HostNetwork>, name: impl Into<String>, gateway: Ipv4Net) -> Self {
        Self {
            host,
            name: name.into(),
            gateway,
        }
    }

    /// Get the bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the bridge device exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be queried.
    pub async fn exists(&self) -> RustainerResult<bool> {
        self.host.link_exists(&self.name).await
    }

    /// Make sure the bridge exists, carries the gateway address and is up.
    ///
    /// A bridge that already matches is left untouched apart from the
    /// (idempotent) link-up.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be created or configured.
    pub async fn ensure_bridge(&self) -> RustainerResult<BridgeHandle> {
        let mut created = false;
        if !self.exists().await? {
            tracing::debug!(bridge = %self.name, "Creating bridge");
            match self.host.add_bridge(&self.name).await {
                Ok(()) => created = true,
                Err(RustainerError::AlreadyExists { .. }) => {
                    tracing::debug!(bridge = %self.name, "Bridge appeared concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        let addresses = self.host.list_addresses(None, &self.name).await?;
        if !addresses.contains(&self.gateway) {
            tracing::debug!(bridge = %self.name, ip = %self.gateway, "Assigning gateway address");
            match self.host.add_address(None, &self.name, self.gateway).await {
                Ok(()) | Err(RustainerError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.host.set_link_up(None, &self.name).await?;

        if created {
            tracing::info!(bridge = %self.name, gateway = %self.gateway, "Bridge created");
        }

        Ok(BridgeHandle {
            name: self.name.clone(),
            gateway: self.gateway.addr(),
            subnet: self.gateway.trunc(),
            created,
        })
    }

    /// Enslave an interface to the bridge and bring it up.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface cannot be attached.
    pub async fn add_interface(&self, interface: &str) -> RustainerResult<()> {
        tracing::debug!(bridge = %self.name, iface = interface, "Adding interface to bridge");
        self.host.set_link_master(interface, &self.name).await?;
        self.host.set_link_up(None, interface).await
    }

    /// Bring the bridge down and delete it.
    ///
    /// `attached` is the number of live container records; the bridge is
    /// never removed while it is non-zero. Returns `true` if a device was
    /// deleted and `false` if it was already absent.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::BridgeInUse`] if containers are attached,
    /// or the host error if deletion fails for a reason other than absence.
    pub async fn teardown_bridge(&self, attached: usize) -> RustainerResult<bool> {
        if attached > 0 {
            return Err(RustainerError::BridgeInUse {
                bridge: self.name.clone(),
                attached,
            });
        }

        tracing::debug!(bridge = %self.name, "Deleting bridge");
        if let Err(e) = self.host.set_link_down(&self.name).await {
            if e.is_not_found() {
                tracing::warn!(bridge = %self.name, "Bridge already absent");
                return Ok(false);
            }
            return Err(e);
        }

        match self.host.delete_link(&self.name).await {
            Ok(()) => {
                tracing::info!(bridge = %self.name, "Bridge deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(bridge = %self.name, "Bridge already absent");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockFailure, MockHost, MockOp};

    fn manager() -> (Arc<MockHost>, BridgeManager) {
        let host = Arc::new(MockHost::new());
        let bridge = BridgeManager::new(
            host.clone(),
            "rustainer0",
            "172.18.0.1/16".parse().unwrap(),
        );
        (host, bridge)
    }

    #[tokio::test]
    async fn ensure_creates_once() {
        let (host, bridge) = manager();
        let first = bridge.ensure_bridge().await.unwrap();
        assert!(first.created);
        assert_eq!(first.gateway, Ipv4Addr::new(172, 18, 0, 1));
        assert_eq!(first.subnet.to_string(), "172.18.0.0/16");
        assert!(host.is_up(None, "rustainer0"));

        let second = bridge.ensure_bridge().await.unwrap();
        assert!(!second.created);
        assert_eq!(host.addresses(None, "rustainer0").len(), 1);
    }

    #[tokio::test]
    async fn ensure_repairs_missing_address() {
        let (host, bridge) = manager();
        host.seed_link("rustainer0");
        let handle = bridge.ensure_bridge().await.unwrap();
        assert!(!handle.created);
        assert_eq!(
            host.addresses(None, "rustainer0"),
            vec!["172.18.0.1/16".parse::<Ipv4Net>().unwrap()]
        );
    }

    #[tokio::test]
    async fn teardown_refuses_while_attached() {
        let (host, bridge) = manager();
        bridge.ensure_bridge().await.unwrap();
        let err = bridge.teardown_bridge(2).await.unwrap_err();
        assert!(matches!(err, RustainerError::BridgeInUse { attached: 2, .. }));
        assert!(host.root_links().contains(&"rustainer0".to_string()));
    }

    #[tokio::test]
    async fn teardown_tolerates_absent_bridge() {
        let (_host, bridge) = manager();
        assert!(!bridge.teardown_bridge(0).await.unwrap());
    }

    #[tokio::test]
    async fn teardown_deletes() {
        let (host, bridge) = manager();
        bridge.ensure_bridge().await.unwrap();
        assert!(bridge.teardown_bridge(0).await.unwrap());
        assert!(!host.root_links().contains(&"rustainer0".to_string()));
    }

    #[tokio::test]
    async fn permission_errors_surface() {
        let (host, bridge) = manager();
        host.inject(MockOp::AddBridge, MockFailure::PermissionDenied);
        let err = bridge.ensure_bridge().await.unwrap_err();
        assert!(matches!(err, RustainerError::PermissionDenied { .. }));
    }
}
