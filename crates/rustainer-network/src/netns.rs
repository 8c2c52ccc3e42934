//! Network namespace operations.

use std::path::PathBuf;
use std::sync::Arc;

use rustainer_common::{ContainerId, RustainerPaths, RustainerResult};

use crate::host::HostNetwork;

/// A named network namespace owned by one container.
pub struct NamespaceHandle {
    host: Arc<dyn HostNetwork>,
    name: String,
    container_id: ContainerId,
}

impl NamespaceHandle {
    /// Create a new namespace.
    ///
    /// # Errors
    ///
    /// Returns [`rustainer_common::RustainerError::AlreadyExists`] if a
    /// namespace with this name is already present; the previous owner must
    /// be detached or reconciled first.
    pub async fn create(
        host: Arc<dyn HostNetwork>,
        name: impl Into<String>,
        container_id: ContainerId,
    ) -> RustainerResult<Self> {
        let name = name.into();
        tracing::debug!(container_id = %container_id, netns = %name, "Creating network namespace");
        host.add_netns(&name).await?;
        Ok(Self {
            host,
            name,
            container_id,
        })
    }

    /// Handle to a namespace that may or may not exist, for teardown.
    pub fn open(
        host: Arc<dyn HostNetwork>,
        name: impl Into<String>,
        container_id: ContainerId,
    ) -> Self {
        Self {
            host,
            name: name.into(),
            container_id,
        }
    }

    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind-mount path under `/run/netns`, the reference a process joins.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        RustainerPaths::netns(&self.name)
    }

    /// Owning container.
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    /// Delete the namespace and every interface inside it.
    ///
    /// Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns the host error for anything other than absence.
    pub async fn delete(&self) -> RustainerResult<bool> {
        match self.host.delete_netns(&self.name).await {
            Ok(()) => {
                tracing::debug!(container_id = %self.container_id, netns = %self.name, "Deleted network namespace");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(netns = %self.name, "Network namespace already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for NamespaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("name", &self.name)
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}
