//! Collaborator hooks.
//!
//! The process supervisor and the storage layer live outside this crate.
//! The lifecycle manager calls into them at two points: once the namespace
//! is fully configured, so the container process can join it, and after a
//! successful detach, so per-container storage can be released.

use std::path::Path;

use async_trait::async_trait;
use rustainer_common::{ContainerId, RustainerResult};

/// Callbacks into the container runtime.
#[async_trait]
pub trait ContainerHooks: Send + Sync {
    /// Join the container process to the namespace at `netns_path`.
    ///
    /// An error aborts the attach and rolls it back.
    async fn bind_namespace(&self, id: &ContainerId, netns_path: &Path) -> RustainerResult<()> {
        let _ = (id, netns_path);
        Ok(())
    }

    /// Release anything the runtime holds for a detached container.
    ///
    /// Errors are logged and do not fail the detach.
    async fn after_detach(&self, id: &ContainerId) -> RustainerResult<()> {
        let _ = id;
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl ContainerHooks for NoopHooks {}
