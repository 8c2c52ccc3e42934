//! Container network lifecycle.
//!
//! [`NetworkLifecycleManager`] walks each container through
//!
//! ```text
//! Unattached -> Allocating -> NamespaceCreated -> VethWired
//!            -> AddressAssigned -> NatEnsured -> Ready -> Detaching -> Unattached
//! ```
//!
//! The registry record is inserted before any host resource is created and
//! its state advances after every completed step, so it doubles as the
//! progress journal for rollback. A failed or cancelled attach tears down
//! the completed steps and the one in progress in reverse order.
//!
//! Per-container work runs without cross-container locking. Bridge, shared
//! NAT and sysctl work is serialized by one async lock; the registry and the
//! address pool have their own short-lived locks.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use rustainer_common::{ContainerId, RustainerError, RustainerResult};

use crate::bridge::BridgeManager;
use crate::config::NetworkConfig;
use crate::hooks::{ContainerHooks, NoopHooks};
use crate::host::HostNetwork;
use crate::ipam::AddressAllocator;
use crate::naming::Naming;
use crate::nat::NatRuleSet;
use crate::netns::NamespaceHandle;
use crate::portmap::{PortMapper, PortMapping};
use crate::record::{AttachState, ContainerNetworkRecord, NetworkInfo};
use crate::sysctl::SysctlTuner;
use crate::veth::VethPair;

/// Parameters of an attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    /// Container to attach.
    pub container_id: ContainerId,
    /// Ports to publish.
    pub ports: Vec<PortMapping>,
}

impl AttachRequest {
    /// Attach without published ports.
    #[must_use]
    pub const fn new(container_id: ContainerId) -> Self {
        Self {
            container_id,
            ports: Vec::new(),
        }
    }

    /// Publish a port.
    #[must_use]
    pub fn with_port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    fn validate(&self) -> RustainerResult<()> {
        for (i, a) in self.ports.iter().enumerate() {
            if let Some(b) = self.ports[i + 1..].iter().find(|b| a.collides_with(b)) {
                return Err(RustainerError::Config {
                    message: format!("port mappings {a} and {b} overlap"),
                });
            }
        }
        Ok(())
    }
}

impl From<ContainerId> for AttachRequest {
    fn from(container_id: ContainerId) -> Self {
        Self::new(container_id)
    }
}

/// Shared host state guarded by the process-wide async lock.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    /// Reverse-path filtering has been disabled for the current bridge device.
    pub(crate) bridge_tuned: bool,
}

/// Marks a detach of one container as running until dropped.
///
/// Dropping on cancellation lets a later detach retry the record.
struct DetachRunning<'a> {
    running: &'a Mutex<HashSet<ContainerId>>,
    id: ContainerId,
}

impl Drop for DetachRunning<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.id);
    }
}

/// Orchestrates namespaces, veths, the bridge, NAT and sysctls per container.
pub struct NetworkLifecycleManager {
    pub(crate) config: NetworkConfig,
    pub(crate) host: Arc<dyn HostNetwork>,
    pub(crate) naming: Naming,
    pub(crate) allocator: AddressAllocator,
    pub(crate) bridge: BridgeManager,
    pub(crate) nat: Arc<NatRuleSet>,
    pub(crate) ports: PortMapper,
    pub(crate) sysctl: SysctlTuner,
    hooks: Arc<dyn ContainerHooks>,
    pub(crate) registry: Mutex<HashMap<ContainerId, ContainerNetworkRecord>>,
    detaching: Mutex<HashSet<ContainerId>>,
    pub(crate) shared: tokio::sync::Mutex<SharedState>,
}

impl NetworkLifecycleManager {
    /// Create a manager over a host backend.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Config`] if the configuration is invalid.
    pub fn new(config: NetworkConfig, host: Arc<dyn HostNetwork>) -> RustainerResult<Self> {
        Self::with_hooks(config, host, Arc::new(NoopHooks))
    }

    /// Create a manager that calls into the container runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Config`] if the configuration is invalid.
    pub fn with_hooks(
        config: NetworkConfig,
        host: Arc<dyn HostNetwork>,
        hooks: Arc<dyn ContainerHooks>,
    ) -> RustainerResult<Self> {
        config.validate()?;

        let naming = Naming::new(config.prefix.clone());
        let nat = Arc::new(NatRuleSet::new(host.clone(), naming.clone()));
        Ok(Self {
            allocator: AddressAllocator::new(config.network(), config.gateway()),
            bridge: BridgeManager::new(host.clone(), config.bridge.clone(), config.gateway_cidr()),
            ports: PortMapper::new(nat.clone(), naming.clone()),
            sysctl: SysctlTuner::new(host.clone(), config.sysctl_conf.clone(), config.interface_wait),
            nat,
            naming,
            host,
            config,
            hooks,
            registry: Mutex::new(HashMap::new()),
            detaching: Mutex::new(HashSet::new()),
            shared: tokio::sync::Mutex::new(SharedState::default()),
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Naming scheme for owned resources.
    #[must_use]
    pub const fn naming(&self) -> &Naming {
        &self.naming
    }

    /// The address pool.
    #[must_use]
    pub const fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// The persisted sysctl tuner.
    #[must_use]
    pub const fn sysctl(&self) -> &SysctlTuner {
        &self.sysctl
    }

    /// Attach a container without published ports.
    ///
    /// # Errors
    ///
    /// See [`NetworkLifecycleManager::attach_with_cancel`].
    pub async fn attach(&self, id: &ContainerId) -> RustainerResult<NetworkInfo> {
        self.attach_request(AttachRequest::new(id.clone())).await
    }

    /// Attach a container.
    ///
    /// # Errors
    ///
    /// See [`NetworkLifecycleManager::attach_with_cancel`].
    pub async fn attach_request(&self, request: AttachRequest) -> RustainerResult<NetworkInfo> {
        self.attach_with_cancel(request, std::future::pending()).await
    }

    /// Attach a container, aborting when `cancel` completes first.
    ///
    /// Any failure or cancellation rolls back every step that ran, leaving
    /// no namespace, veth or per-container rule behind and returning the
    /// address to the pool.
    ///
    /// # Errors
    ///
    /// - [`RustainerError::AlreadyExists`] if the container is attached, its
    ///   veth names are held by another attached container, or its namespace
    ///   or veth already exists on the host
    /// - [`RustainerError::Busy`] if another operation on it is in flight
    /// - [`RustainerError::PoolExhausted`] if no address is free
    /// - [`RustainerError::Cancelled`] if `cancel` won the race
    /// - any host error raised by the failing step
    pub async fn attach_with_cancel<F>(
        &self,
        request: AttachRequest,
        cancel: F,
    ) -> RustainerResult<NetworkInfo>
    where
        F: Future<Output = ()> + Send,
    {
        request.validate()?;
        let id = request.container_id.clone();
        self.begin_attach(&request)?;

        let result = tokio::select! {
            result = self.run_attach(&request) => result,
            () = cancel => {
                tracing::warn!(container_id = %id, "Attach cancelled");
                Err(RustainerError::Cancelled {
                    operation: format!("attach {id}"),
                })
            }
        };

        match result {
            Ok(info) => {
                tracing::info!(container_id = %id, ip = %info.ip, netns = %info.namespace, "Container attached");
                Ok(info)
            }
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Attach failed, rolling back");
                self.rollback(&id, &e).await;
                Err(e)
            }
        }
    }

    /// Detach a container, reversing every attach step.
    ///
    /// Detaching an unknown container still removes any leftover resources
    /// with its deterministic names and succeeds, so a second call is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::Busy`] while an attach or another detach of
    /// the container is in flight, and [`RustainerError::PartialTeardown`] if
    /// any step failed; the record is then kept in [`AttachState::Detaching`]
    /// with its address reserved so the detach can be retried.
    pub async fn detach(&self, id: &ContainerId) -> RustainerResult<()> {
        let (record, _running) = {
            let mut registry = self.registry.lock();
            let mut running = self.detaching.lock();
            match registry.get_mut(id) {
                Some(record)
                    if record.state.is_ready()
                        || (record.state == AttachState::Detaching && !running.contains(id)) =>
                {
                    record.state = AttachState::Detaching;
                    running.insert(id.clone());
                    let guard = DetachRunning {
                        running: &self.detaching,
                        id: id.clone(),
                    };
                    (Some(record.clone()), Some(guard))
                }
                Some(record) => {
                    return Err(RustainerError::Busy {
                        container_id: id.to_string(),
                        state: record.state.to_string(),
                    });
                }
                None => (None, None),
            }
        };

        let Some(record) = record else {
            return self.sweep(id).await;
        };
        tracing::debug!(container_id = %id, state = %AttachState::Detaching, "State transition");

        let failures = self.teardown(&record, AttachState::Ready).await;
        if !failures.is_empty() {
            tracing::warn!(container_id = %id, failures = failures.len(), "Detach incomplete");
            return Err(RustainerError::PartialTeardown {
                container_id: id.to_string(),
                failures,
            });
        }

        self.forget(&record);
        tracing::info!(container_id = %id, ip = %record.ip, "Container detached");
        self.after_detach(id).await;
        Ok(())
    }

    /// Snapshot of every record, ordered by container ID.
    #[must_use]
    pub fn list(&self) -> Vec<ContainerNetworkRecord> {
        let mut records: Vec<_> = self.registry.lock().values().cloned().collect();
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        records
    }

    /// Snapshot of one record.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<ContainerNetworkRecord> {
        self.registry.lock().get(id).cloned()
    }

    /// Network details of a ready container.
    #[must_use]
    pub fn info(&self, id: &ContainerId) -> Option<NetworkInfo> {
        self.get(id)
            .filter(|record| record.state.is_ready())
            .map(|record| self.network_info(&record))
    }

    /// Delete the bridge if no container is attached.
    ///
    /// Returns `false` if it was already absent.
    ///
    /// # Errors
    ///
    /// Returns [`RustainerError::BridgeInUse`] while records exist.
    pub async fn teardown_bridge(&self) -> RustainerResult<bool> {
        let mut shared = self.shared.lock().await;
        let attached = self.registry.lock().len();
        let removed = self.bridge.teardown_bridge(attached).await?;
        shared.bridge_tuned = false;
        Ok(removed)
    }

    /// Reserve the record and address for a new attach.
    fn begin_attach(&self, request: &AttachRequest) -> RustainerResult<()> {
        let id = &request.container_id;
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.get(id) {
            return Err(if existing.state.is_ready() {
                RustainerError::AlreadyExists {
                    kind: "container".to_string(),
                    name: id.to_string(),
                }
            } else {
                RustainerError::Busy {
                    container_id: id.to_string(),
                    state: existing.state.to_string(),
                }
            });
        }

        let names = self.naming.for_container(id);
        if let Some(holder) = registry.values().find(|r| r.veth_host == names.veth_host) {
            tracing::warn!(container_id = %id, holder = %holder.container_id, veth = %names.veth_host, "Veth name already in use");
            return Err(RustainerError::AlreadyExists {
                kind: "link".to_string(),
                name: names.veth_host,
            });
        }

        let ip = self.allocator.allocate()?;
        registry.insert(
            id.clone(),
            ContainerNetworkRecord::new(id.clone(), names, ip, request.ports.clone()),
        );
        tracing::debug!(container_id = %id, ip = %ip, state = %AttachState::Allocating, "State transition");
        Ok(())
    }

    async fn run_attach(&self, request: &AttachRequest) -> RustainerResult<NetworkInfo> {
        let id = &request.container_id;
        let record = self.get(id).ok_or_else(|| RustainerError::Internal {
            message: format!("record for {id} vanished during attach"),
        })?;

        let ns = NamespaceHandle::create(self.host.clone(), &record.namespace, id.clone()).await?;
        self.advance(id, AttachState::NamespaceCreated);

        self.ensure_bridge().await?;
        let veth = VethPair::create(self.host.clone(), &record.veth_host, &record.veth_container).await?;
        veth.move_to_namespace(&ns).await?;
        self.bridge.add_interface(&veth.host).await?;
        self.advance(id, AttachState::VethWired);

        let address = Ipv4Net::new(record.ip, self.config.subnet.prefix_len()).map_err(|e| {
            RustainerError::Internal {
                message: e.to_string(),
            }
        })?;
        veth.assign_address(&ns, address, self.config.gateway()).await?;
        self.advance(id, AttachState::AddressAssigned);

        self.ensure_nat(id, record.ip, &request.ports).await?;
        self.advance(id, AttachState::NatEnsured);

        self.hooks.bind_namespace(id, &ns.path()).await?;
        self.advance(id, AttachState::Ready);

        Ok(self.network_info(&record))
    }

    async fn ensure_bridge(&self) -> RustainerResult<()> {
        let mut shared = self.shared.lock().await;
        let handle = self.bridge.ensure_bridge().await?;
        if handle.created || !shared.bridge_tuned {
            shared.bridge_tuned = false;
            self.sysctl
                .disable_reverse_path_filter(&handle.name)
                .await?;
            shared.bridge_tuned = true;
        }
        Ok(())
    }

    async fn ensure_nat(
        &self,
        id: &ContainerId,
        ip: Ipv4Addr,
        ports: &[PortMapping],
    ) -> RustainerResult<()> {
        let _shared = self.shared.lock().await;
        if self.config.enable_ip_forward {
            self.sysctl.enable_ip_forwarding().await?;
        }
        self.nat
            .ensure_masquerade(self.config.network(), &self.config.bridge)
            .await?;
        self.nat.ensure_forward_accept(&self.config.bridge).await?;
        self.ports.install(id, ip, ports).await
    }

    fn advance(&self, id: &ContainerId, state: AttachState) {
        if let Some(record) = self.registry.lock().get_mut(id) {
            record.state = state;
        }
        tracing::debug!(container_id = %id, state = %state, "State transition");
    }

    /// Undo a failed attach using the state reached so far.
    async fn rollback(&self, id: &ContainerId, cause: &RustainerError) {
        let Some(record) = self.get(id) else {
            return;
        };
        // A namespace or veth that was already there is not ours to delete.
        let collided = matches!(cause, RustainerError::AlreadyExists { .. });
        let failures = match record.state {
            AttachState::Allocating if collided => Vec::new(),
            AttachState::NamespaceCreated if collided => {
                self.teardown(&record, AttachState::Allocating).await
            }
            reached => self.teardown(&record, reached).await,
        };
        if failures.is_empty() {
            self.forget(&record);
            tracing::debug!(container_id = %id, state = %AttachState::Unattached, "Rolled back");
        } else {
            for failure in &failures {
                tracing::warn!(container_id = %id, failure = %failure, "Rollback step failed");
            }
            // Keep the record so a later detach retries the teardown.
            self.advance(id, AttachState::Detaching);
        }
    }

    /// Tear down everything a record in state `reached` may own.
    ///
    /// `reached` is the last completed step; resources of the step after
    /// it may exist partially and are removed too. Missing resources are
    /// not failures. Returns a description of every step that failed.
    async fn teardown(&self, record: &ContainerNetworkRecord, reached: AttachState) -> Vec<String> {
        let id = &record.container_id;
        let mut failures = Vec::new();

        if reached >= AttachState::AddressAssigned {
            if let Err(e) = self.ports.remove_container(id).await {
                failures.push(format!("port rules: {e}"));
            }
        }

        if reached >= AttachState::NamespaceCreated {
            let veth = VethPair::open(self.host.clone(), &record.veth_host, &record.veth_container);
            if let Err(e) = veth.delete_host_end().await {
                failures.push(format!("veth {}: {e}", record.veth_host));
            }
        }

        let ns = NamespaceHandle::open(self.host.clone(), &record.namespace, id.clone());
        if let Err(e) = ns.delete().await {
            failures.push(format!("namespace {}: {e}", record.namespace));
        }

        failures
    }

    /// Drop the record and return its address to the pool.
    fn forget(&self, record: &ContainerNetworkRecord) {
        self.registry.lock().remove(&record.container_id);
        self.allocator.release(record.ip);
    }

    /// Detach without a record: remove whatever carries the container's names.
    async fn sweep(&self, id: &ContainerId) -> RustainerResult<()> {
        let names = self.naming.for_container(id);
        let veth_held = self
            .registry
            .lock()
            .values()
            .any(|r| r.veth_host == names.veth_host);
        let mut failures = Vec::new();
        let mut removed = 0;

        match self.ports.remove_container(id).await {
            Ok(count) => removed += count,
            Err(e) => failures.push(format!("port rules: {e}")),
        }
        if !veth_held {
            match VethPair::open(self.host.clone(), &names.veth_host, &names.veth_container)
                .delete_host_end()
                .await
            {
                Ok(deleted) => removed += usize::from(deleted),
                Err(e) => failures.push(format!("veth {}: {e}", names.veth_host)),
            }
        }
        match NamespaceHandle::open(self.host.clone(), &names.namespace, id.clone())
            .delete()
            .await
        {
            Ok(deleted) => removed += usize::from(deleted),
            Err(e) => failures.push(format!("namespace {}: {e}", names.namespace)),
        }

        if !failures.is_empty() {
            return Err(RustainerError::PartialTeardown {
                container_id: id.to_string(),
                failures,
            });
        }
        if removed > 0 {
            tracing::info!(container_id = %id, removed, "Removed leftovers of untracked container");
            self.after_detach(id).await;
        } else {
            tracing::debug!(container_id = %id, "Container already detached");
        }
        Ok(())
    }

    async fn after_detach(&self, id: &ContainerId) {
        if let Err(e) = self.hooks.after_detach(id).await {
            tracing::warn!(container_id = %id, error = %e, "Post-detach hook failed");
        }
    }

    fn network_info(&self, record: &ContainerNetworkRecord) -> NetworkInfo {
        NetworkInfo::new(record, self.config.gateway(), self.config.subnet.prefix_len())
    }
}
