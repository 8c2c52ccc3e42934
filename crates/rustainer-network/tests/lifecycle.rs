//! End-to-end lifecycle tests against the in-memory host.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use rustainer_common::{ContainerId, RustainerError, RustainerResult};
use rustainer_network::mock::{MockFailure, MockHost, MockOp};
use rustainer_network::{
    AttachRequest, AttachState, ContainerHooks, HostNetwork, NetworkConfig,
    NetworkLifecycleManager, PortMapping, SysctlTuner, WaitPolicy,
};
use tempfile::TempDir;

struct Fixture {
    host: Arc<MockHost>,
    manager: NetworkLifecycleManager,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self::with_hooks(None)
    }

    fn with_hooks(hooks: Option<Arc<dyn ContainerHooks>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(MockHost::new());
        let manager = build(&host, dir.path(), hooks);
        Self { host, manager, dir }
    }

    /// A second manager over the same host, as after a restart.
    fn restart(&self) -> NetworkLifecycleManager {
        build(&self.host, self.dir.path(), None)
    }

    /// Every host resource that belongs to one container.
    fn leftovers(&self, id: &ContainerId) -> Vec<String> {
        let names = self.manager.naming().for_container(id);
        let mut found = Vec::new();
        if self.host.namespaces().contains(&names.namespace) {
            found.push(names.namespace.clone());
        }
        for link in self.host.root_links() {
            if link == names.veth_host || link == names.veth_container {
                found.push(link);
            }
        }
        let tag = self.manager.naming().container_tag(id);
        for chain in ["PREROUTING", "OUTPUT", "POSTROUTING"] {
            for rule in self.host.rules("nat", chain) {
                if rule.contains(&tag) {
                    found.push(format!("{chain} {}", rule.join(" ")));
                }
            }
        }
        found
    }
}

fn build(
    host: &Arc<MockHost>,
    dir: &Path,
    hooks: Option<Arc<dyn ContainerHooks>>,
) -> NetworkLifecycleManager {
    let config = NetworkConfig {
        sysctl_conf: dir.join("90-rustainer.conf"),
        ..NetworkConfig::default()
    };
    let host: Arc<dyn HostNetwork> = host.clone();
    match hooks {
        Some(hooks) => NetworkLifecycleManager::with_hooks(config, host, hooks).unwrap(),
        None => NetworkLifecycleManager::new(config, host).unwrap(),
    }
}

fn id(s: &str) -> ContainerId {
    ContainerId::new(s).unwrap()
}

#[test_log::test(tokio::test)]
async fn lowest_free_address_is_reused() {
    let fx = Fixture::new();

    let c1 = fx.manager.attach(&id("c1")).await.unwrap();
    let c2 = fx.manager.attach(&id("c2")).await.unwrap();
    assert_eq!(c1.ip, Ipv4Addr::new(172, 18, 0, 2));
    assert_eq!(c2.ip, Ipv4Addr::new(172, 18, 0, 3));
    assert_eq!(c1.gateway, Ipv4Addr::new(172, 18, 0, 1));

    fx.manager.detach(&id("c1")).await.unwrap();
    assert!(!fx.manager.allocator().is_allocated(c1.ip));

    let c3 = fx.manager.attach(&id("c3")).await.unwrap();
    assert_eq!(c3.ip, Ipv4Addr::new(172, 18, 0, 2));
}

#[tokio::test]
async fn detach_twice_is_a_noop() {
    let fx = Fixture::new();
    fx.manager.attach(&id("c1")).await.unwrap();

    fx.manager.detach(&id("c1")).await.unwrap();
    let calls = fx.host.calls().len();
    fx.manager.detach(&id("c1")).await.unwrap();

    assert!(fx.leftovers(&id("c1")).is_empty());
    assert!(fx.manager.list().is_empty());
    // The second call only retries deletions of absent resources.
    let mutating = fx.host.calls()[calls..]
        .iter()
        .filter(|call| !call.starts_with("delete_"))
        .count();
    assert_eq!(mutating, 0);
}

#[tokio::test]
async fn masquerade_is_shared_by_all_containers() {
    let fx = Fixture::new();
    for n in 0..5 {
        fx.manager.attach(&id(&format!("c{n}"))).await.unwrap();
    }
    assert_eq!(fx.host.rules("nat", "POSTROUTING").len(), 1);
    assert_eq!(fx.host.rules("filter", "FORWARD").len(), 2);
}

/// Which step to break, and the last state the record reaches before it
/// once the bridge and shared rules exist.
fn failure_points() -> Vec<(MockOp, AttachState)> {
    vec![
        (MockOp::AddNetns, AttachState::Allocating),
        (MockOp::AddVeth, AttachState::NamespaceCreated),
        (MockOp::MoveToNetns, AttachState::NamespaceCreated),
        (MockOp::SetMaster, AttachState::NamespaceCreated),
        (MockOp::AddAddress, AttachState::VethWired),
        (MockOp::DefaultRoute, AttachState::VethWired),
        (MockOp::AppendRule, AttachState::AddressAssigned),
    ]
}

#[tokio::test]
async fn failure_at_every_step_rolls_back() {
    for warm in [false, true] {
        for (op, reached) in failure_points() {
            let fx = Fixture::new();
            if warm {
                fx.manager.attach(&id("warm")).await.unwrap();
            }
            let live = usize::from(warm);
            let request =
                AttachRequest::new(id("victim")).with_port(PortMapping::tcp(8080, 80));

            fx.host.inject(op, MockFailure::Command);
            let err = fx.manager.attach_request(request.clone()).await.unwrap_err();
            assert!(
                matches!(err, RustainerError::CommandFailed { .. }),
                "{op:?} after {reached} (warm: {warm}): {err}"
            );

            assert!(
                fx.leftovers(&id("victim")).is_empty(),
                "{op:?} after {reached} (warm: {warm}) left {:?}",
                fx.leftovers(&id("victim"))
            );
            assert!(fx.manager.get(&id("victim")).is_none());
            assert_eq!(fx.manager.allocator().allocated_count(), live);

            fx.host.clear_failures();
            fx.manager.attach_request(request).await.unwrap();
            assert_eq!(fx.manager.allocator().allocated_count(), live + 1);
        }
    }
}

#[derive(Default)]
struct RecordingHooks {
    fail_bind: bool,
    bound: Mutex<Vec<(String, PathBuf)>>,
    cleaned: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerHooks for RecordingHooks {
    async fn bind_namespace(&self, id: &ContainerId, netns_path: &Path) -> RustainerResult<()> {
        if self.fail_bind {
            return Err(RustainerError::Internal {
                message: "supervisor refused".to_string(),
            });
        }
        self.bound
            .lock()
            .push((id.to_string(), netns_path.to_path_buf()));
        Ok(())
    }

    async fn after_detach(&self, id: &ContainerId) -> RustainerResult<()> {
        self.cleaned.lock().push(id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn failed_namespace_binding_rolls_back_port_rules() {
    let hooks = Arc::new(RecordingHooks {
        fail_bind: true,
        ..RecordingHooks::default()
    });
    let fx = Fixture::with_hooks(Some(hooks as Arc<dyn ContainerHooks>));
    let request = AttachRequest::new(id("web"))
        .with_port(PortMapping::tcp(8080, 80))
        .with_port(PortMapping::udp(5353, 53));

    assert!(fx.manager.attach_request(request).await.is_err());
    assert!(fx.leftovers(&id("web")).is_empty());
    assert_eq!(fx.host.rules("nat", "PREROUTING").len(), 0);
}

#[tokio::test]
async fn hooks_see_namespace_and_detach() {
    let hooks = Arc::new(RecordingHooks::default());
    let fx = Fixture::with_hooks(Some(hooks.clone() as Arc<dyn ContainerHooks>));

    let info = fx.manager.attach(&id("c1")).await.unwrap();
    assert_eq!(
        *hooks.bound.lock(),
        vec![("c1".to_string(), PathBuf::from("/run/netns/rst-c1"))]
    );
    assert_eq!(info.namespace_path, PathBuf::from("/run/netns/rst-c1"));

    fx.manager.detach(&id("c1")).await.unwrap();
    fx.manager.detach(&id("c1")).await.unwrap();
    assert_eq!(*hooks.cleaned.lock(), vec!["c1".to_string()]);
}

#[tokio::test]
async fn permission_denied_is_surfaced_without_retry() {
    let fx = Fixture::new();
    fx.host.inject(MockOp::AddBridge, MockFailure::PermissionDenied);

    let err = fx.manager.attach(&id("c1")).await.unwrap_err();
    assert!(matches!(err, RustainerError::PermissionDenied { .. }));
    let attempts = fx
        .host
        .calls()
        .iter()
        .filter(|call| call.starts_with("add_bridge"))
        .count();
    assert_eq!(attempts, 1);
    assert!(fx.leftovers(&id("c1")).is_empty());
}

#[tokio::test]
async fn published_ports_follow_the_container() {
    let fx = Fixture::new();
    let request = AttachRequest::new(id("web")).with_port(PortMapping::tcp(8080, 80));
    fx.manager.attach_request(request).await.unwrap();

    let prerouting = fx.host.rules("nat", "PREROUTING");
    assert_eq!(prerouting.len(), 1);
    assert!(prerouting[0].contains(&"172.18.0.2:80".to_string()));
    assert_eq!(fx.manager.get(&id("web")).unwrap().ports.len(), 1);

    let clash = AttachRequest::new(id("other")).with_port(PortMapping::tcp(8080, 8080));
    let err = fx.manager.attach_request(clash).await.unwrap_err();
    assert!(matches!(err, RustainerError::AlreadyExists { .. }));
    assert!(fx.leftovers(&id("other")).is_empty());

    fx.manager.detach(&id("web")).await.unwrap();
    assert!(fx.host.rules("nat", "PREROUTING").is_empty());
    assert!(fx.host.rules("nat", "OUTPUT").is_empty());
    // Only the shared masquerade rule remains.
    assert_eq!(fx.host.rules("nat", "POSTROUTING").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_attach_rolls_back() {
    let fx = Fixture::new();
    fx.host.inject(MockOp::DefaultRoute, MockFailure::Hang);

    let err = fx
        .manager
        .attach_with_cancel(
            AttachRequest::new(id("slow")),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RustainerError::Cancelled { .. }));
    assert!(fx.leftovers(&id("slow")).is_empty());
    assert!(fx.manager.get(&id("slow")).is_none());
    assert_eq!(fx.manager.allocator().allocated_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn detach_during_attach_is_busy() {
    let fx = Arc::new(Fixture::new());
    fx.host.inject(MockOp::DefaultRoute, MockFailure::Hang);

    let attaching = {
        let fx = fx.clone();
        tokio::spawn(async move {
            fx.manager
                .attach_with_cancel(
                    AttachRequest::new(id("slow")),
                    tokio::time::sleep(Duration::from_secs(5)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = fx.manager.detach(&id("slow")).await.unwrap_err();
    assert!(matches!(err, RustainerError::Busy { .. }));
    assert!(attaching.await.unwrap().is_err());
    fx.manager.detach(&id("slow")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn overlapping_detaches_release_the_address_once() {
    let fx = Arc::new(Fixture::new());
    fx.manager.attach(&id("c1")).await.unwrap();
    fx.host.inject(MockOp::DeleteNetns, MockFailure::Hang);

    let first = {
        let fx = fx.clone();
        tokio::spawn(async move { fx.manager.detach(&id("c1")).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = fx.manager.detach(&id("c1")).await.unwrap_err();
    assert!(matches!(err, RustainerError::Busy { .. }));
    assert_eq!(fx.manager.allocator().allocated_count(), 1);

    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());
    assert_eq!(fx.manager.get(&id("c1")).unwrap().state, AttachState::Detaching);

    fx.host.clear_failures();
    fx.manager.detach(&id("c1")).await.unwrap();
    assert!(fx.leftovers(&id("c1")).is_empty());
    assert_eq!(fx.manager.allocator().allocated_count(), 0);

    let a = fx.manager.attach(&id("c2")).await.unwrap();
    let b = fx.manager.attach(&id("c3")).await.unwrap();
    assert_ne!(a.ip, b.ip);
}

// Both IDs hash to the veth pair rstc51deb06h / rstc51deb06c.
#[tokio::test]
async fn colliding_veth_names_leave_the_holder_alone() {
    let fx = Fixture::new();
    let (holder, other) = (id("c17439"), id("c24164"));
    let names = fx.manager.naming().for_container(&holder);
    assert_eq!(names.veth_host, fx.manager.naming().for_container(&other).veth_host);

    fx.manager.attach(&holder).await.unwrap();
    let err = fx.manager.attach(&other).await.unwrap_err();
    assert!(matches!(err, RustainerError::AlreadyExists { ref kind, .. } if kind == "link"));
    assert!(fx.manager.get(&other).is_none());
    assert_eq!(fx.manager.allocator().allocated_count(), 1);

    fx.manager.detach(&other).await.unwrap();
    assert_eq!(fx.manager.get(&holder).unwrap().state, AttachState::Ready);
    assert!(fx.host.root_links().contains(&names.veth_host));
    assert_eq!(fx.host.master_of(&names.veth_host).as_deref(), Some("rustainer0"));

    fx.manager.detach(&holder).await.unwrap();
    assert!(fx.leftovers(&holder).is_empty());
}

#[tokio::test]
async fn existing_veth_is_not_rolled_back() {
    let fx = Fixture::new();
    let names = fx.manager.naming().for_container(&id("c1"));
    fx.host.seed_link(&names.veth_host);

    let err = fx.manager.attach(&id("c1")).await.unwrap_err();
    assert!(matches!(err, RustainerError::AlreadyExists { .. }));
    assert!(fx.host.root_links().contains(&names.veth_host));
    assert!(!fx.host.namespaces().contains(&names.namespace));
    assert!(fx.manager.get(&id("c1")).is_none());
    assert_eq!(fx.manager.allocator().allocated_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_attaches_get_distinct_addresses() {
    let fx = Arc::new(Fixture::new());

    let tasks: Vec<_> = (0..32)
        .map(|n| {
            let fx = fx.clone();
            tokio::spawn(async move { fx.manager.attach(&id(&format!("c{n}"))).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    let ips: HashSet<Ipv4Addr> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap().ip)
        .collect();
    assert_eq!(ips.len(), 32);
    assert_eq!(fx.host.rules("nat", "POSTROUTING").len(), 1);
    assert_eq!(fx.host.namespaces().len(), 32);
}

#[test_log::test(tokio::test)]
async fn reconcile_after_restart_removes_everything_owned() {
    let fx = Fixture::new();
    fx.manager
        .attach_request(AttachRequest::new(id("c1")).with_port(PortMapping::tcp(8080, 80)))
        .await
        .unwrap();
    fx.manager.attach(&id("c2")).await.unwrap();

    // Unrelated host state.
    fx.host.seed_netns("cni-1234");
    fx.host.seed_link("docker0");
    fx.host
        .seed_rule("nat", "POSTROUTING", &["-s", "10.88.0.0/16", "-j", "MASQUERADE"]);

    let restarted = fx.restart();
    let report = restarted.reconcile().await.unwrap();
    assert_eq!(report.namespaces.len(), 2);
    assert_eq!(report.rules.len(), 6);
    assert!(report.bridge_removed);
    assert!(report.failures.is_empty());

    assert_eq!(fx.host.namespaces(), vec!["cni-1234"]);
    assert_eq!(fx.host.root_links(), vec!["docker0", "lo"]);
    assert_eq!(fx.host.rules("nat", "POSTROUTING").len(), 1);
    assert!(fx.host.rules("filter", "FORWARD").is_empty());

    let second = restarted.reconcile().await.unwrap();
    assert!(second.is_empty(), "{second}");
}

#[tokio::test]
async fn reconcile_keeps_tracked_containers() {
    let fx = Fixture::new();
    fx.manager.attach(&id("live")).await.unwrap();

    let ghost = fx.manager.naming().for_container(&id("ghost"));
    fx.host.seed_netns(&ghost.namespace);
    fx.host.seed_link(&ghost.veth_host);
    fx.host.seed_rule(
        "filter",
        "FORWARD",
        &["-i", "oldbr0", "-m", "comment", "--comment", "rst:shared:forward-in", "-j", "ACCEPT"],
    );

    let report = fx.manager.reconcile().await.unwrap();
    assert_eq!(report.namespaces, vec![ghost.namespace.clone()]);
    assert_eq!(report.links, vec![ghost.veth_host.clone()]);
    assert_eq!(report.rules.len(), 1);
    assert!(!report.bridge_removed);

    assert!(fx.leftovers(&id("ghost")).is_empty());
    let live = fx.manager.naming().for_container(&id("live"));
    assert!(fx.host.namespaces().contains(&live.namespace));
    assert_eq!(fx.host.rules("filter", "FORWARD").len(), 2);

    assert!(fx.manager.reconcile().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rp_filter_before_bridge_exists_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MockHost::new());
    let tuner = SysctlTuner::new(host, dir.path().join("90-rustainer.conf"), WaitPolicy::default());

    let started = tokio::time::Instant::now();
    let err = tuner
        .disable_reverse_path_filter("rustainer0")
        .await
        .unwrap_err();

    assert!(matches!(err, RustainerError::Timeout { .. }));
    assert!(started.elapsed() <= WaitPolicy::default().total());
}

#[derive(Debug, Clone)]
enum Op {
    Attach(u8),
    Detach(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6).prop_map(Op::Attach),
        (0u8..6).prop_map(Op::Detach),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ready_containers_never_share_addresses(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let fx = Fixture::new();
            for op in ops {
                match op {
                    Op::Attach(n) => {
                        let _ = fx.manager.attach(&id(&format!("c{n}"))).await;
                    }
                    Op::Detach(n) => {
                        fx.manager.detach(&id(&format!("c{n}"))).await.unwrap();
                    }
                }

                let ready: Vec<_> = fx
                    .manager
                    .list()
                    .into_iter()
                    .filter(|r| r.state == AttachState::Ready)
                    .collect();
                let ips: HashSet<_> = ready.iter().map(|r| r.ip).collect();
                prop_assert_eq!(ips.len(), ready.len());

                let namespaces: HashSet<_> = fx.host.namespaces().into_iter().collect();
                let expected: HashSet<_> = ready.iter().map(|r| r.namespace.clone()).collect();
                prop_assert_eq!(namespaces, expected);
            }
            Ok(())
        })?;
    }
}
