//! In-memory [`HostNetwork`] for tests and dry runs.
//!
//! Models links (with veth peering and namespace membership), named
//! namespaces, addresses, default routes, iptables chains and sysctls,
//! following the same error conventions as [`crate::CommandHost`].
//! Failures can be injected per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use rustainer_common::{RustainerError, RustainerResult};

use crate::host::HostNetwork;
use crate::nat::RuleDescriptor;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `add_bridge`
    AddBridge,
    /// `add_veth_pair`
    AddVeth,
    /// `set_link_up`
    LinkUp,
    /// `set_link_master`
    SetMaster,
    /// `move_link_to_netns`
    MoveToNetns,
    /// `delete_link`
    DeleteLink,
    /// `add_address`
    AddAddress,
    /// `set_default_route`
    DefaultRoute,
    /// `add_netns`
    AddNetns,
    /// `delete_netns`
    DeleteNetns,
    /// `append_rule`
    AppendRule,
    /// `delete_rule`
    DeleteRule,
    /// `write_sysctl`
    WriteSysctl,
}

/// How an injected failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// The command exits non-zero with unrecognised stderr.
    Command,
    /// The caller lacks privileges.
    PermissionDenied,
    /// The command never returns.
    Hang,
}

#[derive(Debug, Clone)]
struct MockLink {
    bridge: bool,
    peer: Option<String>,
    netns: Option<String>,
    up: bool,
    master: Option<String>,
    addrs: Vec<Ipv4Net>,
}

impl MockLink {
    const fn new(bridge: bool, peer: Option<String>) -> Self {
        Self {
            bridge,
            peer,
            netns: None,
            up: false,
            master: None,
            addrs: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    /// Keyed by (namespace, name); `None` is the root namespace.
    links: BTreeMap<(Option<String>, String), MockLink>,
    netns: BTreeSet<String>,
    routes: BTreeMap<String, Ipv4Addr>,
    rules: BTreeMap<(String, String), Vec<Vec<String>>>,
    sysctls: BTreeMap<String, String>,
    failures: HashMap<MockOp, MockFailure>,
    calls: Vec<String>,
}

/// In-memory host network.
#[derive(Debug, Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    /// Create an empty host with only `lo` in the root namespace.
    #[must_use]
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock();
            let mut lo = MockLink::new(false, None);
            lo.up = true;
            state.links.insert((None, "lo".to_string()), lo);
            state
                .sysctls
                .insert("net.ipv4.conf.all.rp_filter".to_string(), "1".to_string());
            state
                .sysctls
                .insert("net.ipv4.conf.default.rp_filter".to_string(), "1".to_string());
            state
                .sysctls
                .insert("net.ipv4.ip_forward".to_string(), "0".to_string());
        }
        host
    }

    /// Make every call of `op` fail until cleared.
    pub fn inject(&self, op: MockOp, failure: MockFailure) {
        self.state.lock().failures.insert(op, failure);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Operation log, one entry per call.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Names of root-namespace links.
    #[must_use]
    pub fn root_links(&self) -> Vec<String> {
        self.state
            .lock()
            .links
            .keys()
            .filter(|(ns, _)| ns.is_none())
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names of links inside a namespace.
    #[must_use]
    pub fn links_in(&self, netns: &str) -> Vec<String> {
        self.state
            .lock()
            .links
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(netns))
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Names of existing namespaces.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.state.lock().netns.iter().cloned().collect()
    }

    /// Bridge a root-namespace link is enslaved to.
    #[must_use]
    pub fn master_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .links
            .get(&(None, name.to_string()))
            .and_then(|link| link.master.clone())
    }

    /// Whether a link is up.
    #[must_use]
    pub fn is_up(&self, netns: Option<&str>, name: &str) -> bool {
        self.state
            .lock()
            .links
            .get(&(netns.map(str::to_string), name.to_string()))
            .is_some_and(|link| link.up)
    }

    /// Addresses on a link.
    #[must_use]
    pub fn addresses(&self, netns: Option<&str>, name: &str) -> Vec<Ipv4Net> {
        self.state
            .lock()
            .links
            .get(&(netns.map(str::to_string), name.to_string()))
            .map(|link| link.addrs.clone())
            .unwrap_or_default()
    }

    /// Default gateway inside a namespace.
    #[must_use]
    pub fn default_route(&self, netns: &str) -> Option<Ipv4Addr> {
        self.state.lock().routes.get(netns).copied()
    }

    /// Rules of a chain, as argument vectors.
    #[must_use]
    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .rules
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Current value of a sysctl.
    #[must_use]
    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().sysctls.get(key).cloned()
    }

    /// Seed a rule that this crate did not create.
    pub fn seed_rule(&self, table: &str, chain: &str, args: &[&str]) {
        self.state
            .lock()
            .rules
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(args.iter().map(|a| (*a).to_string()).collect());
    }

    /// Seed a root-namespace link (e.g. a leftover from a crashed run).
    pub fn seed_link(&self, name: &str) {
        self.state
            .lock()
            .links
            .insert((None, name.to_string()), MockLink::new(false, None));
    }

    /// Seed a namespace.
    pub fn seed_netns(&self, name: &str) {
        self.state.lock().netns.insert(name.to_string());
    }

    /// Record the call and return the injected failure, if any.
    async fn enter(&self, op: MockOp, call: String) -> RustainerResult<()> {
        let failure = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());
            state.failures.get(&op).copied()
        };
        match failure {
            None => Ok(()),
            Some(MockFailure::Command) => Err(RustainerError::CommandFailed {
                command: call,
                stderr: "injected failure".to_string(),
            }),
            Some(MockFailure::PermissionDenied) => {
                Err(RustainerError::PermissionDenied { operation: call })
            }
            Some(MockFailure::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn log(&self, call: String) {
        self.state.lock().calls.push(call);
    }
}

fn key(netns: Option<&str>, name: &str) -> (Option<String>, String) {
    (netns.map(str::to_string), name.to_string())
}

fn link_missing(name: &str) -> RustainerError {
    RustainerError::InterfaceNotFound {
        name: name.to_string(),
    }
}

fn link_exists_error(name: &str) -> RustainerError {
    RustainerError::AlreadyExists {
        kind: "link".to_string(),
        name: name.to_string(),
    }
}

/// Remove a link and, for veths, its peer wherever it lives.
fn remove_link(state: &mut MockState, at: &(Option<String>, String)) {
    let Some(link) = state.links.remove(at) else {
        return;
    };
    if let Some(peer) = link.peer {
        let peer_key = state
            .links
            .iter()
            .find(|((_, name), l)| *name == peer && l.peer.as_deref() == Some(at.1.as_str()))
            .map(|(k, _)| k.clone());
        if let Some(peer_key) = peer_key {
            state.links.remove(&peer_key);
        }
    }
    if link.bridge {
        for other in state.links.values_mut() {
            if other.master.as_deref() == Some(at.1.as_str()) {
                other.master = None;
            }
        }
    }
}

#[async_trait]
impl HostNetwork for MockHost {
    async fn list_links(&self) -> RustainerResult<Vec<String>> {
        self.log("list_links".to_string());
        Ok(self.root_links())
    }

    async fn link_exists(&self, name: &str) -> RustainerResult<bool> {
        Ok(self.state.lock().links.contains_key(&key(None, name)))
    }

    async fn add_bridge(&self, name: &str) -> RustainerResult<()> {
        self.enter(MockOp::AddBridge, format!("add_bridge {name}"))
            .await?;
        let mut state = self.state.lock();
        if state.links.contains_key(&key(None, name)) {
            return Err(link_exists_error(name));
        }
        state.links.insert(key(None, name), MockLink::new(true, None));
        Ok(())
    }

    async fn add_veth_pair(&self, host: &str, peer: &str) -> RustainerResult<()> {
        self.enter(MockOp::AddVeth, format!("add_veth_pair {host} {peer}"))
            .await?;
        let mut state = self.state.lock();
        for name in [host, peer] {
            if state.links.contains_key(&key(None, name)) {
                return Err(link_exists_error(name));
            }
        }
        state.links.insert(
            key(None, host),
            MockLink::new(false, Some(peer.to_string())),
        );
        state.links.insert(
            key(None, peer),
            MockLink::new(false, Some(host.to_string())),
        );
        Ok(())
    }

    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> RustainerResult<()> {
        self.enter(
            MockOp::LinkUp,
            format!("set_link_up {} {name}", netns.unwrap_or("-")),
        )
        .await?;
        let mut state = self.state.lock();
        if let Some(ns) = netns {
            if !state.netns.contains(ns) {
                return Err(RustainerError::NotFound {
                    kind: "namespace".to_string(),
                    name: ns.to_string(),
                });
            }
            // Every namespace has its own loopback.
            if name == "lo" {
                let lo = state
                    .links
                    .entry(key(netns, "lo"))
                    .or_insert_with(|| MockLink::new(false, None));
                lo.up = true;
                return Ok(());
            }
        }
        let link = state
            .links
            .get_mut(&key(netns, name))
            .ok_or_else(|| link_missing(name))?;
        link.up = true;
        Ok(())
    }

    async fn set_link_down(&self, name: &str) -> RustainerResult<()> {
        self.log(format!("set_link_down {name}"));
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&key(None, name))
            .ok_or_else(|| link_missing(name))?;
        link.up = false;
        Ok(())
    }

    async fn set_link_master(&self, name: &str, master: &str) -> RustainerResult<()> {
        self.enter(MockOp::SetMaster, format!("set_link_master {name} {master}"))
            .await?;
        let mut state = self.state.lock();
        let is_bridge = state
            .links
            .get(&key(None, master))
            .is_some_and(|link| link.bridge);
        if !is_bridge {
            return Err(link_missing(master));
        }
        let link = state
            .links
            .get_mut(&key(None, name))
            .ok_or_else(|| link_missing(name))?;
        link.master = Some(master.to_string());
        Ok(())
    }

    async fn move_link_to_netns(&self, name: &str, netns: &str) -> RustainerResult<()> {
        self.enter(MockOp::MoveToNetns, format!("move_link_to_netns {name} {netns}"))
            .await?;
        let mut state = self.state.lock();
        if !state.netns.contains(netns) {
            return Err(RustainerError::NotFound {
                kind: "namespace".to_string(),
                name: netns.to_string(),
            });
        }
        let mut link = state
            .links
            .remove(&key(None, name))
            .ok_or_else(|| link_missing(name))?;
        link.netns = Some(netns.to_string());
        link.up = false;
        link.master = None;
        state.links.insert(key(Some(netns), name), link);
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> RustainerResult<()> {
        self.enter(MockOp::DeleteLink, format!("delete_link {name}"))
            .await?;
        let mut state = self.state.lock();
        let at = key(None, name);
        if !state.links.contains_key(&at) {
            return Err(link_missing(name));
        }
        remove_link(&mut state, &at);
        Ok(())
    }

    async fn list_addresses(
        &self,
        netns: Option<&str>,
        name: &str,
    ) -> RustainerResult<Vec<Ipv4Net>> {
        self.state
            .lock()
            .links
            .get(&key(netns, name))
            .map(|link| link.addrs.clone())
            .ok_or_else(|| link_missing(name))
    }

    async fn add_address(
        &self,
        netns: Option<&str>,
        name: &str,
        addr: Ipv4Net,
    ) -> RustainerResult<()> {
        self.enter(
            MockOp::AddAddress,
            format!("add_address {} {name} {addr}", netns.unwrap_or("-")),
        )
        .await?;
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&key(netns, name))
            .ok_or_else(|| link_missing(name))?;
        if link.addrs.contains(&addr) {
            return Err(RustainerError::AlreadyExists {
                kind: "address".to_string(),
                name: addr.to_string(),
            });
        }
        link.addrs.push(addr);
        Ok(())
    }

    async fn set_default_route(&self, netns: &str, gateway: Ipv4Addr) -> RustainerResult<()> {
        self.enter(
            MockOp::DefaultRoute,
            format!("set_default_route {netns} {gateway}"),
        )
        .await?;
        let mut state = self.state.lock();
        let reachable = state
            .links
            .iter()
            .any(|((ns, _), link)| ns.as_deref() == Some(netns) && link.up && link.addrs.iter().any(|a| a.contains(&gateway)));
        if !reachable {
            return Err(RustainerError::CommandFailed {
                command: format!("ip -n {netns} route replace default via {gateway}"),
                stderr: "Error: Nexthop has invalid gateway.".to_string(),
            });
        }
        state.routes.insert(netns.to_string(), gateway);
        Ok(())
    }

    async fn add_netns(&self, name: &str) -> RustainerResult<()> {
        self.enter(MockOp::AddNetns, format!("add_netns {name}"))
            .await?;
        let mut state = self.state.lock();
        if !state.netns.insert(name.to_string()) {
            return Err(RustainerError::AlreadyExists {
                kind: "namespace".to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_netns(&self, name: &str) -> RustainerResult<()> {
        self.enter(MockOp::DeleteNetns, format!("delete_netns {name}"))
            .await?;
        let mut state = self.state.lock();
        if !state.netns.remove(name) {
            return Err(RustainerError::NotFound {
                kind: "namespace".to_string(),
                name: name.to_string(),
            });
        }
        let inside: Vec<_> = state
            .links
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(name))
            .cloned()
            .collect();
        for at in inside {
            remove_link(&mut state, &at);
        }
        state.routes.remove(name);
        Ok(())
    }

    async fn list_netns(&self) -> RustainerResult<Vec<String>> {
        self.log("list_netns".to_string());
        Ok(self.namespaces())
    }

    async fn list_rules(&self, table: &str, chain: &str) -> RustainerResult<Vec<String>> {
        Ok(self
            .rules(table, chain)
            .into_iter()
            .map(|args| format!("-A {chain} {}", args.join(" ")))
            .collect())
    }

    async fn append_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()> {
        self.enter(
            MockOp::AppendRule,
            format!("append_rule {table} {chain} {}", args.join(" ")),
        )
        .await?;
        self.state
            .lock()
            .rules
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(args.to_vec());
        Ok(())
    }

    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> RustainerResult<()> {
        self.enter(
            MockOp::DeleteRule,
            format!("delete_rule {table} {chain} {}", args.join(" ")),
        )
        .await?;
        let wanted = RuleDescriptor::from_args(chain, args);
        let mut state = self.state.lock();
        let rules = state
            .rules
            .entry((table.to_string(), chain.to_string()))
            .or_default();
        let position = rules
            .iter()
            .position(|rule| RuleDescriptor::from_args(chain, rule) == wanted);
        match position {
            Some(index) => {
                rules.remove(index);
                Ok(())
            }
            None => Err(RustainerError::NotFound {
                kind: "rule".to_string(),
                name: chain.to_string(),
            }),
        }
    }

    async fn read_sysctl(&self, key: &str) -> RustainerResult<String> {
        self.state
            .lock()
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| RustainerError::NotFound {
                kind: "sysctl".to_string(),
                name: key.to_string(),
            })
    }

    async fn write_sysctl(&self, key: &str, value: &str) -> RustainerResult<()> {
        self.enter(MockOp::WriteSysctl, format!("write_sysctl {key} {value}"))
            .await?;
        let mut state = self.state.lock();
        // Per-interface keys only exist while the interface does.
        if let Some((iface, _)) = crate::sysctl::split_conf_key(key) {
            let known = iface == "all"
                || iface == "default"
                || state.links.contains_key(&(None, iface.to_string()));
            if !known {
                return Err(RustainerError::NotFound {
                    kind: "sysctl".to_string(),
                    name: key.to_string(),
                });
            }
        }
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deleting_netns_destroys_veth_pair() {
        let host = MockHost::new();
        host.add_netns("ns1").await.unwrap();
        host.add_veth_pair("vh", "vc").await.unwrap();
        host.move_link_to_netns("vc", "ns1").await.unwrap();
        assert!(host.root_links().contains(&"vh".to_string()));
        assert_eq!(host.links_in("ns1"), vec!["vc"]);

        host.delete_netns("ns1").await.unwrap();
        assert!(!host.root_links().contains(&"vh".to_string()));
        assert!(host.links_in("ns1").is_empty());
    }

    #[tokio::test]
    async fn address_must_target_the_right_namespace() {
        let host = MockHost::new();
        host.add_netns("ns1").await.unwrap();
        host.add_veth_pair("vh", "vc").await.unwrap();
        host.move_link_to_netns("vc", "ns1").await.unwrap();

        let addr: Ipv4Net = "10.0.0.2/24".parse().unwrap();
        let err = host.add_address(None, "vc", addr).await.unwrap_err();
        assert!(matches!(err, RustainerError::InterfaceNotFound { .. }));
        host.add_address(Some("ns1"), "vc", addr).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_apply_until_cleared() {
        let host = MockHost::new();
        host.inject(MockOp::AddNetns, MockFailure::PermissionDenied);
        assert!(matches!(
            host.add_netns("ns1").await,
            Err(RustainerError::PermissionDenied { .. })
        ));
        host.clear_failures();
        host.add_netns("ns1").await.unwrap();
    }

    #[tokio::test]
    async fn dotted_interface_sysctl() {
        let host = MockHost::new();
        host.seed_link("eth0.100");
        host.write_sysctl("net.ipv4.conf.eth0.100.rp_filter", "0")
            .await
            .unwrap();
        assert_eq!(
            host.sysctl("net.ipv4.conf.eth0.100.rp_filter").as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn per_interface_sysctl_needs_the_interface() {
        let host = MockHost::new();
        let key = "net.ipv4.conf.br0.rp_filter";
        assert!(host.write_sysctl(key, "0").await.unwrap_err().is_not_found());
        host.add_bridge("br0").await.unwrap();
        host.write_sysctl(key, "0").await.unwrap();
        assert_eq!(host.sysctl(key).as_deref(), Some("0"));
    }
}
