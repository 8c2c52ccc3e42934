//! Orphan cleanup.
//!
//! Anything on the host that carries the reserved prefix but is not backed
//! by a registry record is an orphan. Shared NAT rules and the bridge are
//! only orphans once no record remains; shared rules that differ from the
//! currently desired ones are always orphans.

use std::collections::HashSet;
use std::fmt;

use rustainer_common::{ContainerId, RustainerResult};
use serde::Serialize;

use crate::manager::NetworkLifecycleManager;
use crate::naming::RuleTag;
use crate::netns::NamespaceHandle;
use crate::veth::VethPair;

/// What a reconcile pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Removed namespaces.
    pub namespaces: Vec<String>,
    /// Removed links.
    pub links: Vec<String>,
    /// Removed rules, as `table: -A CHAIN ...`.
    pub rules: Vec<String>,
    /// Whether the bridge was deleted.
    pub bridge_removed: bool,
    /// Resources that could not be removed.
    pub failures: Vec<String>,
}

impl ReconcileReport {
    /// Whether the pass found nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
            && self.links.is_empty()
            && self.rules.is_empty()
            && !self.bridge_removed
            && self.failures.is_empty()
    }

    /// Number of removed resources.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.namespaces.len()
            + self.links.len()
            + self.rules.len()
            + usize::from(self.bridge_removed)
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "Nothing to reconcile");
        }
        for ns in &self.namespaces {
            writeln!(f, "removed namespace {ns}")?;
        }
        for link in &self.links {
            writeln!(f, "removed link {link}")?;
        }
        for rule in &self.rules {
            writeln!(f, "removed rule {rule}")?;
        }
        if self.bridge_removed {
            writeln!(f, "removed bridge")?;
        }
        for failure in &self.failures {
            writeln!(f, "failed: {failure}")?;
        }
        Ok(())
    }
}

impl NetworkLifecycleManager {
    /// Remove every owned host resource the registry does not account for.
    ///
    /// Safe to run at any time, including right after a restart that lost
    /// the registry. Individual removal failures are reported, not raised.
    ///
    /// # Errors
    ///
    /// Returns an error only if host state cannot be listed.
    pub async fn reconcile(&self) -> RustainerResult<ReconcileReport> {
        let mut shared = self.shared.lock().await;
        let mut report = ReconcileReport::default();

        // Host state is listed before the registry is read: an attach that
        // starts in between has its record in the snapshot already, and
        // anything it creates afterwards is not in the listing.
        let namespaces = self.host.list_netns().await?;
        let links = self.host.list_links().await?;
        let rules = self.nat.list_owned().await?;

        let (known_names, known_ids) = {
            let registry = self.registry.lock();
            let mut names = HashSet::new();
            let mut ids = HashSet::new();
            for record in registry.values() {
                names.insert(record.namespace.clone());
                names.insert(record.veth_host.clone());
                names.insert(record.veth_container.clone());
                ids.insert(record.container_id.to_string());
            }
            (names, ids)
        };

        for name in namespaces {
            if !self.naming.is_owned_netns(&name) || known_names.contains(&name) {
                continue;
            }
            let Some(id) = name
                .strip_prefix(self.naming.prefix())
                .and_then(|rest| rest.strip_prefix('-'))
                .and_then(|rest| ContainerId::new(rest).ok())
            else {
                continue;
            };
            match NamespaceHandle::open(self.host.clone(), &name, id).delete().await {
                Ok(true) => {
                    tracing::info!(netns = %name, "Removed orphaned namespace");
                    report.namespaces.push(name);
                }
                Ok(false) => {}
                Err(e) => report.failures.push(format!("namespace {name}: {e}")),
            }
        }

        // Deleting a namespace takes its veth peer with it, so some of
        // these are already gone.
        for name in links {
            if !self.naming.is_owned_link(&name) || known_names.contains(&name) {
                continue;
            }
            match VethPair::open(self.host.clone(), &name, "").delete_host_end().await {
                Ok(true) => {
                    tracing::info!(iface = %name, "Removed orphaned link");
                    report.links.push(name);
                }
                Ok(false) => {}
                Err(e) => report.failures.push(format!("link {name}: {e}")),
            }
        }

        let desired = self
            .nat
            .desired(self.config.network(), &self.config.bridge);
        let idle = known_ids.is_empty();
        for owned in rules {
            let orphan = match &owned.tag {
                RuleTag::Container(id) => !known_ids.contains(id),
                RuleTag::Shared(_) => {
                    idle || !desired
                        .iter()
                        .any(|(table, rule)| *table == owned.table && *rule == owned.rule)
                }
            };
            if !orphan {
                continue;
            }
            let label = format!("{}: {}", owned.table, owned.rule);
            match self.nat.delete(owned.table, &owned.rule).await {
                Ok(()) => {
                    tracing::info!(rule = %label, "Removed orphaned rule");
                    report.rules.push(label);
                }
                Err(e) => report.failures.push(format!("rule {label}: {e}")),
            }
        }

        let attached = self.registry.lock().len();
        if attached == 0 && self.bridge.exists().await? {
            match self.bridge.teardown_bridge(attached).await {
                Ok(removed) => {
                    report.bridge_removed = removed;
                    shared.bridge_tuned = false;
                }
                Err(e) => report.failures.push(format!("bridge {}: {e}", self.bridge.name())),
            }
        }

        if report.is_empty() {
            tracing::debug!("Reconcile found nothing to remove");
        } else {
            tracing::info!(
                removed = report.removed(),
                failures = report.failures.len(),
                "Reconcile complete"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_display() {
        assert_eq!(ReconcileReport::default().to_string(), "Nothing to reconcile\n");
    }

    #[test]
    fn removed_counts_bridge() {
        let report = ReconcileReport {
            links: vec!["rst0badc0deh".to_string()],
            bridge_removed: true,
            ..ReconcileReport::default()
        };
        assert_eq!(report.removed(), 2);
        assert!(!report.is_empty());
    }
}
