//! # rustainer-net
//!
//! Operator tool for the Rustainer container network: reconcile orphaned
//! namespaces, veths and NAT rules, re-apply persisted sysctls, and attach
//! or detach a container by hand.

#![warn(missing_docs)]

pub mod cli;
