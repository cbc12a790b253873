//! Host/container port mapping normalization.
//!
//! The container runtime lives inside the machine, so the mappings it asks for
//! have to be massaged before they are published on the host: consecutive
//! single-port mappings are folded into ranges for inspection output, and
//! each backend gets its own treatment of the bound host address.

use std::net::IpAddr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// A single requested port binding, as handed over by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SinglePortMapping {
    /// Host address to bind; empty means unspecified
    #[serde(default, rename = "HostIP")]
    pub host_ip: String,
    /// Port on the host side
    pub host_port: u16,
    /// Port inside the container
    pub container_port: u16,
    /// `tcp`, `udp`, `sctp`, or a family-qualified `tcp4`/`tcp6`
    pub protocol: String,
}

/// A port binding covering `range` consecutive ports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortMapping {
    /// Host address to bind; empty means unspecified
    #[serde(default, rename = "HostIP")]
    pub host_ip: String,
    /// First port on the host side
    pub host_port: u16,
    /// First port inside the container
    pub container_port: u16,
    /// Transport protocol
    pub protocol: String,
    /// Number of consecutive ports covered, at least 1
    pub range: u16,
}

impl From<SinglePortMapping> for PortMapping {
    fn from(p: SinglePortMapping) -> Self {
        Self {
            host_ip: p.host_ip,
            host_port: p.host_port,
            container_port: p.container_port,
            protocol: p.protocol,
            range: 1,
        }
    }
}

impl PortMapping {
    /// Whether `next` continues this range by exactly one port on both sides.
    ///
    /// A range that already spans `u16::MAX` ports is closed.
    fn continued_by(&self, next: &PortMapping) -> bool {
        self.range < u16::MAX
            && self.protocol == next.protocol
            && self.host_ip == next.host_ip
            && u32::from(self.host_port) + u32::from(self.range) == u32::from(next.host_port)
            && u32::from(self.container_port) + u32::from(self.range)
                == u32::from(next.container_port)
    }
}

/// How a backend publishes container ports on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PortPublishing {
    /// The backend cannot bind both address families from one wildcard
    /// binding, so such bindings are published once per family.
    DualStackSplit,
    /// The machine owns its network stack and is only reachable through
    /// forwarding, so a specific host address is meaningless.
    DropHostIp,
    /// Mappings are published as requested.
    Passthrough,
}

/// Fold single-port mappings into ranges.
///
/// Ordering is by host address, protocol, host port, then container port,
/// which makes the result independent of the input order. Two mappings merge
/// only when protocol and host address match exactly and both ports advance
/// by one. Returns `None` for empty input.
pub fn coalesce(ports: Vec<SinglePortMapping>) -> Option<Vec<PortMapping>> {
    if ports.is_empty() {
        return None;
    }
    let merged = ports
        .into_iter()
        .sorted_by(|a, b| {
            (&a.host_ip, &a.protocol, a.host_port, a.container_port).cmp(&(
                &b.host_ip,
                &b.protocol,
                b.host_port,
                b.container_port,
            ))
        })
        .map(PortMapping::from)
        .coalesce(|prev, next| {
            if prev.continued_by(&next) {
                Ok(PortMapping {
                    range: prev.range + 1,
                    ..prev
                })
            } else {
                Err((prev, next))
            }
        })
        .collect();
    Some(merged)
}

/// Address pair to publish for a dual-stack split, if `mapping` needs one.
fn dual_stack_addresses(mapping: &PortMapping) -> Option<(&'static str, &'static str)> {
    // Only an unqualified protocol spans both families.
    if !(mapping.protocol == "tcp" || mapping.protocol.is_empty()) {
        return None;
    }
    let ip: IpAddr = mapping.host_ip.parse().ok()?;
    match ip {
        ip if ip.is_unspecified() => Some(("0.0.0.0", "::")),
        IpAddr::V6(v6) if v6.is_loopback() => Some(("127.0.0.1", "::1")),
        _ => None,
    }
}

/// Rewrite mappings for publication through the given backend.
pub fn publish_for(mode: PortPublishing, ports: &[PortMapping]) -> Vec<PortMapping> {
    match mode {
        PortPublishing::Passthrough => ports.to_vec(),
        PortPublishing::DropHostIp => ports
            .iter()
            .map(|p| PortMapping {
                host_ip: String::new(),
                ..p.clone()
            })
            .collect(),
        PortPublishing::DualStackSplit => ports
            .iter()
            .flat_map(|p| match dual_stack_addresses(p) {
                Some((v4, v6)) => vec![
                    PortMapping {
                        protocol: "tcp4".into(),
                        host_ip: v4.into(),
                        ..p.clone()
                    },
                    PortMapping {
                        protocol: "tcp6".into(),
                        host_ip: v6.into(),
                        ..p.clone()
                    },
                ],
                None => vec![p.clone()],
            })
            .collect(),
    }
}
