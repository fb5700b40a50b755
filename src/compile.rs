//! Rule compilation to a platform-neutral statement list
//!
//! Parsed lan-access rules expand into an ordered list of [`Stmt`] values:
//! allow statements first, then one block statement per private range that
//! matches the container's address family. Backends render this list into
//! their native ruleset syntax; the ordering is load-bearing on every
//! platform, since both nftables chains and `quick` pf rules take the first
//! matching verdict.

use std::fmt;

use crate::rules::{self, LanRule, Protocol};

/// Private IPv4 ranges blocked by default.
pub const PRIVATE_IPV4_RANGES: [&str; 5] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "127.0.0.0/8",
];

/// Private IPv6 ranges blocked by default.
pub const PRIVATE_IPV6_RANGES: [&str; 3] = ["fe80::/10", "fc00::/7", "::1/128"];

/// Concrete transport for one expanded statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Transport {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

/// Destination port constraint for one expanded statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
}

impl PortSpec {
    /// The full port range used when a protocol is pinned but the port is
    /// wildcarded.
    pub const ALL: Self = Self::Range(1, 65535);
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(p) => write!(f, "{p}"),
            Self::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

/// One allow flow: container source to a rule destination, optionally
/// narrowed to a transport and port set.
///
/// Source and destination families are independent: an IPv4 container can
/// carry IPv6 allow rules and vice versa.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMatch {
    /// Container IP literal
    pub src: String,
    /// Whether `src` is IPv6
    pub src_v6: bool,
    /// Destination address or CIDR literal
    pub dst: String,
    /// Whether `dst` is IPv6
    pub dst_v6: bool,
    /// Pinned transport, or `None` for any protocol
    pub transport: Option<Transport>,
    /// Port constraint, or `None` for any port
    pub port: Option<PortSpec>,
}

/// One statement of a compiled ruleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// Accept traffic matching the flow.
    Allow(FlowMatch),
    /// Drop traffic from the container to a private range.
    Block {
        src: String,
        dst: &'static str,
        v6: bool,
    },
}

/// Expands parsed rules for one container into the ordered statement list.
///
/// If any rule is the all-LAN wildcard the result is empty: nothing is
/// blocked, so nothing needs to be written. Otherwise every allow statement
/// precedes every block statement.
pub fn expand(container_ip: &str, lan_rules: &[LanRule]) -> Vec<Stmt> {
    if rules::has_all_lan(lan_rules) {
        return Vec::new();
    }

    let src_v6 = rules::is_ipv6(container_ip);
    let mut stmts = Vec::new();

    for rule in lan_rules {
        for (transport, port) in expand_ports(rule) {
            stmts.push(Stmt::Allow(FlowMatch {
                src: container_ip.to_string(),
                src_v6,
                dst: rule.dest.clone(),
                dst_v6: rule.is_ipv6,
                transport,
                port,
            }));
        }
    }

    let ranges: &[&'static str] = if src_v6 {
        &PRIVATE_IPV6_RANGES
    } else {
        &PRIVATE_IPV4_RANGES
    };
    for dst in ranges {
        stmts.push(Stmt::Block {
            src: container_ip.to_string(),
            dst,
            v6: src_v6,
        });
    }

    stmts
}

/// Expands one rule's port/protocol combination into concrete
/// transport+port pairs. Six cases:
///
/// | port | protocol | result                          |
/// |------|----------|---------------------------------|
/// | 0    | All      | one unrestricted statement      |
/// | 0    | TCP/UDP  | that transport, ports 1-65535   |
/// | p    | TCP/UDP  | that transport, single port     |
/// | p    | All      | TCP single port + UDP single    |
fn expand_ports(rule: &LanRule) -> Vec<(Option<Transport>, Option<PortSpec>)> {
    match (rule.port, rule.protocol) {
        (0, Protocol::All) => vec![(None, None)],
        (0, Protocol::Tcp) => vec![(Some(Transport::Tcp), Some(PortSpec::ALL))],
        (0, Protocol::Udp) => vec![(Some(Transport::Udp), Some(PortSpec::ALL))],
        (p, Protocol::Tcp) => vec![(Some(Transport::Tcp), Some(PortSpec::Single(p)))],
        (p, Protocol::Udp) => vec![(Some(Transport::Udp), Some(PortSpec::Single(p)))],
        (p, Protocol::All) => vec![
            (Some(Transport::Tcp), Some(PortSpec::Single(p))),
            (Some(Transport::Udp), Some(PortSpec::Single(p))),
        ],
    }
}
