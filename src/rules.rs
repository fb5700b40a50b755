//! lan-access rule language parser
//!
//! A lan-access rule describes one destination a container may reach on the
//! local network. Everything else in the private ranges is blocked. Supported
//! formats:
//!
//! ```text
//! "*"                         → allow all LAN traffic
//! "192.168.1.100"             → IPv4, all ports, all protocols
//! "192.168.1.100:8080"        → IPv4, port 8080, TCP default
//! "192.168.1.100:*"           → IPv4, all ports, all protocols
//! "tcp://192.168.1.100:8080"  → IPv4, port 8080, TCP
//! "udp://192.168.1.100:53"    → IPv4, port 53, UDP
//! "*://192.168.1.100:443"     → IPv4, port 443, TCP+UDP
//! "192.168.1.0/24:8080"       → CIDR, port 8080, TCP default
//! "fe80::1"                   → IPv6, all ports
//! "[fe80::1]:8080"            → IPv6, port 8080, TCP default
//! "tcp://[2001:db8::1]:443"   → IPv6, port 443, TCP
//! "[2001:db8::/32]:*"         → IPv6 CIDR, all ports
//! ```
//!
//! Parsing is pure validation: no name resolution, no normalization. The
//! validated address text is kept verbatim so compiled rulesets reproduce the
//! operator's configuration exactly.

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The special rule value that allows all LAN access.
pub const LAN_ACCESS_WILDCARD: &str = "*";

/// Transport protocol selector for a lan-access rule
///
/// `All` means both TCP and UDP; it is the default when no port is given,
/// and is spelled `*://` as an explicit prefix.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum Protocol {
    /// Both TCP and UDP
    #[default]
    #[strum(serialize = "*")]
    All,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

/// Validation errors for a single lan-access rule string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty rule string")]
    Empty,

    #[error("missing closing bracket for IPv6 address")]
    UnterminatedBracket,

    #[error("unexpected characters after IPv6 address: {0:?}")]
    TrailingInput(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("port {0} out of range (1-65535)")]
    PortOutOfRange(u32),

    #[error("invalid IP address {0:?}")]
    InvalidIp(String),

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("invalid CIDR prefix /{prefix} (must be 0-{max})")]
    InvalidPrefix { prefix: u8, max: u8 },

    #[error("expected IPv6 address but got IPv4: {0:?}")]
    ExpectedIpv6(String),

    #[error("expected IPv4 address but got IPv6: {0:?}")]
    ExpectedIpv4(String),
}

/// One parsed lan-access configuration entry
///
/// If `all_lan` is set the rule is the `"*"` wildcard and every other field
/// is meaningless. Otherwise `dest` holds a validated IP address or CIDR and
/// `port == 0` means all ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanRule {
    /// Original rule string, kept for error messages
    pub raw: String,
    /// Validated destination address or CIDR text
    pub dest: String,
    /// Destination port; 0 means all ports
    pub port: u16,
    /// Transport protocol selector
    pub protocol: Protocol,
    /// Whether `dest` is an IPv6 address/CIDR
    pub is_ipv6: bool,
    /// True for the `"*"` wildcard (allow all LAN)
    pub all_lan: bool,
}

impl LanRule {
    /// Builds the wildcard rule that disables LAN blocking entirely.
    pub fn all_lan(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            dest: String::new(),
            port: 0,
            protocol: Protocol::All,
            is_ipv6: false,
            all_lan: true,
        }
    }
}

impl FromStr for LanRule {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_rule(s)
    }
}

/// Returns true if the address literal is IPv6.
pub fn is_ipv6(addr: &str) -> bool {
    addr.contains(':')
}

/// Returns true if any rule allows all LAN access.
pub fn has_all_lan(rules: &[LanRule]) -> bool {
    rules.iter().any(|r| r.all_lan)
}

/// Parses a single lan-access rule string.
pub fn parse_rule(input: &str) -> Result<LanRule, ParseError> {
    let raw = input.to_string();
    let s = input.trim();

    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    if s == LAN_ACCESS_WILDCARD {
        return Ok(LanRule::all_lan(raw));
    }

    let (explicit_proto, s) = strip_protocol_prefix(s);

    let (dest, port_str, dest_is_v6) = if let Some(rest) = s.strip_prefix('[') {
        let (dest, port_str) = split_bracketed(rest)?;
        (dest, port_str, true)
    } else {
        split_unbracketed(s)
    };

    validate_dest(dest, dest_is_v6)?;
    let port = parse_port(port_str)?;

    // Explicit protocol prefix wins; otherwise a concrete port defaults to
    // TCP, and a wildcard port means all protocols.
    let protocol = match explicit_proto {
        Some(p) => p,
        None if port > 0 => Protocol::Tcp,
        None => Protocol::All,
    };

    Ok(LanRule {
        raw,
        dest: dest.to_string(),
        port,
        protocol,
        is_ipv6: dest_is_v6,
        all_lan: false,
    })
}

/// Parses a list of lan-access rule strings, failing fast on the first
/// invalid entry.
pub fn parse_rules<S: AsRef<str>>(entries: &[S]) -> Result<Vec<LanRule>, Error> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            parse_rule(entry.as_ref()).map_err(|source| Error::Rule {
                index,
                rule: entry.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

/// Strips an optional `tcp://`, `udp://`, or `*://` prefix.
fn strip_protocol_prefix(s: &str) -> (Option<Protocol>, &str) {
    if let Some(rest) = s.strip_prefix("tcp://") {
        (Some(Protocol::Tcp), rest)
    } else if let Some(rest) = s.strip_prefix("udp://") {
        (Some(Protocol::Udp), rest)
    } else if let Some(rest) = s.strip_prefix("*://") {
        (Some(Protocol::All), rest)
    } else {
        (None, s)
    }
}

/// Splits bracketed IPv6 notation, given the text after the opening `[`:
/// `fe80::1]` or `fe80::1]:8080`.
fn split_bracketed(rest: &str) -> Result<(&str, &str), ParseError> {
    let close = rest.find(']').ok_or(ParseError::UnterminatedBracket)?;
    let dest = &rest[..close];
    let remainder = &rest[close + 1..];

    match remainder {
        "" => Ok((dest, "")),
        _ => match remainder.strip_prefix(':') {
            Some(port) => Ok((dest, port)),
            None => Err(ParseError::TrailingInput(remainder.to_string())),
        },
    }
}

/// Splits an unbracketed address into destination and port.
///
/// Two or more colons must be a bare IPv6 literal, which cannot carry a port.
/// Exactly one colon separates an IPv4 address/CIDR from its port.
fn split_unbracketed(s: &str) -> (&str, &str, bool) {
    match s.bytes().filter(|&b| b == b':').count() {
        0 => (s, "", false),
        1 => match s.split_once(':') {
            Some((dest, port)) => (dest, port, false),
            None => (s, "", false),
        },
        _ => (s, "", true),
    }
}

/// Validates an IP address or CIDR and checks it matches the family implied
/// by the rule's syntax (brackets / colon count).
fn validate_dest(dest: &str, expect_v6: bool) -> Result<(), ParseError> {
    if let Some((addr, prefix_str)) = dest.split_once('/') {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| ParseError::InvalidCidr(dest.to_string()))?;
        check_family(&ip, expect_v6, dest)?;

        let prefix: u8 = prefix_str
            .parse()
            .map_err(|_| ParseError::InvalidCidr(dest.to_string()))?;
        let max = if ip.is_ipv6() { 128 } else { 32 };
        if prefix > max {
            return Err(ParseError::InvalidPrefix { prefix, max });
        }

        IpNetwork::new(ip, prefix).map_err(|_| ParseError::InvalidCidr(dest.to_string()))?;
        Ok(())
    } else {
        let ip: IpAddr = dest
            .parse()
            .map_err(|_| ParseError::InvalidIp(dest.to_string()))?;
        check_family(&ip, expect_v6, dest)
    }
}

fn check_family(ip: &IpAddr, expect_v6: bool, dest: &str) -> Result<(), ParseError> {
    if expect_v6 && ip.is_ipv4() {
        return Err(ParseError::ExpectedIpv6(dest.to_string()));
    }
    if !expect_v6 && ip.is_ipv6() {
        return Err(ParseError::ExpectedIpv4(dest.to_string()));
    }
    Ok(())
}

/// Parses a port string. Empty or `"*"` means all ports (0).
fn parse_port(port_str: &str) -> Result<u16, ParseError> {
    if port_str.is_empty() || port_str == LAN_ACCESS_WILDCARD {
        return Ok(0);
    }
    let port: u32 = port_str
        .parse()
        .map_err(|_| ParseError::InvalidPort(port_str.to_string()))?;
    if !(1..=65535).contains(&port) {
        return Err(ParseError::PortOutOfRange(port));
    }
    #[allow(clippy::cast_possible_truncation)]
    Ok(port as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parsed(s: &str) -> LanRule {
        parse_rule(s).unwrap_or_else(|e| panic!("rule {s:?} should parse: {e}"))
    }

    #[test]
    fn test_wildcard() {
        let rule = parsed("*");
        assert!(rule.all_lan);
        assert_eq!(rule.raw, "*");
    }

    #[test]
    fn test_wildcard_with_whitespace() {
        assert!(parsed("  *  ").all_lan);
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(parse_rule(""), Err(ParseError::Empty));
        assert_eq!(parse_rule("   "), Err(ParseError::Empty));
    }

    #[test]
    fn test_plain_ipv4() {
        let rule = parsed("192.168.1.100");
        assert_eq!(rule.dest, "192.168.1.100");
        assert_eq!(rule.port, 0);
        assert_eq!(rule.protocol, Protocol::All);
        assert!(!rule.is_ipv6);
        assert!(!rule.all_lan);
    }

    #[test]
    fn test_ipv4_with_port_defaults_tcp() {
        let rule = parsed("192.168.1.100:8080");
        assert_eq!(rule.dest, "192.168.1.100");
        assert_eq!(rule.port, 8080);
        assert_eq!(rule.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_ipv4_wildcard_port_means_all_protocols() {
        let rule = parsed("192.168.1.100:*");
        assert_eq!(rule.port, 0);
        assert_eq!(rule.protocol, Protocol::All);
    }

    #[test]
    fn test_udp_prefix() {
        let rule = parsed("udp://192.168.1.50:53");
        assert_eq!(rule.protocol, Protocol::Udp);
        assert_eq!(rule.port, 53);
    }

    #[test]
    fn test_explicit_all_protocol_with_port() {
        let rule = parsed("*://192.168.1.100:443");
        assert_eq!(rule.protocol, Protocol::All);
        assert_eq!(rule.port, 443);
    }

    #[test]
    fn test_tcp_prefix_without_port_keeps_tcp() {
        let rule = parsed("tcp://10.0.0.1");
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.port, 0);
    }

    #[test]
    fn test_ipv4_cidr_with_port() {
        let rule = parsed("192.168.1.0/24:8080");
        assert_eq!(rule.dest, "192.168.1.0/24");
        assert_eq!(rule.port, 8080);
        assert_eq!(rule.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_bare_ipv6() {
        let rule = parsed("fe80::1");
        assert_eq!(rule.dest, "fe80::1");
        assert!(rule.is_ipv6);
        assert_eq!(rule.port, 0);
        assert_eq!(rule.protocol, Protocol::All);
    }

    #[test]
    fn test_bracketed_ipv6_with_port() {
        let rule = parsed("[fe80::1]:8080");
        assert_eq!(rule.dest, "fe80::1");
        assert!(rule.is_ipv6);
        assert_eq!(rule.port, 8080);
        assert_eq!(rule.protocol, Protocol::Tcp);
    }

    #[test]
    fn test_bracketed_ipv6_without_port() {
        let rule = parsed("[2001:db8::1]");
        assert_eq!(rule.dest, "2001:db8::1");
        assert_eq!(rule.port, 0);
    }

    #[test]
    fn test_protocol_prefix_with_bracketed_ipv6() {
        let rule = parsed("tcp://[2001:db8::1]:443");
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.port, 443);
        assert!(rule.is_ipv6);
    }

    #[test]
    fn test_ipv6_cidr_wildcard_port() {
        let rule = parsed("[2001:db8::/32]:*");
        assert_eq!(rule.dest, "2001:db8::/32");
        assert_eq!(rule.port, 0);
        assert_eq!(rule.protocol, Protocol::All);
    }

    #[test]
    fn test_unterminated_bracket() {
        assert_eq!(parse_rule("[fe80::1"), Err(ParseError::UnterminatedBracket));
    }

    #[test]
    fn test_trailing_garbage_after_bracket() {
        assert_eq!(
            parse_rule("[fe80::1]junk"),
            Err(ParseError::TrailingInput("junk".to_string()))
        );
    }

    #[test]
    fn test_invalid_ip() {
        assert_eq!(
            parse_rule("not-an-ip"),
            Err(ParseError::InvalidIp("not-an-ip".to_string()))
        );
        assert_eq!(
            parse_rule("300.1.1.1"),
            Err(ParseError::InvalidIp("300.1.1.1".to_string()))
        );
    }

    #[test]
    fn test_family_mismatch_bracketed_v4() {
        // Brackets promise IPv6; an IPv4 literal inside is a mismatch.
        assert_eq!(
            parse_rule("[192.168.1.1]:80"),
            Err(ParseError::ExpectedIpv6("192.168.1.1".to_string()))
        );
    }

    #[test]
    fn test_port_boundaries() {
        assert_eq!(parsed("10.0.0.1:1").port, 1);
        assert_eq!(parsed("10.0.0.1:65535").port, 65535);
        assert_eq!(parse_rule("10.0.0.1:0"), Err(ParseError::PortOutOfRange(0)));
        assert_eq!(
            parse_rule("10.0.0.1:65536"),
            Err(ParseError::PortOutOfRange(65536))
        );
        assert_eq!(
            parse_rule("10.0.0.1:http"),
            Err(ParseError::InvalidPort("http".to_string()))
        );
    }

    #[test]
    fn test_ipv4_prefix_boundaries() {
        assert_eq!(parsed("0.0.0.0/0").dest, "0.0.0.0/0");
        assert_eq!(parsed("10.1.2.3/32").dest, "10.1.2.3/32");
        assert_eq!(
            parse_rule("10.0.0.0/33"),
            Err(ParseError::InvalidPrefix { prefix: 33, max: 32 })
        );
    }

    #[test]
    fn test_ipv6_prefix_boundaries() {
        assert_eq!(parsed("::/0").dest, "::/0");
        assert_eq!(parsed("[2001:db8::1/128]").dest, "2001:db8::1/128");
        assert_eq!(
            parse_rule("[2001:db8::/129]"),
            Err(ParseError::InvalidPrefix {
                prefix: 129,
                max: 128
            })
        );
    }

    #[test]
    fn test_bad_cidr() {
        assert_eq!(
            parse_rule("10.0.0.0/abc"),
            Err(ParseError::InvalidCidr("10.0.0.0/abc".to_string()))
        );
    }

    #[test]
    fn test_batch_preserves_failing_index() {
        let entries = ["192.168.1.1".to_string(), "bogus".to_string()];
        let err = parse_rules(&entries).unwrap_err();
        match err {
            Error::Rule { index, rule, .. } => {
                assert_eq!(index, 1);
                assert_eq!(rule, "bogus");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_batch_success() {
        let entries = ["*".to_string(), "tcp://10.0.0.1:22".to_string()];
        let rules = parse_rules(&entries).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(has_all_lan(&rules));
    }

    #[test]
    fn test_has_all_lan_false_for_concrete_rules() {
        let rules = vec![parsed("10.0.0.0/8"), parsed("192.168.1.1:80")];
        assert!(!has_all_lan(&rules));
    }

    #[test]
    fn test_is_ipv6_literal() {
        assert!(is_ipv6("fe80::1"));
        assert!(is_ipv6("2001:db8::2"));
        assert!(!is_ipv6("172.17.0.2"));
    }

    #[test]
    fn test_from_str_round_trip() {
        let rule: LanRule = "udp://10.1.2.3:500".parse().unwrap();
        assert_eq!(rule.protocol, Protocol::Udp);
    }

    proptest! {
        /// Any valid IPv4 address with any valid port parses and keeps both
        /// components verbatim.
        #[test]
        fn prop_ipv4_with_port(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255, port in 1u16..=65535) {
            let input = format!("{a}.{b}.{c}.{d}:{port}");
            let rule = parse_rule(&input).unwrap();
            prop_assert_eq!(rule.dest, format!("{a}.{b}.{c}.{d}"));
            prop_assert_eq!(rule.port, port);
            prop_assert_eq!(rule.protocol, Protocol::Tcp);
            prop_assert!(!rule.is_ipv6);
        }

        /// Out-of-range ports never parse.
        #[test]
        fn prop_port_out_of_range(port in 65536u32..=1_000_000) {
            let input = format!("10.0.0.1:{port}");
            prop_assert_eq!(parse_rule(&input), Err(ParseError::PortOutOfRange(port)));
        }
    }
}
