//! macOS packet-filter backend
//!
//! pf evaluates rules top to bottom and the last match wins unless a rule
//! is marked `quick`, which stops evaluation at the first match. Every rule
//! emitted here is `quick`, so allow rules are always written before block
//! rules; the ordering is load-bearing.
//!
//! Each project owns two fragment files under the anchor directory, named
//! with ordering prefixes so that `cat dir/*` yields valid pf input: `0nat`
//! (translation) fragments sort before `1filter` (pass/block) fragments,
//! matching pf's requirement that all translation rules precede all filter
//! rules. Reload always concatenates every fragment and loads the whole
//! anchor in one pass, never a single fragment alone.
//!
//! OrbStack shares a NAT'd subnet with the host, so this backend also owns
//! translation policy per container: broad NAT when all LAN access is
//! allowed, selective NAT plus a no-translate catch-all for a whitelist,
//! and the catch-all alone when nothing is allowed. Docker Desktop does its
//! own NAT, so it gets filter fragments only.

use std::fmt::Write;
use std::path::PathBuf;

use tracing::info;

use super::{
    project_file_name, sweep_dir, Firewall, FirewallEnv, PostCommitAction, SHARED_RULE_FILE,
};
use crate::compile::{expand, FlowMatch, PortSpec, Stmt};
use crate::error::Result;
use crate::rules::{self, LanRule};

/// Filename prefix for NAT/translation fragments.
pub const NAT_RULE_PREFIX: &str = "0nat";
/// Filename prefix for filter fragments.
pub const FILTER_RULE_PREFIX: &str = "1filter";

pub struct Pf {
    env: FirewallEnv,
}

impl Pf {
    pub fn new(env: FirewallEnv) -> Self {
        Self { env }
    }

    fn nat_rule_file(&self) -> PathBuf {
        self.env.paths.anchor_dir.join(format!(
            "{NAT_RULE_PREFIX}{}",
            project_file_name(&self.env.project_dir)
        ))
    }

    fn filter_rule_file(&self) -> PathBuf {
        self.env.paths.anchor_dir.join(format!(
            "{FILTER_RULE_PREFIX}{}",
            project_file_name(&self.env.project_dir)
        ))
    }

    fn header(&self, container_id: &str, container_ip: &str) -> String {
        format!(
            "# Container: {container_id} ({container_ip})\n# project-dir: {}\n# project-id: {}\n",
            self.env.project_dir.display(),
            self.env.project_id
        )
    }

    /// Writes a fragment, or removes it when the content is empty so a
    /// superseded policy does not leave a stale file behind.
    fn write_or_remove(&self, path: &PathBuf, content: &str) -> Result<()> {
        if content.is_empty() {
            if self.env.fs.exists(path) {
                self.env.fs.remove_file(path)?;
            }
            return Ok(());
        }
        self.env.fs.write(path, content)
    }

    /// Physical interfaces NAT rules bind to, from
    /// `networksetup -listallhardwareports` "Device:" lines.
    fn physical_interfaces(&self) -> Vec<String> {
        let Ok(output) = self.env.cmd.run("networksetup", &["-listallhardwareports"]) else {
            return Vec::new();
        };
        output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("Device:"))
            .map(|dev| dev.trim().to_string())
            .filter(|dev| !dev.is_empty())
            .collect()
    }
}

impl Firewall for Pf {
    fn apply_rules(
        &self,
        container_id: &str,
        container_ip: &str,
        rules: &[LanRule],
    ) -> Result<PostCommitAction> {
        let all_lan = rules::has_all_lan(rules);
        let is_orbstack = matches!(self.env.platform, super::Platform::MacOrbStack);

        // Docker Desktop with all LAN allowed: nothing to enforce, just
        // drop any fragments a previous policy left behind
        if all_lan && !is_orbstack {
            let had_files =
                self.env.fs.exists(&self.nat_rule_file()) || self.env.fs.exists(&self.filter_rule_file());
            self.write_or_remove(&self.nat_rule_file(), "")?;
            self.write_or_remove(&self.filter_rule_file(), "")?;
            if had_files {
                return Ok(PostCommitAction::ReloadPfAnchor {
                    anchor_dir: self.env.paths.anchor_dir.clone(),
                });
            }
            return Ok(PostCommitAction::None);
        }

        let header = self.header(container_id, container_ip);
        let stmts = expand(container_ip, rules);

        let nat_content = if is_orbstack {
            let interfaces = self.physical_interfaces();
            if interfaces.is_empty() {
                String::new()
            } else {
                let mut out = header.clone();
                render_nat(&mut out, container_ip, all_lan, &stmts, &interfaces);
                out
            }
        } else {
            String::new()
        };

        let filter_content = if all_lan {
            String::new()
        } else {
            let mut out = header;
            render_filter(&mut out, &stmts);
            out
        };

        self.env.fs.create_dir_all(&self.env.paths.anchor_dir)?;
        // Reserved shared fragment; sorts after project fragments so their
        // rules take precedence
        self.env.fs.write(
            &self.env.paths.anchor_dir.join(SHARED_RULE_FILE),
            "# Shared rules (NAT handled per-container in project files)\n",
        )?;
        self.write_or_remove(&self.nat_rule_file(), &nat_content)?;
        self.write_or_remove(&self.filter_rule_file(), &filter_content)?;
        info!(container = container_id, "staged pf fragments");

        Ok(PostCommitAction::ReloadPfAnchor {
            anchor_dir: self.env.paths.anchor_dir.clone(),
        })
    }

    fn cleanup(&self, _container_id: &str) -> Result<PostCommitAction> {
        for path in [self.nat_rule_file(), self.filter_rule_file()] {
            if self.env.fs.exists(&path) {
                self.env.fs.remove_file(&path)?;
            }
        }
        Ok(PostCommitAction::FlushOrReloadPfAnchor {
            anchor_dir: self.env.paths.anchor_dir.clone(),
        })
    }

    fn cleanup_stale_files(&self) -> Result<usize> {
        sweep_dir(&self.env, &self.env.paths.anchor_dir, &[SHARED_RULE_FILE])
    }
}

/// Renders pass and block rules, allows strictly before blocks.
fn render_filter(out: &mut String, stmts: &[Stmt]) {
    let mut wrote_allow = false;
    for stmt in stmts {
        if let Stmt::Allow(flow) = stmt {
            if !wrote_allow {
                out.push_str("# Allow specific lan-access entries\n");
                wrote_allow = true;
            }
            render_pass(out, flow);
        }
    }
    if wrote_allow {
        out.push('\n');
    }

    out.push_str("# Block private ranges\n");
    for stmt in stmts {
        if let Stmt::Block { src, dst, .. } = stmt {
            let _ = writeln!(out, "block drop quick from {src} to {dst}");
        }
    }
}

/// One pass rule: `pass quick [proto P] from SRC to DST [port N]`. The
/// proto keyword goes before from/to; a full-range port spec is written as
/// no port clause at all.
fn render_pass(out: &mut String, flow: &FlowMatch) {
    out.push_str("pass quick");
    if let Some(transport) = flow.transport {
        let _ = write!(out, " proto {transport}");
    }
    let _ = write!(out, " from {} to {}", flow.src, flow.dst);
    if let Some(PortSpec::Single(port)) = flow.port {
        let _ = write!(out, " port {port}");
    }
    out.push('\n');
}

/// Renders the NAT policy for one container.
fn render_nat(
    out: &mut String,
    container_ip: &str,
    all_lan: bool,
    stmts: &[Stmt],
    interfaces: &[String],
) {
    if all_lan {
        out.push_str("# Broad NAT for all LAN access\n");
        for iface in interfaces {
            let _ = writeln!(out, "nat on {iface} from {container_ip} to any -> ({iface})");
        }
        out.push('\n');
        return;
    }

    let allows: Vec<&FlowMatch> = stmts
        .iter()
        .filter_map(|s| match s {
            Stmt::Allow(flow) => Some(flow),
            Stmt::Block { .. } => None,
        })
        .collect();

    if allows.is_empty() {
        out.push_str("# No LAN access: block all NAT for this container\n");
        let _ = writeln!(out, "no nat from {container_ip} to any");
        return;
    }

    out.push_str("# Selective NAT for whitelisted destinations\n");
    for flow in &allows {
        for iface in interfaces {
            render_nat_rule(out, iface, flow);
        }
    }
    out.push('\n');
    out.push_str("# Catch-all: prevent other traffic from being NAT'd\n");
    let _ = writeln!(out, "no nat from {container_ip} to any");
}

fn render_nat_rule(out: &mut String, iface: &str, flow: &FlowMatch) {
    let _ = write!(out, "nat on {iface}");
    if let Some(transport) = flow.transport {
        let _ = write!(out, " proto {transport}");
    }
    let _ = write!(out, " from {} to {}", flow.src, flow.dst);
    if let Some(PortSpec::Single(port)) = flow.port {
        let _ = write!(out, " port {port}");
    }
    let _ = writeln!(out, " -> ({iface})");
}
