//! nftables batch-script rendering
//!
//! Shared by the Linux backend and the macOS VM backend, which differ only
//! in chain priority and file placement. The script uses the
//! idempotent-recreate pattern: an empty `table` declaration followed by
//! `delete table`, so the fresh create below never fails regardless of
//! prior state and `nft -f` both creates and updates atomically.

use std::fmt::Write;
use std::path::Path;

use crate::compile::{FlowMatch, Stmt};

/// Project identity embedded as header comments, read back by the stale
/// sweep.
#[derive(Debug, Clone)]
pub struct RulesetMeta<'a> {
    pub project_dir: &'a Path,
    pub project_id: &'a str,
}

/// Renders the complete batch script for one container's table.
pub fn render_ruleset(
    table: &str,
    priority: &str,
    meta: &RulesetMeta<'_>,
    stmts: &[Stmt],
) -> String {
    let mut out = String::new();

    out.push_str("#!/usr/sbin/nft -f\n");
    let _ = writeln!(out, "# Container isolation rules for table: {table}");
    let _ = writeln!(out, "# project-dir: {}", meta.project_dir.display());
    let _ = writeln!(out, "# project-id: {}", meta.project_id);
    out.push('\n');

    out.push_str("# Delete table if exists (idempotent)\n");
    let _ = writeln!(out, "table inet {table}");
    let _ = writeln!(out, "delete table inet {table}");
    out.push('\n');

    out.push_str("# Create fresh table with rules\n");
    let _ = writeln!(out, "table inet {table} {{");
    out.push_str("\tchain forward {\n");
    let _ = writeln!(
        out,
        "\t\ttype filter hook forward priority {priority}; policy accept;"
    );
    out.push('\n');
    out.push_str("\t\t# Allow established/related connections (return traffic)\n");
    out.push_str("\t\tct state established,related accept\n\n");

    let has_allows = stmts.iter().any(|s| matches!(s, Stmt::Allow(_)));
    if has_allows {
        out.push_str("\t\t# Allow rules from lan-access configuration\n");
        for stmt in stmts {
            if let Stmt::Allow(flow) = stmt {
                render_allow(&mut out, flow);
            }
        }
        out.push('\n');
    }

    out.push_str("\t\t# Block private ranges from container\n");
    for stmt in stmts {
        if let Stmt::Block { src, dst, v6 } = stmt {
            let fam = family(*v6);
            let _ = writeln!(out, "\t\t{fam} saddr {src} {fam} daddr {dst} drop");
        }
    }

    out.push_str("\t}\n}\n");
    out
}

fn family(v6: bool) -> &'static str {
    if v6 {
        "ip6"
    } else {
        "ip"
    }
}

/// One accept line. Source and destination matchers pick their family
/// independently, so cross-family allow rules render correctly.
fn render_allow(out: &mut String, flow: &FlowMatch) {
    let _ = write!(
        out,
        "\t\t{} saddr {} {} daddr {}",
        family(flow.src_v6),
        flow.src,
        family(flow.dst_v6),
        flow.dst
    );
    if let (Some(transport), Some(port)) = (flow.transport, flow.port) {
        let _ = write!(out, " {transport} dport {port}");
    }
    out.push_str(" accept\n");
}
