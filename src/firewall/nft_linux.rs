//! Linux nftables backend
//!
//! One table per container, persisted as `<table>.nft` under the lanlock
//! nftables directory so rules survive a reboot via an nftables.conf
//! include. Loading is a single `nft -f` of the idempotent script.

use std::path::PathBuf;

use tracing::info;

use super::nft::{render_ruleset, RulesetMeta};
use super::{sweep_dir, table_name, Firewall, FirewallEnv, PostCommitAction};
use crate::compile::expand;
use crate::error::Result;
use crate::rules::{self, LanRule};

pub struct NftLinux {
    env: FirewallEnv,
}

impl NftLinux {
    pub fn new(env: FirewallEnv) -> Self {
        Self { env }
    }

    fn rule_file(&self, container_id: &str) -> PathBuf {
        self.env
            .paths
            .nft_dir
            .join(format!("{}.nft", table_name(container_id)))
    }
}

impl Firewall for NftLinux {
    fn apply_rules(
        &self,
        container_id: &str,
        container_ip: &str,
        rules: &[LanRule],
    ) -> Result<PostCommitAction> {
        if rules::has_all_lan(rules) {
            return Ok(PostCommitAction::None);
        }

        let table = table_name(container_id);
        let stmts = expand(container_ip, rules);
        let meta = RulesetMeta {
            project_dir: &self.env.project_dir,
            project_id: &self.env.project_id,
        };
        let ruleset = render_ruleset(&table, self.env.platform.chain_priority(), &meta, &stmts);

        self.env.fs.create_dir_all(&self.env.paths.nft_dir)?;
        let path = self.rule_file(container_id);
        self.env.fs.write(&path, &ruleset)?;
        info!(table, file = %path.display(), "staged nftables ruleset");

        Ok(PostCommitAction::LoadNftFile { path })
    }

    fn cleanup(&self, container_id: &str) -> Result<PostCommitAction> {
        // Best-effort file removal; the file may never have been written
        let path = self.rule_file(container_id);
        if self.env.fs.exists(&path) {
            self.env.fs.remove_file(&path)?;
        }

        Ok(PostCommitAction::DeleteNftTable {
            table: table_name(container_id),
        })
    }

    fn cleanup_stale_files(&self) -> Result<usize> {
        sweep_dir(&self.env, &self.env.paths.nft_dir, &[])
    }
}
