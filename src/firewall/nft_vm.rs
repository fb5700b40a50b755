//! macOS nftables-via-VM backend
//!
//! Docker Desktop and OrbStack run containers inside a Linux VM, so LAN
//! isolation still uses nftables, just not on the host. Rule fragments are
//! written to a host directory mirrored into the VM, and a long-running
//! helper container (privileged, host pid/net namespaces) loads them. The
//! helper polls the directory by content hash and also reloads on SIGHUP,
//! which apply and cleanup send via `docker exec` after commit.
//!
//! Fragments are per project rather than per container: the container ID
//! still names the table inside the fragment, but the file is keyed by
//! project path so a project restart with a new container ID supersedes its
//! old fragment instead of leaking one per run.

use std::path::PathBuf;

use tracing::info;

use super::nft::{render_ruleset, RulesetMeta};
use super::{
    project_file_name, sweep_dir, table_name, vm_helper_running, Firewall, FirewallEnv,
    PostCommitAction, VM_HELPER_CONTAINER,
};
use crate::compile::expand;
use crate::error::Result;
use crate::rules::{self, LanRule};

/// Entry script the helper container runs, installed into the helper
/// directory and bind-mounted into the container.
pub const ENTRY_SCRIPT: &str = include_str!("entry.sh");

const ENTRY_FILE_NAME: &str = "entry.sh";

pub struct NftVm {
    env: FirewallEnv,
}

impl NftVm {
    pub fn new(env: FirewallEnv) -> Self {
        Self { env }
    }

    fn rule_file(&self) -> PathBuf {
        self.env
            .paths
            .nft_dir
            .join(format!("{}.nft", project_file_name(&self.env.project_dir)))
    }

    fn entry_script_path(&self) -> PathBuf {
        self.env.paths.helper_dir.join(ENTRY_FILE_NAME)
    }

    /// Stages the entry script and its directories. Called by helper
    /// install before the container starts.
    pub fn write_entry_script(&self) -> Result<()> {
        self.env.fs.create_dir_all(&self.env.paths.nft_dir)?;
        self.env.fs.create_dir_all(&self.env.paths.helper_dir)?;
        self.env.fs.write(&self.entry_script_path(), ENTRY_SCRIPT)
    }

    /// True when the installed entry script differs from the embedded one.
    pub fn entry_script_needs_update(&self) -> bool {
        match self.env.fs.read_to_string(&self.entry_script_path()) {
            Ok(existing) => existing != ENTRY_SCRIPT,
            Err(_) => true,
        }
    }

    /// True when the helper container exists and is running.
    pub fn helper_is_running(&self) -> bool {
        vm_helper_running(self.env.cmd.as_ref())
    }

    /// Starts (or restarts) the helper container. The entry script must be
    /// committed to disk first.
    pub fn install_helper(&self) -> Result<()> {
        // Replace any previous instance; ignore "no such container"
        let _ = self
            .env
            .cmd
            .run("docker", &["rm", "-f", VM_HELPER_CONTAINER]);

        let files_dir = self
            .env
            .paths
            .nft_dir
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.env.paths.nft_dir.clone());
        let mount = format!("{}:/files", files_dir.display());

        self.env.cmd.run(
            "docker",
            &[
                "run",
                "-d",
                "--restart=always",
                "--privileged",
                "--pid=host",
                "--net=host",
                "--name",
                VM_HELPER_CONTAINER,
                "-v",
                &mount,
                "alpine:latest",
                "sh",
                "/files/lanlock_network_helper/entry.sh",
            ],
        )?;
        Ok(())
    }

    /// Stops and removes the helper container.
    pub fn uninstall_helper(&self) -> Result<()> {
        self.env
            .cmd
            .run("docker", &["rm", "-f", VM_HELPER_CONTAINER])?;
        Ok(())
    }
}

impl Firewall for NftVm {
    fn apply_rules(
        &self,
        container_id: &str,
        container_ip: &str,
        rules: &[LanRule],
    ) -> Result<PostCommitAction> {
        // All-LAN: no file, no signal, nothing at all
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
        let path = self.rule_file();
        self.env.fs.write(&path, &ruleset)?;
        info!(table, file = %path.display(), "staged VM nftables ruleset");

        Ok(PostCommitAction::SignalVmHelper)
    }

    fn cleanup(&self, _container_id: &str) -> Result<PostCommitAction> {
        let path = self.rule_file();
        if self.env.fs.exists(&path) {
            self.env.fs.remove_file(&path)?;
        }
        Ok(PostCommitAction::SignalVmHelper)
    }

    fn cleanup_stale_files(&self) -> Result<usize> {
        sweep_dir(&self.env, &self.env.paths.nft_dir, &[])
    }
}
