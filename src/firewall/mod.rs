//! Firewall backends and the apply/cleanup lifecycle
//!
//! Three backends share one lifecycle protocol:
//!
//! - [`nft_linux::NftLinux`]: per-container nftables tables on Linux
//! - [`pf::Pf`]: pf anchor fragments on macOS
//! - [`nft_vm::NftVm`]: nftables inside the container runtime VM on macOS,
//!   reloaded by a helper container watching a mirrored directory
//!
//! Every operation follows write-then-load: fragments are staged through
//! [`StagedFs`] first, and the privileged reload step comes back to the
//! caller as a [`PostCommitAction`] to run only after the staged writes are
//! durably committed. Re-applying always regenerates the whole ruleset; the
//! compiled text is a pure function of its inputs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::fsx::StagedFs;
use crate::rules::LanRule;

pub mod nft;
pub mod nft_linux;
pub mod nft_vm;
pub mod pf;

/// Prefix for per-container nftables table names.
pub const TABLE_PREFIX: &str = "lanlock-";

/// Name of the pf anchor holding all fragments.
pub const PF_ANCHOR_NAME: &str = "lanlock";

/// Reserved pf fragment filename for shared translation rules.
///
/// Project fragments start with `0`/`1` prefixes or `-`, all of which sort
/// before `_`, so project rules always load before the shared file.
pub const SHARED_RULE_FILE: &str = "_shared";

/// Name of the helper container running nftables inside the VM.
pub const VM_HELPER_CONTAINER: &str = "lanlock-network-helper";

/// Per-project state directory name (holds `state.json`).
pub const STATE_DIR_NAME: &str = ".lanlock";

/// Platform and hypervisor the firewall targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Platform {
    #[strum(serialize = "linux")]
    Linux,
    #[strum(serialize = "mac-orbstack")]
    MacOrbStack,
    #[strum(serialize = "mac-docker-desktop")]
    MacDockerDesktop,
}

impl Platform {
    /// Forward-chain priority placing our rules just before the container
    /// runtime's own forwarding rules. OrbStack installs its chain at
    /// `filter - 1`, so ours must sit one earlier.
    pub fn chain_priority(self) -> &'static str {
        match self {
            Self::Linux | Self::MacDockerDesktop => "filter - 1",
            Self::MacOrbStack => "filter - 2",
        }
    }

    pub fn is_darwin(self) -> bool {
        matches!(self, Self::MacOrbStack | Self::MacDockerDesktop)
    }

    /// Detects the current platform from the OS and hypervisor signals.
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            if crate::exec::binary_exists("orbctl") {
                Self::MacOrbStack
            } else {
                Self::MacDockerDesktop
            }
        } else {
            Self::Linux
        }
    }
}

/// Filesystem locations the backends write to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// nftables fragment directory. On Linux this is a system path included
    /// from nftables.conf; on macOS it is mirrored into the VM as
    /// `/files/lanlock_nft`.
    pub nft_dir: PathBuf,
    /// pf anchor fragment directory (macOS only).
    pub anchor_dir: PathBuf,
    /// Directory holding the VM helper's entry script (macOS only).
    pub helper_dir: PathBuf,
}

impl Paths {
    /// Standard system locations for one platform.
    pub fn system(platform: Platform) -> Result<Self> {
        if platform.is_darwin() {
            let base = directories::BaseDirs::new().ok_or_else(|| {
                Error::Internal("cannot determine home directory".to_string())
            })?;
            let files = base.home_dir().join(STATE_DIR_NAME).join("files");
            Ok(Self {
                nft_dir: files.join("lanlock_nft"),
                anchor_dir: PathBuf::from("/etc/pf.anchors/lanlock"),
                helper_dir: files.join("lanlock_network_helper"),
            })
        } else {
            Ok(Self {
                nft_dir: PathBuf::from("/etc/nftables.d/lanlock"),
                anchor_dir: PathBuf::new(),
                helper_dir: PathBuf::new(),
            })
        }
    }

    /// All paths relocated under one root, for tests.
    pub fn under_root(root: &Path) -> Self {
        Self {
            nft_dir: root.join("nft"),
            anchor_dir: root.join("anchors"),
            helper_dir: root.join("helper"),
        }
    }
}

/// Shared dependencies for one firewall instance.
#[derive(Clone)]
pub struct FirewallEnv {
    pub fs: Arc<dyn StagedFs>,
    pub cmd: Arc<dyn CommandRunner>,
    pub paths: Paths,
    pub project_dir: PathBuf,
    pub project_id: String,
    pub platform: Platform,
}

impl FirewallEnv {
    pub fn new(
        fs: Arc<dyn StagedFs>,
        cmd: Arc<dyn CommandRunner>,
        paths: Paths,
        project_dir: PathBuf,
        project_id: String,
        platform: Platform,
    ) -> Self {
        Self {
            fs,
            cmd,
            paths,
            project_dir,
            project_id,
            platform,
        }
    }
}

/// Privileged step of a two-phase apply or cleanup.
///
/// Phase 1 stages fragment files through [`StagedFs`] and returns one of
/// these; phase 2 is `run`, invoked by the caller only after the staged
/// writes are committed to disk. Running the action never touches the
/// fragment files again, only the firewall tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCommitAction {
    /// Nothing to activate (the all-LAN short circuit).
    None,
    /// Load one nftables batch script via `nft -f`.
    LoadNftFile { path: PathBuf },
    /// Delete one nftables table; "does not exist" counts as success.
    DeleteNftTable { table: String },
    /// Reload the pf anchor from all fragments.
    ReloadPfAnchor { anchor_dir: PathBuf },
    /// Reload the pf anchor, flushing it when no fragments remain.
    FlushOrReloadPfAnchor { anchor_dir: PathBuf },
    /// Ask the VM helper container to reload nftables rules.
    SignalVmHelper,
}

impl PostCommitAction {
    /// Runs the privileged step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Command`] with captured output when the underlying
    /// tool fails, or [`Error::HelperNotInstalled`] when the VM helper
    /// container is required but not running.
    pub fn run(&self, cmd: &dyn CommandRunner) -> Result<()> {
        match self {
            Self::None => Ok(()),
            Self::LoadNftFile { path } => {
                cmd.run_elevated("nft", &["-f", &path.to_string_lossy()])?;
                Ok(())
            }
            Self::DeleteNftTable { table } => delete_nft_table(cmd, table),
            Self::ReloadPfAnchor { anchor_dir } => {
                let mutex = lock_shared_resource(anchor_dir);
                let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
                let script = format!(
                    "cat {}/* 2>/dev/null | pfctl -a {PF_ANCHOR_NAME} -f -",
                    anchor_dir.display()
                );
                cmd.run_elevated("sh", &["-c", &script])?;
                Ok(())
            }
            Self::FlushOrReloadPfAnchor { anchor_dir } => {
                let mutex = lock_shared_resource(anchor_dir);
                let _guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
                // Fallback flush covers the last-fragment-removed case where
                // cat finds nothing and pfctl rejects the empty input.
                let script = format!(
                    "cat {dir}/* 2>/dev/null | pfctl -a {PF_ANCHOR_NAME} -f - || pfctl -a {PF_ANCHOR_NAME} -F all",
                    dir = anchor_dir.display()
                );
                cmd.run_elevated("sh", &["-c", &script])?;
                Ok(())
            }
            Self::SignalVmHelper => {
                if !vm_helper_running(cmd) {
                    return Err(Error::HelperNotInstalled);
                }
                cmd.run("docker", &["exec", VM_HELPER_CONTAINER, "sh", "-c", "kill -HUP 1"])?;
                Ok(())
            }
        }
    }
}

/// Deletes an nftables table, treating "does not exist" as success so
/// cleanup stays idempotent.
fn delete_nft_table(cmd: &dyn CommandRunner, table: &str) -> Result<()> {
    match cmd.run_elevated("nft", &["delete", "table", "inet", table]) {
        Ok(_) => Ok(()),
        Err(Error::Command { output, .. }) if output.contains("No such file or directory") => {
            debug!(table, "table already absent during cleanup");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Checks whether the VM helper container exists and is running.
pub(crate) fn vm_helper_running(cmd: &dyn CommandRunner) -> bool {
    cmd.run(
        "docker",
        &["inspect", "--format", "{{.State.Running}}", VM_HELPER_CONTAINER],
    )
    .map(|out| out.trim() == "true")
    .unwrap_or(false)
}

/// Interprocess-unsafe but in-process lock over the aggregated pf anchor,
/// keyed by its directory path. Concurrent reloads of the same anchor would
/// otherwise race on the shared `pfctl -f -` load.
fn lock_shared_resource(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let locks = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = match locks.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
    };
    Arc::clone(map.entry(path.to_path_buf()).or_default())
}

/// Lifecycle operations every backend implements.
///
/// Apply is idempotent while active: it regenerates and reloads rather than
/// diffing. A rule set containing the all-LAN wildcard short-circuits apply
/// to a no-op.
pub trait Firewall {
    /// Stages isolation rules for a container and returns the activation
    /// step to run after commit.
    fn apply_rules(
        &self,
        container_id: &str,
        container_ip: &str,
        rules: &[LanRule],
    ) -> Result<PostCommitAction>;

    /// Stages removal of a container's rules. Never fails on already-gone
    /// resources.
    fn cleanup(&self, container_id: &str) -> Result<PostCommitAction>;

    /// Removes fragments whose recorded project no longer exists. Returns
    /// the number of files removed.
    fn cleanup_stale_files(&self) -> Result<usize>;
}

/// Picks the backend for the environment's platform. On macOS the VM
/// backend is used when its helper container is running, otherwise pf.
pub fn new_firewall(env: FirewallEnv) -> Box<dyn Firewall> {
    match env.platform {
        Platform::Linux => Box::new(nft_linux::NftLinux::new(env)),
        Platform::MacOrbStack | Platform::MacDockerDesktop => {
            if vm_helper_running(env.cmd.as_ref()) {
                Box::new(nft_vm::NftVm::new(env))
            } else {
                Box::new(pf::Pf::new(env))
            }
        }
    }
}

/// First 12 characters of a container ID, the standard Docker short form.
pub fn short_container_id(container_id: &str) -> &str {
    if container_id.len() > 12 {
        &container_id[..12]
    } else {
        container_id
    }
}

/// nftables table name for a container.
pub fn table_name(container_id: &str) -> String {
    format!("{TABLE_PREFIX}{}", short_container_id(container_id))
}

/// Converts a project path to a flat filename, `/Users/alice/proj` becoming
/// `-Users-alice-proj`.
pub fn project_file_name(project_dir: &Path) -> String {
    project_dir.to_string_lossy().replace('/', "-")
}

/// Persistent per-project identity stored in `<dir>/.lanlock/state.json`.
///
/// Fragment files record this ID so the stale sweep can tell a renamed
/// project apart from a live one that moved.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
}

fn state_file(project_dir: &Path) -> PathBuf {
    project_dir.join(STATE_DIR_NAME).join("state.json")
}

/// Reads a project's recorded ID, if any.
pub fn read_project_id(fs: &dyn StagedFs, project_dir: &Path) -> Option<String> {
    let content = fs.read_to_string(&state_file(project_dir)).ok()?;
    let state: ProjectState = serde_json::from_str(&content).ok()?;
    Some(state.project_id)
}

/// Reads the project ID, creating and persisting a fresh one when absent.
pub fn load_or_create_project_id(fs: &dyn StagedFs, project_dir: &Path) -> Result<String> {
    if let Some(id) = read_project_id(fs, project_dir) {
        return Ok(id);
    }
    let state = ProjectState {
        project_id: uuid::Uuid::new_v4().to_string(),
    };
    let path = state_file(project_dir);
    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent)?;
    }
    fs.write(&path, &serde_json::to_string(&state)?)?;
    Ok(state.project_id)
}

/// Identity a fragment file records about its owning project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FragmentMeta {
    pub project_dir: PathBuf,
    pub project_id: String,
}

/// Extracts `# project-dir:` and `# project-id:` header comments from a
/// fragment. Returns `None` when no project dir is recorded (foreign file).
pub(crate) fn parse_fragment_meta(content: &str) -> Option<FragmentMeta> {
    let mut project_dir = None;
    let mut project_id = String::new();
    for line in content.lines() {
        if let Some(dir) = line.strip_prefix("# project-dir: ") {
            project_dir = Some(PathBuf::from(dir.trim()));
        } else if let Some(id) = line.strip_prefix("# project-id: ") {
            project_id = id.trim().to_string();
        }
    }
    project_dir.map(|project_dir| FragmentMeta {
        project_dir,
        project_id,
    })
}

/// Decides whether a fragment's recorded project is gone.
///
/// Stale when the recorded directory no longer exists, or when it exists
/// but its state file records a different project ID (the directory was
/// recreated or renamed over). An unreadable or missing state file keeps
/// the fragment: staleness must be provable, not assumed.
pub(crate) fn is_stale_project(fs: &dyn StagedFs, meta: &FragmentMeta) -> bool {
    if !fs.is_dir(&meta.project_dir) {
        return true;
    }
    if meta.project_id.is_empty() {
        return false;
    }
    match read_project_id(fs, &meta.project_dir) {
        Some(current) => current != meta.project_id,
        None => false,
    }
}

/// Sweeps one fragment directory, removing files whose recorded project is
/// stale. Files named in `skip` and files without fragment headers are left
/// alone.
pub(crate) fn sweep_dir(env: &FirewallEnv, dir: &Path, skip: &[&str]) -> Result<usize> {
    if !env.fs.is_dir(dir) {
        return Ok(0);
    }

    let mut removed = 0;
    for path in env.fs.read_dir(dir)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if skip.contains(&name.as_str()) {
            continue;
        }

        let Ok(content) = env.fs.read_to_string(&path) else {
            continue;
        };
        let Some(meta) = parse_fragment_meta(&content) else {
            continue;
        };

        if is_stale_project(env.fs.as_ref(), &meta) {
            warn!(file = %path.display(), project = %meta.project_dir.display(), "removing stale rule file");
            env.fs.remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
