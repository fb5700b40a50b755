//! lanlock - LAN isolation for coding-assistant containers
//!
//! Compiles a small allow-list rule language into per-platform firewall
//! rulesets and manages their lifecycle: apply, cleanup, and stale-file
//! recovery.
//!
//! # Usage
//!
//! ```bash
//! # Preview the compiled ruleset without touching the system
//! lanlock compile --container-id c1 --container-ip 172.17.0.2 \
//!     --rule "tcp://192.168.1.100:8080" --rule "10.0.0.0/8"
//!
//! # Stage and load isolation rules for a running container
//! lanlock apply --container-id c1 --container-ip 172.17.0.2 \
//!     --rule "udp://192.168.1.50:53"
//!
//! # Remove a container's rules
//! lanlock cleanup --container-id c1
//!
//! # Remove rule files whose project no longer exists
//! lanlock sweep
//! ```
//!
//! # Security
//!
//! Runs as an unprivileged user; only the final load/reload step elevates
//! (run0 preferred, sudo fallback). Rule files are staged before any
//! privileged command runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lanlock::error::Result;
use lanlock::exec::SystemRunner;
use lanlock::firewall::{
    self, load_or_create_project_id, new_firewall, FirewallEnv, Paths, Platform,
};
use lanlock::fsx::DirectFs;
use lanlock::rules::parse_rules;

#[derive(Parser)]
#[command(name = "lanlock")]
#[command(about = "LAN isolation for coding-assistant containers", long_about = None)]
struct Cli {
    /// Project directory the container belongs to (defaults to cwd)
    #[arg(long, global = true, value_name = "DIR")]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compiled ruleset without applying it
    Compile {
        #[arg(long)]
        container_id: String,
        #[arg(long)]
        container_ip: String,
        /// LAN-access rule, repeatable
        #[arg(long = "rule", value_name = "RULE")]
        rules: Vec<String>,
    },
    /// Stage and load isolation rules for a container
    Apply {
        #[arg(long)]
        container_id: String,
        #[arg(long)]
        container_ip: String,
        /// LAN-access rule, repeatable
        #[arg(long = "rule", value_name = "RULE")]
        rules: Vec<String>,
    },
    /// Remove a container's rules
    Cleanup {
        #[arg(long)]
        container_id: String,
    },
    /// Remove rule files for projects that no longer exist
    Sweep,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let platform = Platform::detect();
    let fs = Arc::new(DirectFs::new());
    let cmd = Arc::new(SystemRunner::new());

    // Compile is a pure preview; only the mutating commands mint an ID
    let project_id = if matches!(cli.command, Commands::Compile { .. }) {
        firewall::read_project_id(fs.as_ref(), &project_dir).unwrap_or_default()
    } else {
        load_or_create_project_id(fs.as_ref(), &project_dir)?
    };
    let env = FirewallEnv::new(
        fs,
        Arc::clone(&cmd) as Arc<dyn lanlock::exec::CommandRunner>,
        Paths::system(platform)?,
        project_dir,
        project_id,
        platform,
    );

    match cli.command {
        Commands::Compile {
            container_id,
            container_ip,
            rules,
        } => {
            let parsed = parse_rules(&rules)?;
            let stmts = lanlock::compile::expand(&container_ip, &parsed);
            let meta = firewall::nft::RulesetMeta {
                project_dir: &env.project_dir,
                project_id: &env.project_id,
            };
            let ruleset = firewall::nft::render_ruleset(
                &firewall::table_name(&container_id),
                platform.chain_priority(),
                &meta,
                &stmts,
            );
            print!("{ruleset}");
            Ok(())
        }
        Commands::Apply {
            container_id,
            container_ip,
            rules,
        } => {
            let parsed = parse_rules(&rules)?;
            let fw = new_firewall(env);
            // No outer transaction here, so commit is immediate and the
            // deferred step runs right after staging
            let action = fw.apply_rules(&container_id, &container_ip, &parsed)?;
            action.run(cmd.as_ref())?;
            println!("Applied isolation rules for {container_id}");
            Ok(())
        }
        Commands::Cleanup { container_id } => {
            let fw = new_firewall(env);
            let action = fw.cleanup(&container_id)?;
            action.run(cmd.as_ref())?;
            println!("Removed isolation rules for {container_id}");
            Ok(())
        }
        Commands::Sweep => {
            let fw = new_firewall(env);
            let removed = fw.cleanup_stale_files()?;
            println!("Removed {removed} stale rule file(s)");
            Ok(())
        }
    }
}
