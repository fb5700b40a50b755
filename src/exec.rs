//! External command execution with privilege elevation
//!
//! Ruleset application shells out to `nft`, `pfctl`, `docker`, and
//! `networksetup`. All of that goes through the [`CommandRunner`] trait so
//! backends stay testable without touching the host: production code uses
//! [`SystemRunner`], tests use [`MockCommandRunner`].
//!
//! # Elevation Strategy
//!
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Fallback**: `sudo`
//!
//! # Environment Variables
//!
//! - `LANLOCK_ELEVATION_METHOD`: Force a specific elevation method (`sudo`
//!   or `run0`). Useful for scripts with sudoers NOPASSWD rules.
//! - `LANLOCK_TEST_NO_ELEVATION`: Bypass elevation entirely (testing only).

use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `LANLOCK_ELEVATION_METHOD`
    #[error("Invalid LANLOCK_ELEVATION_METHOD '{0}'. Valid options: sudo, run0")]
    InvalidMethod(String),

    /// No elevation binary found at all
    #[error("No elevation method available - install sudo or run0")]
    NoMethodAvailable,
}

/// Abstraction over running external programs.
///
/// Both methods block until the child exits and return combined
/// stdout+stderr. A non-zero exit status maps to [`Error::Command`] with the
/// captured output, so callers can match on specific tool error text.
pub trait CommandRunner: Send + Sync {
    /// Runs a program with the invoking user's privileges.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;

    /// Runs a program with root privileges.
    fn run_elevated(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// [`CommandRunner`] backed by real processes.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!(program, ?args, "running command");
        collect_output(program, Command::new(program).args(args))
    }

    fn run_elevated(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = build_elevated_command(program, args)?;
        debug!(program, ?args, "running elevated command");
        collect_output(program, &mut cmd)
    }
}

fn collect_output(program: &str, cmd: &mut Command) -> Result<String> {
    let output = cmd.output()?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(text)
    } else {
        Err(Error::Command {
            program: program.to_string(),
            output: text,
            code: output.status.code(),
        })
    }
}

/// Checks if a binary exists in PATH.
pub(crate) fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Builds a command that runs `program` with root privileges.
fn build_elevated_command(
    program: &str,
    args: &[&str],
) -> std::result::Result<Command, ElevationError> {
    // 1. Strict test mode override (highest priority)
    if std::env::var("LANLOCK_TEST_NO_ELEVATION").is_ok() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 2. Direct root execution (no prompt needed)
    if nix::unistd::getuid().is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("LANLOCK_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" => {
                    if !binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    let mut cmd = Command::new(&method);
                    cmd.arg(program).args(args);
                    Ok(cmd)
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection - prefer run0 (modern, no SUID), fall back to sudo
    for helper in ["run0", "sudo"] {
        if binary_exists(helper) {
            let mut cmd = Command::new(helper);
            cmd.arg(program).args(args);
            return Ok(cmd);
        }
    }

    Err(ElevationError::NoMethodAvailable)
}

/// Scripted [`CommandRunner`] for tests.
///
/// Expectations are keyed by `"program arg1 arg2 ..."`. Unexpected commands
/// succeed with empty output by default, so tests only script the commands
/// they care about. Every invocation is recorded for later assertions.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    expectations: std::sync::Mutex<std::collections::HashMap<String, Result<String>>>,
    calls: std::sync::Mutex<Vec<String>>,
}

impl MockCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(program: &str, args: &[&str]) -> String {
        let mut key = program.to_string();
        for arg in args {
            key.push(' ');
            key.push_str(arg);
        }
        key
    }

    /// Scripts a command to succeed with the given output.
    pub fn expect_success(&self, command_line: &str, output: &str) {
        self.expectations
            .lock()
            .unwrap()
            .insert(command_line.to_string(), Ok(output.to_string()));
    }

    /// Scripts a command to fail with the given output.
    pub fn expect_failure(&self, command_line: &str, output: &str) {
        let program = command_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        self.expectations.lock().unwrap().insert(
            command_line.to_string(),
            Err(Error::Command {
                program,
                output: output.to_string(),
                code: Some(1),
            }),
        );
    }

    /// Returns all command lines run so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Asserts that a command line was run at least once.
    ///
    /// # Panics
    ///
    /// Panics when the command was never run.
    pub fn assert_called(&self, command_line: &str) {
        let calls = self.calls();
        assert!(
            calls.iter().any(|c| c == command_line),
            "expected command {command_line:?} to have run; saw: {calls:#?}"
        );
    }

    fn dispatch(&self, program: &str, args: &[&str]) -> Result<String> {
        let key = Self::key(program, args);
        self.calls.lock().unwrap().push(key.clone());

        match self.expectations.lock().unwrap().get(&key) {
            Some(Ok(output)) => Ok(output.clone()),
            Some(Err(Error::Command {
                program,
                output,
                code,
            })) => Err(Error::Command {
                program: program.clone(),
                output: output.clone(),
                code: *code,
            }),
            Some(Err(_)) | None => Ok(String::new()),
        }
    }
}

impl CommandRunner for MockCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        self.dispatch(program, args)
    }

    fn run_elevated(&self, program: &str, args: &[&str]) -> Result<String> {
        self.dispatch(program, args)
    }
}
