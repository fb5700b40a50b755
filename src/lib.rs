//! lanlock - LAN isolation for coding-assistant containers
//!
//! Blocks a container's access to the local network while leaving internet
//! access alone, driven by a small allow-list rule language.
//!
//! # Architecture
//!
//! - [`rules`] - LAN-access rule language parser
//! - [`compile`] - Expansion of parsed rules into allow/block statements
//! - [`firewall`] - Platform backends (Linux nftables, macOS pf, macOS
//!   nftables-in-VM) and the apply/cleanup lifecycle
//! - [`exec`] - External command execution with privilege elevation
//! - [`fsx`] - Filesystem staging abstraction
//!
//! # Lifecycle
//!
//! Apply and cleanup stage fragment files first and return a
//! [`firewall::PostCommitAction`] describing the privileged reload step,
//! which the caller runs once the staged writes are committed. A stale-file
//! sweep recovers from applies that died before reload and containers
//! removed behind the engine's back.

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod compile;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod fsx;
pub mod rules;

// Re-export commonly used types
pub use error::{Error, Result};
pub use firewall::{new_firewall, Firewall, FirewallEnv, Platform, PostCommitAction};
pub use rules::{parse_rule, parse_rules, LanRule, Protocol};
