//! Admin Patcher: idempotent maintenance patching for server source files
//!
//! Replaces a pile of one-shot fix scripts with an ordered set of named,
//! versioned patch rules applied by a single runner. Rules live in TOML
//! files; each pairs a match specification (literal substring, multi-line
//! regular expression, or anchor + bounded scan window) with a replacement
//! or insertion, and an applied-rules ledger records what already ran.
//!
//! # Architecture
//!
//! All operations compile down to a single primitive: [`Edit`], a verified
//! byte-span replacement. Intelligence lives in span acquisition (literal
//! and regex matchers, the anchor locator), not in the application logic.
//! Rules targeting one file fold sequentially into a single in-memory
//! buffer, written back once, atomically.
//!
//! # Safety
//!
//! - All edits verify expected before-text before applying
//! - Atomic file writes (tempfile + fsync + rename)
//! - Workspace boundary enforcement
//! - Idempotent operations: re-running a rule never corrupts content
//!
//! # Example
//!
//! ```no_run
//! use admin_patcher::{apply_rules, load_from_path, Ledger};
//! use std::path::Path;
//!
//! let workspace = Path::new("/var/www/staging/server");
//! let config = load_from_path("patches/001-fix-adminjs-href.toml")?;
//! let mut ledger = Ledger::load(workspace)?;
//!
//! for (rule_id, result) in apply_rules(&config, workspace, "1.4.2", &mut ledger) {
//!     match result {
//!         Ok(outcome) => println!("{rule_id}: {outcome}"),
//!         Err(e) => eprintln!("{rule_id}: {e}"),
//!     }
//! }
//! ledger.save()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod anchor;
pub mod config;
pub mod edit;
pub mod ledger;
pub mod matcher;
pub mod safety;

// Re-exports
pub use anchor::{AnchorError, InsertionPoint, DEFAULT_SCAN_WINDOW};
pub use config::{
    apply_rules, check_rules, load_from_path, load_from_str, matches_requirement,
    read_package_version, ApplicationError, ConfigError, PatchResult, PatchRule, Query, RuleSet,
    VersionError,
};
pub use edit::{Edit, EditError, EditResult, EditVerification};
pub use ledger::{Ledger, LedgerEntry, LedgerError};
pub use matcher::{MatcherError, SpanMatch};
pub use safety::{SafetyError, WorkspaceGuard};
