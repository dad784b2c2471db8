//! Applied-rules ledger.
//!
//! Replaces "run script N by hand, remember which ones you ran" with a
//! recorded migration set: each successfully applied rule is written to
//! `<workspace>/.admin-patcher/applied.toml` together with a fingerprint of
//! its match/replacement definition. On later runs the applicator skips
//! rules whose recorded fingerprint is unchanged; editing a rule definition
//! changes the fingerprint and re-arms it.

use crate::edit::{atomic_write, EditError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const LEDGER_DIR: &str = ".admin-patcher";
const LEDGER_FILE: &str = "applied.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDoc {
    #[serde(default)]
    applied: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Rule id, unique across all rule sets
    pub id: String,
    /// Target file the rule patched (as written in the rule set)
    pub file: String,
    /// xxh3 of the rule's query + operation, hex encoded
    pub fingerprint: String,
    /// Unix timestamp of the recording run
    pub applied_at: u64,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to read ledger at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("ledger at {path} is not valid TOML: {source}")]
    Toml {
        path: PathBuf,
        source: toml_edit::de::Error,
    },

    #[error("failed to write ledger: {0}")]
    Write(#[from] EditError),
}

/// The on-disk record of applied rules for one workspace.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    doc: LedgerDoc,
}

impl Ledger {
    /// Load the workspace ledger, or start an empty one if none exists yet.
    pub fn load(workspace_root: &Path) -> Result<Self, LedgerError> {
        let path = workspace_root.join(LEDGER_DIR).join(LEDGER_FILE);

        let doc = match fs::read_to_string(&path) {
            Ok(contents) => {
                toml_edit::de::from_str(&contents).map_err(|source| LedgerError::Toml {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerDoc::default(),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        Ok(Self { path, doc })
    }

    /// True when a rule with this id and an unchanged definition has
    /// already been recorded.
    pub fn is_applied(&self, id: &str, fingerprint: &str) -> bool {
        self.doc
            .applied
            .iter()
            .any(|entry| entry.id == id && entry.fingerprint == fingerprint)
    }

    /// Look up the recorded entry for a rule id, regardless of fingerprint.
    pub fn entry(&self, id: &str) -> Option<&LedgerEntry> {
        self.doc.applied.iter().find(|entry| entry.id == id)
    }

    /// Record a rule as applied, replacing any earlier entry for the same id.
    pub fn record(&mut self, id: &str, file: &str, fingerprint: &str) {
        let applied_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.doc.applied.retain(|entry| entry.id != id);
        self.doc.applied.push(LedgerEntry {
            id: id.to_string(),
            file: file.to_string(),
            fingerprint: fingerprint.to_string(),
            applied_at,
        });
    }

    /// Persist the ledger atomically.
    pub fn save(&self) -> Result<(), LedgerError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|source| LedgerError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let serialized = toml_edit::ser::to_string_pretty(&self.doc)
            .expect("ledger document serialization is infallible");
        atomic_write(&self.path, serialized.as_bytes())?;
        Ok(())
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.doc.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.applied.is_empty()
    }

    /// Iterate recorded entries in application order.
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.doc.applied.iter()
    }
}
