//! Rule applicator - applies patch rules with idempotency checks
//!
//! This module provides high-level rule application that:
//! - Filters rule sets by the target server's version
//! - Skips rules already recorded in the applied-rules ledger
//! - Evaluates each rule against in-memory content, sequentially and in
//!   declared order (later rules may match text produced by earlier ones)
//! - Writes each target file once, atomically, after all its rules ran
//! - Reports detailed results for each rule

use crate::anchor;
use crate::config::schema::{Operation, PatchRule, Query, RuleSet};
use crate::config::version::{matches_requirement, VersionError};
use crate::edit::{atomic_write, splice_all, Edit, EditError};
use crate::ledger::Ledger;
use crate::matcher::{self, SpanMatch};
use crate::safety::WorkspaceGuard;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of applying a single rule
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchResult should be checked for success/failure"]
pub enum PatchResult {
    /// Rule was applied; `replacements` spans changed
    Applied { file: PathBuf, replacements: usize },
    /// Target already holds the rule's output (idempotent check passed)
    AlreadyApplied { file: PathBuf },
    /// Rule was skipped due to a version constraint
    SkippedVersion { reason: String },
    /// Rule was skipped because the ledger records it as applied
    SkippedLedger { reason: String },
    /// Rule found nothing to patch and nothing already patched
    Failed { file: PathBuf, reason: String },
}

impl fmt::Display for PatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchResult::Applied { file, replacements } => {
                write!(
                    f,
                    "Applied {} replacement(s) to {}",
                    replacements,
                    file.display()
                )
            }
            PatchResult::AlreadyApplied { file } => {
                write!(f, "Already applied to {}", file.display())
            }
            PatchResult::SkippedVersion { reason } => {
                write!(f, "Skipped (version): {}", reason)
            }
            PatchResult::SkippedLedger { reason } => {
                write!(f, "Skipped (ledger): {}", reason)
            }
            PatchResult::Failed { file, reason } => {
                write!(f, "Failed on {}: {}", file.display(), reason)
            }
        }
    }
}

/// Errors during rule application
#[derive(Debug)]
pub enum ApplicationError {
    /// Version filtering error
    Version(VersionError),
    /// Target artifact unreadable or unwritable (fatal per rule)
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Edit application error
    Edit(EditError),
    /// Target path escapes the workspace or names a forbidden directory
    Safety { path: PathBuf, reason: String },
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::Version(e) => write!(f, "version error: {}", e),
            ApplicationError::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            ApplicationError::Edit(e) => write!(f, "edit error: {}", e),
            ApplicationError::Safety { path, reason } => {
                write!(f, "unsafe target {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for ApplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApplicationError::Version(e) => Some(e),
            ApplicationError::Io { source, .. } => Some(source),
            ApplicationError::Edit(e) => Some(e),
            ApplicationError::Safety { .. } => None,
        }
    }
}

impl From<VersionError> for ApplicationError {
    fn from(e: VersionError) -> Self {
        ApplicationError::Version(e)
    }
}

impl From<EditError> for ApplicationError {
    fn from(e: EditError) -> Self {
        ApplicationError::Edit(e)
    }
}

type RuleResults = Vec<(String, Result<PatchResult, ApplicationError>)>;

/// Apply a rule set to a server workspace.
///
/// Applied and already-applied rules are recorded in the ledger (in
/// memory; the caller persists it with [`Ledger::save`]).
///
/// # Returns
///
/// A vector of results, one per rule, in the rule set's declared order.
pub fn apply_rules(
    config: &RuleSet,
    workspace_root: &Path,
    server_version: &str,
    ledger: &mut Ledger,
) -> RuleResults {
    match matches_requirement(server_version, config.meta.version_range.as_deref()) {
        Ok(true) => {
            let results = run_rules(config, workspace_root, ledger, Mode::Apply);
            for (id, result) in &results {
                if matches!(
                    result,
                    Ok(PatchResult::Applied { .. }) | Ok(PatchResult::AlreadyApplied { .. })
                ) {
                    if let Some(rule) = config.rules.iter().find(|r| r.id == *id) {
                        ledger.record(&rule.id, &rule.file, &rule.fingerprint());
                    }
                }
            }
            results
        }
        Ok(false) => all_skipped_version(config, server_version),
        Err(e) => all_version_errors(config, e),
    }
}

/// Check rule status without mutating the workspace or the ledger.
///
/// Mirrors `apply_rules` result semantics: `Applied` means "would apply".
pub fn check_rules(
    config: &RuleSet,
    workspace_root: &Path,
    server_version: &str,
    ledger: &Ledger,
) -> RuleResults {
    match matches_requirement(server_version, config.meta.version_range.as_deref()) {
        Ok(true) => run_rules(config, workspace_root, ledger, Mode::Check),
        Ok(false) => all_skipped_version(config, server_version),
        Err(e) => all_version_errors(config, e),
    }
}

fn all_skipped_version(config: &RuleSet, server_version: &str) -> RuleResults {
    let req = config.meta.version_range.as_deref().unwrap_or("").trim();
    let reason = format!("server version {server_version} does not satisfy version_range {req}");
    config
        .rules
        .iter()
        .map(|rule| {
            (
                rule.id.clone(),
                Ok(PatchResult::SkippedVersion {
                    reason: reason.clone(),
                }),
            )
        })
        .collect()
}

fn all_version_errors(config: &RuleSet, e: VersionError) -> RuleResults {
    config
        .rules
        .iter()
        .map(|rule| (rule.id.clone(), Err(ApplicationError::Version(e.clone()))))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apply,
    Check,
}

/// Evaluate all rules, grouped by target file, in declared order.
fn run_rules(
    config: &RuleSet,
    workspace_root: &Path,
    ledger: &Ledger,
    mode: Mode,
) -> RuleResults {
    // Group rules by resolved file path, preserving first-appearance order
    // of files and declared order of rules within each file.
    let mut groups: Vec<(PathBuf, Vec<&PatchRule>)> = Vec::new();
    for rule in &config.rules {
        let file_path = if config.meta.workspace_relative {
            workspace_root.join(&rule.file)
        } else {
            PathBuf::from(&rule.file)
        };
        match groups.iter_mut().find(|(path, _)| *path == file_path) {
            Some((_, rules)) => rules.push(rule),
            None => groups.push((file_path, vec![rule])),
        }
    }

    // Workspace-relative sets may never reach outside the checkout or into
    // node_modules/dist/build/.git, symlinks included.
    let guard = if config.meta.workspace_relative {
        match WorkspaceGuard::new(workspace_root) {
            Ok(guard) => Some(guard),
            Err(e) => {
                let reason = e.to_string();
                return config
                    .rules
                    .iter()
                    .map(|rule| {
                        (
                            rule.id.clone(),
                            Err(ApplicationError::Safety {
                                path: workspace_root.to_path_buf(),
                                reason: reason.clone(),
                            }),
                        )
                    })
                    .collect();
            }
        }
    } else {
        None
    };

    let mut all_results = Vec::new();

    for (file_path, rules) in groups {
        // Artifact unreadable is fatal for every rule targeting it (no
        // pattern evaluation can happen)
        let content = match fs::read_to_string(&file_path) {
            Ok(c) => c,
            Err(source) => {
                // std::io::Error is not Clone; reconstruct one per rule
                let kind = source.kind();
                let msg = source.to_string();
                for rule in rules {
                    all_results.push((
                        rule.id.clone(),
                        Err(ApplicationError::Io {
                            path: file_path.clone(),
                            source: std::io::Error::new(kind, msg.clone()),
                        }),
                    ));
                }
                continue;
            }
        };

        if let Some(guard) = &guard {
            if let Err(e) = guard.validate_path(&file_path) {
                let reason = e.to_string();
                for rule in rules {
                    all_results.push((
                        rule.id.clone(),
                        Err(ApplicationError::Safety {
                            path: file_path.clone(),
                            reason: reason.clone(),
                        }),
                    ));
                }
                continue;
            }
        }

        let mut buffer = content;
        let mut dirty = false;
        let mut group_results: RuleResults = Vec::new();

        for rule in rules {
            if ledger.is_applied(&rule.id, &rule.fingerprint()) {
                let reason = match ledger.entry(&rule.id) {
                    Some(entry) => format!("recorded in ledger at unix {}", entry.applied_at),
                    None => "recorded in ledger".to_string(),
                };
                group_results.push((
                    rule.id.clone(),
                    Ok(PatchResult::SkippedLedger { reason }),
                ));
                continue;
            }

            match eval_rule(rule, &file_path, &buffer) {
                RuleEval::Applied {
                    updated,
                    replacements,
                } => {
                    buffer = updated;
                    dirty = true;
                    group_results.push((
                        rule.id.clone(),
                        Ok(PatchResult::Applied {
                            file: file_path.clone(),
                            replacements,
                        }),
                    ));
                }
                RuleEval::AlreadyApplied => {
                    group_results.push((
                        rule.id.clone(),
                        Ok(PatchResult::AlreadyApplied {
                            file: file_path.clone(),
                        }),
                    ));
                }
                RuleEval::Failed(reason) => {
                    group_results.push((
                        rule.id.clone(),
                        Ok(PatchResult::Failed {
                            file: file_path.clone(),
                            reason,
                        }),
                    ));
                }
            }
        }

        // One write per file, after every rule has folded into the buffer
        if dirty && mode == Mode::Apply {
            if let Err(e) = atomic_write(&file_path, buffer.as_bytes()) {
                // Nothing persisted; downgrade this file's Applied results
                let msg = e.to_string();
                for (_, result) in &mut group_results {
                    if matches!(result, Ok(PatchResult::Applied { .. })) {
                        *result = Err(ApplicationError::Io {
                            path: file_path.clone(),
                            source: std::io::Error::other(msg.clone()),
                        });
                    }
                }
            }
        }

        all_results.extend(group_results);
    }

    // Restore declared rule order (file grouping interleaves sets)
    let rule_order: std::collections::HashMap<&str, usize> = config
        .rules
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.as_str(), i))
        .collect();
    all_results.sort_by_key(|(id, _)| rule_order.get(id.as_str()).copied().unwrap_or(usize::MAX));

    all_results
}

enum RuleEval {
    Applied { updated: String, replacements: usize },
    AlreadyApplied,
    Failed(String),
}

/// Evaluate one rule against the current buffer.
fn eval_rule(rule: &PatchRule, file_path: &Path, buffer: &str) -> RuleEval {
    match (&rule.query, &rule.operation) {
        (Query::Literal { search, count }, Operation::Replace { text }) => {
            let mut spans = matcher::literal_matches(buffer, search, text);
            if let Some(max) = count {
                spans.truncate(*max);
            }
            if spans.is_empty() {
                if buffer.contains(text.as_str()) {
                    return RuleEval::AlreadyApplied;
                }
                return RuleEval::Failed(not_found_reason("search text", search, buffer));
            }
            apply_spans(file_path, buffer, &spans)
        }

        (
            Query::Pattern {
                pattern,
                dot_matches_newline,
            },
            Operation::Replace { text },
        ) => {
            let spans = match matcher::pattern_matches(buffer, pattern, *dot_matches_newline, text)
            {
                Ok(spans) => spans,
                Err(e) => return RuleEval::Failed(e.to_string()),
            };
            if spans.is_empty() {
                // Templates with capture references can't be checked by
                // substring presence; plain replacements can.
                if !text.contains('$') && buffer.contains(text.as_str()) {
                    return RuleEval::AlreadyApplied;
                }
                return RuleEval::Failed(not_found_reason("pattern", pattern, buffer));
            }
            apply_spans(file_path, buffer, &spans)
        }

        (
            Query::Anchor {
                anchor,
                marker,
                window,
            },
            Operation::Insert { text, indent, .. },
        ) => {
            let Some(fragment) = text.as_deref() else {
                return RuleEval::Failed("insertion fragment was not loaded".to_string());
            };

            let point = match anchor::locate(buffer, anchor, marker.as_deref(), *window) {
                Ok(point) => point,
                Err(e) => return RuleEval::Failed(e.to_string()),
            };

            let indent_str = match indent {
                Some(width) => " ".repeat(*width),
                None => point.indent.clone(),
            };
            let insert_text = anchor::indent_fragment(fragment, &indent_str);

            // Idempotency: the located site already starts with the content
            if buffer[point.byte_offset..].starts_with(&insert_text) {
                return RuleEval::AlreadyApplied;
            }

            let new_text = if point.needs_leading_newline {
                format!("\n{insert_text}")
            } else {
                insert_text
            };

            let edit = Edit::new(file_path, point.byte_offset, point.byte_offset, new_text, "");
            match edit.splice(buffer) {
                Ok(updated) => RuleEval::Applied {
                    updated,
                    replacements: 1,
                },
                Err(e) => RuleEval::Failed(e.to_string()),
            }
        }

        // Mismatched combinations are rejected by RuleSet::validate
        _ => RuleEval::Failed("unsupported query/operation combination".to_string()),
    }
}

/// Splice all matched spans into the buffer.
fn apply_spans(file_path: &Path, buffer: &str, spans: &[SpanMatch]) -> RuleEval {
    let edits: Vec<Edit> = spans
        .iter()
        .map(|span| {
            Edit::new(
                file_path,
                span.start,
                span.end,
                span.replacement.clone(),
                &buffer[span.start..span.end],
            )
        })
        .collect();

    match splice_all(buffer, &edits) {
        Ok((updated, replacements)) => RuleEval::Applied {
            updated,
            replacements,
        },
        Err(e) => RuleEval::Failed(e.to_string()),
    }
}

fn not_found_reason(kind: &str, needle: &str, buffer: &str) -> String {
    match matcher::nearest_line(buffer, needle) {
        Some((line, text)) => {
            format!("{kind} not found; nearest line {line}: {}", text.trim())
        }
        None => format!("{kind} not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_from_str;
    use std::fs;
    use tempfile::TempDir;

    const SETUP_TS: &str = r#"const approveAction = async (request, response, record) => {
    console.log('Approving product');
    await record.update({
        status: 'approved',
        rejectionReason: null
    });
    return ok;
};
"#;

    fn workspace_with(content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("src/config/setup.ts");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, content).unwrap();
        dir
    }

    fn literal_set(search: &str, text: &str) -> RuleSet {
        load_from_str(&format!(
            r#"
[meta]
workspace_relative = true

[[rules]]
id = "test-rule"
file = "src/config/setup.ts"

[rules.query]
type = "literal"
search = {search:?}

[rules.operation]
type = "replace"
text = {text:?}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_apply_literal_replace() {
        let dir = workspace_with(SETUP_TS);
        let config = literal_set("'approved'", "'live'");
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(
            results[0].1,
            Ok(PatchResult::Applied { replacements: 1, .. })
        ));

        let patched = fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap();
        assert!(patched.contains("'live'"));
        assert!(!patched.contains("'approved'"));
        assert!(ledger.is_applied("test-rule", &config.rules[0].fingerprint()));
    }

    #[test]
    fn test_second_run_skips_via_ledger() {
        let dir = workspace_with(SETUP_TS);
        let config = literal_set("'approved'", "'live'");
        let mut ledger = Ledger::load(dir.path()).unwrap();

        apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(
            results[0].1,
            Ok(PatchResult::SkippedLedger { .. })
        ));
    }

    #[test]
    fn test_already_applied_without_ledger_entry() {
        let dir = workspace_with(SETUP_TS);
        let config = literal_set("'approved'", "'live'");
        let mut ledger = Ledger::load(dir.path()).unwrap();

        apply_rules(&config, dir.path(), "1.0.0", &mut ledger);

        // Fresh ledger simulates a second operator with no local record
        let mut fresh = Ledger::load(tempfile::tempdir().unwrap().path()).unwrap();
        let results = apply_rules(&config, dir.path(), "1.0.0", &mut fresh);
        assert!(matches!(
            results[0].1,
            Ok(PatchResult::AlreadyApplied { .. })
        ));
        // Presence is now recorded for next time
        assert!(fresh.is_applied("test-rule", &config.rules[0].fingerprint()));
    }

    #[test]
    fn test_no_match_reports_failed_without_write() {
        let dir = workspace_with(SETUP_TS);
        let config = literal_set("text that is not there", "replacement");
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        match &results[0].1 {
            Ok(PatchResult::Failed { reason, .. }) => {
                assert!(reason.contains("not found"));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let untouched = fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap();
        assert_eq!(untouched, SETUP_TS);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_missing_file_is_fatal_error() {
        let dir = TempDir::new().unwrap();
        let config = literal_set("anything", "whatever");
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(results[0].1, Err(ApplicationError::Io { .. })));
    }

    #[test]
    fn test_version_gate_skips_all() {
        let dir = workspace_with(SETUP_TS);
        let mut config = literal_set("'approved'", "'live'");
        config.meta.version_range = Some(">=2.0.0".to_string());
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.4.2", &mut ledger);
        assert!(matches!(
            results[0].1,
            Ok(PatchResult::SkippedVersion { .. })
        ));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap(),
            SETUP_TS
        );
    }

    #[test]
    fn test_later_rule_sees_earlier_rule_output() {
        let dir = workspace_with(SETUP_TS);
        let config = load_from_str(
            r#"
[meta]
workspace_relative = true

[[rules]]
id = "step-one"
file = "src/config/setup.ts"

[rules.query]
type = "literal"
search = "'approved'"

[rules.operation]
type = "replace"
text = "'stage-one'"

[[rules]]
id = "step-two"
file = "src/config/setup.ts"

[rules.query]
type = "literal"
search = "'stage-one'"

[rules.operation]
type = "replace"
text = "'stage-two'"
"#,
        )
        .unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(results[0].1, Ok(PatchResult::Applied { .. })));
        assert!(matches!(results[1].1, Ok(PatchResult::Applied { .. })));

        let patched = fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap();
        assert!(patched.contains("'stage-two'"));
        assert!(!patched.contains("'stage-one'"));
    }

    #[test]
    fn test_anchor_insert_and_idempotency() {
        let dir = workspace_with(SETUP_TS);
        let config = load_from_str(
            r#"
[meta]
workspace_relative = true

[[rules]]
id = "add-save"
file = "src/config/setup.ts"

[rules.query]
type = "anchor"
anchor = "await record.update({"
marker = "rejectionReason"

[rules.operation]
type = "insert"
text = "await record.save();"
"#,
        )
        .unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(results[0].1, Ok(PatchResult::Applied { .. })));

        let patched = fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap();
        let update_close = patched.find("});").unwrap();
        let save_call = patched.find("await record.save();").unwrap();
        assert!(save_call > update_close);
        // Indent copied from the terminator line
        assert!(patched.contains("    await record.save();\n"));

        // Second run with a fresh ledger: located site already patched
        let mut fresh = Ledger::load(tempfile::tempdir().unwrap().path()).unwrap();
        let results = apply_rules(&config, dir.path(), "1.0.0", &mut fresh);
        assert!(matches!(
            results[0].1,
            Ok(PatchResult::AlreadyApplied { .. })
        ));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap(),
            patched
        );
    }

    #[test]
    fn test_forbidden_target_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("node_modules/adminjs/lib/setup.js");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "const x = 'approved';\n").unwrap();

        let config = load_from_str(
            r#"
[meta]
workspace_relative = true

[[rules]]
id = "bad-target"
file = "node_modules/adminjs/lib/setup.js"

[rules.query]
type = "literal"
search = "'approved'"

[rules.operation]
type = "replace"
text = "'live'"
"#,
        )
        .unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();

        let results = apply_rules(&config, dir.path(), "1.0.0", &mut ledger);
        assert!(matches!(results[0].1, Err(ApplicationError::Safety { .. })));
        assert_eq!(
            fs::read_to_string(&file).unwrap(),
            "const x = 'approved';\n"
        );
    }

    #[test]
    fn test_check_rules_never_writes() {
        let dir = workspace_with(SETUP_TS);
        let config = literal_set("'approved'", "'live'");
        let ledger = Ledger::load(dir.path()).unwrap();

        let results = check_rules(&config, dir.path(), "1.0.0", &ledger);
        assert!(matches!(results[0].1, Ok(PatchResult::Applied { .. })));

        assert_eq!(
            fs::read_to_string(dir.path().join("src/config/setup.ts")).unwrap(),
            SETUP_TS
        );
        assert!(ledger.is_empty());
    }
}
