use crate::anchor::DEFAULT_SCAN_WINDOW;
use crate::matcher;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct RuleSet {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub rules: Vec<PatchRule>,
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.rules.is_empty() {
            issues.push(ValidationIssue::EmptyRuleList);
        }

        let mut seen_ids = std::collections::HashSet::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: None,
                    field: "id",
                });
            } else if !seen_ids.insert(rule.id.as_str()) {
                issues.push(ValidationIssue::DuplicateId {
                    rule_id: rule.id.clone(),
                });
            }
            if rule.file.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    rule_id: Some(rule.id.clone()),
                    field: "file",
                });
            }

            match &rule.query {
                Query::Literal { search, count } => {
                    if search.is_empty() {
                        issues.push(ValidationIssue::MissingField {
                            rule_id: Some(rule.id.clone()),
                            field: "query.search",
                        });
                    }
                    if *count == Some(0) {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: "query.count must be at least 1".to_string(),
                        });
                    }
                }
                Query::Pattern {
                    pattern,
                    dot_matches_newline,
                } => {
                    if pattern.trim().is_empty() {
                        issues.push(ValidationIssue::MissingField {
                            rule_id: Some(rule.id.clone()),
                            field: "query.pattern",
                        });
                    } else if let Err(e) =
                        matcher::validate_pattern(pattern, *dot_matches_newline)
                    {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: e.to_string(),
                        });
                    }
                }
                Query::Anchor { anchor, window, .. } => {
                    if anchor.trim().is_empty() {
                        issues.push(ValidationIssue::MissingField {
                            rule_id: Some(rule.id.clone()),
                            field: "query.anchor",
                        });
                    }
                    if *window == 0 {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: "anchor scan window must be at least 1 line".to_string(),
                        });
                    }
                }
            }

            match &rule.operation {
                Operation::Replace { text } => {
                    if text.is_empty() {
                        issues.push(ValidationIssue::MissingField {
                            rule_id: Some(rule.id.clone()),
                            field: "operation.text",
                        });
                    }
                    if matches!(rule.query, Query::Anchor { .. }) {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: "replace requires a literal or pattern query".to_string(),
                        });
                    }
                }
                Operation::Insert { text, text_file, .. } => {
                    if text.is_none() && text_file.is_none() {
                        issues.push(ValidationIssue::MissingField {
                            rule_id: Some(rule.id.clone()),
                            field: "operation.text (or text_file)",
                        });
                    }
                    if text.is_some() && text_file.is_some() {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: "insert takes either text or text_file, not both"
                                .to_string(),
                        });
                    }
                    if !matches!(rule.query, Query::Anchor { .. }) {
                        issues.push(ValidationIssue::InvalidCombo {
                            rule_id: Some(rule.id.clone()),
                            message: "insert requires an anchor query".to_string(),
                        });
                    }
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Semver range matched against the target server's package.json version
    #[serde(default)]
    pub version_range: Option<String>,
    /// Resolve rule file paths against the workspace root instead of
    /// treating them as absolute host paths
    #[serde(default)]
    pub workspace_relative: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PatchRule {
    pub id: String,
    pub file: String,
    pub query: Query,
    pub operation: Operation,
}

impl PatchRule {
    /// Fingerprint of the rule's definition (query + operation), used by
    /// the applied-rules ledger. Editing a rule changes its fingerprint
    /// and re-arms it; renaming only the id does not.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_string(&(&self.query, &self.operation))
            .expect("rule definition serialization is infallible");
        format!("{:016x}", xxh3_64(encoded.as_bytes()))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Query {
    /// Exact substring match; every occurrence is patched unless `count`
    /// caps the number of leading occurrences to touch
    Literal {
        search: String,
        #[serde(default)]
        count: Option<usize>,
    },
    /// Regular expression match, optionally spanning line breaks
    Pattern {
        pattern: String,
        #[serde(default)]
        dot_matches_newline: bool,
    },
    /// Proximity match: a literal marker near the edit site, with a bounded
    /// forward scan for the block terminator
    Anchor {
        anchor: String,
        #[serde(default)]
        marker: Option<String>,
        #[serde(default = "default_window")]
        window: usize,
    },
}

fn default_window() -> usize {
    DEFAULT_SCAN_WINDOW
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    /// Replace every query match; regex queries may reference capture
    /// groups ($1, ${name}) in the replacement text
    Replace { text: String },
    /// Insert content after the anchor's block terminator. `text_file`
    /// names an externally prepared fragment (relative to the rule set
    /// file) inserted verbatim; `indent` overrides the block indentation
    /// with a fixed-width space run.
    Insert {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        text_file: Option<String>,
        #[serde(default)]
        indent: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone)]
pub enum ValidationIssue {
    EmptyRuleList,
    MissingField {
        rule_id: Option<String>,
        field: &'static str,
    },
    DuplicateId {
        rule_id: String,
    },
    InvalidCombo {
        rule_id: Option<String>,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyRuleList => write!(f, "rule set contains no rules"),
            ValidationIssue::MissingField { rule_id, field } => match rule_id {
                Some(id) => write!(f, "rule '{id}' missing required field '{field}'"),
                None => write!(f, "rule missing required field '{field}'"),
            },
            ValidationIssue::DuplicateId { rule_id } => {
                write!(f, "duplicate rule id '{rule_id}'")
            }
            ValidationIssue::InvalidCombo { rule_id, message } => match rule_id {
                Some(id) => write!(f, "rule '{id}' has invalid configuration: {message}"),
                None => write!(f, "invalid rule configuration: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal_rule(id: &str) -> PatchRule {
        PatchRule {
            id: id.to_string(),
            file: "src/config/setup.ts".to_string(),
            query: Query::Literal {
                search: "before".to_string(),
                count: None,
            },
            operation: Operation::Replace {
                text: "after".to_string(),
            },
        }
    }

    #[test]
    fn test_empty_rule_set_invalid() {
        let set = RuleSet::default();
        let err = set.validate().unwrap_err();
        assert!(matches!(err.issues[0], ValidationIssue::EmptyRuleList));
    }

    #[test]
    fn test_valid_literal_rule() {
        let set = RuleSet {
            meta: Metadata::default(),
            rules: vec![literal_rule("fix-a")],
        };
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let set = RuleSet {
            meta: Metadata::default(),
            rules: vec![literal_rule("fix-a"), literal_rule("fix-a")],
        };
        let err = set.validate().unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DuplicateId { .. })));
    }

    #[test]
    fn test_malformed_pattern_rejected_at_validation() {
        let mut rule = literal_rule("fix-a");
        rule.query = Query::Pattern {
            pattern: "unclosed(".to_string(),
            dot_matches_newline: false,
        };
        let set = RuleSet {
            meta: Metadata::default(),
            rules: vec![rule],
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_insert_requires_anchor_query() {
        let mut rule = literal_rule("fix-a");
        rule.operation = Operation::Insert {
            text: Some("await record.save();".to_string()),
            text_file: None,
            indent: None,
        };
        let set = RuleSet {
            meta: Metadata::default(),
            rules: vec![rule],
        };
        let err = set.validate().unwrap_err();
        assert!(err
            .issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::InvalidCombo { .. })));
    }

    #[test]
    fn test_insert_text_xor_text_file() {
        let mut rule = literal_rule("fix-a");
        rule.query = Query::Anchor {
            anchor: "app.get(\"/admin/fcm-management\"".to_string(),
            marker: None,
            window: DEFAULT_SCAN_WINDOW,
        };
        rule.operation = Operation::Insert {
            text: None,
            text_file: None,
            indent: None,
        };
        let set = RuleSet {
            meta: Metadata::default(),
            rules: vec![rule],
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_definition_not_id() {
        let a = literal_rule("fix-a");
        let mut renamed = literal_rule("fix-b");
        renamed.file = a.file.clone();
        assert_eq!(a.fingerprint(), renamed.fingerprint());

        let mut changed = literal_rule("fix-a");
        changed.operation = Operation::Replace {
            text: "different".to_string(),
        };
        assert_ne!(a.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_deserialize_rule_set_from_toml() {
        let toml = r#"
[meta]
name = "fix-adminjs-href"
workspace_relative = true

[[rules]]
id = "fix-adminjs-href"
file = "src/config/setup.ts"

[rules.query]
type = "pattern"
pattern = 'redirectUrl: resource\.href\(\{ resourceId: resource\.id\(\) \}\)'

[rules.operation]
type = "replace"
text = "redirectUrl: `/admin/resources/${resource.id()}/actions/list`"
"#;
        let set: RuleSet = toml_edit::de::from_str(toml).unwrap();
        assert_eq!(set.rules.len(), 1);
        assert!(matches!(set.rules[0].query, Query::Pattern { .. }));
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_anchor_window_defaults() {
        let toml = r#"
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
indent = 12
"#;
        let set: RuleSet = toml_edit::de::from_str(toml).unwrap();
        match &set.rules[0].query {
            Query::Anchor { window, .. } => assert_eq!(*window, DEFAULT_SCAN_WINDOW),
            other => panic!("unexpected query: {other:?}"),
        }
    }
}
