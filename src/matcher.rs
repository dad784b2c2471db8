//! Match specifications: literal substrings and multi-line regular
//! expressions over target file content.
//!
//! Produces byte spans plus fully-expanded replacement text for each match;
//! the applicator turns these into [`crate::edit::Edit`]s. Also provides the
//! before/after occurrence counts used for success reporting and a
//! nearest-line suggestion for diagnosing drifted targets.

use regex::RegexBuilder;
use thiserror::Error;

/// A single match: byte span plus the replacement text for that span
/// (capture-group templates already expanded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanMatch {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("invalid match pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Find every non-overlapping occurrence of a literal search string.
pub fn literal_matches(content: &str, search: &str, replacement: &str) -> Vec<SpanMatch> {
    content
        .match_indices(search)
        .map(|(start, matched)| SpanMatch {
            start,
            end: start + matched.len(),
            replacement: replacement.to_string(),
        })
        .collect()
}

/// Find every match of a regex pattern, expanding `$n`/`${name}` template
/// references in the replacement.
///
/// `dot_matches_newline` enables `(?s)` semantics for bug text that spans
/// several source lines (e.g. a multi-line object-literal argument).
pub fn pattern_matches(
    content: &str,
    pattern: &str,
    dot_matches_newline: bool,
    replacement: &str,
) -> Result<Vec<SpanMatch>, MatcherError> {
    let re = compile(pattern, dot_matches_newline)?;

    let mut matches = Vec::new();
    for caps in re.captures_iter(content) {
        let whole = caps.get(0).expect("capture 0 always present");
        let mut expanded = String::new();
        caps.expand(replacement, &mut expanded);
        matches.push(SpanMatch {
            start: whole.start(),
            end: whole.end(),
            replacement: expanded,
        });
    }
    Ok(matches)
}

/// Count occurrences of a regex pattern (pre-fix count for reporting).
pub fn count_pattern(
    content: &str,
    pattern: &str,
    dot_matches_newline: bool,
) -> Result<usize, MatcherError> {
    let re = compile(pattern, dot_matches_newline)?;
    Ok(re.find_iter(content).count())
}

/// Count occurrences of a literal (post-fix count for reporting).
pub fn count_literal(content: &str, needle: &str) -> usize {
    content.matches(needle).count()
}

/// Check that a pattern compiles. Used by schema validation so malformed
/// rules fail at load time rather than mid-run.
pub fn validate_pattern(pattern: &str, dot_matches_newline: bool) -> Result<(), MatcherError> {
    compile(pattern, dot_matches_newline).map(|_| ())
}

fn compile(pattern: &str, dot_matches_newline: bool) -> Result<regex::Regex, MatcherError> {
    RegexBuilder::new(pattern)
        .dot_matches_new_line(dot_matches_newline)
        .multi_line(true)
        .build()
        .map_err(|source| MatcherError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Find the line most similar to the search text, for "pattern not found"
/// diagnostics. Returns (1-based line number, line text).
///
/// Multi-line searches are compared by their first non-empty line.
pub fn nearest_line(content: &str, search: &str) -> Option<(usize, String)> {
    let probe = search
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?;

    let mut best: Option<(f64, usize, &str)> = None;
    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let score = strsim::normalized_levenshtein(probe, trimmed);
        if best.map_or(true, |(s, _, _)| score > s) {
            best = Some((score, idx, line));
        }
    }

    // Below this similarity a suggestion is noise, not help
    best.filter(|(score, _, _)| *score >= 0.5)
        .map(|(_, idx, line)| (idx + 1, line.to_string()))
}
