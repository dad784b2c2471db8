//! Anchor-based insertion point location.
//!
//! Insertion rules don't replace text; they add a statement or route next to
//! an existing one. The edit site is located by proximity: find a line
//! containing the anchor literal, then scan forward a bounded window of
//! lines for the structural terminator that closes the anchored block.
//! If no terminator appears within the window the rule makes no change.

use thiserror::Error;

/// How far past the anchor line we look for a terminator by default.
pub const DEFAULT_SCAN_WINDOW: usize = 10;

/// Where to insert, as located from an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionPoint {
    /// Byte offset immediately after the terminator line (including its
    /// newline). Inserting here places new content on its own lines.
    pub byte_offset: usize,
    /// 1-based line number of the terminator line.
    pub terminator_line: usize,
    /// Leading whitespace of the terminator line; inserted lines are
    /// prefixed with this to match the surrounding block.
    pub indent: String,
    /// True when the terminator is the file's final line and that line has
    /// no trailing newline, so inserted text must supply one first.
    pub needs_leading_newline: bool,
}

#[derive(Error, Debug)]
pub enum AnchorError {
    #[error("anchor '{anchor}' not found")]
    AnchorNotFound { anchor: String },

    #[error("no block terminator within {window} lines of anchor '{anchor}'")]
    TerminatorNotFound { anchor: String, window: usize },
}

/// Locate the insertion point for an anchor.
///
/// Scanning starts on the line after the first line containing `anchor` and
/// covers at most `window` lines. A line terminates the scan when:
/// - its trimmed content is a lone `}` or `};`, or
/// - it contains `});` and `marker` (when given) has appeared somewhere in
///   the lines scanned so far, anchor line included.
pub fn locate(
    content: &str,
    anchor: &str,
    marker: Option<&str>,
    window: usize,
) -> Result<InsertionPoint, AnchorError> {
    // Lines with their starting byte offsets, newlines kept
    let mut lines: Vec<(usize, &str)> = Vec::new();
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        lines.push((offset, line));
        offset += line.len();
    }

    let anchor_idx = lines
        .iter()
        .position(|(_, line)| line.contains(anchor))
        .ok_or_else(|| AnchorError::AnchorNotFound {
            anchor: anchor.to_string(),
        })?;

    let mut marker_seen = marker.map_or(true, |m| lines[anchor_idx].1.contains(m));

    let last = lines.len().saturating_sub(1).min(anchor_idx + window);
    for idx in anchor_idx + 1..=last {
        let (start, line) = lines[idx];
        if let Some(m) = marker {
            marker_seen = marker_seen || line.contains(m);
        }

        let trimmed = line.trim();
        let lone_close = trimmed == "}" || trimmed == "};";
        let block_close = line.contains("});") && marker_seen;

        if lone_close || block_close {
            let indent: String = line
                .chars()
                .take_while(|c| *c == ' ' || *c == '\t')
                .collect();
            return Ok(InsertionPoint {
                byte_offset: start + line.len(),
                terminator_line: idx + 1,
                indent,
                needs_leading_newline: !line.ends_with('\n'),
            });
        }
    }

    Err(AnchorError::TerminatorNotFound {
        anchor: anchor.to_string(),
        window,
    })
}

/// Prefix every non-empty line of a fragment with the block indent and
/// ensure it ends with a newline, so it splices cleanly between lines.
pub fn indent_fragment(fragment: &str, indent: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + indent.len() * 4);
    for line in fragment.lines() {
        if line.trim().is_empty() {
            out.push('\n');
        } else {
            out.push_str(indent);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
