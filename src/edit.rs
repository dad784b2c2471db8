use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// The fundamental edit primitive: byte-span replacement with verification.
///
/// Every rule the applicator runs (literal replace, regex substitution,
/// anchor insertion) compiles down to one or more of these. Intelligence
/// lives in span acquisition, not in application.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Edit does nothing until splice() or apply() is called"]
pub struct Edit {
    /// Path to the target artifact (resolved against the workspace root)
    pub file: PathBuf,
    /// Starting byte offset (inclusive)
    pub byte_start: usize,
    /// Ending byte offset (exclusive)
    pub byte_end: usize,
    /// New text to insert at [byte_start, byte_end)
    pub new_text: String,
    /// Verification of what we expect to find before applying
    pub expected_before: EditVerification,
}

/// Verification strategy for edit safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Exact text match required
    ExactMatch(String),
    /// xxh3 hash of expected text (faster for large spans)
    Hash(u64),
}

impl EditVerification {
    /// Check if the provided text matches the verification criteria.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            EditVerification::ExactMatch(expected) => text == expected,
            EditVerification::Hash(expected_hash) => xxh3_64(text.as_bytes()) == *expected_hash,
        }
    }

    /// Create verification from text, using hash for text over 1KB.
    pub fn from_text(text: &str) -> Self {
        if text.len() > 1024 {
            EditVerification::Hash(xxh3_64(text.as_bytes()))
        } else {
            EditVerification::ExactMatch(text.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("Before-text verification failed at {file}:{byte_start}")]
    BeforeTextMismatch {
        file: PathBuf,
        byte_start: usize,
        byte_end: usize,
        expected: String,
        found: String,
    },

    #[error("Invalid byte range: [{byte_start}, {byte_end}) in content of length {content_len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        content_len: usize,
    },

    #[error("Overlapping edits at byte {at}")]
    OverlappingEdits { at: usize },

    #[error("Byte range does not fall on a character boundary")]
    NotCharBoundary,

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of applying an edit directly to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "EditResult should be checked for applied/already-applied"]
pub enum EditResult {
    /// Edit was written to disk
    Applied { file: PathBuf, bytes_changed: usize },
    /// Span already holds the new text; nothing was written
    AlreadyApplied { file: PathBuf },
}

impl Edit {
    /// Create a new edit with automatic verification generation.
    pub fn new(
        file: impl Into<PathBuf>,
        byte_start: usize,
        byte_end: usize,
        new_text: impl Into<String>,
        expected_before: impl Into<String>,
    ) -> Self {
        let expected = expected_before.into();
        Self {
            file: file.into(),
            byte_start,
            byte_end,
            new_text: new_text.into(),
            expected_before: EditVerification::from_text(&expected),
        }
    }

    /// Validate the span against content and return the current text there.
    fn validate<'a>(&self, content: &'a str) -> Result<&'a str, EditError> {
        if self.byte_start > self.byte_end || self.byte_end > content.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                content_len: content.len(),
            });
        }
        if !content.is_char_boundary(self.byte_start) || !content.is_char_boundary(self.byte_end) {
            return Err(EditError::NotCharBoundary);
        }

        let current = &content[self.byte_start..self.byte_end];

        // Already-applied spans pass verification unconditionally (idempotency)
        if current == self.new_text {
            return Ok(current);
        }

        if !self.expected_before.matches(current) {
            return Err(EditError::BeforeTextMismatch {
                file: self.file.clone(),
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                expected: format!("{:?}", self.expected_before),
                found: current.to_string(),
            });
        }

        Ok(current)
    }

    /// Splice this edit into in-memory content, returning the new content.
    ///
    /// Used by the applicator, which runs rules sequentially against one
    /// buffer and writes the file once at the end.
    pub fn splice(&self, content: &str) -> Result<String, EditError> {
        self.validate(content)?;
        let mut out = String::with_capacity(
            content.len() + self.new_text.len() - (self.byte_end - self.byte_start),
        );
        out.push_str(&content[..self.byte_start]);
        out.push_str(&self.new_text);
        out.push_str(&content[self.byte_end..]);
        Ok(out)
    }

    /// Apply this edit directly to the file system atomically.
    pub fn apply(&self) -> Result<EditResult, EditError> {
        let original = fs::read_to_string(&self.file)?;
        let current = self.validate(&original)?;

        if current == self.new_text {
            return Ok(EditResult::AlreadyApplied {
                file: self.file.clone(),
            });
        }

        let updated = self.splice(&original)?;
        atomic_write(&self.file, updated.as_bytes())?;

        Ok(EditResult::Applied {
            file: self.file.clone(),
            bytes_changed: self.new_text.len(),
        })
    }
}

/// Splice a batch of edits into one content buffer.
///
/// Edits are applied bottom-to-top (descending by byte_start) so earlier
/// spans stay valid. Overlapping spans are rejected. Returns the updated
/// content and the number of spans that actually changed.
pub fn splice_all(content: &str, edits: &[Edit]) -> Result<(String, usize), EditError> {
    let mut sorted: Vec<&Edit> = edits.iter().collect();
    sorted.sort_by(|a, b| b.byte_start.cmp(&a.byte_start));

    for window in sorted.windows(2) {
        let (later, earlier) = (window[0], window[1]);
        if earlier.byte_end > later.byte_start {
            return Err(EditError::OverlappingEdits {
                at: later.byte_start,
            });
        }
    }

    // Validate everything against the original before mutating anything
    for edit in &sorted {
        edit.validate(content)?;
    }

    let mut updated = content.to_string();
    let mut changed = 0;
    for edit in sorted {
        if &updated[edit.byte_start..edit.byte_end] == edit.new_text {
            continue;
        }
        updated.replace_range(edit.byte_start..edit.byte_end, &edit.new_text);
        changed += 1;
    }

    Ok((updated, changed))
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write succeeds or the target is untouched. The mtime is
/// bumped afterwards so watchers on the patched server (nodemon, tsc -w)
/// pick up the change.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EditError> {
    let parent = path.parent().ok_or_else(|| {
        EditError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Path has no parent directory",
        ))
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    let now = filetime::FileTime::now();
    filetime::set_file_mtime(path, now)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_exact_match() {
        let verify = EditVerification::ExactMatch("hello world".to_string());
        assert!(verify.matches("hello world"));
        assert!(!verify.matches("hello"));
    }

    #[test]
    fn test_verification_hash() {
        let verify = EditVerification::Hash(xxh3_64(b"hello world"));
        assert!(verify.matches("hello world"));
        assert!(!verify.matches("goodbye world"));
    }

    #[test]
    fn test_verification_from_text_picks_variant_by_size() {
        assert!(matches!(
            EditVerification::from_text("small"),
            EditVerification::ExactMatch(_)
        ));
        assert!(matches!(
            EditVerification::from_text(&"x".repeat(2000)),
            EditVerification::Hash(_)
        ));
    }

    #[test]
    fn test_splice_replaces_span() {
        let edit = Edit::new("test.ts", 0, 5, "howdy", "hello");
        let out = edit.splice("hello world").unwrap();
        assert_eq!(out, "howdy world");
    }

    #[test]
    fn test_splice_invalid_range() {
        let edit = Edit::new("test.ts", 5, 20, "replacement", "");
        assert!(matches!(
            edit.splice("hello world"),
            Err(EditError::InvalidByteRange { .. })
        ));
    }

    #[test]
    fn test_splice_mismatch() {
        let edit = Edit::new("test.ts", 0, 5, "howdy", "HELLO");
        assert!(matches!(
            edit.splice("hello world"),
            Err(EditError::BeforeTextMismatch { .. })
        ));
    }

    #[test]
    fn test_splice_already_applied_passes_verification() {
        let edit = Edit::new("test.ts", 0, 5, "hello", "something else");
        let out = edit.splice("hello world").unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_splice_all_descending_application() {
        let content = "line1\nline2\nline3\n";
        let edits = vec![
            Edit::new("t", 0, 5, "LINE1", "line1"),
            Edit::new("t", 6, 11, "LINE2", "line2"),
            Edit::new("t", 12, 17, "LINE3", "line3"),
        ];
        let (out, changed) = splice_all(content, &edits).unwrap();
        assert_eq!(out, "LINE1\nLINE2\nLINE3\n");
        assert_eq!(changed, 3);
    }

    #[test]
    fn test_splice_all_rejects_overlap() {
        let content = "abcdef";
        let edits = vec![
            Edit::new("t", 0, 4, "xxxx", "abcd"),
            Edit::new("t", 2, 6, "yyyy", "cdef"),
        ];
        assert!(matches!(
            splice_all(content, &edits),
            Err(EditError::OverlappingEdits { .. })
        ));
    }

    #[test]
    fn test_apply_writes_atomically() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("setup.ts");
        fs::write(&file_path, b"original content").unwrap();

        let edit = Edit::new(&file_path, 0, 8, "modified", "original");
        let result = edit.apply().unwrap();

        assert!(matches!(result, EditResult::Applied { .. }));
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "modified content");
    }

    #[test]
    fn test_apply_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("setup.ts");
        fs::write(&file_path, b"hello world").unwrap();

        let edit = Edit::new(&file_path, 0, 5, "hello", "hello");
        let result = edit.apply().unwrap();

        assert!(matches!(result, EditResult::AlreadyApplied { .. }));
        assert_eq!(fs::read_to_string(&file_path).unwrap(), "hello world");
    }
}
