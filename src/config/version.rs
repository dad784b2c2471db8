//! Version gating for rule sets using semver constraints.
//!
//! Rule sets may declare a `version_range` like ">=1.2.0, <2.0.0" in their
//! meta table; it is matched against the target server's version as read
//! from its package.json.

use semver::{Version, VersionReq};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum VersionError {
    /// Invalid version string (e.g., "not-a-version")
    InvalidVersion { value: String, source: String },
    /// Invalid version requirement (e.g., ">=bad")
    InvalidRequirement { value: String, source: String },
    /// package.json unreadable or unparseable
    PackageJson { path: PathBuf, message: String },
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionError::InvalidVersion { value, source } => {
                write!(f, "invalid version '{}': {}", value, source)
            }
            VersionError::InvalidRequirement { value, source } => {
                write!(f, "invalid version requirement '{}': {}", value, source)
            }
            VersionError::PackageJson { path, message } => {
                write!(f, "cannot read version from {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for VersionError {}

/// Check if a version matches a requirement string.
///
/// # Examples
///
/// ```
/// use admin_patcher::config::version::matches_requirement;
///
/// assert!(matches_requirement("1.2.0", Some(">=1.2.0")).unwrap());
/// assert!(matches_requirement("1.3.0", Some(">=1.2.0, <2.0.0")).unwrap());
/// assert!(!matches_requirement("1.1.0", Some(">=1.2.0")).unwrap());
///
/// // None requirement means "apply to all versions"
/// assert!(matches_requirement("1.0.0", None).unwrap());
/// ```
pub fn matches_requirement(
    version: &str,
    requirement: Option<&str>,
) -> Result<bool, VersionError> {
    // No requirement means "apply to all versions"
    let Some(req_str) = requirement else {
        return Ok(true);
    };

    let req_str = req_str.trim();
    if req_str.is_empty() {
        return Ok(true);
    }

    let version = Version::parse(version).map_err(|e| VersionError::InvalidVersion {
        value: version.to_string(),
        source: e.to_string(),
    })?;

    let req = VersionReq::parse(req_str).map_err(|e| VersionError::InvalidRequirement {
        value: req_str.to_string(),
        source: e.to_string(),
    })?;

    Ok(req.matches(&version))
}

/// Read the target server's version from `<workspace>/package.json`.
pub fn read_package_version(workspace_root: &Path) -> Result<String, VersionError> {
    let path = workspace_root.join("package.json");
    let contents = fs::read_to_string(&path).map_err(|e| VersionError::PackageJson {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let package: serde_json::Value =
        serde_json::from_str(&contents).map_err(|e| VersionError::PackageJson {
            path: path.clone(),
            message: e.to_string(),
        })?;

    package
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| VersionError::PackageJson {
            path,
            message: "no \"version\" field".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_requirement() {
        assert!(matches_requirement("1.2.0", None).unwrap());
        assert!(matches_requirement("0.1.0", None).unwrap());
    }

    #[test]
    fn test_empty_requirement() {
        assert!(matches_requirement("1.2.0", Some("")).unwrap());
        assert!(matches_requirement("1.2.0", Some("   ")).unwrap());
    }

    #[test]
    fn test_simple_requirement() {
        assert!(matches_requirement("1.2.0", Some("=1.2.0")).unwrap());
        assert!(!matches_requirement("1.2.1", Some("=1.2.0")).unwrap());

        assert!(matches_requirement("1.2.0", Some(">=1.2.0")).unwrap());
        assert!(matches_requirement("1.3.0", Some(">=1.2.0")).unwrap());
        assert!(!matches_requirement("1.1.0", Some(">=1.2.0")).unwrap());
    }

    #[test]
    fn test_compound_requirement() {
        let req = ">=1.2.0, <2.0.0";
        assert!(matches_requirement("1.2.0", Some(req)).unwrap());
        assert!(matches_requirement("1.9.5", Some(req)).unwrap());
        assert!(!matches_requirement("1.1.0", Some(req)).unwrap());
        assert!(!matches_requirement("2.0.0", Some(req)).unwrap());
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            matches_requirement("not-a-version", Some(">=1.0.0")).unwrap_err(),
            VersionError::InvalidVersion { .. }
        ));
        assert!(matches!(
            matches_requirement("1.0.0", Some(">=bad")).unwrap_err(),
            VersionError::InvalidRequirement { .. }
        ));
    }

    #[test]
    fn test_read_package_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{ "name": "server", "version": "1.4.2" }"#,
        )
        .unwrap();

        assert_eq!(read_package_version(dir.path()).unwrap(), "1.4.2");
    }

    #[test]
    fn test_read_package_version_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("package.json"), r#"{ "name": "server" }"#).unwrap();

        assert!(matches!(
            read_package_version(dir.path()).unwrap_err(),
            VersionError::PackageJson { .. }
        ));
    }

    #[test]
    fn test_read_package_version_no_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_package_version(dir.path()).is_err());
    }
}
