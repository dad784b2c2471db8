use crate::config::schema::{Operation, RuleSet, ValidationError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
    Fragment {
        rule_id: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(
                    f,
                    "failed to read rule set from {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse rule set TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse rule set TOML: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid rule set ({}): {}", path.display(), source),
                None => write!(f, "invalid rule set: {}", source),
            },
            ConfigError::Fragment {
                rule_id,
                path,
                source,
            } => write!(
                f,
                "rule '{}': failed to read fragment {}: {}",
                rule_id,
                path.display(),
                source
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
            ConfigError::Fragment { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<RuleSet, ConfigError> {
    let config: RuleSet = toml_edit::de::from_str(input)
        .map_err(|source| ConfigError::Toml { path: None, source })?;
    config
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(config)
}

/// Load a rule set from disk and resolve any `text_file` insertion
/// fragments relative to the rule set's own directory.
///
/// Fragments are read verbatim with no validation applied (they are
/// externally prepared content, inserted as-is).
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RuleSet, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = load_from_str(&contents).map_err(|error| error.with_path(path))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for rule in &mut config.rules {
        if let Operation::Insert {
            text: text @ None,
            text_file: Some(fragment),
            ..
        } = &mut rule.operation
        {
            let fragment_path = base.join(fragment.as_str());
            let body =
                fs::read_to_string(&fragment_path).map_err(|source| ConfigError::Fragment {
                    rule_id: rule.id.clone(),
                    path: fragment_path.clone(),
                    source,
                })?;
            *text = Some(body);
        }
    }

    Ok(config)
}
