pub mod applicator;
pub mod loader;
pub mod schema;
pub mod version;

pub use applicator::{apply_rules, check_rules, ApplicationError, PatchResult};
pub use loader::{load_from_path, load_from_str, ConfigError};
pub use schema::{Metadata, Operation, PatchRule, Query, RuleSet, ValidationError};
pub use version::{matches_requirement, read_package_version, VersionError};
