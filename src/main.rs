use admin_patcher::config::{
    apply_rules, check_rules, load_from_path, read_package_version, PatchResult, Query, RuleSet,
};
use admin_patcher::ledger::Ledger;
use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use similar::{ChangeTag, TextDiff};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "admin-patcher")]
#[command(about = "Idempotent maintenance patching for admin server source files", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply patch rules to a server workspace
    Apply {
        /// Path to server workspace root (auto-detected if not specified)
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Specific rule file to apply (otherwise applies all in patches/)
        #[arg(short, long)]
        rules: Option<PathBuf>,

        /// Dry run - show what would change without modifying files
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,
    },

    /// Check status of patch rules without applying
    Status {
        /// Path to server workspace root (auto-detected if not specified)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// Verify all patch rules are already applied to the workspace
    Verify {
        /// Path to server workspace root (auto-detected if not specified)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },

    /// List rule sets and their rules in application order
    List {
        /// Path to server workspace root (auto-detected if not specified)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            workspace,
            rules,
            dry_run,
            diff,
        } => cmd_apply(workspace, rules, dry_run, diff),

        Commands::Status { workspace } => cmd_status(workspace),

        Commands::Verify { workspace } => cmd_verify(workspace),

        Commands::List { workspace } => cmd_list(workspace),
    }
}

/// Helper: Discover all .toml rule files in a patches/ directory.
///
/// Discovery order:
/// 1. `<workspace>/patches` (rule files kept alongside the target server).
/// 2. `./patches` relative to the current working directory (typical when
///    running from this repo).
///
/// Files are sorted by name; the shipped sets carry numeric prefixes so
/// later fixes that depend on earlier ones run in the right order.
fn discover_rule_files(workspace: &Path) -> Result<Vec<PathBuf>> {
    let cwd_patches_dir = env::current_dir().ok().map(|cwd| cwd.join("patches"));
    let workspace_patches_dir = workspace.join("patches");

    let candidate_dirs: Vec<PathBuf> = std::iter::once(workspace_patches_dir)
        .chain(cwd_patches_dir)
        .collect();

    for patches_dir in candidate_dirs {
        if !patches_dir.exists() {
            continue;
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&patches_dir).max_depth(1) {
            let entry = entry?;
            if entry.file_type().is_file()
                && entry.path().extension().and_then(|s| s.to_str()) == Some("toml")
            {
                files.push(entry.path().to_path_buf());
            }
        }

        files.sort();

        if !files.is_empty() {
            return Ok(files);
        }
    }

    anyhow::bail!(
        "No .toml rule files found in either ./patches or {}/patches",
        workspace.display()
    )
}

/// Resolve the server workspace path using multiple detection strategies
///
/// Priority order:
/// 1. Explicit --workspace flag
/// 2. ADMIN_PATCHER_WORKSPACE environment variable
/// 3. Auto-detect by walking up from the current directory
fn resolve_workspace(cli_workspace: Option<PathBuf>) -> Result<PathBuf> {
    // 1. Explicit flag (highest priority)
    if let Some(path) = cli_workspace {
        return Ok(path.canonicalize()?);
    }

    // 2. Environment variable
    if let Ok(env_path) = env::var("ADMIN_PATCHER_WORKSPACE") {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            return Ok(path.canonicalize()?);
        }
        eprintln!(
            "{}",
            format!(
                "Warning: ADMIN_PATCHER_WORKSPACE is set but path doesn't exist: {}",
                env_path
            )
            .yellow()
        );
    }

    // 3. Auto-detect from current directory
    if let Some(path) = auto_detect_workspace() {
        println!(
            "{}",
            format!("Auto-detected workspace: {}", path.display()).dimmed()
        );
        return Ok(path);
    }

    anyhow::bail!(
        "{}\n{}\n  {}\n  {}\n  {}",
        "Could not find the server workspace.".red(),
        "Try one of:".bold(),
        "1. cd into the server checkout: cd /var/www/staging/server && admin-patcher apply",
        "2. Specify explicitly: admin-patcher apply --workspace /var/www/staging/server",
        "3. Set environment variable: export ADMIN_PATCHER_WORKSPACE=/var/www/staging/server"
    )
}

/// Auto-detect the server workspace by walking up from the current directory.
///
/// A workspace is a Node checkout: package.json at the root plus the source
/// tree the shipped rules target.
fn auto_detect_workspace() -> Option<PathBuf> {
    let current = env::current_dir().ok()?;

    for ancestor in current.ancestors() {
        if !ancestor.join("package.json").exists() {
            continue;
        }
        if ancestor.join("src").is_dir() {
            return Some(ancestor.to_path_buf());
        }
    }

    None
}

/// Helper: Read the server version, warning and defaulting when absent.
fn server_version(workspace: &Path) -> String {
    read_package_version(workspace).unwrap_or_else(|e| {
        eprintln!(
            "{}",
            format!("Warning: {}, using 0.0.0", e).yellow()
        );
        "0.0.0".to_string()
    })
}

/// Helper: Show unified diff between original and modified content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => format!("-{}", change).red(),
            ChangeTag::Insert => format!("+{}", change).green(),
            ChangeTag::Equal => format!(" {}", change).normal(),
        };
        print!("{}", sign);
    }
}

/// Resolve the files a rule set targets, for diff capture.
fn target_files(config: &RuleSet, workspace: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = config
        .rules
        .iter()
        .map(|rule| {
            if config.meta.workspace_relative {
                workspace.join(&rule.file)
            } else {
                PathBuf::from(&rule.file)
            }
        })
        .collect();
    files.sort();
    files.dedup();
    files
}

fn cmd_apply(
    workspace: Option<PathBuf>,
    rules: Option<PathBuf>,
    dry_run: bool,
    show_diff: bool,
) -> Result<()> {
    let workspace = resolve_workspace(workspace)?;

    let rule_files = if let Some(path) = rules {
        vec![path]
    } else {
        discover_rule_files(&workspace)?
    };

    let version = server_version(&workspace);
    let mut ledger = Ledger::load(&workspace)?;

    println!("Workspace: {}", workspace.display());
    println!("Server version: {}", version);
    println!();

    let mut total_applied = 0;
    let mut total_already_applied = 0;
    let mut total_skipped = 0;
    let mut total_failed = 0;

    for rule_file in rule_files {
        println!("Loading rules from {}...", rule_file.display());

        let config = load_from_path(&rule_file)?;

        if config.rules.is_empty() {
            println!("{}", "  No rules found in file".yellow());
            continue;
        }

        // Capture file contents before applying (for diff output)
        let mut contents_before: HashMap<PathBuf, String> = HashMap::new();
        if show_diff && !dry_run {
            for file_path in target_files(&config, &workspace) {
                if let Ok(content) = fs::read_to_string(&file_path) {
                    contents_before.insert(file_path, content);
                }
            }
        }

        let results = if dry_run {
            println!("{}", "  [DRY RUN - no files will be modified]".cyan());
            check_rules(&config, &workspace, &version, &ledger)
        } else {
            apply_rules(&config, &workspace, &version, &mut ledger)
        };

        let mut touched_files = Vec::new();

        for (rule_id, result) in results {
            match result {
                Ok(PatchResult::Applied {
                    ref file,
                    replacements,
                }) => {
                    let verb = if dry_run { "Would apply" } else { "Applied" };
                    println!(
                        "{} {}: {} {} replacement(s) to {}",
                        "✓".green(),
                        rule_id,
                        verb,
                        replacements,
                        file.display()
                    );
                    total_applied += 1;
                    touched_files.push(file.clone());
                }
                Ok(PatchResult::AlreadyApplied { file }) => {
                    println!(
                        "{} {}: Already applied to {}",
                        "⊙".yellow(),
                        rule_id,
                        file.display()
                    );
                    total_already_applied += 1;
                }
                Ok(PatchResult::SkippedVersion { reason }) => {
                    println!("{} {}: Skipped ({})", "⊘".cyan(), rule_id, reason);
                    total_skipped += 1;
                }
                Ok(PatchResult::SkippedLedger { reason }) => {
                    println!("{} {}: Skipped ({})", "⊘".cyan(), rule_id, reason);
                    total_skipped += 1;
                }
                Ok(PatchResult::Failed { file, reason }) => {
                    eprintln!("{} {}: Failed - {}", "✗".red(), rule_id, reason);
                    eprintln!("  File: {}", file.display());
                    total_failed += 1;
                }
                Err(e) => {
                    eprintln!("{} {}: Error - {}", "✗".red(), rule_id, e);
                    total_failed += 1;
                }
            }
        }

        if show_diff && !dry_run {
            touched_files.sort();
            touched_files.dedup();
            for file in touched_files {
                if let Some(before) = contents_before.get(&file) {
                    if let Ok(after) = fs::read_to_string(&file) {
                        if before != &after {
                            display_diff(&file, before, &after);
                        }
                    }
                }
            }
        }

        println!();
    }

    if !dry_run {
        ledger.save()?;
    }

    println!("{}", "Summary:".bold());
    println!("  {} applied", format!("{}", total_applied).green());
    println!(
        "  {} already applied",
        format!("{}", total_already_applied).yellow()
    );
    println!("  {} skipped", format!("{}", total_skipped).cyan());
    println!("  {} failed", format!("{}", total_failed).red());

    if total_failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_status(workspace: Option<PathBuf>) -> Result<()> {
    let workspace = resolve_workspace(workspace)?;
    let rule_files = discover_rule_files(&workspace)?;
    let version = server_version(&workspace);
    let ledger = Ledger::load(&workspace)?;

    println!("{}", "Patch Status Report".bold());
    println!("Workspace: {}", workspace.display());
    println!("Server version: {}", version);
    println!();

    let mut applied = Vec::new();
    let mut not_applied = Vec::new();
    let mut skipped = Vec::new();

    // Read-only; does not mutate workspace files or the ledger
    for rule_file in rule_files {
        let config = load_from_path(&rule_file)?;
        let results = check_rules(&config, &workspace, &version, &ledger);

        for (rule_id, result) in results {
            match result {
                Ok(PatchResult::Applied { .. }) => {
                    // Target found and would be changed if applied
                    not_applied.push((rule_id, "target found but not yet patched".to_string()));
                }
                Ok(PatchResult::AlreadyApplied { .. })
                | Ok(PatchResult::SkippedLedger { .. }) => {
                    applied.push(rule_id);
                }
                Ok(PatchResult::SkippedVersion { reason }) => {
                    skipped.push((rule_id, reason));
                }
                Ok(PatchResult::Failed { ref reason, .. }) => {
                    not_applied.push((rule_id, reason.clone()));
                }
                Err(ref e) => {
                    not_applied.push((rule_id, e.to_string()));
                }
            }
        }
    }

    if !applied.is_empty() {
        println!(
            "{} {} ({} rules)",
            "✓".green(),
            "APPLIED".green().bold(),
            applied.len()
        );
        for id in &applied {
            println!("  - {}", id);
        }
        println!();
    }

    if !not_applied.is_empty() {
        println!(
            "{} {} ({} rules)",
            "⊙".yellow(),
            "NOT APPLIED".yellow().bold(),
            not_applied.len()
        );
        for (id, reason) in &not_applied {
            println!("  - {} ({})", id, reason.dimmed());
        }
        println!();
    }

    if !skipped.is_empty() {
        println!(
            "{} {} ({} rules)",
            "⊘".cyan(),
            "SKIPPED".cyan().bold(),
            skipped.len()
        );
        for (id, reason) in &skipped {
            println!("  - {} ({})", id, reason.dimmed());
        }
        println!();
    }

    Ok(())
}

fn cmd_verify(workspace: Option<PathBuf>) -> Result<()> {
    let workspace = resolve_workspace(workspace)?;
    let rule_files = discover_rule_files(&workspace)?;
    let version = server_version(&workspace);
    let ledger = Ledger::load(&workspace)?;

    println!("{}", "Verifying patch rules...".bold());
    println!("Workspace: {}", workspace.display());
    println!("Server version: {}", version);
    println!();

    let mut verified = 0;
    let mut mismatch = 0;
    let mut skipped = 0;

    for rule_file in rule_files {
        let config = load_from_path(&rule_file)?;
        let results = check_rules(&config, &workspace, &version, &ledger);

        for (rule_id, result) in results {
            match result {
                Ok(PatchResult::AlreadyApplied { .. })
                | Ok(PatchResult::SkippedLedger { .. }) => {
                    println!("{} {}: Verified (already applied)", "✓".green(), rule_id);
                    verified += 1;
                }
                Ok(PatchResult::Applied { file, .. }) => {
                    eprintln!("{} {}: MISMATCH", "✗".red(), rule_id);
                    eprintln!("  Expected: rule already applied");
                    eprintln!("  Found: rule not yet applied");
                    eprintln!("  Location: {}", file.display());
                    mismatch += 1;
                }
                Ok(PatchResult::SkippedVersion { reason }) => {
                    println!("{} {}: Skipped ({})", "⊘".cyan(), rule_id, reason);
                    skipped += 1;
                }
                Ok(PatchResult::Failed {
                    ref file,
                    ref reason,
                }) => {
                    eprintln!("{} {}: MISMATCH", "✗".red(), rule_id);
                    eprintln!("  Error: {}", reason);
                    eprintln!("  Location: {}", file.display());
                    mismatch += 1;
                }
                Err(ref e) => {
                    eprintln!("{} {}: MISMATCH", "✗".red(), rule_id);
                    eprintln!("  Error: {}", e);
                    mismatch += 1;
                }
            }
        }
    }

    println!();
    println!("{}", "Summary:".bold());
    println!("  {} verified", format!("{}", verified).green());
    println!("  {} mismatch", format!("{}", mismatch).red());
    println!("  {} skipped", format!("{}", skipped).cyan());

    if mismatch > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_list(workspace: Option<PathBuf>) -> Result<()> {
    let workspace = resolve_workspace(workspace)?;
    let rule_files = discover_rule_files(&workspace)?;

    for rule_file in rule_files {
        let config = load_from_path(&rule_file)?;

        let name = if config.meta.name.is_empty() {
            rule_file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string()
        } else {
            config.meta.name.clone()
        };

        println!("{} ({})", name.bold(), rule_file.display());
        if let Some(description) = &config.meta.description {
            println!("  {}", description.dimmed());
        }
        if let Some(range) = &config.meta.version_range {
            println!("  version range: {}", range);
        }

        for rule in &config.rules {
            let kind = match &rule.query {
                Query::Literal { .. } => "literal",
                Query::Pattern { .. } => "pattern",
                Query::Anchor { .. } => "anchor",
            };
            println!("  - {} [{}] -> {}", rule.id, kind, rule.file);
        }
        println!();
    }

    Ok(())
}
