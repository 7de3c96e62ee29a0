//! Graft - Skill Package Manager
//!
//! Usage:
//!   graft init                      # Snapshot the project and create .g2/
//!   graft apply <skill-dir>         # Apply a skill package
//!   graft uninstall <name>          # Remove a skill via replay
//!   graft update <new-core-dir>     # Carry skills onto a new core
//!   graft rebase [new-base-dir]     # Flatten skills or rebase onto a new base

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use graft_core::prelude::*;
use graft_core::resolutions::{load_resolutions, save_resolutions};

#[derive(Parser)]
#[command(name = "graft")]
#[command(about = "Skill Package Manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the .g2/ skeleton and snapshot the project base
    Init,
    /// Init, then capture pre-existing modifications as a migration patch
    Migrate,
    /// Apply a skill package from a directory
    Apply {
        /// Path to the skill package directory
        skill_dir: PathBuf,
    },
    /// Uninstall a skill by replaying the remaining skills
    Uninstall {
        /// Name of the skill to remove
        name: String,
        /// Proceed even when the skill carries a custom patch
        #[arg(long)]
        confirm: bool,
    },
    /// Preview and apply a core update
    Update {
        /// Directory containing the new core
        new_core_dir: PathBuf,
        /// Show the preview without applying
        #[arg(long)]
        preview: bool,
    },
    /// Flatten skills into the base, or rebase onto a new base directory
    Rebase {
        /// New base directory; flattens in place when omitted
        new_base_dir: Option<PathBuf>,
    },
    /// Manage customize sessions for user edits to skill-managed files
    Customize {
        #[command(subcommand)]
        action: CustomizeAction,
    },
    /// Inspect and seed the conflict-resolution cache
    Resolutions {
        #[command(subcommand)]
        action: ResolutionsAction,
    },
}

#[derive(Subcommand)]
enum CustomizeAction {
    /// Start a session, snapshotting skill-managed file hashes
    Start {
        /// Human-readable description of the customization
        description: String,
    },
    /// Commit the session as a numbered patch
    Commit,
    /// Abort the session without recording anything
    Abort,
}

#[derive(Subcommand)]
enum ResolutionsAction {
    /// Save resolved conflicts for a skill combination
    Save {
        /// Skill names in the combination
        #[arg(required = true)]
        skills: Vec<String>,
        /// YAML file with the resolved files and metadata
        #[arg(long)]
        request: PathBuf,
    },
    /// Load cached resolutions for a skill combination into rr-cache
    Load {
        /// Skill names in the combination
        #[arg(required = true)]
        skills: Vec<String>,
        /// Skill package providing the top skill's modify/ tree
        #[arg(long)]
        skill_dir: Option<PathBuf>,
    },
}

/// On-disk shape of a `resolutions save` request.
#[derive(Deserialize)]
struct SaveRequest {
    files: Vec<ResolutionFile>,
    #[serde(default)]
    meta: Option<ResolutionMetaInput>,
}

fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(success) => {
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Dispatch a command; Ok(false) is a structured, already-reported failure.
fn run(cli: Cli) -> anyhow::Result<bool> {
    let project_root = std::env::current_dir().context("Failed to read current directory")?;
    let ctx = EngineContext::new(project_root);

    match cli.command {
        Commands::Init => {
            InitCommand::new(&ctx).execute()?;
            println!("Skills system initialized. .g2/ directory created.");
            Ok(true)
        }
        Commands::Migrate => {
            let report = InitCommand::new(&ctx).migrate()?;
            match report.patch_file {
                Some(patch) => println!("Custom modifications captured in {patch}"),
                None => println!("No custom modifications detected."),
            }
            println!("Migration complete. Skills system ready.");
            Ok(true)
        }
        Commands::Apply { skill_dir } => {
            let report = ApplyCommand::new(&ctx).execute(&skill_dir)?;
            print_apply(&report);
            Ok(report.applied)
        }
        Commands::Uninstall { name, confirm } => {
            let report = UninstallCommand::new(&ctx).execute(&name, confirm)?;
            if let Some(warning) = &report.custom_patch_warning {
                eprintln!("{warning}");
            } else {
                println!("Uninstalled {}.", report.skill);
            }
            Ok(report.removed)
        }
        Commands::Update {
            new_core_dir,
            preview,
        } => {
            let command = UpdateCommand::new(&ctx);
            let plan = command.preview(&new_core_dir)?;
            print_preview(&plan);
            if preview {
                return Ok(true);
            }
            let report = command.execute(&new_core_dir)?;
            print_update(&report);
            Ok(report.updated)
        }
        Commands::Rebase { new_base_dir } => {
            let report = RebaseCommand::new(&ctx).execute(new_base_dir.as_deref())?;
            print_rebase(&report);
            Ok(report.rebased_at.is_some())
        }
        Commands::Customize { action } => {
            let session = CustomizeSession::new(&ctx);
            match action {
                CustomizeAction::Start { description } => {
                    session.start(&description)?;
                    println!("Customize session started.");
                }
                CustomizeAction::Commit => {
                    let commit = session.commit()?;
                    match commit.patch_file {
                        Some(patch) => println!(
                            "Committed {} file(s) to {patch}.",
                            commit.files_modified.len()
                        ),
                        None => println!("No files changed. Nothing to commit."),
                    }
                }
                CustomizeAction::Abort => {
                    session.abort()?;
                    println!("Customize session aborted.");
                }
            }
            Ok(true)
        }
        Commands::Resolutions { action } => match action {
            ResolutionsAction::Save { skills, request } => {
                let content = std::fs::read_to_string(&request)
                    .with_context(|| format!("Failed to read {}", request.display()))?;
                let parsed: SaveRequest = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse {}", request.display()))?;
                save_resolutions(
                    &ctx,
                    &skills,
                    &parsed.files,
                    parsed.meta.unwrap_or_default(),
                )?;
                println!("Saved {} resolution(s).", parsed.files.len());
                Ok(true)
            }
            ResolutionsAction::Load { skills, skill_dir } => {
                let loaded = load_resolutions(&ctx, &skills, skill_dir.as_deref())?;
                if loaded {
                    println!("Resolutions loaded into rr-cache.");
                } else {
                    println!("No matching resolutions found.");
                }
                Ok(loaded)
            }
        },
    }
}

fn print_apply(report: &ApplyReport) {
    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    if !report.untracked_changes.is_empty() {
        println!("Drift detected in: {}", report.untracked_changes.join(", "));
    }
    if report.applied {
        println!("Applied {} {}.", report.skill, report.version);
    } else if report.backup_pending {
        eprintln!(
            "Merge conflicts in: {}. Resolve manually, then clear the backup to \
             commit, or restore and clear it to abort.",
            report.merge_conflicts.join(", ")
        );
    }
}

fn print_preview(plan: &UpdatePreview) {
    println!(
        "Update {} -> {}: {} changed, {} deleted, {} at conflict risk, {} custom patch(es) at risk",
        plan.current_version,
        plan.new_version,
        plan.files_changed.len(),
        plan.files_deleted.len(),
        plan.conflict_risk.len(),
        plan.custom_patches_at_risk.len()
    );
}

fn print_update(report: &UpdateReport) {
    if report.updated {
        println!(
            "Updated core {} -> {}.",
            report.previous_version, report.new_version
        );
        for failure in &report.custom_patch_failures {
            eprintln!("Warning: custom patch failed to re-apply: {failure}");
        }
        for (skill, passed) in &report.skill_reapply_results {
            println!("test {}: {}", skill, if *passed { "ok" } else { "FAILED" });
        }
    } else if report.backup_pending {
        eprintln!(
            "Merge conflicts in: {}. Resolve manually, then clear the backup to \
             commit, or restore and clear it to abort.",
            report.merge_conflicts.join(", ")
        );
    }
}

fn print_rebase(report: &RebaseReport) {
    if let Some(at) = &report.rebased_at {
        println!(
            "Rebased at {at}; {} file(s) archived in {}.",
            report.files_in_patch,
            report.patch_file.as_deref().unwrap_or(".g2/combined.patch")
        );
    } else if report.backup_pending {
        eprintln!(
            "Merge conflicts in: {}. Resolve manually, then clear the backup to \
             commit, or restore and clear it to abort.",
            report.merge_conflicts.join(", ")
        );
    }
}
