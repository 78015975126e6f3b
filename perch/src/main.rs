// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Perch: Declarative host convergence for the Kea ecosystem
//!
//! The Perch is where a new machine settles into its declared shape.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kea_perch::{
    host,
    report::{combine_exit_codes, EXIT_CONNECTION_LOST, EXIT_ERROR},
    run::target_context,
    Config, Interrupt, Manifest, PerchError, Plan, Run, RunOptions, RunReport, TagFilter,
};

/// Kea-Perch: The Roost Keeper
///
/// Declarative, idempotent host convergence for the Kea ecosystem.
/// Applies tag-filtered manifests and validates risky files before they go live.
#[derive(Parser, Debug)]
#[command(name = "perch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "perch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (report what would change, commit nothing)
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge targets to a manifest
    #[command(alias = "run")]
    Apply {
        /// Manifest file (defaults to the configured manifest)
        manifest: Option<PathBuf>,

        /// Target to converge (repeatable; defaults to every configured target)
        #[arg(short, long = "target")]
        targets: Vec<String>,

        #[command(flatten)]
        tags: TagArgs,

        /// Variable override as KEY=VALUE (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Directive id whose ignored failure does not fail the run (repeatable)
        #[arg(long = "allow-failure", value_name = "ID")]
        allow_failures: Vec<String>,

        /// Report format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show which directives would run, in order
    Plan {
        /// Manifest file (defaults to the configured manifest)
        manifest: Option<PathBuf>,

        #[command(flatten)]
        tags: TagArgs,
    },

    /// Validate a manifest file
    Validate {
        /// Path to the manifest file
        manifest: PathBuf,
    },

    /// Show configuration
    Config,

    /// Initialize a new perch configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct TagArgs {
    /// Only run directives with one of these tags (comma-separated, repeatable)
    #[arg(long = "tags", value_name = "TAGS")]
    include: Vec<String>,

    /// Never run directives with any of these tags (comma-separated, repeatable)
    #[arg(long = "skip-tags", value_name = "TAGS")]
    exclude: Vec<String>,
}

impl TagArgs {
    fn filter(&self) -> TagFilter {
        TagFilter::from_args(&self.include, &self.exclude)
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over flags and config
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else if cli.verbose {
            EnvFilter::new("info")
        } else {
            let level = Config::load_or_default(&cli.config)
                .map(|config| config.logging.level)
                .unwrap_or_else(|_| "warn".to_string());
            EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"))
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("Error: {:#}", error);
            ExitCode::from(exit_code_for(&error))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Version => {
            println!("Kea-Perch v{}", env!("CARGO_PKG_VERSION"));
            println!("The Roost Keeper for the Kea Ecosystem");
            Ok(0)
        }

        Commands::Init { force } => init_config(&cli.config, force).map(|()| 0),

        Commands::Config => show_config(&cli.config).map(|()| 0),

        Commands::Validate { manifest } => validate_manifest(&manifest).map(|()| 0),

        Commands::Plan { manifest, tags } => {
            show_plan(&cli.config, manifest.as_deref(), &tags.filter()).map(|()| 0)
        }

        Commands::Apply {
            manifest,
            targets,
            tags,
            vars,
            allow_failures,
            format,
        } => {
            let request = ApplyRequest {
                manifest,
                targets,
                filter: tags.filter(),
                vars,
                allow_failures,
                format,
                dry_run: cli.dry_run,
            };
            apply(&cli.config, request).await
        }
    }
}

/// Map a top-level error to a process exit code
fn exit_code_for(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<PerchError>() {
        Some(e) if e.is_connection_lost() => EXIT_CONNECTION_LOST,
        _ => EXIT_ERROR,
    }
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let default_config = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# Kea-Perch Configuration

name = "perch"
manifest = "site.toml"

[execution]
command_timeout_secs = 120

[report]
# Directive ids whose ignored failures do not fail the run
allowed_failures = []

[vars]
# admin_user = "deploy"

[[targets]]
name = "localhost"
connection = "local"

# [[targets]]
# name = "web-1"
# connection = "ssh"
# address = "203.0.113.10"
# user = "root"
# port = 22
# identity_file = "~/.ssh/id_ed25519"

[logging]
level = "warn"
"#;

    std::fs::write(config_path, default_config)?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the current configuration
fn show_config(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        let config = Config::default();
        println!("No configuration file found. Using defaults:");
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

fn load_manifest(config: &Config, manifest: Option<&Path>) -> anyhow::Result<(PathBuf, Manifest)> {
    let path = manifest.map(Path::to_path_buf).unwrap_or_else(|| config.manifest.clone());
    info!("Loading manifest: {}", path.display());

    let manifest = kea_perch::load_manifest(&path)
        .with_context(|| format!("Failed to load manifest: {}", path.display()))?;
    Ok((path, manifest))
}

/// Validate a manifest file
fn validate_manifest(manifest_path: &Path) -> anyhow::Result<()> {
    info!("Validating manifest: {}", manifest_path.display());

    let manifest = Manifest::from_file(manifest_path)
        .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;

    manifest
        .validate()
        .with_context(|| "Manifest validation failed")?;

    let tags: BTreeSet<&str> = manifest
        .directives
        .iter()
        .flat_map(|directive| directive.tags.iter().map(String::as_str))
        .collect();
    let gated = manifest
        .directives
        .iter()
        .filter(|directive| directive.requires_gate())
        .count();

    println!("Manifest '{}' is valid", manifest.name);
    println!();
    if !manifest.description.is_empty() {
        println!("  Description: {}", manifest.description);
    }
    println!("  Directives: {}", manifest.directives.len());
    println!("  Validated files: {}", gated);
    println!("  Handlers: {}", manifest.handlers.len());
    println!("  Tags: {}", tags.into_iter().collect::<Vec<_>>().join(", "));

    Ok(())
}

/// List the runnable subset of a manifest
fn show_plan(config_path: &Path, manifest: Option<&Path>, filter: &TagFilter) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let (path, manifest) = load_manifest(&config, manifest)?;
    let plan = Plan::build(&manifest.directives, filter);

    println!(
        "Plan for '{}' ({}): {} of {} directives",
        manifest.name,
        path.display(),
        plan.len(),
        manifest.directives.len()
    );
    println!();

    for (index, directive) in plan.runnable().iter().enumerate() {
        let mut line = format!("  {:>3}. {}", index + 1, directive.id);
        if !directive.tags.is_empty() {
            let tags: Vec<&str> = directive.tags.iter().map(String::as_str).collect();
            line.push_str(&format!(" [{}]", tags.join(", ")));
        }
        if directive.requires_gate() {
            line.push_str(" (validated)");
        }
        if let Some(var) = &directive.guard.when {
            line.push_str(&format!(" (when {})", var));
        }
        if !directive.description.is_empty() {
            line.push_str(&format!(" - {}", directive.description));
        }
        println!("{}", line);
    }

    if !plan.omitted().is_empty() {
        println!();
        let omitted: Vec<&str> = plan.omitted().iter().map(|d| d.id.as_str()).collect();
        println!("Omitted by tags: {}", omitted.join(", "));
    }

    Ok(())
}

/// Everything `perch apply` needs besides the config path
struct ApplyRequest {
    manifest: Option<PathBuf>,
    targets: Vec<String>,
    filter: TagFilter,
    vars: Vec<String>,
    allow_failures: Vec<String>,
    format: OutputFormat,
    dry_run: bool,
}

/// Converge every selected target, concurrently
async fn apply(config_path: &Path, request: ApplyRequest) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;
    let (_, manifest) = load_manifest(&config, request.manifest.as_deref())?;
    let targets = config.select_targets(&request.targets)?;

    let allowed_failures = config
        .report
        .allowed_failures
        .iter()
        .chain(&request.allow_failures)
        .cloned()
        .collect();
    let options = RunOptions {
        dry_run: request.dry_run,
        command_timeout: config.command_timeout(),
        filter: request.filter,
        allowed_failures,
    };

    let interrupt = Interrupt::new();
    let signal = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current directive");
            signal.trigger();
        }
    });

    if request.dry_run && request.format == OutputFormat::Text {
        println!("[DRY RUN] Nothing will be committed");
    }

    let mut runs = Vec::with_capacity(targets.len());
    for target in &targets {
        let context = target_context(&manifest, &config, target, &request.vars)?;
        let host = host::connect(target)?;
        let run = Run::new(&manifest, host, context, options.clone()).with_interrupt(interrupt.clone());
        runs.push(run.execute());
    }

    let results = join_all(runs).await;

    let mut codes = Vec::with_capacity(results.len());
    let mut reports: Vec<RunReport> = Vec::new();
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok(report) => {
                codes.push(report.exit_code());
                reports.push(report);
            }
            Err(e) => {
                eprintln!("Error: target '{}': {}", target.name, e);
                codes.push(if e.is_connection_lost() {
                    EXIT_CONNECTION_LOST
                } else {
                    EXIT_ERROR
                });
            }
        }
    }

    match request.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text => {
            for report in &reports {
                println!("{}", report.render_text());
            }
        }
    }

    Ok(combine_exit_codes(codes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["perch", "version"]).unwrap();
        match cli.command {
            Commands::Version => {}
            _ => panic!("Expected Version command"),
        }
    }

    #[test]
    fn test_cli_apply_command() {
        let cli = Cli::try_parse_from([
            "perch",
            "apply",
            "site.toml",
            "--target",
            "web-1",
            "--tags",
            "ssh,firewall",
            "--skip-tags",
            "docker",
            "--var",
            "admin_user=deploy",
            "--allow-failure",
            "enable-ufw",
            "--format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Apply {
                manifest,
                targets,
                tags,
                vars,
                allow_failures,
                format,
            } => {
                assert_eq!(manifest, Some(PathBuf::from("site.toml")));
                assert_eq!(targets, vec!["web-1"]);
                assert_eq!(tags.filter(), TagFilter::new(["firewall", "ssh"], ["docker"]));
                assert_eq!(vars, vec!["admin_user=deploy"]);
                assert_eq!(allow_failures, vec!["enable-ufw"]);
                assert_eq!(format, OutputFormat::Json);
            }
            _ => panic!("Expected Apply command"),
        }
    }

    #[test]
    fn test_cli_apply_defaults() {
        let cli = Cli::try_parse_from(["perch", "apply"]).unwrap();
        match cli.command {
            Commands::Apply {
                manifest, format, ..
            } => {
                assert!(manifest.is_none());
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("Expected Apply command"),
        }
    }

    #[test]
    fn test_cli_dry_run_flag() {
        let cli = Cli::try_parse_from(["perch", "--dry-run", "plan"]).unwrap();
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["perch", "-v", "config"]).unwrap();
        assert!(cli.verbose);
    }

    #[test]
    fn test_exit_code_for_connection_lost() {
        let error = anyhow::Error::new(PerchError::ConnectionLost {
            host: "web-1".to_string(),
            message: "refused".to_string(),
        });
        assert_eq!(exit_code_for(&error), EXIT_CONNECTION_LOST);
        assert_eq!(exit_code_for(&anyhow::anyhow!("bad flag")), EXIT_ERROR);
    }
}
