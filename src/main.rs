//! dcs-deploy CLI entrypoint.
//!
//! This is the main entrypoint for the dcs-deploy command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use dcs_server_deploy::cli::{Cli, Commands, OutputFormatter, StateCommands};
use dcs_server_deploy::cloud::AzureClient;
use dcs_server_deploy::config::{ConfigParser, ConfigValidator, DeployConfig, find_config_file};
use dcs_server_deploy::error::{DeployError, ReconcileError, Result};
use dcs_server_deploy::reconciler::{Reconciler, ReconciliationResult};
use dcs_server_deploy::secrets::EnvSecretStore;
use dcs_server_deploy::state::{STATE_DIR, StateStore, open_store};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply {
            yes,
            continue_on_error,
            max_attempts,
        } => cmd_apply(config, yes, continue_on_error, max_attempts, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::Destroy { yes, force } => cmd_destroy(config, yes, force, &formatter).await,
        Commands::Output { name } => cmd_output(config, name.as_deref(), &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack directory.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("dcs.deploy.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/dcs.deploy.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.contains(STATE_DIR);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# dcs-deploy")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in the Azure credentials");
    eprintln!("  2. Edit dcs.deploy.yaml to match your snapshots and region");
    eprintln!("  3. Run 'dcs-deploy validate' to check the definition");
    eprintln!("  4. Run 'dcs-deploy plan' to see what will be deployed");
    eprintln!("  5. Run 'dcs-deploy apply' to deploy the server");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let validator = ConfigValidator::new();
    let report = validator.check(&config);
    for error in &report.errors {
        eprintln!("  ✗ {}: {}", error.field, error.message);
    }
    validator.validate(&config)?;

    eprintln!("Configuration is valid!");
    if show_warnings && !report.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &report.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Stack: {}", config.stack_name());
    eprintln!("  Resource group: {}", config.project.resource_group);
    eprintln!("  Location: {}", config.project.location);
    eprintln!("  VM: {} ({})", config.vm.name, config.vm.size);
    eprintln!("  Disks: {}", config.disks.len());
    eprintln!("  Security rules: {}", config.network.security_group.rules.len());
    eprintln!(
        "  Scheduled shutdown: {}",
        if config.shutdown.enabled { "enabled" } else { "disabled" }
    );

    Ok(())
}

/// Show deployment plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = AzureClient::from_env()?;
    let secrets = EnvSecretStore::new();

    let preview = Reconciler::new(&config, &state_store, &provider, &secrets)
        .plan()
        .await?;

    emit(&formatter.format_plan(&preview.plan, detailed.then_some(&preview.diff)))
}

/// Apply the stack definition.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    continue_on_error: bool,
    max_attempts: u32,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = AzureClient::from_env()?;
    let secrets = EnvSecretStore::new();

    let reconciler = Reconciler::new(&config, &state_store, &provider, &secrets)
        .with_max_attempts(max_attempts)
        .with_continue_on_error(continue_on_error);

    let preview = reconciler.plan().await?;
    if preview.plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(());
    }

    eprintln!("{}", formatter.format_plan(&preview.plan, None));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let result = reconciler.reconcile().await?;
    emit(&formatter.format_reconciliation(&result))?;
    finished(&result)
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let provider = AzureClient::from_env()?;
    let secrets = EnvSecretStore::new();

    let report = Reconciler::new(&config, &state_store, &provider, &secrets)
        .check_drift()
        .await?;

    emit(&formatter.format_drift(&report))
}

/// Destroy deployment.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    force: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;

    let state = state_store.load_for(&config.project).await?;
    if state.resources.is_empty() {
        eprintln!("No resources to destroy.");
        return Ok(());
    }

    eprintln!("The following resources will be destroyed:");
    for resource in state.resources.values() {
        let marker = if !force && config.is_protected(&resource.name) {
            " [protected]"
        } else {
            ""
        };
        eprintln!(
            "  - {} {} ({}){marker}",
            resource.kind, resource.name, resource.cloud_id
        );
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let provider = AzureClient::from_env()?;
    let secrets = EnvSecretStore::new();
    let result = Reconciler::new(&config, &state_store, &provider, &secrets)
        .destroy(force)
        .await?;

    emit(&formatter.format_reconciliation(&result))?;
    finished(&result)
}

/// Show exported values.
async fn cmd_output(
    config_path: Option<&Path>,
    name: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_store) = load_config_and_state(config_path).await?;
    let outputs = state_store.load_for(&config.project).await?.outputs;
    emit(&formatter.format_outputs(&outputs, name)?)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_config, state_store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                emit(&formatter.format_state(&state))?;
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let lock = state_store
                .acquire_lock(holder.as_deref().unwrap_or(""), "manual")
                .await?;
            eprintln!("State locked: {lock}");
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = state_store.get_lock_info().await? {
                    state_store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                }
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads configuration and opens the state store it names.
async fn load_config_and_state(
    config_path: Option<&Path>,
) -> Result<(DeployConfig, Box<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    let state_store = open_store(&config, &config_file).await?;
    debug!("Using {} state backend", state_store.backend_type());

    Ok((config, state_store))
}

/// Asks for confirmation on stderr; true if the answer matches `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.as_bytes())?;
    if !output.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}

/// Turns a partially failed run into a failing exit status.
fn finished(result: &ReconciliationResult) -> Result<()> {
    if result.success {
        return Ok(());
    }
    Err(DeployError::Reconcile(ReconcileError::Incomplete {
        failed: result.errors.len(),
        attempts: result.attempts,
    }))
}
