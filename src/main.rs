mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use cli::{Cli, Commands};
use stack_cli::core::catalog::{SourceEntry, SourceMode};
use stack_cli::core::prompt::{NonInteractive, Prompter, TerminalPrompter};
use stack_cli::core::runner::{
    BackupOptions, OperationRunner, RestoreOptions, RestoreOutcome, RunnerSettings,
    ServiceReport, StartReport, UnitStatus,
};
use stack_cli::core::{DockerEngine, StackError};
use stack_cli::utils::{format_age, format_bytes, format_duration, get_project_root, logger, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logger::init(if cli.verbose { "debug" } else { "info" }) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` when the command ran but a selected service failed entirely
async fn run(cli: Cli) -> Result<bool> {
    let mut config = AppConfig::load()?;
    let registry = config.registry()?;
    let project_root = get_project_root(cli.project_root.as_deref(), &mut config, &registry)?;
    let backup_root = cli
        .backup_root
        .clone()
        .unwrap_or_else(|| config.backup_root(&project_root));

    let settings = RunnerSettings {
        project_root,
        backup_root,
        archive_prefix: config.archive_prefix(),
        helper_image: config.helper_image(),
        network: config.network(),
        health: config.health_gate()?,
        on_unhealthy: config.on_unhealthy(),
    };

    let engine = DockerEngine::connect().context("Failed to create Docker client")?;
    if !matches!(cli.command, Commands::List) && !engine.check_docker().await {
        anyhow::bail!("Docker daemon is not reachable. Is Docker running?");
    }
    let runner = OperationRunner::new(registry, Arc::new(engine), settings);

    match cli.command {
        Commands::Backup {
            services,
            stop,
            bundle,
            restart,
        } => handle_backup(&runner, services, BackupOptions { stop, bundle, restart }).await,
        Commands::Restore { services, yes, start } => {
            handle_restore(&runner, services, RestoreOptions { assume_yes: yes, start }).await
        }
        Commands::Start { services } => handle_start(&runner, services).await,
        Commands::List => handle_list(&runner),
    }
}

/// Interactive prompts on a terminal, defaults (and `--yes`) otherwise
fn prompter(assume_yes: bool) -> Box<dyn Prompter> {
    if std::io::stdin().is_terminal() {
        Box::new(TerminalPrompter::stdio())
    } else {
        Box::new(NonInteractive { assume_yes })
    }
}

fn print_service(report: &ServiceReport) {
    let header = match &report.instance {
        Some(path) => format!("{} ({})", report.service.bold(), path.display()),
        None => report.service.bold().to_string(),
    };
    println!("{}", header);

    if let Some(error) = &report.error {
        println!("  {} {}", "✗".red(), error);
    }
    for unit in &report.units {
        match &unit.status {
            UnitStatus::Captured => println!("  {} {}", "✓".green(), unit.unit),
            UnitStatus::Restored => println!("  {} {} restored", "✓".green(), unit.unit),
            UnitStatus::Skipped { reason } => {
                println!("  {} {} skipped: {}", "-".yellow(), unit.unit, reason)
            }
            UnitStatus::Failed { error } => println!("  {} {}: {}", "✗".red(), unit.unit, error),
        }
    }
}

fn print_start(report: &StartReport) {
    for name in &report.started {
        println!("  {} {} started", "✓".green(), name);
    }
    for name in &report.unhealthy {
        println!("  {} {} started but not healthy", "⚠".yellow(), name);
    }
    for name in &report.skipped {
        println!("  {} {} not started (dependency unavailable)", "-".yellow(), name);
    }
    for (name, error) in &report.failed {
        println!("  {} {} failed to start: {}", "✗".red(), name, error);
    }
}

async fn handle_backup(runner: &OperationRunner, services: Vec<String>, options: BackupOptions) -> Result<bool> {
    let selection = if services.is_empty() {
        runner.registry().all()
    } else {
        runner.registry().validate_selection(&services)?
    };

    let started = Instant::now();
    let report = runner
        .backup(&selection, &options, prompter(false).as_mut())
        .await?;

    println!();
    for service in &report.services {
        print_service(service);
    }
    if let Some(bundle) = &report.bundle {
        let size = std::fs::metadata(bundle).map(|m| m.len()).unwrap_or(0);
        println!("\n{} Archive {} ({})", "✓".green(), bundle.display(), format_bytes(size));
    }
    if let Some(restart) = &report.restart {
        println!("\nRestart:");
        print_start(restart);
    } else if !report.stopped.is_empty() {
        println!("\n{} Left stopped: {}", "⚠".yellow(), report.stopped.join(", "));
    }

    let ok = !report.has_failures();
    let mark = if ok { "✓".green() } else { "✗".red() };
    println!(
        "\n{} Backup {} finished in {}",
        mark,
        report.timestamp,
        format_duration(started.elapsed().as_secs())
    );
    Ok(ok)
}

async fn handle_restore(runner: &OperationRunner, services: Vec<String>, options: RestoreOptions) -> Result<bool> {
    let requested = (!services.is_empty()).then_some(services.as_slice());
    let started = Instant::now();
    let outcome = runner
        .restore(requested, &options, prompter(options.assume_yes).as_mut())
        .await?;

    let report = match outcome {
        RestoreOutcome::Cancelled => {
            println!("Restore cancelled; nothing was changed.");
            return Ok(true);
        }
        RestoreOutcome::Completed(report) => report,
    };

    println!();
    for service in &report.services {
        print_service(service);
    }
    match &report.start {
        Some(start) => {
            println!("\nStart:");
            print_start(start);
        }
        None => println!(
            "\n{} Stopped services were left down: {}",
            "⚠".yellow(),
            report.stopped.join(", ")
        ),
    }

    let ok = !report.has_failures();
    let mark = if ok { "✓".green() } else { "✗".red() };
    println!(
        "\n{} Restore finished in {}",
        mark,
        format_duration(started.elapsed().as_secs())
    );
    Ok(ok)
}

async fn handle_start(runner: &OperationRunner, services: Vec<String>) -> Result<bool> {
    let selection = if services.is_empty() {
        runner.registry().all()
    } else {
        runner.registry().validate_selection(&services)?
    };

    let report = runner.start(&selection).await?;
    print_start(&report);
    Ok(!report.has_failures())
}

fn handle_list(runner: &OperationRunner) -> Result<bool> {
    let snapshot = match runner.list() {
        Ok(snapshot) => snapshot,
        Err(StackError::NotFound { root }) => {
            println!("No backups found under {}", root.display());
            return Ok(true);
        }
        Err(e) => return Err(e.into()),
    };
    let now = chrono::Local::now();

    println!("{}", format!("Backups in {}", snapshot.root.display()).bold());
    for name in runner.registry().names() {
        match snapshot.folders.get(name) {
            Some(instance) => println!(
                "  {:<12} {}  {}",
                name,
                format_age(instance.created_at, now),
                instance.root_path.display()
            ),
            None => println!("  {:<12} {}", name, "no folder backup".dimmed()),
        }
    }

    if let Some(archive) = &snapshot.archive {
        let size = std::fs::metadata(&archive.path).map(|m| m.len()).unwrap_or(0);
        println!(
            "\nArchive {} ({}, {})",
            archive.path.display(),
            format_bytes(size),
            format_age(archive.created_at, now)
        );
        let contained: Vec<&str> = archive.contained_services.iter().map(|s| s.as_str()).collect();
        println!("  contains: {}", contained.join(", "));
    }

    let resolved = snapshot.resolve_source();
    let mode = match resolved.mode {
        SourceMode::Archive => "archive",
        SourceMode::Folders => "folders",
    };
    println!("\nRestore source: {}", mode.cyan());
    for name in runner.registry().names() {
        if let Some(entry) = resolved.per_service.get(name) {
            let from = match entry {
                SourceEntry::Folder(instance) => instance.root_path.display().to_string(),
                SourceEntry::Pending { archive } => archive.display().to_string(),
            };
            println!("  {} {:<12} {}", "✓".green(), name, from);
        }
    }
    Ok(true)
}
