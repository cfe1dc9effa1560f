mod logging;
mod notify;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use dockvault_borg::BorgCli;
use dockvault_core::backup::BackupPlan;
use dockvault_core::cancel::CancelToken;
use dockvault_core::config::Config;
use dockvault_core::error::RunError;
use dockvault_core::lock::RunLock;
use dockvault_core::orchestrator::{Collaborators, Orchestrator, RunOptions, RunReport};
use dockvault_core::remote::RemoteSync;
use dockvault_core::report::{human_bytes, Notifier};
use dockvault_core::restore::RestoreRequest;
use dockvault_core::space::FsProbe;
use dockvault_docker::DockerRuntime;
use dockvault_storage::remote_from_config;
use notify::SendmailNotifier;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::io::{self, BufRead, IsTerminal, Write};
use std::process::ExitCode;
use tracing::{debug, error};

const EXIT_FAILURE: u8 = 1;
const EXIT_PRECONDITION: u8 = 2;
const EXIT_LOCK_BUSY: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "dockvault", version, about = "Consistent backups and restores of a Docker host")]
struct Cli {
    #[arg(long, default_value = "/etc/dockvault/config.toml")]
    config: String,
    /// More log output; repeat for trace level.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    no_color: bool,
    /// Use this repository instead of paths.repository.
    #[arg(long, global = true)]
    repository: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the archive repository.
    Init,
    /// Snapshot the data root, or selected volumes in volume mode.
    Backup {
        /// Volume to include; repeatable. Overrides selection.include.
        #[arg(long = "volume")]
        volumes: Vec<String>,
        /// Continue past a failed space check.
        #[arg(long)]
        force: bool,
        /// Show what would be backed up and exit.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        progress: bool,
    },
    /// Replace the data root, or one volume, with an archive's copy.
    Restore {
        /// Archive name, or `latest`.
        #[arg(default_value = "latest")]
        archive: String,
        #[arg(long)]
        volume: Option<String>,
        /// Keep the replaced data next to the restored one.
        #[arg(long)]
        keep_relocated: bool,
        /// Skip the confirmation and the space check.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        progress: bool,
    },
    /// List archives in the repository, or files on the remote.
    List {
        #[arg(long)]
        remote: bool,
    },
    /// Apply retention to every scope, then compact and sync.
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Fetch the remote copy of the repository into the staging directory.
    Download,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(EXIT_PRECONDITION);
        }
    };
    let log = logging::LogOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        color: !cli.no_color,
        file: config.paths.log_file.as_deref(),
    };
    if let Err(err) = logging::init(&log) {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_PRECONDITION);
    }

    let cancel = CancelToken::new();
    if let Err(err) = install_signal_handlers(&cancel) {
        error!(error = %format!("{err:#}"), "failed to install signal handlers");
        return ExitCode::from(EXIT_FAILURE);
    }

    match run(&cli, &config, &cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config =
        Config::load(&cli.config).with_context(|| format!("config required at {}", cli.config))?;
    if let Some(repository) = &cli.repository {
        config.paths.repository = repository.clone();
        config.validate()?;
    }
    Ok(config)
}

/// First signal requests cancellation; a second one while the first is
/// still pending exits immediately.
fn install_signal_handlers(cancel: &CancelToken) -> Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register_conditional_shutdown(signal, i32::from(EXIT_CANCELLED), cancel.flag())
            .context("failed to register shutdown handler")?;
        signal_hook::flag::register(signal, cancel.flag()).context("failed to register signal flag")?;
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<RunError>() {
        Some(RunError::LockBusy { .. }) => EXIT_LOCK_BUSY,
        Some(RunError::Cancelled) => EXIT_CANCELLED,
        Some(run_error) if run_error.is_precondition() => EXIT_PRECONDITION,
        _ => EXIT_FAILURE,
    }
}

fn run(cli: &Cli, config: &Config, cancel: &CancelToken) -> Result<()> {
    let runtime = DockerRuntime::new(&config.service);
    let engine = BorgCli::from_config(config);
    let remote: Option<Box<dyn RemoteSync>> = config.remote.as_ref().map(remote_from_config).transpose()?;
    let notifier = config.notify.as_ref().map(SendmailNotifier::new);
    let (force, progress) = match &cli.command {
        Command::Backup { force, progress, .. } | Command::Restore { force, progress, .. } => (*force, *progress),
        _ => (false, false),
    };
    let orchestrator = Orchestrator::new(
        config,
        Collaborators {
            runtime: &runtime,
            engine: &engine,
            capacity: &FsProbe,
            remote: remote.as_deref(),
            notifier: notifier.as_ref().map(|n| n as &dyn Notifier),
        },
        RunOptions {
            force,
            progress,
            cancel: cancel.clone(),
        },
    );

    match &cli.command {
        Command::Init => {
            let _lock = RunLock::acquire(&config.paths.lock)?;
            if orchestrator.initialize()? {
                println!("Initialized repository {}", engine.repository());
            } else {
                println!("Repository already exists: {}", engine.repository());
            }
            Ok(())
        }
        Command::Backup { volumes, dry_run: true, .. } => {
            print_backup_plan(&orchestrator.plan_backup(volumes)?);
            Ok(())
        }
        Command::Backup { volumes, .. } => conclude(orchestrator.backup(volumes)),
        Command::Restore {
            archive,
            volume,
            keep_relocated,
            force,
            ..
        } => {
            let target = match volume {
                Some(name) => format!("volume {name}"),
                None => config.paths.data_root.display().to_string(),
            };
            if !force {
                confirm(&format!("Replace {target} with archive {archive}?"))?;
            }
            conclude(orchestrator.restore(&RestoreRequest {
                archive: archive.clone(),
                volume: volume.clone(),
                keep_relocated: *keep_relocated,
            }))
        }
        Command::List { remote: true } => {
            let remote = remote
                .as_deref()
                .ok_or_else(|| RunError::Precondition("no remote is configured".to_string()))?;
            for entry in remote.list()? {
                println!("{entry}");
            }
            Ok(())
        }
        Command::List { remote: false } => {
            for entry in orchestrator.archives()? {
                println!("{}\t{}", entry.name, entry.start);
            }
            Ok(())
        }
        Command::Cleanup { dry_run: true } => {
            for (scope, plan) in orchestrator.preview_cleanup()? {
                println!("{scope}:");
                for kept in &plan.keep {
                    let note = if kept.oldest { " (oldest)" } else { "" };
                    println!("  keep   {} [{}{note}]", kept.name, kept.rule.label());
                }
                for name in &plan.prune {
                    println!("  prune  {name}");
                }
            }
            Ok(())
        }
        Command::Cleanup { dry_run: false } => conclude(orchestrator.cleanup()),
        Command::Download => {
            let report = orchestrator.download();
            if report.result.is_ok() {
                println!(
                    "Repository downloaded to {}",
                    orchestrator.download_destination().display()
                );
            }
            conclude(report)
        }
    }
}

fn conclude(report: RunReport) -> Result<()> {
    print!("{}", report.summary.body());
    report.result
}

fn print_backup_plan(plan: &BackupPlan) {
    match plan {
        BackupPlan::DataRoot { scope, path, estimate } => {
            println!("would back up {} as {scope} ({})", path.display(), human_bytes(*estimate));
            println!("the platform service would be stopped for the snapshot");
        }
        BackupPlan::Volumes(seq) => {
            for volume in seq.in_order() {
                let paused: Vec<&str> = volume.running.iter().map(String::as_str).collect();
                println!(
                    "would back up volume {} ({}), pausing [{}]",
                    volume.name,
                    human_bytes(volume.size_estimate),
                    paused.join(", ")
                );
            }
            for skipped in &seq.skipped {
                println!("would skip volume {skipped} (in use)");
            }
        }
    }
}

/// Ask on the terminal. Without one, the caller must pass --force.
fn confirm(question: &str) -> Result<()> {
    if !io::stdin().is_terminal() {
        return Err(RunError::Precondition(
            "refusing to restore without confirmation; pass --force when not interactive".to_string(),
        )
        .into());
    }
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read answer")?;
    debug!(answer = answer.trim(), "confirmation answered");
    if matches!(answer.trim(), "y" | "Y" | "yes") {
        Ok(())
    } else {
        Err(anyhow!(RunError::Precondition("restore not confirmed".to_string())))
    }
}
