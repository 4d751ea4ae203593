//! fwctl - Ignition firmware update CLI

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ignition_engine::{
    Engine, EngineBuilder, EngineConfig, InstallFlags, InstallStatus, ParseFlags,
};
use ignition_errors::UpdateError;
use ignition_progress::Progress;

mod output;

#[derive(Parser)]
#[command(name = "fwctl")]
#[command(about = "Ignition firmware update tool")]
#[command(version)]
struct Cli {
    /// Engine state directory
    #[arg(long, global = true, default_value = "/var/lib/ignition")]
    state_dir: PathBuf,

    /// Emit machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// More logging; repeat for debug
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct InstallOpts {
    /// Permit installing an older release
    #[arg(long)]
    allow_older: bool,
    /// Permit rewriting the installed version
    #[arg(long)]
    allow_reinstall: bool,
    /// Permit switching firmware branch
    #[arg(long)]
    allow_branch_switch: bool,
    /// Skip vendor-declared requirement checks
    #[arg(long)]
    ignore_requirements: bool,
    /// Proceed past guard-rail problems
    #[arg(long)]
    force: bool,
    /// Do not record history for this install
    #[arg(long)]
    no_history: bool,
    /// Refuse devices that are not emulated
    #[arg(long)]
    only_emulated: bool,
}

impl InstallOpts {
    fn flags(&self) -> InstallFlags {
        let mut flags = InstallFlags::default();
        if self.allow_older {
            flags |= InstallFlags::ALLOW_OLDER;
        }
        if self.allow_reinstall {
            flags |= InstallFlags::ALLOW_REINSTALL;
        }
        if self.allow_branch_switch {
            flags |= InstallFlags::ALLOW_BRANCH_SWITCH;
        }
        if self.ignore_requirements {
            flags |= InstallFlags::IGNORE_REQUIREMENTS;
        }
        if self.force {
            flags |= InstallFlags::FORCE;
        }
        if self.no_history {
            flags |= InstallFlags::NO_HISTORY;
        }
        if self.only_emulated {
            flags |= InstallFlags::ONLY_EMULATED;
        }
        flags
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List devices the engine knows about
    GetDevices,
    /// List available updates for a device
    GetUpdates {
        /// Device id, id prefix or hardware-id; `*` when unambiguous
        device: Option<String>,
    },
    /// Install a cabinet archive onto a device
    Install {
        /// Path to the cabinet archive
        cabinet: PathBuf,
        /// Device selector
        device: Option<String>,
        #[command(flatten)]
        opts: InstallOpts,
    },
    /// Update a device to the newest available release
    Update {
        device: Option<String>,
        #[command(flatten)]
        opts: InstallOpts,
    },
    /// Downgrade a device to the newest release older than installed
    Downgrade {
        device: Option<String>,
        #[command(flatten)]
        opts: InstallOpts,
    },
    /// Rewrite the currently installed release
    Reinstall {
        device: Option<String>,
        #[command(flatten)]
        opts: InstallOpts,
    },
    /// Commit a staged update
    Activate { device: Option<String> },
    /// Hash on-device firmware and compare against expected checksums
    Verify { device: Option<String> },
    /// Snapshot on-device checksums for later verification
    VerifyUpdate { device: Option<String> },
    /// Show past install attempts
    GetHistory,
    /// Refresh metadata from enabled remotes
    Refresh {
        /// Refresh even when the cached metadata is fresh
        #[arg(long)]
        force: bool,
    },
    /// Show the engine's security posture
    Security,
    /// Enable a remote
    EnableRemote { remote_id: String },
    /// Disable a remote
    DisableRemote { remote_id: String },
    /// Align devices to a best-known-configuration tag
    Sync { tag: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            let code = error
                .downcast_ref::<UpdateError>()
                .map(|e| i32::from(e.exit_code()) as u8)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("IGNITION_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn build_engine(cli: &Cli) -> Result<Engine> {
    let config = EngineConfig::load(cli.state_dir.clone(), None)
        .context("failed to load configuration")?;
    let engine = EngineBuilder::new(config)
        .build()
        .await
        .context("failed to start engine")?;
    Ok(engine)
}

fn selector(device: Option<String>) -> String {
    device.unwrap_or_else(|| "*".to_string())
}

/// Install progress on stderr while the real work runs.
fn spawn_progress_printer(progress: &Progress, quiet: bool) -> Option<tokio::task::JoinHandle<()>> {
    if quiet {
        return None;
    }
    let mut rx = progress.subscribe();
    Some(tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let update = *rx.borrow();
            eprint!("\r{:>3}%  {:?}        ", update.percentage, update.status);
        }
    }))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let json = cli.json;
    let engine = build_engine(&cli).await?;

    match cli.command {
        Commands::GetDevices => {
            let devices = engine.devices().await;
            let details = if cli.verbose > 0 {
                Some(
                    devices
                        .iter()
                        .map(|d| engine.describe_device(d))
                        .collect::<Vec<_>>(),
                )
            } else {
                None
            };
            output::render_devices(&devices, details.as_deref(), json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::GetUpdates { device } => {
            let updates = engine.updates_for(&selector(device)).await?;
            if updates.is_empty() {
                eprintln!("no updates available");
                return Ok(ExitCode::from(2));
            }
            output::render_updates(&updates, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Install {
            cabinet,
            device,
            opts,
        } => {
            let bytes = tokio::fs::read(&cabinet)
                .await
                .with_context(|| format!("failed to read {}", cabinet.display()))?;
            let progress = Progress::new();
            let printer = spawn_progress_printer(&progress, json);
            let report = engine
                .install(
                    &selector(device),
                    &bytes,
                    opts.flags(),
                    ParseFlags::default(),
                    &progress,
                    None,
                )
                .await;
            if let Some(printer) = printer {
                printer.abort();
                eprintln!();
            }
            let report = report?;
            output::render_report(&report, json)?;
            Ok(exit_for_status(report.status()))
        }

        Commands::Update { device, opts } => {
            install_from_remote(&engine, device, opts, ReleasePick::Newer, json).await
        }

        Commands::Downgrade { device, mut opts } => {
            opts.allow_older = true;
            install_from_remote(&engine, device, opts, ReleasePick::Older, json).await
        }

        Commands::Reinstall { device, mut opts } => {
            opts.allow_reinstall = true;
            install_from_remote(&engine, device, opts, ReleasePick::Same, json).await
        }

        Commands::Activate { device } => {
            let progress = Progress::new();
            engine.activate(&selector(device), &progress).await?;
            println!("activation complete");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Verify { device } => {
            engine.verify(&selector(device)).await?;
            println!("verification passed");
            Ok(ExitCode::SUCCESS)
        }

        Commands::VerifyUpdate { device } => {
            engine.verify_update(&selector(device)).await?;
            println!("verification snapshot stored");
            Ok(ExitCode::SUCCESS)
        }

        Commands::GetHistory => {
            let history = engine.history().await;
            if history.is_empty() {
                eprintln!("no history");
                return Ok(ExitCode::from(2));
            }
            output::render_history(&history, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Refresh { force } => {
            let summary = engine.refresh(force).await?;
            if let Some(ref warning) = summary.stale_warning {
                eprintln!("warning: {warning}");
            }
            println!(
                "refreshed {} remotes, {} fresh",
                summary.refreshed, summary.skipped
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Security => {
            let summary = engine.security_summary().await;
            output::render_security(&summary, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::EnableRemote { remote_id } => {
            engine.set_remote_enabled(&remote_id, true).await?;
            println!("enabled '{remote_id}'");
            Ok(ExitCode::SUCCESS)
        }

        Commands::DisableRemote { remote_id } => {
            engine.set_remote_enabled(&remote_id, false).await?;
            println!("disabled '{remote_id}'");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Sync { tag } => {
            let progress = Progress::new();
            let printer = spawn_progress_printer(&progress, json);
            let report = engine.sync(tag.as_deref(), &progress).await;
            if let Some(printer) = printer {
                printer.abort();
                eprintln!();
            }
            let report = report?;
            output::render_report(&report, json)?;
            Ok(exit_for_status(report.status()))
        }
    }
}

fn exit_for_status(status: InstallStatus) -> ExitCode {
    match status {
        InstallStatus::Success => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    }
}

enum ReleasePick {
    Newer,
    Older,
    Same,
}

/// Pick a release from the metadata index and install its payload.
///
/// Fetches only filesystem locations; a release whose every location is a
/// network URI needs the download daemon and is reported as unreachable.
async fn install_from_remote(
    engine: &Engine,
    device: Option<String>,
    opts: InstallOpts,
    pick: ReleasePick,
    json: bool,
) -> Result<ExitCode> {
    use ignition_remote::{FileFetcher, MetadataFetcher};

    let selector = selector(device);
    let target = engine.select_device(&selector).await?;
    let current = target.version.clone();
    let candidates = engine.releases_for(&selector).await?;

    let wanted = candidates.into_iter().find(|c| {
        let ordering = match current {
            Some(ref current) => ignition_version::Version::try_compare(
                &c.release.version,
                current,
                target.version_format,
            ),
            None => Some(std::cmp::Ordering::Greater),
        };
        match pick {
            ReleasePick::Newer => ordering == Some(std::cmp::Ordering::Greater),
            ReleasePick::Older => ordering == Some(std::cmp::Ordering::Less),
            ReleasePick::Same => ordering == Some(std::cmp::Ordering::Equal),
        }
    });
    let Some(wanted) = wanted else {
        return Err(UpdateError::nothing_to_do(format!(
            "no suitable release for device {}",
            target.id
        ))
        .into());
    };

    let fetcher = FileFetcher;
    let mut bytes = None;
    for location in &wanted.release.locations {
        if location.starts_with("http://") || location.starts_with("https://") {
            continue;
        }
        if let Ok(fetched) = fetcher.fetch(location).await {
            bytes = Some(fetched);
            break;
        }
    }
    let Some(bytes) = bytes else {
        return Err(UpdateError::new(
            ignition_errors::ErrorKind::NotReachable,
            format!(
                "release {} is only available from a download remote",
                wanted.release.version
            ),
        )
        .into());
    };

    let progress = Progress::new();
    let printer = spawn_progress_printer(&progress, json);
    let report = engine
        .install(
            &selector,
            &bytes,
            opts.flags(),
            ParseFlags::default(),
            &progress,
            None,
        )
        .await;
    if let Some(printer) = printer {
        printer.abort();
        eprintln!();
    }
    let report = report?;
    output::render_report(&report, json)?;
    Ok(exit_for_status(report.status()))
}
