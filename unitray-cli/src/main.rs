mod commands;
mod executor;
mod host;
mod journal;
mod runtime;
mod systemctl;

#[cfg(test)]
mod testing;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use unitray_core::action::ServiceAction;
use unitray_core::clock::SystemClock;
use unitray_core::config::{TrayConfig, default_config_path, ensure_config};
use unitray_core::discovery::DiscoveryCache;

use executor::{DEFAULT_WORKERS, TaskExecutor};
use host::HostCommand;
use journal::JournalRequest;
use runtime::TrayRuntime;
use systemctl::Systemctl;

#[derive(Parser)]
#[command(name = "unitray", version)]
#[command(about = "Control per-user systemd services from the desktop session", long_about = None)]
struct Cli {
    /// Path to services.yaml
    #[arg(long, global = true, env = "UNITRAY_CONFIG")]
    config: Option<PathBuf>,

    /// systemctl command line, e.g. "flatpak-spawn --host systemctl"
    #[arg(long, global = true, env = "UNITRAY_SYSTEMCTL", default_value = "systemctl")]
    systemctl: String,

    #[arg(long, global = true, env = "UNITRAY_JOURNALCTL", default_value = "journalctl")]
    journalctl: String,

    /// Maximum number of concurrent systemctl invocations
    #[arg(long, global = true, env = "UNITRAY_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch configured services and report changes (default)
    Tray,
    /// List user services that can be managed
    List {
        /// Include filtered session and template units
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        filter: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Replace the configured services with the given units
    Select {
        #[arg(required = true)]
        units: Vec<String>,
    },
    /// Print the status of the given (or all configured) units
    Status { units: Vec<String> },
    /// Stop active units and start the others
    Toggle {
        #[arg(required = true)]
        units: Vec<String>,
    },
    Start {
        #[arg(required = true)]
        units: Vec<String>,
    },
    Stop {
        #[arg(required = true)]
        units: Vec<String>,
    },
    Restart {
        #[arg(required = true)]
        units: Vec<String>,
    },
    /// Reload unit definitions of the user manager
    ReloadDaemon,
    /// Show the journal of a unit
    Logs {
        unit: String,
        #[arg(short = 'n', long)]
        lines: Option<u32>,
        #[arg(short, long, overrides_with = "no_follow")]
        follow: bool,
        #[arg(long, overrides_with = "follow")]
        no_follow: bool,
    },
    /// Add a unit to the configuration
    Add {
        unit: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Remove a unit from the configuration
    Remove { unit: String },
    /// Run one of a unit's configured open actions
    Open {
        unit: String,
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
    /// Check the environment and configuration
    Doctor,
}

/// Resolved global options
struct Settings {
    config_path: PathBuf,
    systemctl: HostCommand,
    journalctl: HostCommand,
    workers: usize,
}

impl Settings {
    fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_path()?,
        };
        let Some(systemctl) = HostCommand::parse(&cli.systemctl) else {
            bail!("--systemctl must not be empty");
        };
        let Some(journalctl) = HostCommand::parse(&cli.journalctl) else {
            bail!("--journalctl must not be empty");
        };
        Ok(Self {
            config_path,
            systemctl,
            journalctl,
            workers: cli.workers.max(1),
        })
    }

    fn systemctl(&self) -> Systemctl {
        Systemctl::new(self.systemctl.clone())
    }

    fn discovery(&self) -> DiscoveryCache<Systemctl> {
        DiscoveryCache::new(self.systemctl(), Arc::new(SystemClock))
    }

    fn runtime(&self, config: TrayConfig) -> TrayRuntime<io::Stdout> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let executor = TaskExecutor::new(
            Arc::new(self.systemctl()),
            self.workers,
            event_tx,
            Handle::current(),
        );
        TrayRuntime::new(
            Arc::new(executor),
            event_rx,
            Arc::new(SystemClock),
            self.config_path.clone(),
            config,
            io::stdout(),
            Handle::current(),
        )
    }
}

/// The saved configuration, or an empty one when none exists yet
fn load_config(path: &Path) -> anyhow::Result<TrayConfig> {
    if !path.exists() {
        return Ok(TrayConfig::default());
    }
    TrayConfig::load(path).with_context(|| format!("failed to load {}", path.display()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UNITRAY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::from_cli(&cli)?;

    let failures = match cli.command.unwrap_or(Commands::Tray) {
        Commands::Tray => {
            let config = ensure_config(&settings.config_path).with_context(|| {
                format!("failed to prepare {}", settings.config_path.display())
            })?;
            println!(
                "Watching {} service(s) from {}",
                config.active_units().len(),
                settings.config_path.display()
            );
            settings.runtime(config).run().await?;
            0
        }
        Commands::List { all, filter, json } => {
            let config = load_config(&settings.config_path)?;
            let options = commands::ListOptions { all, filter, json };
            commands::run_list(&settings.discovery(), &config, &options, &mut io::stdout())?;
            0
        }
        Commands::Select { units } => {
            let cache = settings.discovery();
            commands::run_select(&cache, &settings.config_path, &units, &mut io::stdout())?;
            0
        }
        Commands::Status { units } => {
            let config = load_config(&settings.config_path)?;
            let targets = commands::target_units(&config, &units);
            if targets.is_empty() {
                println!("No services configured.");
                return Ok(());
            }
            settings.runtime(config).fetch_statuses(&targets).await
        }
        Commands::Toggle { units } => {
            let config = load_config(&settings.config_path)?;
            let targets = commands::target_units(&config, &units);
            settings.runtime(config).toggle(&targets).await
        }
        Commands::Start { units } => run_action(&settings, ServiceAction::Start, &units).await?,
        Commands::Stop { units } => run_action(&settings, ServiceAction::Stop, &units).await?,
        Commands::Restart { units } => {
            run_action(&settings, ServiceAction::Restart, &units).await?
        }
        Commands::ReloadDaemon => run_action(&settings, ServiceAction::DaemonReload, &[]).await?,
        Commands::Logs {
            unit,
            lines,
            follow,
            no_follow,
        } => {
            let config = load_config(&settings.config_path)?;
            let mut options = config.find(&unit).map(|s| s.logs).unwrap_or_default();
            if let Some(lines) = lines {
                options.lines = lines;
            }
            if follow {
                options.follow = true;
            } else if no_follow {
                options.follow = false;
            }
            run_logs(&settings, JournalRequest::new(unit, options)).await?
        }
        Commands::Add { unit, name } => {
            commands::run_add(&settings.config_path, &unit, name, &mut io::stdout())?;
            0
        }
        Commands::Remove { unit } => {
            commands::run_remove(&settings.config_path, &unit, &mut io::stdout())?;
            0
        }
        Commands::Open { unit, index } => {
            let config = load_config(&settings.config_path)?;
            commands::run_open(&config, &unit, index, &mut io::stdout())?;
            0
        }
        Commands::Doctor => commands::run_doctor(
            &settings.systemctl(),
            &settings.journalctl,
            &settings.config_path,
            &mut io::stdout(),
        )?,
    };

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_action(
    settings: &Settings,
    action: ServiceAction,
    units: &[String],
) -> anyhow::Result<usize> {
    let config = load_config(&settings.config_path)?;
    let targets = commands::target_units(&config, units);
    if action.is_per_unit() && targets.is_empty() {
        bail!("no units given");
    }
    Ok(settings.runtime(config).run_action(action, &targets).await)
}

async fn run_logs(settings: &Settings, request: JournalRequest) -> anyhow::Result<usize> {
    if request.follow {
        eprintln!("Following logs for {} (Ctrl+C to stop)", request.unit);
    }
    let mut stdout = io::stdout();
    tokio::select! {
        result = journal::stream(&settings.journalctl, &request, &mut stdout) => {
            let code = result.with_context(|| {
                format!("failed to run {}", settings.journalctl.display_with(&request.args()))
            })?;
            Ok(usize::from(code.is_some_and(|c| c != 0)))
        }
        _ = tokio::signal::ctrl_c() => {
            println!("{}", journal::STREAM_ENDED);
            Ok(0)
        }
    }
}
