use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::watch;

use bingwall::bing::Bing;
use bingwall::command::{CommandRunner, SystemRunner};
use bingwall::config::{default_config_file, seed_config_file, Config, ConfigLayer, ConfigSource, ConfigStore};
use bingwall::manager::{listen, signal_events, Manager, Outcome};
use bingwall::session;
use bingwall::wallpaper::Applier;

/// Sets Bing's picture of the day as the desktop wallpaper.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Bing market, e.g. en-US or de-DE
    #[arg(short, long)]
    market: Option<String>,
    /// Directory to store downloaded pictures in
    #[arg(short, long)]
    dir: Option<String>,
    /// Desktop environment, skips detection
    #[arg(long)]
    desktop: Option<String>,
    /// Picture placement, e.g. zoom or scaled
    #[arg(short = 'o', long)]
    picture_options: Option<String>,
    /// Time between updates in daemon mode, e.g. 6h or 1h30m
    #[arg(short, long)]
    interval: Option<String>,
    /// Wallpaper command for window managers, the picture path is appended
    #[arg(short, long)]
    command: Option<String>,
    /// Keep running and update periodically
    #[arg(long)]
    daemon: bool,
    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn layer(&self) -> ConfigLayer {
        ConfigLayer {
            market: self.market.clone(),
            wallpaper_dir: self.dir.clone(),
            desktop_environment: self.desktop.clone(),
            picture_options: self.picture_options.clone(),
            update_interval: self.interval.clone(),
            default_command: self.command.clone(),
        }
    }

    fn config_file(&self) -> Option<PathBuf> {
        if let Some(file) = &self.config {
            return Some(file.clone());
        }
        let file = default_config_file()?;
        seed_config_file(&file);
        Some(file)
    }
}

async fn run(daemon: bool, source: ConfigSource, config: Config) -> ExitCode {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let store = ConfigStore::new(config);
    let mut manager = Manager::new(
        Bing::new(runner.clone()),
        Applier::new(runner.clone()),
        runner,
        store.clone(),
    );

    if !daemon {
        return match manager.poll_picture().await {
            Ok(Outcome::Applied(path)) | Ok(Outcome::Unchanged(path)) => {
                info!("Done: {}", path.display());
                ExitCode::SUCCESS
            }
            Err(err) => {
                error!("Failed to update wallpaper: {}", err);
                ExitCode::FAILURE
            }
        };
    }

    let events = match signal_events() {
        Ok(events) => events,
        Err(err) => {
            error!("Failed to install signal handlers: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let (shutdown, receiver) = watch::channel(false);
    tokio::spawn(listen(Box::pin(events), store, shutdown, move || source.reload()));

    match manager.run(receiver).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    // before the runtime spawns any threads
    session::repair_bus_address();

    let source = ConfigSource {
        file: cli.config_file(),
        command_line: cli.layer(),
    };
    let config = match source.load() {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    info!("Using {:?}", config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(cli.daemon, source, config))
}
