use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::{Stream, StreamExt};
use tokio_walltime::sleep_until;

use crate::bing::{AcquireError, Bing};
use crate::command::CommandRunner;
use crate::config::{Config, ConfigError, ConfigStore};
use crate::desktop::{DesktopEnvironment, Probe};
use crate::wallpaper::{Applier, ApplyError, ApplyRequest};

const FALLBACK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl CycleError {
    /// Only a missing tool stops the daemon; everything else is retried next cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            CycleError::Acquire(AcquireError::MissingDependency(_)) => true,
            CycleError::Apply(err) => err.is_fatal(),
            CycleError::Acquire(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new picture was handed to the desktop.
    Applied(PathBuf),
    /// Same picture as last cycle, the desktop was left alone.
    Unchanged(PathBuf),
}

pub struct Manager {
    bing: Bing,
    applier: Applier,
    runner: Arc<dyn CommandRunner>,
    store: ConfigStore,
    detected: OnceLock<DesktopEnvironment>,
    last_picture: Option<PathBuf>,
}

impl Manager {
    pub fn new(bing: Bing, applier: Applier, runner: Arc<dyn CommandRunner>, store: ConfigStore) -> Self {
        Manager {
            bing,
            applier,
            runner,
            store,
            detected: OnceLock::new(),
            last_picture: None,
        }
    }

    /// The configured override, or the environment detected on first use.
    fn desktop(&self, config: &Config) -> DesktopEnvironment {
        if let Some(desktop) = &config.desktop {
            return desktop.clone();
        }
        self.detected
            .get_or_init(|| Probe::new(self.runner.as_ref()).detect())
            .clone()
    }

    /// One acquire and apply cycle against the current configuration snapshot.
    pub async fn poll_picture(&mut self) -> Result<Outcome, CycleError> {
        let config = self.store.snapshot();
        debug!("Polling picture with {:?}", config);

        let image = self.bing.acquire(config.market, &config.wallpaper_dir).await?;
        if self.last_picture.as_ref() == Some(&image.path) {
            debug!("Wallpaper {} is already applied", image.path.display());
            return Ok(Outcome::Unchanged(image.path));
        }

        let desktop = self.desktop(&config);
        let request = ApplyRequest {
            path: &image.path,
            picture_options: config.picture_options.as_deref(),
            fallback_command: config.default_command.as_deref(),
        };
        let result = self.applier.apply(&desktop, &request);
        // a failed apply may have half taken effect, don't hammer the desktop with it again
        self.last_picture = Some(image.path.clone());
        result?;

        info!("Wallpaper set to {}", image.path.display());
        Ok(Outcome::Applied(image.path))
    }

    /// Cycles until `shutdown` turns true. A cycle in progress always completes; only the
    /// wait between cycles is interrupted.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), CycleError> {
        loop {
            match self.poll_picture().await {
                Ok(outcome) => debug!("Cycle finished: {:?}", outcome),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => error!("Failed to update wallpaper: {}", err),
            }

            let interval = self.store.snapshot().update_interval;
            let next = next_poll_time(Utc::now(), interval);
            debug!("Sleeping until {}", next);

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Stopping");
                    return Ok(());
                }
                _ = wait_until(next, interval) => {}
            }
        }
    }
}

/// `now + interval`, or six hours from now when that is not a representable time.
fn next_poll_time(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let next = chrono::Duration::from_std(interval)
        .ok()
        .and_then(|interval| now.checked_add_signed(interval));
    match next {
        Some(next) => next,
        None => {
            warn!("Interval {:?} is out of range, waiting {:?} instead", interval, FALLBACK_INTERVAL);
            chrono::Duration::from_std(FALLBACK_INTERVAL)
                .ok()
                .and_then(|fallback| now.checked_add_signed(fallback))
                .unwrap_or(now)
        }
    }
}

async fn wait_until(next: DateTime<Utc>, interval: Duration) {
    if let Err(err) = sleep_until(next).await {
        warn!("Error while sleeping until {}: {}, using a monotonic timer", next, err);
        tokio::time::sleep(interval).await;
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            // nobody left to ask for a shutdown
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Terminate,
    Reload,
}

/// SIGINT and SIGTERM stop the daemon, SIGHUP reloads its configuration.
pub fn signal_events() -> io::Result<impl Stream<Item = ControlEvent>> {
    let interrupt = SignalStream::new(signal(SignalKind::interrupt())?).map(|_| ControlEvent::Terminate);
    let terminate = SignalStream::new(signal(SignalKind::terminate())?).map(|_| ControlEvent::Terminate);
    let hangup = SignalStream::new(signal(SignalKind::hangup())?).map(|_| ControlEvent::Reload);
    Ok(interrupt.merge(terminate).merge(hangup))
}

/// Reacts to control events until a termination arrives. Reloads swap the store's snapshot;
/// a cycle already running keeps the one it took.
pub async fn listen<S, F>(mut events: S, store: ConfigStore, shutdown: watch::Sender<bool>, reload: F)
where
    S: Stream<Item = ControlEvent> + Unpin,
    F: Fn() -> Result<Config, ConfigError>,
{
    while let Some(event) = events.next().await {
        match event {
            ControlEvent::Terminate => {
                warn!("Got SIGINT/SIGTERM, exiting.");
                let _ = shutdown.send(true);
                return;
            }
            ControlEvent::Reload => {
                warn!("Got SIGHUP, reloading.");
                match reload() {
                    Ok(config) => {
                        info!("Reloaded configuration: {:?}", config);
                        store.replace(config);
                    }
                    Err(err) => error!("Failed to reload configuration, keeping the current one: {}", err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::bing::fake::FakeFetch;
    use crate::bing::Market;
    use crate::command::fake::FakeRunner;

    const JPEG: &[u8] = b"\xff\xd8\xff\xe0 pretend jpeg";

    fn config(dir: &Path, desktop: DesktopEnvironment) -> Config {
        Config {
            market: Market::EnglishUS,
            wallpaper_dir: dir.to_owned(),
            desktop: Some(desktop),
            picture_options: None,
            update_interval: Duration::from_secs(6 * 60 * 60),
            default_command: None,
        }
    }

    fn manager(fetch: Arc<FakeFetch>, runner: Arc<FakeRunner>, store: ConfigStore) -> Manager {
        let bing = Bing::with_fetch(fetch, runner.clone()).retry_delay(Duration::from_millis(1));
        let applier = Applier::new(runner.clone());
        Manager::new(bing, applier, runner, store)
    }

    fn runner(programs: &[&str]) -> Arc<FakeRunner> {
        let mut installed = vec!["file"];
        installed.extend_from_slice(programs);
        let runner = FakeRunner::with_programs(&installed);
        runner.respond("file", 0, "image/jpeg\n");
        Arc::new(runner)
    }

    #[tokio::test]
    async fn same_picture_is_applied_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = runner(&["dconf"]);
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let mut manager = manager(fetch, runner.clone(), store);

        let first = manager.poll_picture().await.unwrap();
        let second = manager.poll_picture().await.unwrap();

        assert!(matches!(first, Outcome::Applied(_)));
        assert!(matches!(second, Outcome::Unchanged(_)));
        assert_eq!(runner.calls_to("dconf").len(), 1);
    }

    #[tokio::test]
    async fn no_image_means_no_apply() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        let runner = runner(&["dconf"]);
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let mut manager = manager(fetch, runner.clone(), store);

        let err = manager.poll_picture().await.unwrap_err();

        assert!(matches!(err, CycleError::Acquire(AcquireError::NoImageAvailable)));
        assert!(!err.is_fatal());
        assert!(runner.calls_to("dconf").is_empty());
    }

    #[tokio::test]
    async fn reloaded_config_is_used_by_next_cycle() {
        let first_dir = tempfile::tempdir().unwrap();
        let second_dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = runner(&["dconf"]);
        let store = ConfigStore::new(config(first_dir.path(), DesktopEnvironment::Mate));
        let mut manager = manager(fetch, runner.clone(), store.clone());

        manager.poll_picture().await.unwrap();
        store.replace(config(second_dir.path(), DesktopEnvironment::Mate));
        let outcome = manager.poll_picture().await.unwrap();

        match outcome {
            Outcome::Applied(path) => assert!(path.starts_with(second_dir.path())),
            other => panic!("expected a new picture, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_after_first_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = runner(&["dconf"]);
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let manager = manager(fetch, runner.clone(), store);
        let (shutdown, receiver) = watch::channel(false);

        shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), manager.run(receiver)).await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(runner.calls_to("dconf").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_wait() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = runner(&["dconf"]);
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let manager = manager(fetch, runner.clone(), store);
        let (shutdown, receiver) = watch::channel(false);

        let run = manager.run(receiver);
        tokio::pin!(run);
        let first_cycle = tokio::time::timeout(Duration::from_secs(5), async {
            while runner.calls_to("dconf").is_empty() {
                tokio::select! {
                    result = &mut run => panic!("run ended before shutdown: {:?}", result),
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        })
        .await;
        assert!(first_cycle.is_ok(), "first cycle never applied");

        // the loop is now parked on the six hour wait
        shutdown.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), &mut run).await;

        assert!(matches!(result, Ok(Ok(()))));
        assert_eq!(runner.calls_to("dconf").len(), 1);
    }

    #[test]
    fn next_poll_time_adds_interval() {
        let now = Utc::now();
        assert_eq!(next_poll_time(now, Duration::from_secs(90)), now + chrono::Duration::seconds(90));
    }

    #[test]
    fn next_poll_time_falls_back_when_out_of_range() {
        let now = Utc::now();
        let six_hours = now + chrono::Duration::hours(6);
        assert_eq!(next_poll_time(now, Duration::from_secs(100_000_000_000 * 3600)), six_hours);
        assert_eq!(next_poll_time(now, Duration::MAX), six_hours);
    }

    #[tokio::test]
    async fn run_ends_on_missing_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = Arc::new(FakeFetch::new());
        fetch.serve("UHD", JPEG);
        let runner = runner(&[]);
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Xfce));
        let (_shutdown, receiver) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(5), manager(fetch, runner, store).run(receiver)).await;

        match result {
            Ok(Err(err)) => assert!(err.is_fatal()),
            other => panic!("expected a fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_and_terminate_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let (shutdown, mut receiver) = watch::channel(false);
        let reloaded = Config {
            market: Market::GermanGermany,
            ..config(dir.path(), DesktopEnvironment::Mate)
        };
        let events = tokio_stream::iter(vec![ControlEvent::Reload, ControlEvent::Terminate]);

        listen(events, store.clone(), shutdown, || Ok(reloaded.clone())).await;

        assert_eq!(store.snapshot().market, Market::GermanGermany);
        assert!(*receiver.borrow_and_update());
    }

    #[tokio::test]
    async fn failed_reload_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(config(dir.path(), DesktopEnvironment::Mate));
        let (shutdown, receiver) = watch::channel(false);
        let events = tokio_stream::iter(vec![ControlEvent::Reload]);

        listen(events, store.clone(), shutdown, || Err(ConfigError::NoDirectory)).await;

        assert_eq!(store.snapshot().market, Market::EnglishUS);
        assert!(!*receiver.borrow());
    }
}
