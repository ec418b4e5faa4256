use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::bing::{Market, UnknownMarket};
use crate::desktop::DesktopEnvironment;

const APPLICATION_DIRECTORY: &str = "linux-bing-wallpaper";
const CONFIG_FILE_NAME: &str = "config.yaml";
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    UnknownMarket(#[from] UnknownMarket),
    #[error("Failed to read {0:?}: {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse {0:?}: {1}")]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("Invalid duration '{0}', expected something like 6h, 1.5h or 1h30m, at most 2562047h")]
    InvalidDuration(String),
    #[error("Could not determine a wallpaper directory, please configure one")]
    NoDirectory,
}

/// One source of settings. Unset fields leave the value of the layer beneath untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    #[serde(alias = "bingmarket")]
    pub market: Option<String>,
    /// Directory to store downloaded wallpapers in. Defaults to '$XDG_PICTURES_DIR/Bing'.
    #[serde(alias = "wallpaperdir")]
    pub wallpaper_dir: Option<String>,
    /// Overrides desktop environment detection.
    #[serde(alias = "desktopenvironment")]
    pub desktop_environment: Option<String>,
    #[serde(alias = "pictureoptions")]
    pub picture_options: Option<String>,
    #[serde(alias = "updateinterval")]
    pub update_interval: Option<String>,
    /// Command for window managers without a desktop environment, e.g. `feh --bg-fill`.
    #[serde(alias = "defaultcommand")]
    pub default_command: Option<String>,
}

impl ConfigLayer {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(ConfigLayer::default());
        }
        serde_yaml::from_str(text)
    }

    /// A missing file is an empty layer.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text).map_err(|err| ConfigError::Parse(path.to_owned(), err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("No configuration file at {}", path.display());
                Ok(ConfigLayer::default())
            }
            Err(err) => Err(ConfigError::Read(path.to_owned(), err)),
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        ConfigLayer {
            market: lookup("BING_MARKET"),
            wallpaper_dir: lookup("WALLPAPER_DIR"),
            desktop_environment: lookup("DESKTOP_ENVIRONMENT"),
            picture_options: lookup("PICTURE_OPTIONS"),
            update_interval: lookup("UPDATE_INTERVAL"),
            default_command: lookup("DEFAULT_COMMAND"),
        }
    }

    /// Stacks `over` on top of `self`; non-empty values of `over` win.
    pub fn overlay(self, over: ConfigLayer) -> ConfigLayer {
        fn pick(under: Option<String>, over: Option<String>) -> Option<String> {
            match over {
                Some(value) if !value.trim().is_empty() => Some(value),
                _ => under,
            }
        }

        ConfigLayer {
            market: pick(self.market, over.market),
            wallpaper_dir: pick(self.wallpaper_dir, over.wallpaper_dir),
            desktop_environment: pick(self.desktop_environment, over.desktop_environment),
            picture_options: pick(self.picture_options, over.picture_options),
            update_interval: pick(self.update_interval, over.update_interval),
            default_command: pick(self.default_command, over.default_command),
        }
    }
}

/// Fully resolved settings for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub market: Market,
    pub wallpaper_dir: PathBuf,
    pub desktop: Option<DesktopEnvironment>,
    pub picture_options: Option<String>,
    pub update_interval: Duration,
    pub default_command: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn resolve(layer: ConfigLayer) -> Result<Config, ConfigError> {
        let market = match non_empty(layer.market) {
            Some(market) => market.parse()?,
            None => Market::default(),
        };
        let wallpaper_dir = match non_empty(layer.wallpaper_dir) {
            Some(dir) => expand_home(&dir),
            None => default_wallpaper_dir().ok_or(ConfigError::NoDirectory)?,
        };
        let desktop = non_empty(layer.desktop_environment)
            .and_then(|desktop| desktop.parse::<DesktopEnvironment>().ok());
        let update_interval = match non_empty(layer.update_interval) {
            Some(interval) => parse_duration(&interval)?,
            None => DEFAULT_UPDATE_INTERVAL,
        };

        Ok(Config {
            market,
            wallpaper_dir,
            desktop,
            picture_options: non_empty(layer.picture_options),
            update_interval,
            default_command: non_empty(layer.default_command),
        })
    }
}

/// Where settings come from: a YAML file, the environment and the command line, each
/// overriding the previous.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub file: Option<PathBuf>,
    pub command_line: ConfigLayer,
}

impl ConfigSource {
    fn file_layer(&self) -> Result<ConfigLayer, ConfigError> {
        match &self.file {
            Some(file) => ConfigLayer::from_file(file),
            None => Ok(ConfigLayer::default()),
        }
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let layer = self
            .file_layer()?
            .overlay(ConfigLayer::from_env())
            .overlay(self.command_line.clone());
        Config::resolve(layer)
    }

    /// Like [`ConfigSource::load`] but without command line overrides.
    pub fn reload(&self) -> Result<Config, ConfigError> {
        Config::resolve(self.file_layer()?.overlay(ConfigLayer::from_env()))
    }
}

fn get_config_directory() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|base_dirs| base_dirs.config_dir().join(APPLICATION_DIRECTORY))
}

pub fn default_config_file() -> Option<PathBuf> {
    get_config_directory().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Copies a `config.yaml` from the working directory into place if there is none yet.
pub fn seed_config_file(target: &Path) {
    if target.exists() {
        return;
    }
    let Ok(seed) = std::env::current_dir().map(|cwd| cwd.join(CONFIG_FILE_NAME)) else {
        return;
    };
    if !seed.is_file() {
        return;
    }

    let copied = target
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::copy(&seed, target));
    match copied {
        Ok(_) => info!("Copied {} to {}", seed.display(), target.display()),
        Err(err) => warn!("Failed to copy {} to {}: {}", seed.display(), target.display(), err),
    }
}

fn default_wallpaper_dir() -> Option<PathBuf> {
    let user_dirs = directories::UserDirs::new()?;
    match user_dirs.picture_dir() {
        Some(pictures_dir) => Some(pictures_dir.join("Bing")),
        None => Some(user_dirs.home_dir().join("Pictures").join("Bing")),
    }
}

fn expand_home(dir: &str) -> PathBuf {
    let rest = match dir.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => return PathBuf::from(dir),
    };
    match directories::BaseDirs::new() {
        Some(base_dirs) => base_dirs.home_dir().join(rest),
        None => PathBuf::from(dir),
    }
}

/// Longest interval accepted: a signed 64-bit count of nanoseconds, roughly 292 years.
const MAX_INTERVAL_NANOS: u128 = i64::MAX as u128;

fn unit_nanos(unit: &str) -> Option<u128> {
    Some(match unit {
        "ns" => 1,
        "us" | "\u{b5}s" | "\u{3bc}s" => 1_000,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        "m" => 60 * 1_000_000_000,
        "h" => 60 * 60 * 1_000_000_000,
        _ => return None,
    })
}

/// Parses durations such as `6h`, `1.5h`, `1h30m`, `45s` or `1500ms`.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(text.to_owned());
    let mut rest = text.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
            return Err(invalid());
        }

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = unit_nanos(unit).ok_or_else(invalid)?;

        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| invalid())? };
        let mut part = whole.checked_mul(scale).ok_or_else(invalid)?;
        let mut place = scale;
        for digit in fraction.chars() {
            place /= 10;
            let digit = u128::from(digit.to_digit(10).ok_or_else(invalid)?);
            part = part.checked_add(digit * place).ok_or_else(invalid)?;
        }

        total = total
            .checked_add(part)
            .filter(|total| *total <= MAX_INTERVAL_NANOS)
            .ok_or_else(invalid)?;
        rest = tail;
    }

    if total == 0 {
        return Err(invalid());
    }
    let nanos = u64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::from_nanos(nanos))
}

/// Shared holder of the current [`Config`]. The lock is only held to clone or swap the
/// pointer, never across a cycle.
#[derive(Clone)]
pub struct ConfigStore {
    current: Arc<Mutex<Arc<Config>>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        ConfigStore {
            current: Arc::new(Mutex::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: Config) {
        let config = Arc::new(config);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }
}
