use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

const BUS_ADDRESS: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Extracts the bus address from a `~/.dbus/session-bus/*` file.
pub fn parse_bus_address(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix(BUS_ADDRESS)?.strip_prefix('='))
        .map(|address| address.trim().trim_matches('\'').to_owned())
        .filter(|address| !address.is_empty())
}

/// First session file in `home`, in name order.
fn session_file(home: &Path) -> Option<PathBuf> {
    let entries = match fs::read_dir(home.join(".dbus").join("session-bus")) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("No D-Bus session files: {}", err);
            return None;
        }
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    files.into_iter().next()
}

/// Looks up the session bus address recorded under `home`.
pub fn find_bus_address(home: &Path) -> Option<String> {
    let path = session_file(home)?;
    match fs::read_to_string(&path) {
        Ok(contents) => parse_bus_address(&contents),
        Err(err) => {
            warn!("Failed to read {}: {}", path.display(), err);
            None
        }
    }
}

/// Desktop tools reach the session over D-Bus; started from cron the address is missing.
/// Must run before any other thread is spawned.
pub fn repair_bus_address() {
    if env::var_os(BUS_ADDRESS).is_some_and(|address| !address.is_empty()) {
        return;
    }
    let Some(home) = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_owned()) else {
        warn!("No home directory, can't look up {}", BUS_ADDRESS);
        return;
    };
    match find_bus_address(&home) {
        Some(address) => {
            info!("Setting {}={}", BUS_ADDRESS, address);
            env::set_var(BUS_ADDRESS, address);
        }
        None => warn!("{} is not set and no session file was found", BUS_ADDRESS),
    }
}
