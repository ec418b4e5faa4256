//! Detection of the running desktop environment.
//!
//! Detection walks an ordered list of independent probes and stops at the first one that
//! recognises the session. Probes never fail: a missing variable, a missing tool or a tool
//! exiting non-zero simply means "no match", and the chain ends at
//! [`DesktopEnvironment::Unknown`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::debug;
use regex::Regex;

use crate::command::{CommandRunner, Invocation};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DesktopEnvironment {
    Gnome2,
    Gnome3,
    Cinnamon,
    Mate,
    Xfce,
    Lxde,
    Lxqt,
    Kde4,
    Plasma5,
    Deepin,
    /// A plain EWMH window manager, identified by its lower-cased `_NET_WM_NAME`.
    WindowManager(String),
    Unknown,
}

impl Display for DesktopEnvironment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DesktopEnvironment::Gnome2 => f.write_str("gnome2"),
            DesktopEnvironment::Gnome3 => f.write_str("gnome3"),
            DesktopEnvironment::Cinnamon => f.write_str("cinnamon"),
            DesktopEnvironment::Mate => f.write_str("mate"),
            DesktopEnvironment::Xfce => f.write_str("xfce"),
            DesktopEnvironment::Lxde => f.write_str("lxde"),
            DesktopEnvironment::Lxqt => f.write_str("lxqt"),
            DesktopEnvironment::Kde4 => f.write_str("kde4"),
            DesktopEnvironment::Plasma5 => f.write_str("plasma5"),
            DesktopEnvironment::Deepin => f.write_str("deepin"),
            DesktopEnvironment::WindowManager(name) => write!(f, "window manager '{}'", name),
            DesktopEnvironment::Unknown => f.write_str("unknown"),
        }
    }
}

/// Parses an explicit override from configuration. Anything that is not a known desktop
/// environment is taken to be the name of a window manager.
impl FromStr for DesktopEnvironment {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        Ok(match s.as_str() {
            "gnome" | "gnome2" => DesktopEnvironment::Gnome2,
            "gnome3" => DesktopEnvironment::Gnome3,
            "cinnamon" | "x-cinnamon" => DesktopEnvironment::Cinnamon,
            "mate" => DesktopEnvironment::Mate,
            "xfce" | "xfce4" => DesktopEnvironment::Xfce,
            "lxde" => DesktopEnvironment::Lxde,
            "lxqt" => DesktopEnvironment::Lxqt,
            "kde4" => DesktopEnvironment::Kde4,
            "plasma5" | "plasma" => DesktopEnvironment::Plasma5,
            "deepin" | "dde" => DesktopEnvironment::Deepin,
            "" | "unknown" => DesktopEnvironment::Unknown,
            name => DesktopEnvironment::WindowManager(name.to_owned()),
        })
    }
}

/// Binary that only ships with GNOME 2.
const GNOME2_ONLY_BINARY: &str = "gnome-default-applications-properties";

pub struct Probe<'a> {
    vars: HashMap<String, String>,
    runner: &'a dyn CommandRunner,
}

impl<'a> Probe<'a> {
    /// Probe against the variables of the current process.
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self::with_vars(std::env::vars(), runner)
    }

    pub fn with_vars<I, K, V>(vars: I, runner: &'a dyn CommandRunner) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Probe {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            runner,
        }
    }

    pub fn detect(&self) -> DesktopEnvironment {
        // priority order, first match wins
        let steps: [(&str, fn(&Self) -> Option<DesktopEnvironment>); 7] = [
            ("XDG_CURRENT_DESKTOP", Self::current_desktop),
            ("DESKTOP_SESSION", Self::desktop_session),
            ("KDE session", Self::kde_session),
            ("MATE session", Self::mate_session),
            ("GNOME session", Self::gnome_session),
            ("XFCE root window", Self::xfce_root_window),
            ("_NET_WM_NAME", Self::window_manager),
        ];
        for (name, step) in steps {
            if let Some(env) = step(self) {
                debug!("Desktop environment {} detected via {}", env, name);
                return env;
            }
        }
        debug!("No desktop environment detected");
        DesktopEnvironment::Unknown
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Runs a diagnostic command, yielding its stdout only if it exited successfully.
    fn query(&self, invocation: Invocation) -> Option<String> {
        match self.runner.run(&invocation) {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                debug!("Probe '{}' exited with {:?}", invocation, output.code);
                None
            }
            Err(err) => {
                debug!("Probe '{}' failed: {}", invocation, err);
                None
            }
        }
    }

    fn current_desktop(&self) -> Option<DesktopEnvironment> {
        self.map_session_value(self.var("XDG_CURRENT_DESKTOP")?)
    }

    fn desktop_session(&self) -> Option<DesktopEnvironment> {
        self.map_session_value(self.var("DESKTOP_SESSION")?)
    }

    /// `XDG_CURRENT_DESKTOP` may carry a colon separated list such as `ubuntu:GNOME`.
    fn map_session_value(&self, value: &str) -> Option<DesktopEnvironment> {
        value
            .split(':')
            .find_map(|token| self.map_token(&token.trim().to_lowercase()))
    }

    fn map_token(&self, token: &str) -> Option<DesktopEnvironment> {
        match token {
            "kde" | "plasma" => Some(self.kde_version()),
            "deepin" | "dde" => Some(DesktopEnvironment::Deepin),
            "lxde" | "lubuntu" | "lxqt" => Some(DesktopEnvironment::Lxde),
            "gnome" => Some(self.gnome_version()),
            "x-cinnamon" | "cinnamon" => Some(DesktopEnvironment::Cinnamon),
            "mate" => Some(DesktopEnvironment::Mate),
            token if token.starts_with("xfce") => Some(DesktopEnvironment::Xfce),
            _ => None,
        }
    }

    fn kde_session(&self) -> Option<DesktopEnvironment> {
        self.var("KDE_FULL_SESSION")?;
        Some(self.kde_version())
    }

    fn mate_session(&self) -> Option<DesktopEnvironment> {
        self.var("MATE_DESKTOP_SESSION_ID")?;
        Some(DesktopEnvironment::Mate)
    }

    fn gnome_session(&self) -> Option<DesktopEnvironment> {
        if self.var("GNOME_DESKTOP_SESSION_ID").is_some() || self.gnome_session_manager_on_bus() {
            Some(self.gnome_version())
        } else {
            None
        }
    }

    fn gnome_session_manager_on_bus(&self) -> bool {
        self.query(Invocation::new("dbus-send").args([
            "--print-reply",
            "--dest=org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus.GetNameOwner",
            "string:org.gnome.SessionManager",
        ]))
        .is_some()
    }

    fn xfce_root_window(&self) -> Option<DesktopEnvironment> {
        let save_mode = self
            .query(Invocation::new("xprop").args(["-root", "_DT_SAVE_MODE"]))
            .is_some_and(|out| out.contains("xfce4"));
        if save_mode {
            return Some(DesktopEnvironment::Xfce);
        }

        let desktop_window = self
            .query(Invocation::new("xprop").arg("-root"))
            .is_some_and(|out| {
                out.lines()
                    .any(|line| line.trim_start().to_lowercase().starts_with("xfce_desktop_window"))
            });
        desktop_window.then_some(DesktopEnvironment::Xfce)
    }

    fn window_manager(&self) -> Option<DesktopEnvironment> {
        let display = self.var("DISPLAY")?;
        let root = self.query(Invocation::new("xprop").args(["-display", display, "-root"]))?;
        let check = Regex::new(r"(?m)^_NET_SUPPORTING_WM_CHECK\(WINDOW\): window id # (\S+)").ok()?;
        let window = check.captures(&root)?.get(1)?.as_str();

        let props = self.query(Invocation::new("xprop").args(["-display", display, "-id", window]))?;
        let name = Regex::new(r#"(?m)^_NET_WM_NAME\([A-Z0-9_]+\) = "(.*?)""#).ok()?;
        let name = name.captures(&props)?.get(1)?.as_str().to_lowercase();
        (!name.is_empty()).then_some(DesktopEnvironment::WindowManager(name))
    }

    /// Asks the Plasma shell for its version. Plasma 5 and later share the scripting API;
    /// anything older, or no answer at all, means KDE 4.
    fn kde_version(&self) -> DesktopEnvironment {
        let major = self
            .query(Invocation::new("plasmashell").arg("--version"))
            .and_then(|out| parse_major_version(&out));
        match major {
            Some(major) if major >= 5 => DesktopEnvironment::Plasma5,
            _ => DesktopEnvironment::Kde4,
        }
    }

    fn gnome_version(&self) -> DesktopEnvironment {
        if self.runner.exists(GNOME2_ONLY_BINARY) {
            DesktopEnvironment::Gnome2
        } else {
            DesktopEnvironment::Gnome3
        }
    }
}

/// Extracts the major version from output such as `plasmashell 5.27.10`.
fn parse_major_version(output: &str) -> Option<u32> {
    output
        .split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))?
        .split('.')
        .next()?
        .parse()
        .ok()
}
