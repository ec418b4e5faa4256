//! Desktop wallpaper backends.
//!
//! Every [`DesktopEnvironment`] maps to exactly one [`Backend`]. Backends check that the tools
//! they need are installed before touching any session state, then drive those tools through
//! a [`CommandRunner`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::desktop::DesktopEnvironment;

mod fallback;
mod gnome;
mod kde;
mod lxde;
mod mate;
mod xfce;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{0} not found, please install it")]
    MissingDependency(String),
    #[error("'{command}' exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("image path {0:?} contained invalid utf-8 characters")]
    InvalidPath(PathBuf),
}

impl ApplyError {
    /// A missing tool will be just as missing on the next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApplyError::MissingDependency(_))
    }
}

/// What to show and how.
#[derive(Debug, Clone, Copy)]
pub struct ApplyRequest<'a> {
    pub path: &'a Path,
    /// Display mode, e.g. `zoom` or `crop`. Backends fall back to their own default.
    pub picture_options: Option<&'a str>,
    /// Command used when no desktop environment was recognised. The image path is appended
    /// as the last argument.
    pub fallback_command: Option<&'a str>,
}

impl<'a> ApplyRequest<'a> {
    pub fn path_str(&self) -> Result<&'a str, ApplyError> {
        self.path
            .to_str()
            .ok_or_else(|| ApplyError::InvalidPath(self.path.to_owned()))
    }

    pub fn options_or(&self, default: &'a str) -> &'a str {
        self.picture_options
            .map(str::trim)
            .filter(|options| !options.is_empty())
            .unwrap_or(default)
    }
}

pub trait Backend {
    fn name(&self) -> &'static str;

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError>;
}

/// Fails with [`ApplyError::MissingDependency`] unless `program` is installed.
fn require(runner: &dyn CommandRunner, program: &str) -> Result<(), ApplyError> {
    if runner.exists(program) {
        Ok(())
    } else {
        Err(ApplyError::MissingDependency(program.to_owned()))
    }
}

/// Runs `invocation`, turning a non-zero exit into [`ApplyError::Failed`].
fn execute(runner: &dyn CommandRunner, invocation: Invocation) -> Result<CommandOutput, ApplyError> {
    let output = runner.run(&invocation)?;
    if !output.success() {
        return Err(ApplyError::Failed {
            command: invocation.to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_owned(),
        });
    }
    Ok(output)
}

pub struct Applier {
    runner: Arc<dyn CommandRunner>,
    kde_console_script: PathBuf,
    lang: Option<String>,
}

impl Applier {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Applier {
            runner,
            kde_console_script: kde::default_console_script(),
            lang: std::env::var("LANG").ok(),
        }
    }

    /// Where the KDE 4 backend writes its throwaway console script.
    pub fn with_kde_console_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.kde_console_script = path.into();
        self
    }

    pub fn with_lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    pub fn backend_for(&self, env: &DesktopEnvironment) -> Box<dyn Backend> {
        match env {
            DesktopEnvironment::Gnome2 => Box::new(gnome::GConf),
            DesktopEnvironment::Gnome3 => Box::new(gnome::GSettings::GNOME),
            DesktopEnvironment::Cinnamon => Box::new(gnome::GSettings::CINNAMON),
            DesktopEnvironment::Deepin => Box::new(gnome::GSettings::DEEPIN),
            DesktopEnvironment::Mate => Box::new(mate::Dconf),
            DesktopEnvironment::Lxde => Box::new(lxde::PcManFm::LXDE),
            DesktopEnvironment::Lxqt => Box::new(lxde::PcManFm::LXQT),
            DesktopEnvironment::Xfce => Box::new(xfce::Xfconf),
            DesktopEnvironment::Kde4 => Box::new(kde::Kde4Console::new(
                self.kde_console_script.clone(),
                self.lang.clone(),
            )),
            DesktopEnvironment::Plasma5 => Box::new(kde::PlasmaShell),
            DesktopEnvironment::WindowManager(_) | DesktopEnvironment::Unknown => Box::new(fallback::Fallback),
        }
    }

    pub fn apply(&self, env: &DesktopEnvironment, request: &ApplyRequest<'_>) -> Result<(), ApplyError> {
        let backend = self.backend_for(env);
        info!("Setting wallpaper for {} using {}", env, backend.name());
        debug!("Wallpaper request: {:?}", request);
        backend.apply(request, self.runner.as_ref())
    }
}
