use std::fs;
use std::path::PathBuf;

use log::{debug, warn};

use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

const CONSOLE_TITLE: &str = "Desktop Shell Scripting Console";
const SHELL_TITLE: &str = "Plasma Desktop Shell";
const TRANSLATION_DOMAIN: &str = "plasma-desktop";
const LOCALE_DIR: &str = "/usr/share/locale";

const WIDGETS_LOCKED: &str = "Widgets are locked";

/// Qt's D-Bus CLI goes by different names across distributions and Qt versions.
const QDBUS_CANDIDATES: [&str; 3] = ["qdbus-qt5", "qdbus", "qdbus6"];

/// Script file the KDE 4 shell autoloads into its interactive console.
pub fn default_console_script() -> PathBuf {
    let data_dir = match directories::BaseDirs::new() {
        Some(base_dirs) => base_dirs.data_dir().to_owned(),
        None => std::env::temp_dir(),
    };
    data_dir.join("plasmashell").join("interactiveconsoleautosave.js")
}

/// Quotes `s` as a JavaScript string literal.
fn js_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// KDE 4 has no scripting call that takes effect directly: the script is loaded into the
/// shell's interactive console, which is then driven with synthetic key presses.
pub struct Kde4Console {
    script: PathBuf,
    lang: Option<String>,
}

impl Kde4Console {
    pub fn new(script: PathBuf, lang: Option<String>) -> Self {
        Kde4Console { script, lang }
    }

    /// `de_DE.UTF-8` becomes `de_DE`; `C` and `POSIX` mean untranslated.
    fn language(&self) -> Option<&str> {
        let lang = self.lang.as_deref()?.split('.').next()?.trim();
        match lang {
            "" | "C" | "POSIX" => None,
            lang => Some(lang),
        }
    }

    fn translate(&self, runner: &dyn CommandRunner, text: &'static str) -> String {
        let Some(language) = self.language() else {
            return text.to_owned();
        };
        let invocation = Invocation::new("gettext")
            .args(["--domain", TRANSLATION_DOMAIN, text])
            .env("LANGUAGE", language)
            .env("TEXTDOMAINDIR", LOCALE_DIR);
        match runner.run(&invocation) {
            Ok(output) if output.success() && !output.stdout.trim().is_empty() => output.stdout.trim().to_owned(),
            _ => {
                debug!("No {} translation of '{}'", language, text);
                text.to_owned()
            }
        }
    }

    fn window_title(&self, runner: &dyn CommandRunner) -> String {
        format!(
            "{} - {}",
            self.translate(runner, CONSOLE_TITLE),
            self.translate(runner, SHELL_TITLE)
        )
    }

    fn script_source(path: &str) -> String {
        let wallpaper = js_string(path);
        format!(
            "var wallpaper = {wallpaper}; \
             var activity = activities()[0]; \
             activity.currentConfigGroup = new Array(\"wallpaper\", \"image\"); \
             activity.writeConfig(\"wallpaper\", wallpaper); \
             activity.writeConfig(\"userswallpaper\", wallpaper); \
             activity.reloadConfig();\n"
        )
    }

    fn run_console(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        let window = self.window_title(runner);

        if let Some(parent) = self.script.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.script, Self::script_source(request.path_str()?))?;

        execute(
            runner,
            Invocation::new("qdbus").args([
                "org.kde.plasma-desktop",
                "/App",
                "local.PlasmaApp.loadScriptInInteractiveConsole",
            ])
            .arg(self.script.to_string_lossy()),
        )?;
        // ctrl+e runs the script, ctrl+w closes the console
        execute(
            runner,
            Invocation::new("xdotool").args([
                "search",
                "--name",
                window.as_str(),
                "windowactivate",
                "key",
                "ctrl+e",
                "key",
                "ctrl+w",
            ]),
        )?;
        Ok(())
    }
}

impl Backend for Kde4Console {
    fn name(&self) -> &'static str {
        "kde4 scripting console"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        for program in ["qdbus", "xdotool", "gettext"] {
            require(runner, program)?;
        }

        let result = self.run_console(request, runner);
        if let Err(err) = fs::remove_file(&self.script) {
            debug!("Could not remove {}: {}", self.script.display(), err);
        }
        result
    }
}

/// Plasma 5 evaluates shell scripts over D-Bus directly.
pub struct PlasmaShell;

impl PlasmaShell {
    fn script_source(path: &str) -> String {
        let image = js_string(&format!("file://{}", path));
        format!(
            "for (i in activities()) {{ \
               activityID = activities()[i]; \
               desktops = desktopsForActivity(activityID); \
               for (j in desktops) {{ \
                 desktop = desktops[j]; \
                 desktop.wallpaperPlugin = \"org.kde.image\"; \
                 desktop.wallpaperMode = \"Scaled and Cropped\"; \
                 desktop.currentConfigGroup = new Array(\"Wallpaper\", \"org.kde.image\", \"General\"); \
                 desktop.writeConfig(\"Image\", {image}); \
               }} \
             }}"
        )
    }
}

impl Backend for PlasmaShell {
    fn name(&self) -> &'static str {
        "plasmashell"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        let qdbus = QDBUS_CANDIDATES
            .into_iter()
            .find(|candidate| runner.exists(candidate))
            .ok_or_else(|| ApplyError::MissingDependency(QDBUS_CANDIDATES[0].to_owned()))?;

        let script = Self::script_source(request.path_str()?);
        let output = execute(
            runner,
            Invocation::new(qdbus).args([
                "org.kde.plasmashell",
                "/PlasmaShell",
                "org.kde.PlasmaShell.evaluateScript",
                script.as_str(),
            ]),
        )?;
        if output.stdout.contains(WIDGETS_LOCKED) {
            warn!("Can't set wallpaper for Plasma because widgets are locked!");
        }
        Ok(())
    }
}
