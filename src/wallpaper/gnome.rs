use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

const DEFAULT_OPTIONS: &str = "zoom";

/// GNOME 2 keeps its background in GConf.
pub struct GConf;

impl Backend for GConf {
    fn name(&self) -> &'static str {
        "gconf"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        require(runner, "gconftool-2")?;
        let path = request.path_str()?;

        for (key, value) in [
            ("/desktop/gnome/background/picture_filename", path),
            ("/desktop/gnome/background/picture_options", request.options_or(DEFAULT_OPTIONS)),
        ] {
            execute(
                runner,
                Invocation::new("gconftool-2").args(["-s", "-t", "string", key, value]),
            )?;
        }
        Ok(())
    }
}

/// GNOME 3 and the desktops built on its settings stack.
pub struct GSettings {
    schema: &'static str,
}

impl GSettings {
    pub const GNOME: GSettings = GSettings {
        schema: "org.gnome.desktop.background",
    };
    pub const CINNAMON: GSettings = GSettings {
        schema: "org.cinnamon.desktop.background",
    };
    pub const DEEPIN: GSettings = GSettings {
        schema: "org.deepin.wrap.gnome.desktop.background",
    };

    fn set(&self, runner: &dyn CommandRunner, key: &str, value: &str) -> Result<(), ApplyError> {
        // Outside a session (cron, systemd) gsettings needs a display and the dconf backend.
        let display = std::env::var("DISPLAY")
            .ok()
            .filter(|display| !display.is_empty())
            .unwrap_or_else(|| ":0".to_owned());
        let invocation = Invocation::new("gsettings")
            .args(["set", self.schema, key, value])
            .env("DISPLAY", display)
            .env("GSETTINGS_BACKEND", "dconf");
        execute(runner, invocation)?;
        Ok(())
    }
}

impl Backend for GSettings {
    fn name(&self) -> &'static str {
        "gsettings"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        require(runner, "gsettings")?;
        let uri = format!("file://{}", request.path_str()?);

        self.set(runner, "picture-uri", &uri)?;
        self.set(runner, "picture-options", request.options_or(DEFAULT_OPTIONS))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn gsettings_sets_uri_and_options_under_schema() {
        let runner = FakeRunner::with_programs(&["gsettings"]);
        let request = ApplyRequest {
            path: Path::new("/home/me/Pictures/Bing/a.jpg"),
            picture_options: Some("spanned"),
            fallback_command: None,
        };

        GSettings::CINNAMON.apply(&request, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[0].args,
            ["set", "org.cinnamon.desktop.background", "picture-uri", "file:///home/me/Pictures/Bing/a.jpg"]
        );
        assert_eq!(calls[1].args, ["set", "org.cinnamon.desktop.background", "picture-options", "spanned"]);
        assert!(calls[0].env.contains(&("GSETTINGS_BACKEND".to_owned(), "dconf".to_owned())));
        assert!(calls[0].env.iter().any(|(key, _)| key == "DISPLAY"));
    }

    #[test]
    fn gconf_sets_filename_and_default_options() {
        let runner = FakeRunner::with_programs(&["gconftool-2"]);
        let request = ApplyRequest {
            path: Path::new("/tmp/a.jpg"),
            picture_options: None,
            fallback_command: None,
        };

        GConf.apply(&request, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].args, ["-s", "-t", "string", "/desktop/gnome/background/picture_filename", "/tmp/a.jpg"]);
        assert_eq!(calls[1].args, ["-s", "-t", "string", "/desktop/gnome/background/picture_options", "zoom"]);
    }
}
