use log::{debug, warn};
use regex::Regex;

use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

const CHANNEL: &str = "xfce4-desktop";

/// Per screen, per monitor background keys, e.g.
/// `/backdrop/screen0/monitoreDP-1/workspace0/last-image`.
const IMAGE_PROPERTY: &str = r"(?m)^.*screen.*/monitor.*(image-path|last-image)$";

pub struct Xfconf;

impl Xfconf {
    fn image_properties(listing: &str) -> Vec<String> {
        match Regex::new(IMAGE_PROPERTY) {
            Ok(re) => re
                .find_iter(listing)
                .map(|m| m.as_str().trim().to_owned())
                .collect(),
            Err(err) => {
                warn!("Invalid xfconf property pattern: {}", err);
                Vec::new()
            }
        }
    }
}

impl Backend for Xfconf {
    fn name(&self) -> &'static str {
        "xfconf"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        require(runner, "xfconf-query")?;
        let path = request.path_str()?;

        let listing = execute(
            runner,
            Invocation::new("xfconf-query").args(["--channel", CHANNEL, "--property", "/backdrop", "-l"]),
        )?;
        let properties = Self::image_properties(&listing.stdout);
        if properties.is_empty() {
            warn!("xfconf lists no background image properties, nothing to set");
        }

        for property in properties {
            debug!("Setting {}", property);
            execute(
                runner,
                Invocation::new("xfconf-query").args(["--channel", CHANNEL, "--property", property.as_str(), "-s", path]),
            )?;
        }
        Ok(())
    }
}
