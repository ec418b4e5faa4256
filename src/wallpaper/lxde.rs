use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

/// LXDE and LXQt let their file manager draw the desktop.
pub struct PcManFm {
    binary: &'static str,
    default_mode: &'static str,
}

impl PcManFm {
    pub const LXDE: PcManFm = PcManFm {
        binary: "pcmanfm",
        default_mode: "crop",
    };
    pub const LXQT: PcManFm = PcManFm {
        binary: "pcmanfm-qt",
        default_mode: "zoom",
    };
}

impl Backend for PcManFm {
    fn name(&self) -> &'static str {
        self.binary
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        require(runner, self.binary)?;
        let path = request.path_str()?;

        execute(runner, Invocation::new(self.binary).args(["-w", path]))?;
        execute(
            runner,
            Invocation::new(self.binary).args(["--wallpaper-mode", request.options_or(self.default_mode)]),
        )?;
        Ok(())
    }
}
