use log::debug;

use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

/// For bare window managers: run the configured command (say `feh --bg-fill`) with the
/// image appended.
pub struct Fallback;

impl Backend for Fallback {
    fn name(&self) -> &'static str {
        "fallback command"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        let mut words = request.fallback_command.unwrap_or_default().split_whitespace();
        let Some(program) = words.next() else {
            debug!("No fallback command configured, leaving the wallpaper alone");
            return Ok(());
        };
        require(runner, program)?;

        let invocation = Invocation::new(program)
            .args(words)
            .arg(request.path_str()?);
        execute(runner, invocation)?;
        Ok(())
    }
}
