use crate::command::{CommandRunner, Invocation};

use super::{execute, require, ApplyError, ApplyRequest, Backend};

const PICTURE_FILENAME_KEY: &str = "/org/mate/desktop/background/picture-filename";

pub struct Dconf;

impl Backend for Dconf {
    fn name(&self) -> &'static str {
        "dconf"
    }

    fn apply(&self, request: &ApplyRequest<'_>, runner: &dyn CommandRunner) -> Result<(), ApplyError> {
        require(runner, "dconf")?;
        // dconf takes GVariant text, so the path goes in as a quoted string
        let value = format!("'{}'", request.path_str()?.replace('\'', "\\'"));
        execute(
            runner,
            Invocation::new("dconf").args(["write", PICTURE_FILENAME_KEY, value.as_str()]),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::command::fake::FakeRunner;

    #[test]
    fn writes_quoted_filename() {
        let runner = FakeRunner::with_programs(&["dconf"]);
        let request = ApplyRequest {
            path: Path::new("/tmp/it's.jpg"),
            picture_options: Some("zoom"),
            fallback_command: None,
        };

        Dconf.apply(&request, &runner).unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, ["write", PICTURE_FILENAME_KEY, "'/tmp/it\\'s.jpg'"]);
    }
}
