use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::error::EngineError;

/// Captured result of one finished subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for parsers that do not care which stream
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        text.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stdout.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&self.stderr);
        text
    }
}

/// Runs `program` in `cwd` and waits at most `limit` for it.
///
/// The child is spawned with `kill_on_drop`, so when the limit expires the
/// wait future is dropped and the process is killed; the caller gets
/// [`EngineError::Timeout`] instead of a hang.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: &Path,
    limit: Duration,
) -> Result<ProcessOutput, EngineError> {
    log::debug!("Running `{program} {}` in {}", args.join(" "), cwd.display());

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| EngineError::Toolchain {
        program: program.to_string(),
        source,
    })?;

    let start_time = Instant::now();
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: start_time.elapsed(),
        }),
        Ok(Err(source)) => Err(EngineError::Toolchain {
            program: program.to_string(),
            source,
        }),
        Err(_) => {
            log::warn!("`{program}` exceeded {limit:?} in {}, killed", cwd.display());
            Err(EngineError::Timeout(limit))
        }
    }
}
