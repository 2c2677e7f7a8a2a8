//! Helpers intended for [`std::process::Command`].

use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, inheriting stdout and stderr; an
    /// unsuccessful exit is turned into an error.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as UTF-8.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        self.log_debug();
        let st = self
            .status()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if !st.success() {
            anyhow::bail!("Subprocess {:?} failed: {st}", self.get_program());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.log_debug();
        self.stdout(Stdio::piped());
        let o = self
            .output()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if !o.status.success() {
            let stderr = String::from_utf8_lossy(&o.stderr);
            anyhow::bail!(
                "Subprocess {:?} failed: {}: {}",
                self.get_program(),
                o.status,
                stderr.trim()
            );
        }
        String::from_utf8(o.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let s = self.run_get_string()?;
        serde_json::from_str(&s).context("Parsing subprocess output as JSON")
    }
}
