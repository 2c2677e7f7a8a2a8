use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};

/// A host command run as a named step of the provisioning run. The
/// description is what the operator sees on stdout.
#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<OsStr>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            cmd,
        }
    }

    /// Don't print the description.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Discard the child's stdout; mkfs and friends are noisy.
    pub(crate) fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    fn pre_exec(&mut self) {
        if !self.quiet {
            println!("{}", self.description);
        }
        if self.quiet_output {
            self.cmd.stdout(Stdio::null());
        }
        tracing::debug!("exec: {:?}", self.cmd);
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(mut self) -> Result<()> {
        self.pre_exec();
        let description = self.description;
        let st = self
            .cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st}");
        }
        Ok(())
    }

    /// Like [`Self::run()`], but return stdout.
    pub(crate) fn read(mut self) -> Result<String> {
        self.pre_exec();
        let description = self.description;
        let mut cmd = self.cmd;
        cmd.stdout(Stdio::piped());
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let st = o.status;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st}");
        }
        Ok(String::from_utf8(o.stdout)?)
    }

    pub(crate) fn new_and_run<'a>(
        description: impl AsRef<str>,
        exe: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        Self::new(description.as_ref(), exe).args(args).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status() {
        Task::new("true", "true").quiet().run().unwrap();
        let e = Task::new("Failing step", "false").quiet().run().unwrap_err();
        assert!(e.to_string().starts_with("Task Failing step failed"));
    }

    #[test]
    fn test_task_read() {
        let out = Task::new("echo", "echo")
            .quiet()
            .args(["hello", "world"])
            .read()
            .unwrap();
        assert_eq!(out, "hello world\n");
        let e = Task::new("Failing read", "sh")
            .quiet()
            .args(["-c", "echo partial; exit 2"])
            .read()
            .unwrap_err();
        assert!(e.to_string().contains("exit status: 2"));
    }
}
