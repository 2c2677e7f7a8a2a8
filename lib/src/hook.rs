//! Running the caller's customization script against the provisioned root.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use mkvmimage_utils::ShellQuoted;

use crate::capabilities::Mounter;
use crate::task::Task;

/// Where the script's directory appears inside the root in chroot mode.
pub(crate) const HOOK_MOUNT: &str = "mnt";

/// Set in the environment of a script run on the host.
pub(crate) const IMAGE_ROOT_ENV: &str = "IMAGE_ROOT";

/// A script and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HookScript {
    pub(crate) path: Utf8PathBuf,
    pub(crate) args: Vec<String>,
}

impl HookScript {
    fn file_name(&self) -> Result<&str> {
        self.path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid script path {}", self.path))
    }
}

/// Bind the directory holding the script at [`HOOK_MOUNT`] in the root,
/// returning the mount point.
#[context("Binding script directory")]
pub(crate) fn bind_script_dir(
    mounts: &dyn Mounter,
    root: &Utf8Path,
    script: &HookScript,
) -> Result<Utf8PathBuf> {
    let path = script.path.canonicalize_utf8()?;
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("No parent directory for {path}"))?;
    let target = root.join(HOOK_MOUNT);
    std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
    mounts.bind(dir, &target)?;
    mounts.make_private(&target)?;
    Ok(target)
}

/// `chroot <root> /bin/sh -c 'cd /mnt && exec ./<script> "$@"' sh <args...>`
pub(crate) fn chroot_command(root: &Utf8Path, script: &HookScript) -> Result<Command> {
    let exe = format!("./{}", script.file_name()?);
    let shell = format!("cd /{HOOK_MOUNT} && exec {} \"$@\"", ShellQuoted::new(&exe));
    let mut cmd = Command::new("chroot");
    cmd.args([root.as_str(), "/bin/sh", "-c", shell.as_str(), "sh"]);
    cmd.args(&script.args);
    Ok(cmd)
}

/// The script run directly on the host, from inside the root.
pub(crate) fn host_command(root: &Utf8Path, script: &HookScript) -> Result<Command> {
    let path = script
        .path
        .canonicalize_utf8()
        .with_context(|| format!("Locating {}", script.path))?;
    let mut cmd = Command::new(path.as_std_path());
    cmd.args(&script.args)
        .current_dir(root)
        .env(IMAGE_ROOT_ENV, root);
    Ok(cmd)
}

/// Run the script to completion; any nonzero exit is an error.
#[context("Running {}", script.path)]
pub(crate) fn run(root: &Utf8Path, script: &HookScript, chroot: bool) -> Result<()> {
    let cmd = if chroot {
        chroot_command(root, script)?
    } else {
        host_command(root, script)?
    };
    Task::new_cmd(format!("Running {}", script.file_name()?), cmd).run()
}
