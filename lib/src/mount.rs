//! Helpers for interacting with mountpoints

use std::cmp::Reverse;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use mkvmimage_utils::CommandRunExt;
use serde::Deserialize;

use crate::capabilities::Mounter;
use crate::image::BlockAttachment;
use crate::task::Task;

/// Name of the mount point inside the scratch directory.
const ROOTFS: &str = "rootfs";

/// Host directories bound into the tree before anything is run in a chroot.
const SYSTEM_BINDS: &[&str] = &["dev", "sys"];

#[derive(Deserialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Filesystem {
    pub(crate) target: Utf8PathBuf,
}

#[derive(Deserialize, Debug)]
pub(crate) struct Findmnt {
    pub(crate) filesystems: Vec<Filesystem>,
}

/// The scratch directory holding the mount point for one run.
///
/// Removal is non-recursive: if an unmount failed, the
/// mount point is not empty and must not be deleted through.
#[derive(Debug)]
pub(crate) struct WorkDir {
    dir: tempfile::TempDir,
    path: Utf8PathBuf,
}

impl WorkDir {
    pub(crate) fn new() -> Result<Self> {
        Self::new_in(&std::env::temp_dir())
    }

    /// The stored path is canonical, since it is matched against the
    /// mount table, which only ever holds canonical paths.
    #[context("Creating temporary directory in {}", parent.display())]
    pub(crate) fn new_in(parent: &std::path::Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("mkvmimage.")
            .tempdir_in(parent)?;
        let path = Utf8Path::from_path(dir.path())
            .ok_or_else(|| anyhow::anyhow!("Non-UTF8 temporary directory {:?}", dir.path()))?
            .canonicalize_utf8()
            .with_context(|| format!("Resolving {:?}", dir.path()))?;
        std::fs::create_dir(path.join(ROOTFS))?;
        Ok(Self { dir, path })
    }

    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub(crate) fn mountpoint(&self) -> Utf8PathBuf {
        self.path.join(ROOTFS)
    }

    /// Leave the directory in place, returning its path.
    pub(crate) fn persist(self) -> Utf8PathBuf {
        let _ = self.dir.into_path();
        self.path
    }

    /// Remove the (now empty) mount point and the directory itself. On
    /// failure the directory is left in place.
    pub(crate) fn remove(self) -> Result<()> {
        let mountpoint = self.mountpoint();
        match std::fs::remove_dir(&mountpoint) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let _ = self.dir.into_path();
                return Err(e).with_context(|| format!("Removing {mountpoint}"));
            }
        }
        let path = self.path;
        self.dir
            .close()
            .with_context(|| format!("Removing {path}"))
    }
}

/// A root filesystem mount and the mounts created beneath it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountTree {
    pub(crate) root: Utf8PathBuf,
    pub(crate) submounts: Vec<Utf8PathBuf>,
}

impl MountTree {
    /// Record a mount created under the root.
    pub(crate) fn push(&mut self, path: Utf8PathBuf) {
        debug_assert!(path.starts_with(&self.root));
        self.submounts.push(path);
    }
}

/// Mount the freshly formatted device.
#[context("Mounting {} at {mountpoint}", attachment.path())]
pub(crate) fn mount_root(
    mounts: &dyn Mounter,
    attachment: &BlockAttachment,
    fstype: &str,
    mountpoint: &Utf8Path,
) -> Result<MountTree> {
    mounts.mount(attachment.path().as_str(), mountpoint, Some(fstype), &[])?;
    Ok(MountTree {
        root: mountpoint.to_owned(),
        submounts: Vec::new(),
    })
}

/// Mount a fresh `proc` and bind the host `/dev` and `/sys` into the tree,
/// each with private propagation so nothing done inside the tree (in
/// particular the final unmount) reaches the host.
#[context("Preparing chroot mounts in {}", tree.root)]
pub(crate) fn bind_system_dirs(mounts: &dyn Mounter, tree: &mut MountTree) -> Result<()> {
    let proc = tree.root.join("proc");
    std::fs::create_dir_all(&proc).with_context(|| format!("Creating {proc}"))?;
    mounts.mount("proc", &proc, Some("proc"), &[])?;
    tree.push(proc.clone());
    mounts.make_private(&proc)?;
    for name in SYSTEM_BINDS {
        let src = Utf8Path::new("/").join(name);
        let target = tree.root.join(name);
        std::fs::create_dir_all(&target).with_context(|| format!("Creating {target}"))?;
        mounts.bind(&src, &target)?;
        tree.push(target.clone());
        mounts.make_private(&target)?;
    }
    Ok(())
}

/// The mounts at or below `root`, deepest first. Mounts at equal depth are
/// ordered by reverse path so the result is deterministic.
pub(crate) fn unmount_order(root: &Utf8Path, mounts: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut r: Vec<_> = mounts
        .iter()
        .filter(|m| m.starts_with(root))
        .cloned()
        .collect();
    r.sort_by(|a, b| {
        Reverse(a.as_str().len())
            .cmp(&Reverse(b.as_str().len()))
            .then_with(|| b.cmp(a))
    });
    // A path mounted over more than once stays listed once per mount.
    r
}

/// Unmount everything at or below `root`. Every mount is attempted even
/// if an earlier one fails; the failures are reported together. Calling
/// this on a tree with nothing mounted is a no-op.
#[context("Unmounting {root}")]
pub(crate) fn unmount_all(mounts: &dyn Mounter, root: &Utf8Path) -> Result<()> {
    let order = unmount_order(root, &mounts.mounts()?);
    let mut failed = Vec::new();
    for target in order {
        tracing::debug!("Unmounting {target}");
        if let Err(e) = mounts.unmount(&target) {
            tracing::warn!("{e:#}");
            failed.push(target);
        }
    }
    if !failed.is_empty() {
        let failed = failed
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        anyhow::bail!("Failed to unmount: {failed}");
    }
    Ok(())
}

/// The host mount table, manipulated with `mount(8)` and `umount2(2)`.
#[derive(Debug)]
pub(crate) struct HostMounts;

impl Mounter for HostMounts {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> Result<()> {
        let mut t = Task::new(format!("Mounting {target}"), "mount").quiet();
        if let Some(fstype) = fstype {
            t = t.args(["-t", fstype]);
        }
        if !options.is_empty() {
            t = t.args(["-o".to_string(), options.join(",")]);
        }
        t.args([source, target.as_str()]).run()
    }

    fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        Task::new(format!("Binding {source} to {target}"), "mount")
            .quiet()
            .args(["--bind", source.as_str(), target.as_str()])
            .run()
    }

    fn make_private(&self, target: &Utf8Path) -> Result<()> {
        Task::new_and_run(
            format!("Making {target} private"),
            "mount",
            ["--make-private", target.as_str()],
        )
    }

    #[context("Listing mounts")]
    fn mounts(&self) -> Result<Vec<Utf8PathBuf>> {
        let o: Findmnt = Command::new("findmnt")
            .args(["-J", "--list", "-o", "TARGET"])
            .run_and_parse_json()?;
        Ok(o.filesystems.into_iter().map(|f| f.target).collect())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        use rustix::mount::UnmountFlags;
        rustix::mount::unmount(target.as_str(), UnmountFlags::DETACH | UnmountFlags::FORCE)
            .with_context(|| format!("Unmounting {target}"))
    }
}
