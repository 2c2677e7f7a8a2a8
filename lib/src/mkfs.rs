//! Creating the root filesystem directly on the attached device.

use std::fmt::Display;

use anyhow::Result;
use camino::Utf8Path;
use clap::ValueEnum;
use fn_error_context::context;

use crate::capabilities::FilesystemMaker;
use crate::task::Task;

/// Filesystems a root can be created with.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Filesystem {
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
}

impl Display for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_possible_value().unwrap().get_name().fmt(f)
    }
}

impl Filesystem {
    pub(crate) fn parse(name: &str) -> Result<Self> {
        Self::from_str(name, false)
            .map_err(|_| anyhow::anyhow!("Unsupported filesystem type: {name}"))
    }

    /// Options that disable features syslinux can't read, and skip the
    /// discard pass which is pointless on a freshly created image.
    fn default_options(&self) -> &'static [&'static str] {
        match self {
            Filesystem::Ext4 => &["-O", "^64bit", "-E", "nodiscard"],
            Filesystem::Ext2 | Filesystem::Ext3 => &["-E", "nodiscard"],
            Filesystem::Btrfs | Filesystem::Xfs => &["-K"],
        }
    }
}

/// Parameters for a new filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MkfsOptions {
    pub(crate) label: String,
    pub(crate) uuid: uuid::Uuid,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            label: "root".into(),
            uuid: uuid::Uuid::new_v4(),
        }
    }
}

/// The full argument list for `mkfs.<fs>`, minus the device.
pub(crate) fn mkfs_args(fs: Filesystem, opts: &MkfsOptions) -> Vec<String> {
    let mut r = Vec::new();
    match fs {
        Filesystem::Xfs => {
            r.push("-m".to_string());
            r.push(format!("uuid={}", opts.uuid));
        }
        Filesystem::Btrfs | Filesystem::Ext2 | Filesystem::Ext3 | Filesystem::Ext4 => {
            r.push("-U".to_string());
            r.push(opts.uuid.to_string());
        }
    }
    // Today all the above mkfs commands take -L
    r.push("-L".to_string());
    r.push(opts.label.clone());
    r.extend(fs.default_options().iter().map(|s| s.to_string()));
    r
}

/// `mkfs.<fs>` on the host.
#[derive(Debug)]
pub(crate) struct HostMkfs;

impl FilesystemMaker for HostMkfs {
    #[context("Creating {fstype} filesystem on {device}")]
    fn make_filesystem(&self, device: &Utf8Path, fstype: &str, opts: &MkfsOptions) -> Result<()> {
        let fs = Filesystem::parse(fstype)?;
        // All the mkfs commands are unnecessarily noisy by default
        Task::new("Creating filesystem", format!("mkfs.{fs}"))
            .args(mkfs_args(fs, opts))
            .args([device.as_str()])
            .quiet_output()
            .run()
    }
}
