//! Narrow interfaces to the host tools a provisioning run drives.
//!
//! The orchestrator never spawns `qemu-nbd`, `apk`, `mkfs` or `mount`
//! itself; it goes through these traits so the acquisition and release
//! ordering can be exercised without root privileges.

use std::fmt::Debug;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::bootloader::BootConfig;
use crate::image::{ImageFormat, ImageTarget};
use crate::mkfs::MkfsOptions;

/// Installs distribution packages into a root.
pub(crate) trait PackageInstaller: Debug {
    /// Install `packages` into the tree at `root`, initializing the
    /// package database if needed.
    fn install(&self, root: &Utf8Path, packages: &[String]) -> Result<()>;

    /// Whether `package` can be found in the repositories configured in `root`.
    fn is_available(&self, root: &Utf8Path, package: &str) -> Result<bool>;

    /// Install `packages` on the host, grouped under the virtual package `name`.
    fn add_virtual(&self, name: &str, packages: &[String]) -> Result<()>;

    /// Remove a virtual package set previously created with [`Self::add_virtual`].
    fn remove_virtual(&self, name: &str) -> Result<()>;
}

/// Creates disk image files and connects them to block devices.
pub(crate) trait BlockImageProvider: Debug {
    /// Create a new, empty image file.
    fn create(&self, image: &ImageTarget) -> Result<()>;

    /// Make the kernel block device pool available (e.g. load a module).
    fn load_kernel_support(&self) -> Result<()>;

    /// Connect `image` to the block device `device`.
    fn connect(&self, image: &Utf8Path, format: ImageFormat, device: &Utf8Path) -> Result<()>;

    /// Disconnect whatever is attached to `device`.
    fn disconnect(&self, device: &Utf8Path) -> Result<()>;
}

/// Creates a filesystem directly on a block device.
pub(crate) trait FilesystemMaker: Debug {
    fn make_filesystem(&self, device: &Utf8Path, fstype: &str, opts: &MkfsOptions) -> Result<()>;
}

/// Makes a mounted root bootable.
pub(crate) trait BootloaderInstaller: Debug {
    fn install(&self, root: &Utf8Path, boot: &BootConfig) -> Result<()>;
}

/// Mount table manipulation.
pub(crate) trait Mounter: Debug {
    /// Mount `source` at `target`.
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        fstype: Option<&str>,
        options: &[&str],
    ) -> Result<()>;

    /// Bind mount the host path `source` at `target`.
    fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()>;

    /// Set mount propagation of `target` to private.
    fn make_private(&self, target: &Utf8Path) -> Result<()>;

    /// All current mount points.
    fn mounts(&self) -> Result<Vec<Utf8PathBuf>>;

    /// Detach the mount at `target`, even if busy.
    fn unmount(&self, target: &Utf8Path) -> Result<()>;
}

/// The full set of host capabilities used by a run.
#[derive(Debug)]
pub(crate) struct Capabilities {
    pub(crate) packages: Box<dyn PackageInstaller>,
    pub(crate) images: Box<dyn BlockImageProvider>,
    pub(crate) mkfs: Box<dyn FilesystemMaker>,
    pub(crate) bootloader: Box<dyn BootloaderInstaller>,
    pub(crate) mounts: Box<dyn Mounter>,
    /// Where block device slots are looked up
    pub(crate) pool: mkvmimage_blockdev::NbdPool,
}

impl Capabilities {
    /// The real host tools.
    pub(crate) fn host() -> Self {
        Self {
            packages: Box::new(crate::apk::Apk),
            images: Box::new(crate::image::Qemu),
            mkfs: Box::new(crate::mkfs::HostMkfs),
            bootloader: Box::new(crate::bootloader::Extlinux),
            mounts: Box::new(crate::mount::HostMounts),
            pool: mkvmimage_blockdev::NbdPool::default(),
        }
    }
}
