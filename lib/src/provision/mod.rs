//! Populating a freshly formatted root filesystem.
//!
//! The stages run strictly in order against the mounted root and any
//! failure ends the run; nothing tries to repair a partially populated
//! tree.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::bootloader::BootConfig;
use crate::capabilities::Capabilities;
use crate::error::ProvisionError;
use crate::mkfs::MkfsOptions;
use crate::mount::MountTree;
use crate::teardown::Interrupt;

mod console;
mod fstab;
mod initramfs;
mod kernel;
mod repos;
mod services;

use fstab::MountSpec;
pub(crate) use kernel::DEFAULT_FLAVOR;

/// The package providing the base system.
const BASE_PACKAGE: &str = "alpine-base";
const BOOTLOADER_PACKAGE: &str = "syslinux";

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
/// Where the package manager keeps the host's signing keys.
pub(crate) const HOST_KEYS_DIR: &str = "/etc/apk/keys";

/// Everything that decides what goes into the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RootfsConfig {
    pub(crate) fstype: String,
    pub(crate) mirror: String,
    pub(crate) branch: String,
    /// Copied verbatim when it exists, instead of repositories for `mirror`
    pub(crate) repositories_file: Option<Utf8PathBuf>,
    /// Copied verbatim when it exists
    pub(crate) keys_dir: Option<Utf8PathBuf>,
    /// Key file name to base64 encoded content
    pub(crate) trust_keys: BTreeMap<String, String>,
    pub(crate) host_keys_dir: Utf8PathBuf,
    /// Installed last
    pub(crate) packages: Vec<String>,
    pub(crate) kernel_flavor: String,
    pub(crate) initfs_features: Vec<String>,
    pub(crate) serial_port: Option<String>,
    pub(crate) script_chroot: bool,
}

/// Create the root filesystem on `device`, returning its UUID.
pub(crate) fn make_filesystem(
    caps: &Capabilities,
    device: &Utf8Path,
    fstype: &str,
) -> Result<uuid::Uuid> {
    let opts = MkfsOptions::default();
    caps.mkfs
        .make_filesystem(device, fstype, &opts)
        .map_err(ProvisionError::FilesystemCreate)?;
    Ok(opts.uuid)
}

fn copy_resolv_conf(root: &Dir) -> Result<()> {
    let src = Utf8Path::new(HOST_RESOLV_CONF);
    if !src.try_exists()? {
        return Ok(());
    }
    let buf = std::fs::read(src).with_context(|| format!("Reading {src}"))?;
    root.create_dir_all("etc")?;
    root.atomic_write("etc/resolv.conf", buf)?;
    Ok(())
}

/// Install and configure the system on the mounted root. The interrupt
/// flag is checked between stages.
pub(crate) fn populate(
    caps: &Capabilities,
    config: &RootfsConfig,
    interrupt: &Interrupt,
    tree: &mut MountTree,
    root_uuid: &uuid::Uuid,
) -> Result<BootConfig> {
    let root_buf = tree.root.clone();
    let rootpath = root_buf.as_path();
    let root = &Dir::open_ambient_dir(rootpath, cap_std::ambient_authority())
        .with_context(|| format!("Opening {rootpath}"))
        .map_err(ProvisionError::Mount)?;
    let install = |packages: &[&str]| -> Result<(), ProvisionError> {
        let packages: Vec<String> = packages.iter().map(|s| s.to_string()).collect();
        caps.packages
            .install(rootpath, &packages)
            .map_err(ProvisionError::PackageInstall)
    };

    repos::write_repositories(root, config).map_err(ProvisionError::Configuration)?;
    repos::write_keys(root, config).map_err(ProvisionError::Configuration)?;
    interrupt.check()?;

    install(&[BASE_PACKAGE])?;
    interrupt.check()?;

    crate::mount::bind_system_dirs(caps.mounts.as_ref(), tree).map_err(ProvisionError::Mount)?;
    if let Err(e) = copy_resolv_conf(root) {
        tracing::warn!("Copying {HOST_RESOLV_CONF}: {e:#}");
    }
    interrupt.check()?;

    initramfs::write_config(root, &config.fstype, &config.initfs_features)
        .map_err(ProvisionError::BootConfig)?;
    let flavor = kernel::resolve_flavor(caps.packages.as_ref(), rootpath, &config.kernel_flavor)
        .map_err(ProvisionError::PackageInstall)?;
    println!("Installing kernel linux-{flavor}");
    install(&[kernel::package(&flavor).as_str()])?;
    interrupt.check()?;

    let boot = BootConfig::new(
        *root_uuid,
        &config.fstype,
        &flavor,
        config.serial_port.as_deref(),
    );
    install(&[BOOTLOADER_PACKAGE])?;
    crate::bootloader::write_extlinux_config(root, &boot).map_err(ProvisionError::BootConfig)?;
    caps.bootloader
        .install(rootpath, &boot)
        .map_err(ProvisionError::BootConfig)?;
    interrupt.check()?;

    fstab::write_fstab(root, &[MountSpec::root(root_uuid, &config.fstype)])
        .map_err(ProvisionError::BootConfig)?;
    if let Some(port) = config.serial_port.as_deref() {
        console::enable_serial(root, port).map_err(ProvisionError::BootConfig)?;
    }
    services::enable_services(root).map_err(ProvisionError::BootConfig)?;
    interrupt.check()?;

    if !config.packages.is_empty() {
        caps.packages
            .install(rootpath, &config.packages)
            .map_err(ProvisionError::PackageInstall)?;
    }
    tracing::debug!("Chroot mounts: {:?}", tree.submounts);
    Ok(boot)
}
