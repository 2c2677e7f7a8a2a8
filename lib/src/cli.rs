//! # Command line interface
//!
//! Every flag can also be set through an environment variable; a flag
//! given on the command line wins over the environment, which wins over
//! the configuration files.

use std::ffi::OsString;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;

use crate::apk::ALPINE_RELEASE;
use crate::capabilities::Capabilities;
use crate::config::ConfigurationToplevel;
use crate::error::{provision_error, ProvisionError};
use crate::hook::HookScript;
use crate::image::{ImageFormat, ImageTarget};
use crate::install::{Provisioner, RunConfig};
use crate::provision::{RootfsConfig, DEFAULT_FLAVOR, HOST_KEYS_DIR};
use crate::teardown::{Interrupt, SignalGuard};

const DEFAULT_BRANCH: &str = "latest-stable";
const DEFAULT_MIRROR: &str = "https://dl-cdn.alpinelinux.org/alpine";
const DEFAULT_IMAGE_SIZE: &str = "2G";
const DEFAULT_FSTYPE: &str = "ext4";
const DEFAULT_INITFS_FEATURES: &str = "ata,ide,scsi,virtio";
const DEFAULT_SERIAL_PORT: &str = "ttyS0";

/// Create a bootable Alpine Linux virtual machine disk image.
///
/// The image is created if it does not exist, otherwise it is reused as
/// is. An optional SCRIPT is run against the new root filesystem before
/// the image is released, with ARGS as its arguments.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "mkvmimage", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) struct Opt {
    /// Alpine branch to install
    #[clap(long, short = 'b', env = "ALPINE_BRANCH")]
    pub(crate) branch: Option<String>,

    /// URI of the Alpine mirror
    #[clap(long, short = 'm', env = "ALPINE_MIRROR")]
    pub(crate) mirror_uri: Option<String>,

    /// Format of the image file
    #[clap(long, short = 'f', env = "IMAGE_FORMAT", value_enum)]
    pub(crate) image_format: Option<ImageFormat>,

    /// Size of a newly created image, e.g. 800M or 2G
    #[clap(long, short = 's', env = "IMAGE_SIZE")]
    pub(crate) image_size: Option<String>,

    /// Root filesystem type: ext2, ext3, ext4, btrfs or xfs
    #[clap(long, env = "ROOTFS")]
    pub(crate) fs_type: Option<String>,

    /// Kernel flavor; "virt" prefers linux-lts when available
    #[clap(long, env = "KERNEL_FLAVOR")]
    pub(crate) kernel_flavor: Option<String>,

    /// Additional mkinitfs features, comma or space separated
    #[clap(long, env = "INITFS_FEATURES")]
    pub(crate) initfs_features: Option<String>,

    /// Directory with repository signing keys to install
    #[clap(long, env = "KEYS_DIR")]
    pub(crate) keys_dir: Option<Utf8PathBuf>,

    /// Repositories file to install instead of the mirror's main and community
    #[clap(long, env = "REPOS_FILE")]
    pub(crate) repositories_file: Option<Utf8PathBuf>,

    /// Additional packages to install, comma or space separated
    #[clap(long, short = 'p', env = "PACKAGES")]
    pub(crate) packages: Option<String>,

    /// Enable a login console on the serial port
    #[clap(long, env = "SERIAL_CONSOLE")]
    pub(crate) serial_console: bool,

    /// Serial port for --serial-console
    #[clap(long, env = "SERIAL_PORT")]
    pub(crate) serial_port: Option<String>,

    /// Run SCRIPT inside the image root instead of on the host
    #[clap(long, short = 'c', env = "SCRIPT_CHROOT")]
    pub(crate) script_chroot: bool,

    /// Leave the image attached and mounted when done, for debugging
    #[clap(long, short = 'C', env = "NO_CLEANUP")]
    pub(crate) no_cleanup: bool,

    /// Don't install missing tools on an Alpine host
    #[clap(long, env = "NO_HOST_PACKAGES")]
    pub(crate) no_host_packages: bool,

    /// Configuration file, read after the system configuration
    #[clap(long, env = "MKVMIMAGE_CONFIG")]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Path of the image file
    pub(crate) image: Utf8PathBuf,

    /// Script to run against the provisioned root
    pub(crate) script: Option<Utf8PathBuf>,

    /// Arguments for the script
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub(crate) script_args: Vec<String>,
}

/// Split a list given as a single string on commas and whitespace.
pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

impl Opt {
    /// Combine the flags with the configuration files into a run.
    pub(crate) fn resolve(self, file: ConfigurationToplevel, alpine_host: bool) -> Result<RunConfig> {
        let d = file.defaults.unwrap_or_default();
        let size = self
            .image_size
            .or(d.image_size)
            .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.into());
        let size = mkvmimage_blockdev::parse_size(&size)?;
        let image = ImageTarget {
            path: self.image,
            size,
            format: self.image_format.or(d.image_format).unwrap_or_default(),
        };
        let initfs_features = match self.initfs_features {
            Some(s) => split_list(&s),
            None => d
                .initfs_features
                .unwrap_or_else(|| split_list(DEFAULT_INITFS_FEATURES)),
        };
        let packages = match self.packages {
            Some(s) => split_list(&s),
            None => d.packages.unwrap_or_default(),
        };
        let serial_port = if self.serial_console || d.serial_console.unwrap_or_default() {
            let port = self
                .serial_port
                .or(d.serial_port)
                .unwrap_or_else(|| DEFAULT_SERIAL_PORT.into());
            crate::bootloader::serial_index(&port)?;
            Some(port)
        } else {
            if let Some(port) = self.serial_port.or(d.serial_port) {
                tracing::warn!("Ignoring serial port {port}, serial console is not enabled");
            }
            None
        };
        let rootfs = RootfsConfig {
            fstype: self
                .fs_type
                .or(d.fs_type)
                .unwrap_or_else(|| DEFAULT_FSTYPE.into()),
            mirror: self
                .mirror_uri
                .or(d.mirror_uri)
                .unwrap_or_else(|| DEFAULT_MIRROR.into()),
            branch: self
                .branch
                .or(d.branch)
                .unwrap_or_else(|| DEFAULT_BRANCH.into()),
            repositories_file: self.repositories_file.or(d.repositories_file),
            keys_dir: self.keys_dir.or(d.keys_dir),
            trust_keys: file.trust_keys,
            host_keys_dir: HOST_KEYS_DIR.into(),
            packages,
            kernel_flavor: self
                .kernel_flavor
                .or(d.kernel_flavor)
                .unwrap_or_else(|| DEFAULT_FLAVOR.into()),
            initfs_features,
            serial_port,
            script_chroot: self.script_chroot || d.script_chroot.unwrap_or_default(),
        };
        let hook = match self.script {
            Some(path) => {
                if !path.try_exists()? {
                    anyhow::bail!("Script {path} does not exist");
                }
                Some(HookScript {
                    path,
                    args: self.script_args,
                })
            }
            None => None,
        };
        let no_host_packages = self.no_host_packages || d.no_host_packages.unwrap_or_default();
        Ok(RunConfig {
            image,
            rootfs,
            hook,
            no_cleanup: self.no_cleanup,
            host_packages: alpine_host && !no_host_packages,
        })
    }
}

/// Attaching devices and mounting needs full root privileges.
pub(crate) fn require_root() -> Result<()> {
    let uid = rustix::process::getuid();
    if !uid.is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    if !rustix::thread::capability_is_in_bounding_set(rustix::thread::Capability::SystemAdmin)? {
        anyhow::bail!("This command requires full root privileges (CAP_SYS_ADMIN)");
    }
    Ok(())
}

/// Prefix the error with its kind, so the fatal message names what failed.
fn label_error(e: anyhow::Error) -> anyhow::Error {
    match provision_error(&e).map(|k| k.kind()) {
        Some(kind) => e.context(kind),
        None => e,
    }
}

fn resolve(opt: Opt) -> Result<RunConfig> {
    let file = crate::config::load_config(opt.config.as_deref())?;
    let alpine_host = Utf8Path::new(ALPINE_RELEASE).try_exists()?;
    let config = opt.resolve(file, alpine_host)?;
    require_root()?;
    Ok(config)
}

async fn run(opt: Opt) -> Result<()> {
    let config = resolve(opt).map_err(ProvisionError::Configuration)?;
    let interrupt = Interrupt::default();
    // Installed for the whole run, including teardown, so a second
    // interrupt can't kill us while releasing devices.
    let _signals = SignalGuard::install(&interrupt)?;
    let r = tokio::task::spawn_blocking(move || {
        let caps = Capabilities::host();
        Provisioner::new(&caps, &config, interrupt).run()
    })
    .await
    .context("Provisioning task")??;
    let verb = if r.created { "Created" } else { "Provisioned" };
    println!("{verb} {} (root filesystem UUID {})", r.image, r.boot.root_uuid);
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run(Opt::parse_from(args)).await.map_err(label_error)
}
