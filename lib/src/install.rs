//! # Provisioning a disk image
//!
//! A run acquires, in order: host tools, a scratch directory, the image
//! file and a block device for it, the root mount and the mounts beneath
//! it. Each acquisition is registered with the [`TeardownController`]
//! immediately, which is the only thing that ever releases them.

use anyhow::Result;
use camino::Utf8PathBuf;

use crate::apk::{host_tools, HOST_VIRTUAL_PACKAGE};
use crate::bootloader::BootConfig;
use crate::capabilities::Capabilities;
use crate::error::ProvisionError;
use crate::hook::HookScript;
use crate::image::{self, ImageTarget};
use crate::mount::{self, WorkDir};
use crate::provision::{self, RootfsConfig};
use crate::teardown::{Interrupt, Resource, TeardownController, TeardownReport, TeardownState};

/// A fully resolved run.
#[derive(Debug, Clone)]
pub(crate) struct RunConfig {
    pub(crate) image: ImageTarget,
    pub(crate) rootfs: RootfsConfig,
    pub(crate) hook: Option<HookScript>,
    /// Leave everything attached and mounted for inspection
    pub(crate) no_cleanup: bool,
    /// Install the tools the run needs on the host first
    pub(crate) host_packages: bool,
}

/// What a successful run produced.
#[derive(Debug)]
pub(crate) struct Provisioned {
    pub(crate) image: Utf8PathBuf,
    pub(crate) created: bool,
    pub(crate) boot: BootConfig,
}

/// One provisioning run and everything it holds.
#[derive(Debug)]
pub(crate) struct Provisioner<'a> {
    caps: &'a Capabilities,
    config: &'a RunConfig,
    interrupt: Interrupt,
    teardown: TeardownController,
}

impl<'a> Provisioner<'a> {
    pub(crate) fn new(caps: &'a Capabilities, config: &'a RunConfig, interrupt: Interrupt) -> Self {
        Self {
            caps,
            config,
            interrupt,
            teardown: TeardownController::new(config.no_cleanup),
        }
    }

    fn acquire(&mut self) -> Result<Provisioned> {
        let caps = self.caps;
        let config = self.config;
        let fstype = config.rootfs.fstype.as_str();

        if config.host_packages {
            caps.packages
                .add_virtual(HOST_VIRTUAL_PACKAGE, &host_tools(fstype))
                .map_err(ProvisionError::PackageInstall)?;
            self.teardown
                .push(Resource::HostPackages(HOST_VIRTUAL_PACKAGE.to_owned()));
        }
        self.interrupt.check()?;

        let workdir = WorkDir::new().map_err(ProvisionError::Mount)?;
        let mountpoint = workdir.mountpoint();
        self.teardown.push(Resource::WorkDir(workdir));

        let created = image::ensure_image(caps.images.as_ref(), &config.image)
            .map_err(ProvisionError::ImageCreate)?;
        self.interrupt.check()?;

        let device = image::find_free_slot(caps).map_err(ProvisionError::DeviceUnavailable)?;
        let attachment =
            image::attach(caps, &config.image, &device).map_err(ProvisionError::Attach)?;
        self.teardown.push(Resource::Attachment(attachment.clone()));
        self.interrupt.check()?;
        image::wait_ready(caps, &attachment).map_err(ProvisionError::Attach)?;

        let uuid = provision::make_filesystem(caps, attachment.path(), fstype)?;
        self.interrupt.check()?;

        println!("Mounting root filesystem");
        let mut tree = mount::mount_root(caps.mounts.as_ref(), &attachment, fstype, &mountpoint)
            .map_err(ProvisionError::Mount)?;
        self.teardown.push(Resource::Mounts(tree.root.clone()));
        self.interrupt.check()?;

        let boot = provision::populate(caps, &config.rootfs, &self.interrupt, &mut tree, &uuid)?;

        if let Some(script) = config.hook.as_ref() {
            let chroot = config.rootfs.script_chroot;
            if chroot {
                let target = crate::hook::bind_script_dir(caps.mounts.as_ref(), &tree.root, script)
                    .map_err(ProvisionError::Mount)?;
                tree.push(target.clone());
                self.teardown.push(Resource::HookBind(target));
            }
            crate::hook::run(&tree.root, script, chroot).map_err(ProvisionError::Script)?;
            self.interrupt.check()?;
        }

        Ok(Provisioned {
            image: config.image.path.clone(),
            created,
            boot,
        })
    }

    /// Release everything acquired so far; only the first call does anything.
    pub(crate) fn teardown(&mut self) -> TeardownReport {
        let report = self.teardown.unwind(self.caps);
        if !report.is_empty() {
            tracing::debug!("Released: {}", report.released.join(", "));
        }
        report.print_warnings();
        report
    }

    /// Run to completion. A failure of the run itself takes precedence over
    /// a failure to clean up after it.
    pub(crate) fn run(mut self) -> Result<Provisioned> {
        let r = self.acquire();
        let report = self.teardown();
        let provisioned = r?;
        report.into_result()?;
        Ok(provisioned)
    }
}

impl Drop for Provisioner<'_> {
    fn drop(&mut self) {
        if self.teardown.state() == TeardownState::Armed {
            if self.teardown.pending().next().is_some() {
                tracing::warn!("Run abandoned, releasing what it acquired");
            }
            self.teardown();
        }
    }
}
