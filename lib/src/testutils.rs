//! Fakes of the host capabilities, for exercising a whole run without root.
//!
//! The "disk" is a directory. Mounting the attached device renames it onto
//! the mount point and unmounting renames it back, so whatever a run wrote
//! into the root can be inspected after teardown.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::rc::Rc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use mkvmimage_blockdev::{NbdDevice, NbdPool};

use crate::bootloader::BootConfig;
use crate::capabilities::{
    BlockImageProvider, BootloaderInstaller, Capabilities, FilesystemMaker, Mounter,
    PackageInstaller,
};
use crate::image::{ImageFormat, ImageTarget};
use crate::mkfs::{Filesystem, MkfsOptions};
use crate::teardown::Interrupt;

const NBD_DEVICES: u32 = 4;
/// Reported for a connected device: 1GiB
const CONNECTED_SECTORS: u64 = 2 * 1024 * 1024;

/// Init scripts shipped by the fake base package; cgroups is missing, as
/// on older releases.
const INIT_SCRIPTS: &[&str] = &[
    "devfs", "dmesg", "mdev", "hwdrivers", "modules", "hwclock", "swap", "hostname", "sysctl",
    "bootmisc", "syslog", "killprocs", "savecache", "mount-ro",
];

const INITTAB: &str = "::sysinit:/sbin/openrc sysinit\n\
::sysinit:/sbin/openrc boot\n\
::wait:/sbin/openrc default\n\
tty1::respawn:/sbin/getty 38400 tty1\n\
# Put a getty on the serial port\n\
#ttyS0::respawn:/sbin/getty -L 115200 ttyS0 vt100\n\
::shutdown:/sbin/openrc shutdown\n";

const EXTLINUX_CONF: &str = "# configuration for extlinux config builder\n\
overwrite=1\n\
#root=\n\
default_kernel_opts=\"quiet\"\n\
modules=sd-mod,usb-storage,ext4\n\
default=lts\n\
timeout=3\n\
# serial_port=\n\
# serial_baud=115200\n";

/// Every operation performed through a fake, as `<op> <args>`.
#[derive(Debug, Clone, Default)]
pub(crate) struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, op: &str, args: impl Display) {
        self.0.borrow_mut().push(format!("{op} {args}"));
    }

    pub(crate) fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// The operation names, in order.
    pub(crate) fn ops(&self) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .map(|e| e.split_once(' ').map_or(e.as_str(), |(op, _)| op).to_owned())
            .collect()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.args_of(op).len()
    }

    /// The arguments of every `op`, in order.
    pub(crate) fn args_of(&self, op: &str) -> Vec<String> {
        self.0
            .borrow()
            .iter()
            .filter_map(|e| e.split_once(' '))
            .filter(|(o, _)| *o == op)
            .map(|(_, args)| args.to_owned())
            .collect()
    }
}

/// State shared by all the fakes of one fixture.
#[derive(Debug)]
pub(crate) struct FakeState {
    log: Log,
    sys_block: Utf8PathBuf,
    dev_dir: Utf8PathBuf,
    disk: Utf8PathBuf,
    mounts: RefCell<Vec<Utf8PathBuf>>,
    /// Where the disk is currently mounted
    disk_mounts: RefCell<Vec<Utf8PathBuf>>,
    stuck: RefCell<Vec<Utf8PathBuf>>,
    available: RefCell<BTreeSet<String>>,
    host_virtual: RefCell<Option<String>>,
    fail_disconnect: Cell<bool>,
    interrupt_on_connect: Cell<bool>,
    pub(crate) interrupt: Interrupt,
}

impl FakeState {
    pub(crate) fn add_mounts(&self, paths: &[Utf8PathBuf]) {
        self.mounts.borrow_mut().extend(paths.iter().cloned());
    }

    pub(crate) fn current_mounts(&self) -> Vec<Utf8PathBuf> {
        self.mounts.borrow().clone()
    }

    /// Make unmounting `path` fail as if it were busy.
    pub(crate) fn make_stuck(&self, path: &Utf8Path) {
        self.stuck.borrow_mut().push(path.to_owned());
    }

    pub(crate) fn set_available(&self, packages: &[&str]) {
        *self.available.borrow_mut() = packages.iter().map(|s| s.to_string()).collect();
    }

    pub(crate) fn fail_disconnect(&self) {
        self.fail_disconnect.set(true);
    }

    /// Raise the interrupt as soon as a device is connected.
    pub(crate) fn interrupt_on_connect(&self) {
        self.interrupt_on_connect.set(true);
    }

    /// The virtual package set currently installed on the "host".
    pub(crate) fn host_virtual(&self) -> Option<String> {
        self.host_virtual.borrow().clone()
    }

    fn sectors_path(&self, device: &Utf8Path) -> Result<Utf8PathBuf> {
        let name = device
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Invalid device {device}"))?;
        Ok(self.sys_block.join(name).join("size"))
    }

    fn reset_disk(&self) -> Result<()> {
        if self.disk.try_exists()? {
            std::fs::remove_dir_all(&self.disk)?;
        }
        std::fs::create_dir_all(self.disk.join("lost+found"))?;
        Ok(())
    }
}

#[derive(Debug)]
struct FakePackages(Rc<FakeState>);

impl PackageInstaller for FakePackages {
    fn install(&self, root: &Utf8Path, packages: &[String]) -> Result<()> {
        self.0.log.push("install", packages.join(" "));
        if !root.join("etc/apk/repositories").try_exists()? {
            anyhow::bail!("No repositories configured in {root}");
        }
        let db = root.join("lib/apk/db");
        std::fs::create_dir_all(&db)?;
        for pkg in packages {
            match pkg.as_str() {
                "alpine-base" => {
                    let initd = root.join("etc/init.d");
                    std::fs::create_dir_all(&initd)?;
                    for svc in INIT_SCRIPTS {
                        std::fs::write(initd.join(svc), "#!/sbin/openrc-run\n")?;
                    }
                    std::fs::write(root.join("etc/inittab"), INITTAB)?;
                    std::fs::write(root.join("etc/securetty"), "console\ntty1\n")?;
                    std::fs::create_dir_all(root.join("mnt"))?;
                }
                "syslinux" => {
                    std::fs::write(root.join("etc/update-extlinux.conf"), EXTLINUX_CONF)?;
                }
                p => {
                    if let Some(flavor) = p.strip_prefix("linux-") {
                        std::fs::create_dir_all(root.join("boot"))?;
                        std::fs::write(root.join(format!("boot/vmlinuz-{flavor}")), "")?;
                    }
                }
            }
            let installed = db.join("installed");
            let mut all = std::fs::read_to_string(&installed).unwrap_or_default();
            all.push_str(&format!("P:{pkg}\n"));
            std::fs::write(&installed, all)?;
        }
        Ok(())
    }

    fn is_available(&self, _root: &Utf8Path, package: &str) -> Result<bool> {
        self.0.log.push("search", package);
        Ok(self.0.available.borrow().contains(package))
    }

    fn add_virtual(&self, name: &str, packages: &[String]) -> Result<()> {
        self.0
            .log
            .push("add-virtual", format!("{name} {}", packages.join(" ")));
        *self.0.host_virtual.borrow_mut() = Some(name.to_owned());
        Ok(())
    }

    fn remove_virtual(&self, name: &str) -> Result<()> {
        self.0.log.push("del-virtual", name);
        self.0.host_virtual.borrow_mut().take();
        Ok(())
    }
}

#[derive(Debug)]
struct FakeImages(Rc<FakeState>);

impl BlockImageProvider for FakeImages {
    fn create(&self, image: &ImageTarget) -> Result<()> {
        self.0.log.push("create", &image.path);
        let f = std::fs::File::create(&image.path)?;
        f.set_len(image.size)?;
        Ok(())
    }

    fn load_kernel_support(&self) -> Result<()> {
        self.0.log.push("modprobe", "nbd");
        Ok(())
    }

    fn connect(&self, image: &Utf8Path, format: ImageFormat, device: &Utf8Path) -> Result<()> {
        self.0.log.push("connect", device);
        tracing::debug!("Connecting {image} ({format})");
        std::fs::write(self.0.sectors_path(device)?, CONNECTED_SECTORS.to_string())?;
        if self.0.interrupt_on_connect.get() {
            self.0.interrupt.raise();
        }
        Ok(())
    }

    fn disconnect(&self, device: &Utf8Path) -> Result<()> {
        self.0.log.push("disconnect", device);
        if self.0.fail_disconnect.get() {
            anyhow::bail!("{device}: Device or resource busy");
        }
        std::fs::write(self.0.sectors_path(device)?, "0")?;
        Ok(())
    }
}

#[derive(Debug)]
struct FakeMkfs(Rc<FakeState>);

impl FilesystemMaker for FakeMkfs {
    fn make_filesystem(&self, device: &Utf8Path, fstype: &str, opts: &MkfsOptions) -> Result<()> {
        self.0.log.push("mkfs", format!("{fstype} {device}"));
        Filesystem::parse(fstype)?;
        if std::fs::read_to_string(self.0.sectors_path(device)?)?.trim() == "0" {
            anyhow::bail!("{device}: No such device");
        }
        tracing::debug!("Formatting with UUID {}", opts.uuid);
        self.0.reset_disk()
    }
}

#[derive(Debug)]
struct FakeBootloader(Rc<FakeState>);

impl BootloaderInstaller for FakeBootloader {
    fn install(&self, root: &Utf8Path, boot: &BootConfig) -> Result<()> {
        self.0.log.push("bootloader", root);
        if !self.0.mounts.borrow().contains(&root.join("proc")) {
            anyhow::bail!("{root} is not prepared for chroot");
        }
        let kernel = root.join(format!("boot/vmlinuz-{}", boot.kernel_flavor));
        if !kernel.try_exists()? {
            anyhow::bail!("Missing {kernel}");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FakeMounts(Rc<FakeState>);

impl Mounter for FakeMounts {
    fn mount(
        &self,
        source: &str,
        target: &Utf8Path,
        _fstype: Option<&str>,
        _options: &[&str],
    ) -> Result<()> {
        let state = &self.0;
        state.log.push("mount", format!("{source} {target}"));
        if Utf8Path::new(source).starts_with(&state.dev_dir) {
            std::fs::remove_dir(target).with_context(|| format!("Mount point {target}"))?;
            std::fs::rename(&state.disk, target)?;
            state.disk_mounts.borrow_mut().push(target.to_owned());
        }
        state.mounts.borrow_mut().push(target.to_owned());
        Ok(())
    }

    fn bind(&self, source: &Utf8Path, target: &Utf8Path) -> Result<()> {
        self.0.log.push("bind", format!("{source} {target}"));
        if !target.is_dir() {
            anyhow::bail!("{target}: No such directory");
        }
        self.0.mounts.borrow_mut().push(target.to_owned());
        Ok(())
    }

    fn make_private(&self, target: &Utf8Path) -> Result<()> {
        self.0.log.push("private", target);
        Ok(())
    }

    fn mounts(&self) -> Result<Vec<Utf8PathBuf>> {
        Ok(self.0.current_mounts())
    }

    fn unmount(&self, target: &Utf8Path) -> Result<()> {
        let state = &self.0;
        state.log.push("unmount", target);
        if state.stuck.borrow().iter().any(|p| p == target) {
            anyhow::bail!("{target}: Device or resource busy");
        }
        let mut mounts = state.mounts.borrow_mut();
        let Some(i) = mounts.iter().rposition(|p| p == target) else {
            anyhow::bail!("{target}: not mounted");
        };
        mounts.remove(i);
        let mut disk_mounts = state.disk_mounts.borrow_mut();
        if let Some(i) = disk_mounts.iter().position(|p| p == target) {
            disk_mounts.remove(i);
            std::fs::rename(target, &state.disk)?;
            std::fs::create_dir(target)?;
        }
        Ok(())
    }
}

/// A scratch directory with fake capabilities operating inside it.
#[derive(Debug)]
pub(crate) struct Fixture {
    _td: tempfile::TempDir,
    pub(crate) dir: Utf8PathBuf,
    pub(crate) state: Rc<FakeState>,
    pub(crate) log: Log,
    pub(crate) caps: Capabilities,
}

impl Fixture {
    pub(crate) fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow::anyhow!("Non-UTF8 tempdir"))?
            .to_owned();
        let sys_block = dir.join("sys/block");
        for i in 0..NBD_DEVICES {
            let d = sys_block.join(format!("nbd{i}"));
            std::fs::create_dir_all(&d)?;
            std::fs::write(d.join("size"), "0\n")?;
        }
        // Not an nbd device, must be ignored
        std::fs::create_dir_all(sys_block.join("loop0"))?;
        let dev_dir = dir.join("dev");
        std::fs::create_dir(&dev_dir)?;
        let log = Log::default();
        let state = Rc::new(FakeState {
            log: log.clone(),
            sys_block: sys_block.clone(),
            dev_dir: dev_dir.clone(),
            disk: dir.join("disk"),
            mounts: Default::default(),
            disk_mounts: Default::default(),
            stuck: Default::default(),
            available: Default::default(),
            host_virtual: Default::default(),
            fail_disconnect: Default::default(),
            interrupt_on_connect: Default::default(),
            interrupt: Interrupt::default(),
        });
        state.reset_disk()?;
        let caps = Capabilities {
            packages: Box::new(FakePackages(Rc::clone(&state))),
            images: Box::new(FakeImages(Rc::clone(&state))),
            mkfs: Box::new(FakeMkfs(Rc::clone(&state))),
            bootloader: Box::new(FakeBootloader(Rc::clone(&state))),
            mounts: Box::new(FakeMounts(Rc::clone(&state))),
            pool: NbdPool::new(sys_block, dev_dir),
        };
        Ok(Self {
            _td: td,
            dir,
            state,
            log,
            caps,
        })
    }

    pub(crate) fn image_target(&self, size: &str, format: ImageFormat) -> Result<ImageTarget> {
        Ok(ImageTarget {
            path: self.dir.join("disk.img"),
            size: mkvmimage_blockdev::parse_size(size)?,
            format,
        })
    }

    pub(crate) fn set_device_size(&self, dev: &NbdDevice, sectors: u64) -> Result<()> {
        std::fs::write(self.state.sectors_path(&dev.path)?, sectors.to_string())?;
        Ok(())
    }

    /// Where the root filesystem's content lives while it is not mounted.
    pub(crate) fn disk(&self) -> &Utf8Path {
        &self.state.disk
    }
}

#[test]
fn test_fake_disk_follows_mount() -> Result<()> {
    let fixture = Fixture::new()?;
    let target = fixture.dir.join("mnt");
    std::fs::create_dir(&target)?;
    let dev = fixture.dir.join("dev/nbd0");
    let mounts = fixture.caps.mounts.as_ref();
    mounts.mount(dev.as_str(), &target, Some("ext4"), &[])?;
    std::fs::write(target.join("file"), "x")?;
    mounts.unmount(&target)?;
    assert!(fixture.disk().join("file").exists());
    assert!(target.is_dir());
    assert!(mounts.unmount(&target).is_err());
    Ok(())
}
