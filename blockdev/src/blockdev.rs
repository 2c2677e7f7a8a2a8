//! Helpers for the Linux network block device (`nbd`) pool.
//!
//! A disk image is exposed as a block device by connecting it to one of
//! the `/dev/nbdN` slots with `qemu-nbd`. The kernel reports a size of
//! zero for every slot that has nothing connected, which is the only
//! "is this free" signal available; it is a best-effort check and not a
//! lock against other processes grabbing the same slot.

use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use mkvmimage_utils::CommandRunExt;
use regex::Regex;

/// sysfs reports block device sizes in 512 byte sectors, regardless of
/// the logical block size of the device.
const SYSFS_SECTOR_SIZE: u64 = 512;

/// A single `/dev/nbdN` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NbdDevice {
    /// The N in nbdN
    pub index: u32,
    /// Kernel name, e.g. `nbd3`
    pub name: String,
    /// Device node, e.g. `/dev/nbd3`
    pub path: Utf8PathBuf,
}

/// The set of nbd slots known to the kernel.
#[derive(Debug, Clone)]
pub struct NbdPool {
    sys_block: Utf8PathBuf,
    dev_dir: Utf8PathBuf,
}

impl Default for NbdPool {
    fn default() -> Self {
        Self::new("/sys/block", "/dev")
    }
}

fn nbd_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^nbd(\d+)$").unwrap())
}

impl NbdPool {
    /// Create a pool reading device state from `sys_block` (normally `/sys/block`)
    /// and handing out device nodes under `dev_dir` (normally `/dev`).
    pub fn new(sys_block: impl Into<Utf8PathBuf>, dev_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
            dev_dir: dev_dir.into(),
        }
    }

    /// List the nbd slots, ordered by index.
    #[context("Listing nbd devices")]
    pub fn devices(&self) -> Result<Vec<NbdDevice>> {
        let re = nbd_name_regex();
        let mut r = Vec::new();
        let entries = match self.sys_block.read_dir_utf8() {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(r),
            Err(e) => return Err(e.into()),
        };
        for e in entries {
            let e = e?;
            let name = e.file_name();
            let Some(caps) = re.captures(name) else {
                continue;
            };
            let index: u32 = caps[1].parse()?;
            r.push(NbdDevice {
                index,
                name: name.to_owned(),
                path: self.dev_dir.join(name),
            });
        }
        r.sort_by_key(|d| d.index);
        Ok(r)
    }

    /// Look up a slot by its device node path.
    pub fn device_for_path(&self, path: &Utf8Path) -> Result<NbdDevice> {
        self.devices()?
            .into_iter()
            .find(|d| d.path == path)
            .ok_or_else(|| anyhow!("{path} is not a known nbd device"))
    }

    /// The size in bytes the kernel reports for this slot; zero means
    /// nothing is connected.
    #[context("Reading size of {}", dev.name)]
    pub fn size(&self, dev: &NbdDevice) -> Result<u64> {
        let p = self.sys_block.join(&dev.name).join("size");
        let s = std::fs::read_to_string(&p).with_context(|| format!("Reading {p}"))?;
        let sectors: u64 = s
            .trim()
            .parse()
            .with_context(|| format!("Parsing {p}: {s:?}"))?;
        Ok(sectors * SYSFS_SECTOR_SIZE)
    }

    /// Return the first slot whose reported size is zero.
    pub fn find_free(&self) -> Result<Option<NbdDevice>> {
        for dev in self.devices()? {
            let size = self.size(&dev)?;
            tracing::trace!("{} size={size}", dev.name);
            if size == 0 {
                return Ok(Some(dev));
            }
        }
        Ok(None)
    }

    /// Like [`Self::find_free`], but if no slot is free (or the kernel
    /// module isn't loaded yet so there are none at all), invoke `load_module`
    /// and scan once more.
    #[context("Finding a free nbd device")]
    pub fn find_free_slot(&self, load_module: impl FnOnce() -> Result<()>) -> Result<NbdDevice> {
        if let Some(dev) = self.find_free()? {
            return Ok(dev);
        }
        tracing::debug!("No free nbd device, loading kernel module");
        if let Err(e) = load_module() {
            tracing::warn!("Loading nbd support: {e:#}");
        }
        self.find_free()?
            .ok_or_else(|| anyhow!("No free nbd device available in {}", self.sys_block))
    }

    /// Wait until the kernel reports a nonzero size for the device, i.e. the
    /// connection is live.
    #[context("Waiting for {} to become ready", dev.name)]
    pub fn wait_connected(&self, dev: &NbdDevice, timeout: Duration) -> Result<u64> {
        let start = Instant::now();
        loop {
            let size = self.size(dev)?;
            if size > 0 {
                return Ok(size);
            }
            if start.elapsed() >= timeout {
                anyhow::bail!("Timed out after {timeout:?}");
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Load the nbd kernel module. Partition scanning is disabled since
/// filesystems are created directly on the device.
pub fn load_nbd_module() -> Result<()> {
    Command::new("modprobe")
        .args(["nbd", "max_part=0"])
        .run()
        .context("Loading nbd kernel module")
}

/// Connect an image file to an nbd slot, with write-back caching.
#[context("Connecting {image} to {device}")]
pub fn qemu_nbd_connect(device: &Utf8Path, image: &Utf8Path, format: &str) -> Result<()> {
    Command::new("qemu-nbd")
        .arg(format!("--connect={device}"))
        .arg("--cache=writeback")
        .arg(format!("--format={format}"))
        .arg(image)
        .run()
}

/// Disconnect an nbd slot.
#[context("Disconnecting {device}")]
pub fn qemu_nbd_disconnect(device: &Utf8Path) -> Result<()> {
    Command::new("qemu-nbd")
        .arg("--disconnect")
        .arg(device)
        .run()
}

/// Parse a size like `800M` or `2GiB` into bytes. A bare number is bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    const K: u64 = 1024;
    let suffixes = [
        ("KiB", K),
        ("MiB", K * K),
        ("GiB", K * K * K),
        ("TiB", K * K * K * K),
        ("K", K),
        ("M", K * K),
        ("G", K * K * K),
        ("T", K * K * K * K),
    ];
    let s = s.trim();
    let (num, mul) = suffixes
        .iter()
        .find_map(|(suffix, mul)| s.strip_suffix(suffix).map(|n| (n, *mul)))
        .unwrap_or((s, 1));
    let v = num
        .parse::<u64>()
        .with_context(|| format!("Invalid size: {s:?}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size out of range: {s:?}"))
}
