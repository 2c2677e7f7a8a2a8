//! extlinux configuration and installation.

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use regex::{NoExpand, Regex};

use crate::capabilities::BootloaderInstaller;
use crate::task::Task;

/// The configuration `update-extlinux` reads, relative to the root.
pub(crate) const EXTLINUX_CONF: &str = "etc/update-extlinux.conf";

pub(crate) const SERIAL_BAUD: u32 = 115200;

/// Always present in the initramfs so the root device can be found.
const BASE_MODULES: &[&str] = &["sd-mod", "usb-storage"];

const SERIAL_PREFIX: &str = "ttyS";

/// Everything the bootloader needs to find and boot the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BootConfig {
    /// Device names are not stable across attachments, so the root is
    /// always referenced by filesystem UUID.
    pub(crate) root_uuid: uuid::Uuid,
    pub(crate) fstype: String,
    pub(crate) kernel_flavor: String,
    pub(crate) modules: Vec<String>,
    /// e.g. `ttyS0`
    pub(crate) serial_port: Option<String>,
}

impl BootConfig {
    pub(crate) fn new(
        root_uuid: uuid::Uuid,
        fstype: &str,
        kernel_flavor: &str,
        serial_port: Option<&str>,
    ) -> Self {
        let modules = BASE_MODULES
            .iter()
            .copied()
            .chain(std::iter::once(fstype))
            .map(ToOwned::to_owned)
            .collect();
        Self {
            root_uuid,
            fstype: fstype.to_owned(),
            kernel_flavor: kernel_flavor.to_owned(),
            modules,
            serial_port: serial_port.map(ToOwned::to_owned),
        }
    }

    pub(crate) fn kernel_opts(&self) -> String {
        let mut opts = vec![format!("rootfstype={}", self.fstype)];
        match self.serial_port.as_deref() {
            Some(port) => opts.push(format!("console={port},{SERIAL_BAUD}")),
            None => opts.push("quiet".into()),
        }
        opts.join(" ")
    }

    /// The key/value pairs written into [`EXTLINUX_CONF`].
    pub(crate) fn extlinux_settings(&self) -> Result<Vec<(&'static str, String)>> {
        let mut r = vec![
            ("root", format!("UUID={}", self.root_uuid)),
            ("modules", format!("\"{}\"", self.modules.join(","))),
            ("default", self.kernel_flavor.clone()),
            ("default_kernel_opts", format!("\"{}\"", self.kernel_opts())),
            ("timeout", "1".into()),
        ];
        if let Some(port) = self.serial_port.as_deref() {
            r.push(("serial_port", serial_index(port)?.to_string()));
            r.push(("serial_baud", SERIAL_BAUD.to_string()));
        }
        Ok(r)
    }
}

/// syslinux wants the number of the port, not its name.
pub(crate) fn serial_index(port: &str) -> Result<u32> {
    port.strip_prefix(SERIAL_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("Unsupported serial port {port}, expected {SERIAL_PREFIX}N"))
}

/// Set `key=value` in a shell-style config file. An existing line for the
/// key, commented out or not, is replaced; otherwise the line is appended.
pub(crate) fn set_config_key(content: &str, key: &str, value: &str) -> String {
    let re = Regex::new(&format!(r"(?m)^[# ]*{}=.*$", regex::escape(key))).unwrap();
    let line = format!("{key}={value}");
    if re.is_match(content) {
        return re.replace_all(content, NoExpand(&line)).into_owned();
    }
    let mut r = content.to_owned();
    if !r.is_empty() && !r.ends_with('\n') {
        r.push('\n');
    }
    r.push_str(&line);
    r.push('\n');
    r
}

/// Point the `update-extlinux` configuration at our root, kernel and console.
#[context("Writing {EXTLINUX_CONF}")]
pub(crate) fn write_extlinux_config(root: &Dir, boot: &BootConfig) -> Result<()> {
    let mut content = root
        .read_to_string(EXTLINUX_CONF)
        .context("Is syslinux installed?")?;
    for (key, value) in boot.extlinux_settings()? {
        content = set_config_key(&content, key, &value);
    }
    root.atomic_write(EXTLINUX_CONF, content.as_bytes())?;
    Ok(())
}

/// syslinux, installed into the filesystem boot sector from inside the root.
#[derive(Debug)]
pub(crate) struct Extlinux;

impl BootloaderInstaller for Extlinux {
    #[context("Installing extlinux")]
    fn install(&self, root: &Utf8Path, boot: &BootConfig) -> Result<()> {
        tracing::debug!("Booting linux-{} from UUID={}", boot.kernel_flavor, boot.root_uuid);
        Task::new("Installing bootloader", "chroot")
            .args([root.as_str(), "extlinux", "--install", "/boot"])
            .quiet_output()
            .run()?;
        Task::new("Generating bootloader configuration", "chroot")
            .args([root.as_str(), "update-extlinux", "--warn-if-no-hooks"])
            .run()
    }
}
