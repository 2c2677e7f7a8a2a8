//! The disk image file and its block device attachment.

use std::fmt::Display;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use fn_error_context::context;
use mkvmimage_blockdev::NbdDevice;
use serde::{Deserialize, Serialize};

use crate::capabilities::{BlockImageProvider, Capabilities};
use crate::task::Task;

/// How long to wait for the kernel to report a connected device.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// On-disk image formats understood by `qemu-img` and `qemu-nbd`.
#[derive(ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ImageFormat {
    Raw,
    Qcow2,
    Vdi,
    Vmdk,
    Vhdx,
    Qed,
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self::Qcow2
    }
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vdi => "vdi",
            Self::Vmdk => "vmdk",
            Self::Vhdx => "vhdx",
            Self::Qed => "qed",
        };
        f.write_str(name)
    }
}

/// The image file being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImageTarget {
    pub(crate) path: Utf8PathBuf,
    /// Size in bytes, used only when the file is created
    pub(crate) size: u64,
    pub(crate) format: ImageFormat,
}

/// An image connected to a block device slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockAttachment {
    pub(crate) device: NbdDevice,
    pub(crate) image: Utf8PathBuf,
    pub(crate) format: ImageFormat,
}

impl BlockAttachment {
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.device.path
    }
}

/// Create the image file unless it already exists; an existing file is
/// reused as is. Returns whether it was created.
#[context("Preparing image {}", image.path)]
pub(crate) fn ensure_image(images: &dyn BlockImageProvider, image: &ImageTarget) -> Result<bool> {
    if image.path.try_exists()? {
        tracing::info!("Reusing existing image {}", image.path);
        return Ok(false);
    }
    images.create(image)?;
    Ok(true)
}

/// Locate an unattached device slot, loading kernel support if needed.
pub(crate) fn find_free_slot(caps: &Capabilities) -> Result<NbdDevice> {
    caps.pool
        .find_free_slot(|| caps.images.load_kernel_support())
}

/// Connect the image to `device`. The slot is checked to still be unused
/// right before connecting, narrowing the window for racing with another
/// user of the pool.
#[context("Attaching {} to {}", image.path, device.path)]
pub(crate) fn attach(
    caps: &Capabilities,
    image: &ImageTarget,
    device: &NbdDevice,
) -> Result<BlockAttachment> {
    let size = caps.pool.size(device)?;
    if size != 0 {
        anyhow::bail!("{} is already in use ({size} bytes)", device.path);
    }
    caps.images
        .connect(&image.path, image.format, &device.path)?;
    Ok(BlockAttachment {
        device: device.clone(),
        image: image.path.clone(),
        format: image.format,
    })
}

/// Block until the attached device reports its size.
pub(crate) fn wait_ready(caps: &Capabilities, attachment: &BlockAttachment) -> Result<u64> {
    let size = caps
        .pool
        .wait_connected(&attachment.device, CONNECT_TIMEOUT)?;
    tracing::debug!("{} ready, {size} bytes", attachment.path());
    Ok(size)
}

/// Disconnect the device. Not retried: a failure here almost always
/// means something still holds the device open.
#[context("Detaching {}", attachment.path())]
pub(crate) fn detach(caps: &Capabilities, attachment: &BlockAttachment) -> Result<()> {
    caps.images.disconnect(attachment.path())
}

/// `qemu-img` and `qemu-nbd`.
#[derive(Debug)]
pub(crate) struct Qemu;

impl BlockImageProvider for Qemu {
    fn create(&self, image: &ImageTarget) -> Result<()> {
        let size = image.size.to_string();
        let format = image.format.to_string();
        Task::new(format!("Creating image file {}", image.path), "qemu-img")
            .args(["create", "-f", format.as_str(), image.path.as_str(), size.as_str()])
            .quiet_output()
            .run()
    }

    fn load_kernel_support(&self) -> Result<()> {
        mkvmimage_blockdev::load_nbd_module()
    }

    fn connect(&self, image: &Utf8Path, format: ImageFormat, device: &Utf8Path) -> Result<()> {
        println!("Attaching {image} to {device}");
        mkvmimage_blockdev::qemu_nbd_connect(device, image, &format.to_string())
    }

    fn disconnect(&self, device: &Utf8Path) -> Result<()> {
        mkvmimage_blockdev::qemu_nbd_disconnect(device).context("qemu-nbd")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::Fixture;

    #[test]
    fn test_format_names() {
        assert_eq!(ImageFormat::Qcow2.to_string(), "qcow2");
        assert_eq!(ImageFormat::from_str("vmdk", false).unwrap(), ImageFormat::Vmdk);
        assert!(ImageFormat::from_str("iso", false).is_err());
    }

    #[test]
    fn test_ensure_image_reuses() -> Result<()> {
        let fixture = Fixture::new()?;
        let image = fixture.image_target("800M", ImageFormat::Raw)?;
        assert!(ensure_image(fixture.caps.images.as_ref(), &image)?);
        std::fs::write(&image.path, "existing")?;
        assert!(!ensure_image(fixture.caps.images.as_ref(), &image)?);
        assert_eq!(std::fs::read_to_string(&image.path)?, "existing");
        assert_eq!(fixture.log.count("create"), 1);
        Ok(())
    }

    #[test]
    fn test_attach_rejects_busy_device() -> Result<()> {
        let fixture = Fixture::new()?;
        let image = fixture.image_target("1G", ImageFormat::Qcow2)?;
        let dev = find_free_slot(&fixture.caps)?;
        fixture.set_device_size(&dev, 8)?;
        let e = attach(&fixture.caps, &image, &dev).unwrap_err();
        assert!(format!("{e:#}").contains("already in use"));
        assert_eq!(fixture.log.count("connect"), 0);
        Ok(())
    }

    #[test]
    fn test_attach_detach() -> Result<()> {
        let fixture = Fixture::new()?;
        let image = fixture.image_target("1G", ImageFormat::Qcow2)?;
        ensure_image(fixture.caps.images.as_ref(), &image)?;
        let dev = find_free_slot(&fixture.caps)?;
        let att = attach(&fixture.caps, &image, &dev)?;
        assert!(wait_ready(&fixture.caps, &att)? > 0);
        // The same slot must not be handed out twice
        let next = find_free_slot(&fixture.caps)?;
        assert_ne!(next, dev);
        detach(&fixture.caps, &att)?;
        assert_eq!(fixture.caps.pool.size(&dev)?, 0);
        Ok(())
    }
}
