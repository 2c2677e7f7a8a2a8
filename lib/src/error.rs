//! Classification of run failures.
//!
//! Everything below the orchestrator speaks `anyhow`; the orchestrator tags
//! each failure with the stage that produced it so the operator (and tests)
//! can tell an unmount problem from a bad package repository.

/// A fatal failure of a provisioning run.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum ProvisionError {
    #[error("Invalid configuration")]
    Configuration(#[source] anyhow::Error),
    #[error("No block device available")]
    DeviceUnavailable(#[source] anyhow::Error),
    #[error("Creating disk image")]
    ImageCreate(#[source] anyhow::Error),
    #[error("Attaching disk image")]
    Attach(#[source] anyhow::Error),
    #[error("Detaching disk image")]
    Detach(#[source] anyhow::Error),
    #[error("Mounting")]
    Mount(#[source] anyhow::Error),
    #[error("Unmounting")]
    Unmount(#[source] anyhow::Error),
    #[error("Installing packages")]
    PackageInstall(#[source] anyhow::Error),
    #[error("Creating filesystem")]
    FilesystemCreate(#[source] anyhow::Error),
    #[error("Configuring boot")]
    BootConfig(#[source] anyhow::Error),
    #[error("Running hook script")]
    Script(#[source] anyhow::Error),
    #[error("Interrupted")]
    Interrupted,
}

impl ProvisionError {
    /// A short name for the failure kind, used in the final fatal message.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Configuration(_) => "ConfigurationError",
            ProvisionError::DeviceUnavailable(_) => "DeviceUnavailable",
            ProvisionError::ImageCreate(_) => "ImageCreateError",
            ProvisionError::Attach(_) => "AttachError",
            ProvisionError::Detach(_) => "DetachError",
            ProvisionError::Mount(_) => "MountError",
            ProvisionError::Unmount(_) => "UnmountError",
            ProvisionError::PackageInstall(_) => "PackageInstallError",
            ProvisionError::FilesystemCreate(_) => "FilesystemCreateError",
            ProvisionError::BootConfig(_) => "BootConfigError",
            ProvisionError::Script(_) => "ScriptError",
            ProvisionError::Interrupted => "Interrupted",
        }
    }
}

/// Find the [`ProvisionError`] in an error chain, if any.
pub(crate) fn provision_error(e: &anyhow::Error) -> Option<&ProvisionError> {
    e.chain().find_map(|e| e.downcast_ref::<ProvisionError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_display() {
        let e = ProvisionError::FilesystemCreate(anyhow::anyhow!("mkfs.zfs not supported"));
        let e = anyhow::Error::new(e).context("Provisioning /tmp/disk.img");
        assert_eq!(
            format!("{e:#}"),
            "Provisioning /tmp/disk.img: Creating filesystem: mkfs.zfs not supported"
        );
        let kind = provision_error(&e).unwrap();
        assert!(matches!(kind, ProvisionError::FilesystemCreate(_)));
        assert_eq!(kind.kind(), "FilesystemCreateError");
    }
}
