use std::fmt::Display;

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

pub(crate) const FSTAB: &str = "etc/fstab";

/// One line of fstab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountSpec {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) fstype: String,
    pub(crate) options: Option<String>,
    /// fsck order; the root is checked first
    pub(crate) passno: u32,
}

impl MountSpec {
    /// The root filesystem, referenced by UUID.
    pub(crate) fn root(uuid: &uuid::Uuid, fstype: &str) -> Self {
        Self {
            source: format!("UUID={uuid}"),
            target: "/".into(),
            fstype: fstype.into(),
            options: Some("noatime".into()),
            passno: 1,
        }
    }

}

impl Display for MountSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let options = self.options.as_deref().unwrap_or("defaults");
        write!(
            f,
            "{} {} {} {} 0 {}",
            self.source, self.target, self.fstype, options, self.passno
        )
    }
}

/// Replace fstab with exactly the given entries.
#[context("Writing {FSTAB}")]
pub(crate) fn write_fstab(root: &Dir, entries: &[MountSpec]) -> Result<()> {
    let content: String = entries.iter().map(|m| format!("{m}\n")).collect();
    root.create_dir_all("etc")?;
    root.atomic_write(FSTAB, content)?;
    Ok(())
}
