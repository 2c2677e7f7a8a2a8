use std::collections::BTreeSet;

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

pub(crate) const MKINITFS_CONF: &str = "etc/mkinitfs/mkinitfs.conf";

/// Needed to mount any root at all.
const BASE_FEATURES: &[&str] = &["base"];

/// The mkinitfs feature list: the baseline, the root filesystem driver and
/// whatever was asked for, sorted and without duplicates.
pub(crate) fn features<'a>(fstype: &'a str, extra: &'a [String]) -> BTreeSet<&'a str> {
    BASE_FEATURES
        .iter()
        .copied()
        .chain(std::iter::once(fstype))
        .chain(extra.iter().map(String::as_str))
        .filter(|f| !f.is_empty())
        .collect()
}

#[context("Writing {MKINITFS_CONF}")]
pub(crate) fn write_config(root: &Dir, fstype: &str, extra: &[String]) -> Result<()> {
    let features = features(fstype, extra)
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ");
    root.create_dir_all("etc/mkinitfs")?;
    root.atomic_write(MKINITFS_CONF, format!("features=\"{features}\"\n"))?;
    Ok(())
}
