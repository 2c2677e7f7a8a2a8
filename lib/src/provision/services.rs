use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

/// OpenRC services enabled in a fresh image, by runlevel.
pub(crate) const RUNLEVELS: &[(&str, &[&str])] = &[
    (
        "sysinit",
        &["devfs", "dmesg", "mdev", "hwdrivers", "cgroups"],
    ),
    (
        "boot",
        &[
            "modules", "hwclock", "swap", "hostname", "sysctl", "bootmisc", "syslog",
        ],
    ),
    ("shutdown", &["killprocs", "savecache", "mount-ro"]),
];

/// Add each service to its runlevel. Services without an init script
/// (cgroups is missing from older releases) are skipped. Returns the
/// services enabled.
#[context("Enabling services")]
pub(crate) fn enable_services(root: &Dir) -> Result<Vec<String>> {
    let mut enabled = Vec::new();
    for (level, services) in RUNLEVELS {
        let leveldir = format!("etc/runlevels/{level}");
        root.create_dir_all(&leveldir)?;
        for svc in services.iter() {
            let script = format!("/etc/init.d/{svc}");
            if !root.try_exists(&script[1..])? {
                tracing::warn!("Not enabling {svc}: {script} does not exist");
                continue;
            }
            let link = format!("{leveldir}/{svc}");
            if root.symlink_metadata_optional(&link)?.is_none() {
                root.symlink_contents(&script, &link)?;
            }
            enabled.push(format!("{level}/{svc}"));
        }
    }
    Ok(enabled)
}
