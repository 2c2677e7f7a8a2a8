//! Package installation with `apk`.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::capabilities::PackageInstaller;
use crate::task::Task;

/// Name of the virtual package grouping host tools installed for a run.
pub(crate) const HOST_VIRTUAL_PACKAGE: &str = ".mkvmimage-deps";

/// Present on Alpine hosts, where missing tools can be installed with apk.
pub(crate) const ALPINE_RELEASE: &str = "/etc/alpine-release";

/// The host packages needed to provision an image with the given root
/// filesystem type.
pub(crate) fn host_tools(fstype: &str) -> Vec<String> {
    let mkfs = match fstype {
        "btrfs" => "btrfs-progs",
        "xfs" => "xfsprogs",
        _ => "e2fsprogs",
    };
    ["qemu-img", mkfs].into_iter().map(ToOwned::to_owned).collect()
}

/// The Alpine package manager.
#[derive(Debug)]
pub(crate) struct Apk;

impl PackageInstaller for Apk {
    #[context("Installing {} into {root}", packages.join(" "))]
    fn install(&self, root: &Utf8Path, packages: &[String]) -> Result<()> {
        // The first install into an empty root has to create the database
        let initdb = !root.join("lib/apk/db/installed").try_exists()?;
        Task::new(format!("Installing {}", packages.join(" ")), "apk")
            .args(["add", "--root", root.as_str(), "--update-cache", "--no-progress"])
            .args(initdb.then_some("--initdb"))
            .args(packages)
            .run()
    }

    #[context("Searching for {package}")]
    fn is_available(&self, root: &Utf8Path, package: &str) -> Result<bool> {
        let out = Task::new(format!("Looking up {package}"), "apk")
            .quiet()
            .args(["search", "--root", root.as_str(), "--exact", "--quiet", package])
            .read()?;
        Ok(!out.trim().is_empty())
    }

    fn add_virtual(&self, name: &str, packages: &[String]) -> Result<()> {
        Task::new("Installing host tools", "apk")
            .args(["add", "--no-progress", "--virtual", name])
            .args(packages)
            .run()
    }

    fn remove_virtual(&self, name: &str) -> Result<()> {
        Task::new_and_run("Removing host tools", "apk", ["del", "--no-progress", name])
    }
}
