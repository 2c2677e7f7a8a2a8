use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::capabilities::PackageInstaller;

/// The flavor asked for by default.
pub(crate) const DEFAULT_FLAVOR: &str = "virt";

/// Probed in order when the default flavor is requested; the first
/// available one is used.
const DEFAULT_FLAVOR_PREFERENCE: &[&str] = &["lts"];

/// Used when none of the preferred flavors are available.
const FALLBACK_FLAVOR: &str = "vanilla";

pub(crate) fn package(flavor: &str) -> String {
    format!("linux-{flavor}")
}

/// Decide which kernel flavor to install. Anything but the default is
/// taken as given.
#[context("Choosing kernel flavor")]
pub(crate) fn resolve_flavor(
    packages: &dyn PackageInstaller,
    root: &Utf8Path,
    requested: &str,
) -> Result<String> {
    if requested != DEFAULT_FLAVOR {
        return Ok(requested.to_owned());
    }
    for flavor in DEFAULT_FLAVOR_PREFERENCE {
        if packages.is_available(root, &package(flavor))? {
            return Ok((*flavor).to_owned());
        }
    }
    Ok(FALLBACK_FLAVOR.to_owned())
}
