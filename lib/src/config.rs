//! # Configuration files
//!
//! Defaults for every flag can be set in TOML drop-ins named
//! `mkvmimage/*.toml` under `/usr/lib`, `/usr/local/lib`, `/etc` and `/run`,
//! plus an explicit `--config` file read last. Later files override
//! earlier ones key by key. The `[trust-keys]` table holds repository
//! signing keys to install into new images when no key directory is given.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::image::ImageFormat;

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
const CONFIG_DIR: &str = "mkvmimage";

/// The toplevel of a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ConfigurationToplevel {
    pub(crate) defaults: Option<Defaults>,
    /// Key file name to base64 encoded contents
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) trust_keys: BTreeMap<String, String>,
}

/// The `[defaults]` table; each key corresponds to a command line flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Defaults {
    pub(crate) branch: Option<String>,
    pub(crate) mirror_uri: Option<String>,
    pub(crate) image_format: Option<ImageFormat>,
    pub(crate) image_size: Option<String>,
    pub(crate) fs_type: Option<String>,
    pub(crate) kernel_flavor: Option<String>,
    pub(crate) initfs_features: Option<Vec<String>>,
    pub(crate) keys_dir: Option<Utf8PathBuf>,
    pub(crate) repositories_file: Option<Utf8PathBuf>,
    pub(crate) packages: Option<Vec<String>>,
    pub(crate) serial_console: Option<bool>,
    pub(crate) serial_port: Option<String>,
    pub(crate) script_chroot: Option<bool>,
    pub(crate) no_host_packages: Option<bool>,
}

impl Defaults {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.branch, other.branch);
        mergeopt(&mut self.mirror_uri, other.mirror_uri);
        mergeopt(&mut self.image_format, other.image_format);
        mergeopt(&mut self.image_size, other.image_size);
        mergeopt(&mut self.fs_type, other.fs_type);
        mergeopt(&mut self.kernel_flavor, other.kernel_flavor);
        mergeopt(&mut self.initfs_features, other.initfs_features);
        mergeopt(&mut self.keys_dir, other.keys_dir);
        mergeopt(&mut self.repositories_file, other.repositories_file);
        mergeopt(&mut self.packages, other.packages);
        mergeopt(&mut self.serial_console, other.serial_console);
        mergeopt(&mut self.serial_port, other.serial_port);
        mergeopt(&mut self.script_chroot, other.script_chroot);
        mergeopt(&mut self.no_host_packages, other.no_host_packages);
    }
}

impl ConfigurationToplevel {
    fn merge(&mut self, other: Self) {
        if let Some(defaults) = other.defaults {
            tracing::debug!("Merging defaults: {defaults:?}");
            self.defaults
                .get_or_insert_with(Default::default)
                .merge(defaults);
        }
        self.trust_keys.extend(other.trust_keys);
    }
}

/// Parse one file; unknown keys are warned about, not rejected, so older
/// versions can read newer files.
pub(crate) fn parse_config(buf: &str, path: &Utf8Path) -> Result<ConfigurationToplevel> {
    let mut unused = std::collections::BTreeSet::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigurationToplevel = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {path}"))?;
    for key in unused {
        tracing::warn!("{path}: Unknown key {key}");
    }
    Ok(c)
}

fn load_files(
    paths: impl IntoIterator<Item = Utf8PathBuf>,
) -> Result<ConfigurationToplevel> {
    let mut config = ConfigurationToplevel::default();
    for path in paths {
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        config.merge(parse_config(&buf, &path)?);
    }
    Ok(config)
}

/// Load and merge all configuration files.
#[context("Loading configuration")]
pub(crate) fn load_config(explicit: Option<&Utf8Path>) -> Result<ConfigurationToplevel> {
    let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, CONFIG_DIR, &["toml"], true);
    let mut paths = fragments
        .into_values()
        .map(|p| {
            Utf8PathBuf::try_from(p).map_err(|e| anyhow::anyhow!("Non-UTF8 config path: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;
    paths.extend(explicit.map(ToOwned::to_owned));
    load_files(paths)
}
