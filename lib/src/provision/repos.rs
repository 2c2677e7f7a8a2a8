//! Package repositories and signing keys, written before anything is installed.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::Engine;
use camino::Utf8Path;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use super::RootfsConfig;

pub(crate) const REPOSITORIES: &str = "etc/apk/repositories";
pub(crate) const KEYS_DIR: &str = "etc/apk/keys";

/// The default repository list for a mirror and branch.
pub(crate) fn default_repositories(mirror: &str, branch: &str) -> String {
    let mirror = mirror.trim_end_matches('/');
    ["main", "community"]
        .iter()
        .map(|repo| format!("{mirror}/{branch}/{repo}\n"))
        .collect()
}

#[context("Writing {REPOSITORIES}")]
pub(crate) fn write_repositories(root: &Dir, config: &RootfsConfig) -> Result<()> {
    let content = match config.repositories_file.as_deref() {
        Some(p) if p.try_exists()? => {
            tracing::debug!("Using repositories from {p}");
            std::fs::read_to_string(p).with_context(|| format!("Reading {p}"))?
        }
        _ => default_repositories(&config.mirror, &config.branch),
    };
    root.create_dir_all("etc/apk")?;
    root.atomic_write(REPOSITORIES, content.as_bytes())?;
    Ok(())
}

fn copy_keys_from(root: &Dir, src: &Utf8Path) -> Result<usize> {
    let mut n = 0;
    for e in src.read_dir_utf8().with_context(|| format!("Reading {src}"))? {
        let e = e?;
        if !e.file_type()?.is_file() {
            continue;
        }
        let buf = std::fs::read(e.path()).with_context(|| format!("Reading {}", e.path()))?;
        root.atomic_write(format!("{KEYS_DIR}/{}", e.file_name()), buf)?;
        n += 1;
    }
    Ok(n)
}

fn write_embedded_keys(root: &Dir, keys: &BTreeMap<String, String>) -> Result<usize> {
    for (name, encoded) in keys {
        if name.contains('/') {
            anyhow::bail!("Invalid key name {name}");
        }
        let buf = base64::engine::general_purpose::STANDARD
            .decode(encoded.split_whitespace().collect::<String>())
            .with_context(|| format!("Decoding key {name}"))?;
        root.atomic_write(format!("{KEYS_DIR}/{name}"), buf)?;
    }
    Ok(keys.len())
}

/// Install the keys packages are verified with: a key directory given by
/// the caller, else keys from the configuration, else the host's own.
#[context("Writing {KEYS_DIR}")]
pub(crate) fn write_keys(root: &Dir, config: &RootfsConfig) -> Result<()> {
    root.create_dir_all(KEYS_DIR)?;
    let n = match config.keys_dir.as_deref() {
        Some(d) if d.try_exists()? => copy_keys_from(root, d)?,
        _ if !config.trust_keys.is_empty() => write_embedded_keys(root, &config.trust_keys)?,
        _ if config.host_keys_dir.try_exists()? => copy_keys_from(root, &config.host_keys_dir)?,
        _ => 0,
    };
    if n == 0 {
        anyhow::bail!("No repository signing keys found");
    }
    tracing::debug!("Installed {n} signing keys");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::tests::config;
    use cap_std_ext::cap_std;

    #[test]
    fn test_default_repositories() {
        similar_asserts::assert_eq!(
            default_repositories("https://mirror.example/alpine/", "v3.20"),
            "https://mirror.example/alpine/v3.20/main\nhttps://mirror.example/alpine/v3.20/community\n"
        );
    }

    #[test]
    fn test_repositories_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let root = &cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let mut c = config(dir);
        c.repositories_file = Some(dir.join("repos"));
        // Not there: fall back to the mirror
        write_repositories(root, &c)?;
        assert!(root.read_to_string(REPOSITORIES)?.ends_with("/latest-stable/community\n"));
        std::fs::write(dir.join("repos"), "http://local/repo\n")?;
        write_repositories(root, &c)?;
        assert_eq!(root.read_to_string(REPOSITORIES)?, "http://local/repo\n");
        Ok(())
    }

    #[test]
    fn test_key_sources() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let mut c = config(dir);
        c.host_keys_dir = dir.join("host-keys");

        let root = &cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let e = write_keys(root, &c).unwrap_err();
        assert!(format!("{e:#}").contains("No repository signing keys"));

        std::fs::create_dir(&c.host_keys_dir)?;
        std::fs::write(c.host_keys_dir.join("host.rsa.pub"), "host")?;
        write_keys(root, &c)?;
        assert_eq!(root.read_to_string("etc/apk/keys/host.rsa.pub")?, "host");

        // Keys from the configuration win over the host's
        let root = &cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        c.trust_keys
            .insert("conf.rsa.pub".into(), "LS0tLS1CRUdJTiBQVUJMSUMgS0VZ\nLS0tLS0K".into());
        write_keys(root, &c)?;
        assert_eq!(
            root.read_to_string("etc/apk/keys/conf.rsa.pub")?,
            "-----BEGIN PUBLIC KEY-----\n"
        );
        assert!(!root.try_exists("etc/apk/keys/host.rsa.pub")?);

        // And an explicit directory wins over both
        let root = &cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let keys = dir.join("keys");
        std::fs::create_dir(&keys)?;
        std::fs::write(keys.join("mine.rsa.pub"), "mine")?;
        std::fs::create_dir(keys.join("subdir"))?;
        c.keys_dir = Some(keys);
        write_keys(root, &c)?;
        assert_eq!(root.read_to_string("etc/apk/keys/mine.rsa.pub")?, "mine");
        assert!(!root.try_exists("etc/apk/keys/conf.rsa.pub")?);
        assert!(!root.try_exists("etc/apk/keys/subdir")?);
        Ok(())
    }

    #[test]
    fn test_bad_embedded_key() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = Utf8Path::from_path(td.path()).unwrap();
        let mut c = config(dir);
        c.trust_keys.insert("bad".into(), "%%%".into());
        let root = &cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        assert!(write_keys(root, &c).is_err());
        Ok(())
    }
}
