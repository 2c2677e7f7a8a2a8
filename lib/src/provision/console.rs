//! Login on a serial console.

use anyhow::Result;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use regex::Regex;

use crate::bootloader::SERIAL_BAUD;

pub(crate) const SECURETTY: &str = "etc/securetty";
pub(crate) const INITTAB: &str = "etc/inittab";

fn read_optional(root: &Dir, path: &str) -> Result<String> {
    if root.try_exists(path)? {
        Ok(root.read_to_string(path)?)
    } else {
        Ok(String::new())
    }
}

fn append_line(mut content: String, line: &str) -> String {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
    content
}

/// Enable a getty on `port` in inittab: a commented out entry is
/// uncommented, otherwise one is appended.
pub(crate) fn enable_getty(inittab: &str, port: &str) -> String {
    let port_re = regex::escape(port);
    let active = Regex::new(&format!(r"(?m)^{port_re}::")).unwrap();
    if active.is_match(inittab) {
        return inittab.to_owned();
    }
    let commented = Regex::new(&format!(r"(?m)^#\s*({port_re}::.*)$")).unwrap();
    if commented.is_match(inittab) {
        return commented.replace_all(inittab, "$1").into_owned();
    }
    append_line(
        inittab.to_owned(),
        &format!("{port}::respawn:/sbin/getty -L {SERIAL_BAUD} {port} vt100"),
    )
}

/// Allow root login on `port` and start a getty on it.
#[context("Enabling serial console on {port}")]
pub(crate) fn enable_serial(root: &Dir, port: &str) -> Result<()> {
    let securetty = read_optional(root, SECURETTY)?;
    if !securetty.lines().any(|l| l.trim() == port) {
        root.atomic_write(SECURETTY, append_line(securetty, port))?;
    }
    let inittab = read_optional(root, INITTAB)?;
    root.atomic_write(INITTAB, enable_getty(&inittab, port))?;
    Ok(())
}
