use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;

/// Renders a path or argument so it can be pasted into a POSIX shell.
///
/// Used when telling an operator which command to run by hand, so it
/// must survive device and mount paths with spaces in them.
#[derive(Debug, Clone, Copy)]
pub struct ShellQuoted<'a> {
    value: &'a OsStr,
}

impl<'a> ShellQuoted<'a> {
    /// Wrap a value. Plain values (alphanumerics, `/`, `.`, `-`, `_`, `:`, `=`)
    /// are rendered unchanged.
    pub fn new<S: AsRef<OsStr> + ?Sized>(value: &'a S) -> Self {
        Self {
            value: value.as_ref(),
        }
    }

    fn is_plain(s: &str) -> bool {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | ':' | '='))
    }
}

impl Display for ShellQuoted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.value.to_str() {
            if Self::is_plain(s) {
                return f.write_str(s);
            }
        }
        let quoted =
            shlex::bytes::try_quote(self.value.as_bytes()).map_err(|_| std::fmt::Error)?;
        let quoted = std::str::from_utf8(&quoted).map_err(|_| std::fmt::Error)?;
        f.write_str(quoted)
    }
}

/// Join arguments into a single shell command line.
pub fn shell_join<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    args.into_iter()
        .map(|a| ShellQuoted::new(a.as_ref()).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}
