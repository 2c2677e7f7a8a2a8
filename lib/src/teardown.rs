//! Releasing everything a run acquired.
//!
//! Every acquisition pushes a [`Resource`] onto the [`TeardownController`];
//! unwinding pops them in reverse, so release order follows from
//! acquisition order. Unwinding happens exactly once, and a failure to
//! release one resource does not stop the others from being released.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use mkvmimage_utils::shell_join;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::SigId;

use crate::capabilities::Capabilities;
use crate::error::ProvisionError;
use crate::image::BlockAttachment;
use crate::mount::WorkDir;

/// A shared flag raised by a termination signal. Signal handlers only set
/// it; the run polls it between stages and unwinds on its own thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    #[cfg(test)]
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`ProvisionError::Interrupted`] if an interrupt arrived.
    pub(crate) fn check(&self) -> Result<(), ProvisionError> {
        if self.is_raised() {
            tracing::info!("Interrupted, cleaning up");
            return Err(ProvisionError::Interrupted);
        }
        Ok(())
    }
}

/// Handlers for SIGINT, SIGHUP and SIGTERM raising an [`Interrupt`].
/// They are unregistered on drop.
#[derive(Debug)]
pub(crate) struct SignalGuard {
    ids: Vec<SigId>,
}

impl SignalGuard {
    pub(crate) fn install(interrupt: &Interrupt) -> Result<Self> {
        let ids = [SIGINT, SIGHUP, SIGTERM]
            .into_iter()
            .map(|sig| {
                signal_hook::flag::register(sig, Arc::clone(&interrupt.0))
                    .with_context(|| format!("Registering handler for signal {sig}"))
            })
            .collect::<Result<_>>()?;
        Ok(Self { ids })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Something acquired during a run that must be given back.
#[derive(Debug)]
pub(crate) enum Resource {
    /// A virtual package set installed on the host
    HostPackages(String),
    WorkDir(WorkDir),
    Attachment(BlockAttachment),
    /// The root mount and everything mounted beneath it
    Mounts(Utf8PathBuf),
    /// The hook script directory bound into the root
    HookBind(Utf8PathBuf),
}

impl Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::HostPackages(name) => write!(f, "host package set {name}"),
            Resource::WorkDir(w) => write!(f, "temporary directory {}", w.path()),
            Resource::Attachment(a) => {
                write!(f, "block device {} ({}, {})", a.path(), a.image, a.format)
            }
            Resource::Mounts(root) => write!(f, "mounts under {root}"),
            Resource::HookBind(p) => write!(f, "hook directory mount {p}"),
        }
    }
}

impl Resource {
    /// The command an operator can run to release this by hand.
    pub(crate) fn remedy(&self) -> String {
        match self {
            Resource::HostPackages(name) => shell_join(["apk", "del", name.as_str()]),
            Resource::WorkDir(w) => {
                shell_join(["rmdir", w.mountpoint().as_str(), w.path().as_str()])
            }
            Resource::Attachment(a) => shell_join(["qemu-nbd", "--disconnect", a.path().as_str()]),
            Resource::Mounts(root) => shell_join(["umount", "-R", "-l", root.as_str()]),
            Resource::HookBind(p) => shell_join(["umount", "-l", p.as_str()]),
        }
    }

    fn release(self, caps: &Capabilities) -> Result<(), ProvisionError> {
        match self {
            Resource::HostPackages(name) => caps
                .packages
                .remove_virtual(&name)
                .map_err(ProvisionError::PackageInstall),
            Resource::WorkDir(w) => w.remove().map_err(ProvisionError::Unmount),
            Resource::Attachment(a) => {
                crate::image::detach(caps, &a).map_err(ProvisionError::Detach)
            }
            Resource::Mounts(p) | Resource::HookBind(p) => {
                crate::mount::unmount_all(caps.mounts.as_ref(), &p)
                    .map_err(ProvisionError::Unmount)
            }
        }
    }

    /// Give up ownership without releasing.
    fn abandon(self) {
        if let Resource::WorkDir(w) = self {
            w.persist();
        }
    }
}

/// A resource that could not be released.
#[derive(Debug)]
pub(crate) struct CleanupFailure {
    pub(crate) resource: String,
    pub(crate) remedy: String,
    pub(crate) error: ProvisionError,
}

/// What unwinding did.
#[derive(Debug, Default)]
pub(crate) struct TeardownReport {
    pub(crate) released: Vec<String>,
    pub(crate) failures: Vec<CleanupFailure>,
    /// Resources deliberately kept, with how to release them later
    pub(crate) left_behind: Vec<(String, String)>,
}

impl TeardownReport {
    pub(crate) fn is_empty(&self) -> bool {
        self.released.is_empty() && self.failures.is_empty() && self.left_behind.is_empty()
    }

    /// Tell the operator about everything that still needs attention.
    pub(crate) fn print_warnings(&self) {
        for f in &self.failures {
            cleanup_warning(&format!(
                "error: Failed to release {}: {:#}\n  To release it manually, run: {}",
                f.resource,
                error_chain(&f.error),
                f.remedy
            ));
        }
        for (resource, remedy) in &self.left_behind {
            println!("Leaving {resource} in place; release with: {remedy}");
        }
    }

    /// The first cleanup failure, as the error for a run that otherwise
    /// succeeded.
    pub(crate) fn into_result(self) -> Result<()> {
        match self.failures.into_iter().next() {
            Some(f) => Err(anyhow::Error::new(f.error).context(format!("Releasing {}", f.resource))),
            None => Ok(()),
        }
    }
}

/// Like `{:#}` on an [`anyhow::Error`].
fn error_chain(e: &ProvisionError) -> String {
    anyhow::Chain::new(e)
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// Output a cleanup failure so it is not lost in scrollback.
fn cleanup_warning(s: &str) {
    anstream::eprintln!(
        "{}{s}{}",
        anstyle::AnsiColor::Red.render_fg(),
        anstyle::Reset.render()
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownState {
    /// Resources may be acquired
    Armed,
    Unwinding,
    Done,
}

/// The ordered set of resources not yet released.
#[derive(Debug)]
pub(crate) struct TeardownController {
    state: TeardownState,
    stack: Vec<Resource>,
    /// Report resources instead of releasing them
    keep: bool,
}

impl TeardownController {
    pub(crate) fn new(keep: bool) -> Self {
        Self {
            state: TeardownState::Armed,
            stack: Vec::new(),
            keep,
        }
    }

    pub(crate) fn state(&self) -> TeardownState {
        self.state
    }

    pub(crate) fn pending(&self) -> impl Iterator<Item = &Resource> {
        self.stack.iter()
    }

    /// Register a freshly acquired resource.
    pub(crate) fn push(&mut self, resource: Resource) {
        debug_assert_eq!(self.state, TeardownState::Armed);
        tracing::debug!("Acquired {resource}");
        self.stack.push(resource);
    }

    /// Release everything, most recently acquired first. Only the first
    /// call does anything; later calls return an empty report.
    pub(crate) fn unwind(&mut self, caps: &Capabilities) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state != TeardownState::Armed {
            return report;
        }
        self.state = TeardownState::Unwinding;
        while let Some(resource) = self.stack.pop() {
            let name = resource.to_string();
            if self.keep {
                report.left_behind.push((name, resource.remedy()));
                resource.abandon();
                continue;
            }
            let remedy = resource.remedy();
            tracing::debug!("Releasing {name}");
            match resource.release(caps) {
                Ok(()) => report.released.push(name),
                Err(error) => {
                    tracing::error!("Releasing {name}: {}", error_chain(&error));
                    report.failures.push(CleanupFailure {
                        resource: name,
                        remedy,
                        error,
                    })
                }
            }
        }
        self.state = TeardownState::Done;
        report
    }
}
