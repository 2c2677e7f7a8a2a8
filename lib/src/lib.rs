//! # Virtual machine image builder
//!
//! This crate provisions a bootable Alpine Linux disk image: the image file
//! is attached as a network block device, formatted without a partition
//! table, mounted and populated, optionally customized by a hook script,
//! and then everything acquired along the way is released again, also
//! when the run fails or is interrupted.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

mod apk;
mod bootloader;
mod capabilities;
pub mod cli;
pub(crate) mod config;
mod error;
mod hook;
mod image;
mod install;
mod mkfs;
pub(crate) mod mount;
mod provision;
mod task;
mod teardown;

#[cfg(test)]
mod testutils;

pub use error::ProvisionError;
