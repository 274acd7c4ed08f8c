//! A library and command-line tool for updating firmware on
//! dual-processor GNSS receivers
//!
//! The receiver carries an application microcontroller and a correlator
//! coprocessor, both flashed through the same on-device bootloader over
//! a typed message link. This crate parses Intel HEX firmware images,
//! resets the device into its bootloader, erases and programs flash
//! sectors with progress reporting, and hands control back to the
//! application firmware when done.
//!
//! ## Feature Flags
//!
//! - `cli`: everything the `navflash` binary needs (argument parsing,
//!   progress bars, configuration files). Implies `serialport`.
//! - `serialport`: the serial-port transport for the device link.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bootloader;
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod error;
pub mod flasher;
pub mod image_format;
pub mod link;
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging;
pub mod progress;
pub mod targets;
pub mod update_index;
pub mod updater;
pub mod version;

pub use self::{
    bootloader::Bootloader,
    error::Error,
    flasher::Flasher,
    image_format::FirmwareImage,
    targets::Target,
    updater::{UpdateOptions, UpdatePlan, Updater},
};
