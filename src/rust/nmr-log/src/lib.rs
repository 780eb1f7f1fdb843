// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Logging macros for the experiment framework.
//!
//! All records are emitted through the `log` facade with the target
//! `nmr.rust::<module path>`, so applications can filter the framework output
//! as one tree. No logger backend is installed here.

use std::sync::{atomic::AtomicBool, atomic::Ordering};

#[doc(hidden)]
pub use log as _log;

#[macro_export]
macro_rules! error {
    ($msg:literal, $($arg:tt)+) => {
        nmr_log::_log::error!(target: concat!("nmr.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        nmr_log::_log::error!(target: concat!("nmr.rust::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! warn {
    ($msg:literal, $($arg:tt)+) => {
        nmr_log::_log::warn!(target: concat!("nmr.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        nmr_log::_log::warn!(target: concat!("nmr.rust::", module_path!()), $msg);
    };
}

#[macro_export]
macro_rules! info {
    ($msg:literal, $($arg:tt)+) => {
        nmr_log::_log::info!(target: concat!("nmr.rust::", module_path!()), $msg, $($arg)+);
    };
    ($msg:literal) => {
        nmr_log::_log::info!(target: concat!("nmr.rust::", module_path!()), $msg);
    };
}

/// Log a per-poll diagnostic at debug level, only when diagnostics are enabled.
#[macro_export]
macro_rules! diagnostic {
    ($msg:literal, $($arg:tt)+) => {
        if nmr_log::is_diagnostics_enabled() {
            nmr_log::_log::debug!(target: concat!("nmr.rust::", module_path!()), $msg, $($arg)+);
        }
    };
    ($msg:literal) => {
        if nmr_log::is_diagnostics_enabled() {
            nmr_log::_log::debug!(target: concat!("nmr.rust::", module_path!()), $msg);
        }
    };
}

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_diagnostics_enabled() -> bool {
    DIAGNOSTICS_ENABLED.load(Ordering::Acquire)
}

/// Initialize the logging.
///
/// Call once at program start. Only the diagnostics switch is set here; the
/// embedding application installs whichever `log` backend it uses.
pub fn init_logging(with_diagnostics: bool) {
    DIAGNOSTICS_ENABLED.store(with_diagnostics, Ordering::Release);
}
