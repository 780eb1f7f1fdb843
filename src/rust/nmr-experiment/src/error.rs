// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

use nmr_units::Nanoseconds;
use serde::Serialize;

use crate::device::DeviceError;
use crate::state::{Event, State};

/// Coarse classification of a failure, as recorded in the experiment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Configuration,
    Compilation,
    Communication,
    DeviceFault,
    Aborted,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] nmr_config::Error),
    #[error("Validation failed for '{constraint}': {reason}")]
    Validation { constraint: String, reason: String },
    #[error("Timing '{field}' of {value} cannot be executed: {reason}")]
    Timing {
        field: String,
        value: Nanoseconds,
        reason: String,
    },
    #[error("Compilation failed at '{field}': {reason}")]
    Compilation { field: String, reason: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("Experiment aborted by the operator")]
    Aborted,
    #[error("Invalid transition from {from:?} on {event:?}")]
    InvalidTransition { from: State, event: Event },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T>(msg: T) -> Self
    where
        T: Display,
    {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }

    pub fn validation<C: Into<String>, R: Display>(constraint: C, reason: R) -> Self {
        Error::Validation {
            constraint: constraint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn compilation<F: Into<String>, R: Display>(field: F, reason: R) -> Self {
        Error::Compilation {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Validation { .. } | Error::Timing { .. } => {
                ErrorKind::Configuration
            }
            Error::Compilation { .. } => ErrorKind::Compilation,
            Error::Device(DeviceError::Communication(_)) => ErrorKind::Communication,
            Error::Device(DeviceError::Fault(_)) => ErrorKind::DeviceFault,
            Error::Aborted => ErrorKind::Aborted,
            Error::InvalidTransition { .. } | Error::Anyhow(_) => ErrorKind::Internal,
        }
    }

    /// The setting, command field or constraint the error refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Config(err) => err.field(),
            Error::Validation { constraint, .. } => Some(constraint),
            Error::Timing { field, .. } | Error::Compilation { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
