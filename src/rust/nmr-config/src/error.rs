// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;

/// Configuration error. Every variant names the offending field or object.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("Undefined {kind} '{name}' referenced by '{referenced_by}'")]
    Undefined {
        kind: &'static str,
        name: String,
        referenced_by: String,
    },
    #[error("Unknown setting '{0}'")]
    UnknownSetting(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
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

    pub fn invalid<F: Into<String>, R: Display>(field: F, reason: R) -> Self {
        Error::InvalidField {
            field: field.into(),
            reason: reason.to_string(),
        }
    }

    /// The field or object name the error refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::InvalidField { field, .. } => Some(field),
            Error::Duplicate { name, .. } | Error::Undefined { name, .. } => Some(name),
            Error::UnknownSetting(name) => Some(name),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
