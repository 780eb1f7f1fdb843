// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The record handed to storage once an experiment has ended.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ErrorKind, Result};
use crate::live::DataSet;
use crate::safety::ClampSummary;
use crate::sweep::{SweepAxis, SweepGeometry};
use crate::timing::RoundingWarning;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Complete,
    /// The run ended early; the data holds what was acquired until then.
    Incomplete { kind: ErrorKind, reason: String },
}

/// The best-effort safe shutdown after a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownRecord {
    pub reason: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMetadata {
    pub n_avg: u32,
    pub geometry: SweepGeometry,
    pub settings: Value,
    pub device_config: Value,
    /// Non-empty batches appended.
    pub batches: usize,
    pub polls: u64,
    pub clamps: ClampSummary,
    pub rounding_warnings: Vec<RoundingWarning>,
    pub safe_shutdown: Option<ShutdownRecord>,
    /// Operator notices issued by the experiment.
    pub notices: Vec<String>,
    /// Caller-supplied metadata from the settings.
    pub user: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentResult {
    pub name: String,
    pub completion: Completion,
    pub axes: Vec<SweepAxis>,
    pub data: IndexMap<String, DataSet>,
    pub metadata: ResultMetadata,
}

impl ExperimentResult {
    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self).map_err(nmr_config::Error::from)?)
    }
}

/// Persists experiment results, for example as files or database rows.
pub trait ResultSink {
    /// Stores `result` and returns where it was put.
    fn store(&mut self, result: &ExperimentResult) -> anyhow::Result<PathBuf>;
}
