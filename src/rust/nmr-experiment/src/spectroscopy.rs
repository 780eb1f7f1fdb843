// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Resonance (wobble) sweep of the probe circuit.
//!
//! The reflected power of a weak probe tone is measured across a frequency
//! range to tune and match the probe. The tone is sent around the power
//! amplifier, which the operator has to confirm before the run.

use nmr_config::{DeviceConfig, ExperimentSettings, SweepRange};
use serde::Serialize;

use crate::error::Result;
use crate::experiment::{Acquisition, Experiment};
use crate::sweep::SweepGeometry;

/// Probe amplitude ceiling while the amplifier is bypassed.
pub const RESONANCE_MAX_AMPLITUDE: f64 = 0.1;

pub const BYPASS_NOTICE: &str = "Resonance sweep: the probe tone bypasses the power amplifier. \
    Connect the output directly to the directional coupler and keep the amplifier blanked.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BypassWiring {
    Unconfirmed,
    /// The operator has rewired the probe path around the amplifier.
    Confirmed,
}

/// Builds a resonance sweep over the intermediate frequencies of `range`.
pub fn resonance_sweep<'a>(
    settings: &'a ExperimentSettings,
    config: &'a DeviceConfig,
    range: &SweepRange,
    wiring: BypassWiring,
) -> Result<Experiment<'a>> {
    range.validate("frequencies")?;
    let experiment = Experiment::new(
        SweepGeometry::Sweep1D,
        Acquisition::Reflection {
            frequencies: range.values(),
            wiring,
        },
        settings,
        config,
    );
    let limits = experiment
        .limits()
        .clone()
        .with_max_amplitude(RESONANCE_MAX_AMPLITUDE);
    Ok(experiment.with_limits(limits))
}
