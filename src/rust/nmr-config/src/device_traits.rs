// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::ops::RangeInclusive;

/// Hardware limits of a controller front-end module.
///
/// Configuration values outside these limits are rejected; they are never clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTraits {
    pub model: &'static str,
    pub module_kind: &'static str,
    /// Samples per nanosecond of the analog outputs.
    pub samples_per_ns: f64,
    pub sampling_rate: f64,
    pub min_pulse_length_ns: f64,
    pub max_pulse_length_ns: f64,
    pub chassis_slots: RangeInclusive<u8>,
    pub analog_outputs: RangeInclusive<u8>,
    pub analog_inputs: RangeInclusive<u8>,
    pub digital_outputs: RangeInclusive<u8>,
    pub input_gain_db: RangeInclusive<i8>,
    /// Half-open upper bound of the intermediate frequency.
    pub max_intermediate_frequency: f64,
    /// Largest normalized output amplitude.
    pub max_amplitude: f64,
    /// Largest fraction of a repetition the RF drive may be on.
    pub max_duty_cycle: f64,
}

pub const OPX1000_LF_TRAITS: DeviceTraits = DeviceTraits {
    model: "opx1000",
    module_kind: "LF",
    samples_per_ns: 1.0,
    sampling_rate: 1e9,
    min_pulse_length_ns: 16.0,
    max_pulse_length_ns: 100_000.0,
    chassis_slots: 1..=8,
    analog_outputs: 1..=8,
    analog_inputs: 1..=2,
    digital_outputs: 1..=8,
    input_gain_db: -12..=20,
    max_intermediate_frequency: 750e6,
    max_amplitude: 0.5,
    max_duty_cycle: 0.1,
};

impl DeviceTraits {
    pub fn from_model(model: &str, module_kind: &str) -> Option<&'static DeviceTraits> {
        match (model, module_kind) {
            ("opx1000", "LF") => Some(&OPX1000_LF_TRAITS),
            _ => None,
        }
    }

    /// Number of waveform samples played during `length_ns`.
    pub fn samples_for(&self, length_ns: f64) -> usize {
        (length_ns * self.samples_per_ns).round() as usize
    }
}
