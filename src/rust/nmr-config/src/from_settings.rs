// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The standard NMR device configuration derived from [`ExperimentSettings`].

use indexmap::IndexMap;
use nmr_units::duration::nanoseconds;

use crate::builder::ConfigBuilder;
use crate::device_config::{DeviceConfig, Element, PortRef, Pulse, Waveform};
use crate::settings::ExperimentSettings;
use crate::Result;

pub const CONTROLLER: &str = "con1";
pub const LF_FEM_SLOT: u8 = 1;
pub const RF_PORT: u8 = 2;
pub const INPUT_GAIN_DB: i8 = 16;
pub const READOUT_SWITCH_PORT: u8 = 1;
pub const AMPLIFIER_BLANK_PORT: u8 = 2;
pub const DEBUG_MARKER_PORT: u8 = 3;
pub const TIME_OF_FLIGHT_NS: f64 = 280.0;
/// Length of the marker-only pulses toggling sticky elements.
pub const TTL_PULSE_NS: f64 = 40.0;

/// Marker name used by every element.
pub const MARKER: &str = "marker";

/// Demodulation labels of measurement pulses and the weights they use.
pub const WEIGHT_LABELS: [(&str, &str); 6] = [
    ("cos", "cosine_weights"),
    ("sin", "sine_weights"),
    ("minus_sin", "minus_sine_weights"),
    ("rotated_cos", "rotated_cosine_weights"),
    ("rotated_sin", "rotated_sine_weights"),
    ("rotated_minus_sin", "rotated_minus_sine_weights"),
];

/// Operations available on the RF elements, operation to pulse.
pub const RF_OPERATIONS: [(&str, &str); 7] = [
    ("cw", "const_pulse"),
    ("excitation", "excitation_pulse"),
    ("readout", "readout_pulse"),
    ("no_pulse_readout", "no_pulse_readout"),
    ("pi", "pi_pulse"),
    ("pi_half", "pi_half_pulse"),
    ("gaussian_pi_half", "gaussian_pi_half_pulse"),
];

/// Operations available on the TTL elements.
pub const TTL_OPERATIONS: [(&str, &str); 2] = [
    ("voltage_on", "voltage_on_pulse"),
    ("voltage_off", "voltage_off_pulse"),
];

fn operations(table: &[(&str, &str)]) -> IndexMap<String, String> {
    table
        .iter()
        .map(|(op, pulse)| (op.to_string(), pulse.to_string()))
        .collect()
}

/// Samples of a Gaussian envelope over +-3 sigma.
pub fn gaussian_samples(amplitude: f64, len: usize) -> Vec<f64> {
    if len == 1 {
        return vec![amplitude];
    }
    (0..len)
        .map(|i| {
            let x = -3.0 + 6.0 * i as f64 / (len - 1) as f64;
            amplitude * (-0.5 * x * x).exp()
        })
        .collect()
}

/// Builds the device configuration for `settings`.
///
/// Pure and deterministic: equal settings always give equal configurations.
pub fn config_from_settings(settings: &ExperimentSettings) -> Result<DeviceConfig> {
    settings.validate()?;
    let keys = &settings.keys;
    let rf = settings.rf_freq();
    let rf_port = PortRef::new(CONTROLLER, LF_FEM_SLOT, RF_PORT);

    let mut builder = ConfigBuilder::new(&settings.qop_host, settings.qop_port, &settings.cluster);
    let traits = builder.traits();
    builder
        .add_controller(CONTROLLER)?
        .add_module(CONTROLLER, LF_FEM_SLOT)?
        .add_analog_output(CONTROLLER, LF_FEM_SLOT, RF_PORT, 0.0)?
        .add_analog_input(CONTROLLER, LF_FEM_SLOT, RF_PORT, INPUT_GAIN_DB)?
        .add_digital_output(CONTROLLER, LF_FEM_SLOT, READOUT_SWITCH_PORT, "readout_switch", false)?
        .add_digital_output(CONTROLLER, LF_FEM_SLOT, AMPLIFIER_BLANK_PORT, "amplifier_blank", true)?
        .add_digital_output(CONTROLLER, LF_FEM_SLOT, DEBUG_MARKER_PORT, "debug_marker", false)?;

    let element = |table: &[(&str, &str)], marker_port: u8, sticky: bool| Element {
        intermediate_frequency: rf,
        output: rf_port.clone(),
        input: Some(rf_port.clone()),
        digital_inputs: IndexMap::from([(
            MARKER.to_string(),
            PortRef::new(CONTROLLER, LF_FEM_SLOT, marker_port),
        )]),
        operations: operations(table),
        time_of_flight: Some(nanoseconds(TIME_OF_FLIGHT_NS)),
        sticky,
    };
    // The helper mirrors the resonator so two acquisition streams can interleave.
    builder
        .add_element(&keys.resonator, element(&RF_OPERATIONS, DEBUG_MARKER_PORT, false))?
        .add_element(&keys.helper, element(&RF_OPERATIONS, DEBUG_MARKER_PORT, false))?
        .add_element(&keys.amplifier, element(&TTL_OPERATIONS, AMPLIFIER_BLANK_PORT, true))?
        .add_element(&keys.switch, element(&TTL_OPERATIONS, READOUT_SWITCH_PORT, true))?;

    let measurement = |waveform: &str| {
        WEIGHT_LABELS.iter().fold(
            Pulse::measurement(settings.dwell_time, waveform).with_marker("ON"),
            |pulse, (label, weights)| pulse.with_weights(label, weights),
        )
    };
    builder
        .add_pulse("const_pulse", Pulse::control(settings.const_len, "const_wf"))?
        .add_pulse(
            "excitation_pulse",
            Pulse::control(settings.excitation_length, "excitation_wf").with_marker("ON"),
        )?
        .add_pulse("readout_pulse", measurement("readout_wf"))?
        .add_pulse("no_pulse_readout", measurement("zero_wf"))?
        .add_pulse(
            "pi_half_pulse",
            Pulse::control(settings.pulse_length, "square_pi_half_wf").with_marker("ON"),
        )?
        .add_pulse(
            "pi_pulse",
            Pulse::control(settings.pulse_length * 2.0, "square_pi_wf").with_marker("ON"),
        )?
        .add_pulse(
            "gaussian_pi_half_pulse",
            Pulse::control(settings.pulse_length, "gaussian_pi_half_wf").with_marker("ON"),
        )?
        .add_pulse(
            "voltage_on_pulse",
            Pulse::control(nanoseconds(TTL_PULSE_NS), "zero_wf").with_marker("ON"),
        )?
        .add_pulse(
            "voltage_off_pulse",
            Pulse::control(nanoseconds(TTL_PULSE_NS), "zero_wf").with_marker("OFF"),
        )?;

    let constant = |sample: f64| Waveform::Constant { sample };
    let gaussian_len = traits.samples_for(settings.pulse_length.value());
    builder
        .add_waveform("const_wf", constant(settings.const_amp))?
        .add_waveform("zero_wf", constant(0.0))?
        .add_waveform("readout_wf", constant(settings.readout_amp))?
        .add_waveform("excitation_wf", constant(settings.excitation_amp))?
        .add_waveform("square_pi_half_wf", constant(settings.pulse_amplitude))?
        .add_waveform("square_pi_wf", constant(settings.pulse_amplitude))?
        .add_waveform(
            "gaussian_pi_half_wf",
            Waveform::Arbitrary {
                samples: gaussian_samples(settings.pulse_amplitude, gaussian_len),
            },
        )?
        .add_digital_waveform("ON", 1, 0)?
        .add_digital_waveform("OFF", 0, 0)?;

    let theta = settings.rotation_angle_normalized().to_radians();
    let (sin, cos) = theta.sin_cos();
    let dwell = settings.dwell_time;
    builder
        .add_integration_weights("cosine_weights", dwell, 1.0, 0.0)?
        .add_integration_weights("sine_weights", dwell, 0.0, 1.0)?
        .add_integration_weights("minus_sine_weights", dwell, 0.0, -1.0)?
        .add_integration_weights("rotated_cosine_weights", dwell, cos, sin)?
        .add_integration_weights("rotated_sine_weights", dwell, -sin, cos)?
        .add_integration_weights("rotated_minus_sine_weights", dwell, sin, -cos)?;

    builder.build()
}
