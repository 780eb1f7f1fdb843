// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Device configuration: controllers, elements, pulses, waveforms and
//! integration weights, keyed by name.
//!
//! A [`DeviceConfig`] is checked for referential integrity against the
//! [`DeviceTraits`] of its front-end module before it is handed out, so every
//! element a program refers to exists and every pulse declares a waveform of
//! matching shape.

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use nmr_units::cycles::is_on_grid;
use nmr_units::duration::Nanoseconds;
use nmr_units::frequency::Hz;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::device_traits::DeviceTraits;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogOutput {
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogInput {
    pub offset: f64,
    pub gain_db: i8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalOutput {
    pub name: String,
    pub inverted: bool,
}

/// A front-end module plugged into a chassis slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontEndModule {
    pub kind: String,
    pub analog_outputs: IndexMap<u8, AnalogOutput>,
    pub analog_inputs: IndexMap<u8, AnalogInput>,
    pub digital_outputs: IndexMap<u8, DigitalOutput>,
}

impl FrontEndModule {
    pub fn new(kind: &str) -> Self {
        FrontEndModule {
            kind: kind.to_string(),
            analog_outputs: IndexMap::new(),
            analog_inputs: IndexMap::new(),
            digital_outputs: IndexMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub model: String,
    pub modules: IndexMap<u8, FrontEndModule>,
}

/// Physical port address: controller, chassis slot and port number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub controller: String,
    pub slot: u8,
    pub port: u8,
}

impl PortRef {
    pub fn new(controller: &str, slot: u8, port: u8) -> Self {
        PortRef {
            controller: controller.to_string(),
            slot,
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortKind {
    AnalogOutput,
    AnalogInput,
    DigitalOutput,
}

/// A logical channel tied to physical ports and an intermediate frequency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub intermediate_frequency: Hz,
    /// Controller output driving the element.
    pub output: PortRef,
    /// Controller input reading back from the element.
    pub input: Option<PortRef>,
    /// Marker lines raised alongside pulses on this element.
    pub digital_inputs: IndexMap<String, PortRef>,
    /// Operation name to pulse name.
    pub operations: IndexMap<String, String>,
    pub time_of_flight: Option<Nanoseconds>,
    /// Sticky elements hold their last output level between pulses.
    pub sticky: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseKind {
    Control,
    Measurement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    pub kind: PulseKind,
    pub length: Nanoseconds,
    pub waveform: String,
    pub digital_marker: Option<String>,
    /// Demodulation label to integration weights name; measurement pulses only.
    pub integration_weights: IndexMap<String, String>,
}

impl Pulse {
    pub fn control(length: Nanoseconds, waveform: &str) -> Self {
        Pulse {
            kind: PulseKind::Control,
            length,
            waveform: waveform.to_string(),
            digital_marker: None,
            integration_weights: IndexMap::new(),
        }
    }

    pub fn measurement(length: Nanoseconds, waveform: &str) -> Self {
        Pulse {
            kind: PulseKind::Measurement,
            ..Pulse::control(length, waveform)
        }
    }

    pub fn with_marker(mut self, marker: &str) -> Self {
        self.digital_marker = Some(marker.to_string());
        self
    }

    pub fn with_weights(mut self, label: &str, weights: &str) -> Self {
        self.integration_weights
            .insert(label.to_string(), weights.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Waveform {
    Constant { sample: f64 },
    Arbitrary { samples: Vec<f64> },
}

impl Waveform {
    /// Largest absolute sample value.
    pub fn peak(&self) -> f64 {
        match self {
            Waveform::Constant { sample } => sample.abs(),
            Waveform::Arbitrary { samples } => samples.iter().fold(0.0, |acc, s| acc.max(s.abs())),
        }
    }
}

/// Marker waveform as `(state, length_ns)` segments; a zero length holds for the whole pulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalWaveform {
    pub samples: Vec<(u8, u32)>,
}

/// Demodulation weights as `(weight, length_ns)` segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationWeights {
    pub cosine: Vec<(f64, u32)>,
    pub sine: Vec<(f64, u32)>,
}

impl IntegrationWeights {
    pub fn constant(real: f64, imag: f64, length_ns: u32) -> Self {
        IntegrationWeights {
            cosine: vec![(real, length_ns)],
            sine: vec![(imag, length_ns)],
        }
    }

    pub fn length_ns(&self) -> u64 {
        self.cosine.iter().map(|(_, len)| *len as u64).sum()
    }
}

/// The complete, immutable description handed to the device runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub cluster: String,
    pub controllers: IndexMap<String, Controller>,
    pub elements: IndexMap<String, Element>,
    pub pulses: IndexMap<String, Pulse>,
    pub waveforms: IndexMap<String, Waveform>,
    pub digital_waveforms: IndexMap<String, DigitalWaveform>,
    pub integration_weights: IndexMap<String, IntegrationWeights>,
}

fn undefined(kind: &'static str, name: &str, referenced_by: String) -> Error {
    Error::Undefined {
        kind,
        name: name.to_string(),
        referenced_by,
    }
}

pub(crate) fn check_pulse_length(
    field: &str,
    length: Nanoseconds,
    traits: &DeviceTraits,
) -> Result<()> {
    let ns = length.value();
    if !is_on_grid(length) {
        return Err(Error::invalid(
            field,
            format!("length {length} is not a multiple of the 4 ns clock cycle"),
        ));
    }
    if ns < traits.min_pulse_length_ns || ns > traits.max_pulse_length_ns {
        return Err(Error::invalid(
            field,
            format!(
                "length {length} outside [{}, {}] ns",
                traits.min_pulse_length_ns, traits.max_pulse_length_ns
            ),
        ));
    }
    Ok(())
}

pub(crate) fn check_intermediate_frequency(
    field: &str,
    frequency: Hz,
    traits: &DeviceTraits,
) -> Result<()> {
    let hz = frequency.value();
    if !hz.is_finite() || !(0.0..traits.max_intermediate_frequency).contains(&hz) {
        return Err(Error::invalid(
            field,
            format!(
                "intermediate frequency {frequency} outside [0, {}) Hz",
                traits.max_intermediate_frequency
            ),
        ));
    }
    Ok(())
}

pub(crate) fn check_waveform(
    field: &str,
    waveform: &Waveform,
    traits: &DeviceTraits,
) -> Result<()> {
    let samples_ok = match waveform {
        Waveform::Constant { sample } => sample.is_finite(),
        Waveform::Arbitrary { samples } => {
            !samples.is_empty() && samples.iter().all(|s| s.is_finite())
        }
    };
    if !samples_ok {
        return Err(Error::invalid(field, "waveform samples must be finite and non-empty"));
    }
    if waveform.peak() > traits.max_amplitude {
        return Err(Error::invalid(
            field,
            format!(
                "peak amplitude {} exceeds the output limit {}",
                waveform.peak(),
                traits.max_amplitude
            ),
        ));
    }
    Ok(())
}

impl DeviceConfig {
    pub fn element(&self, name: &str) -> Result<&Element> {
        self.elements
            .get(name)
            .ok_or_else(|| undefined("element", name, "program".to_string()))
    }

    /// The pulse an operation on `element` plays.
    pub fn pulse_for(&self, element: &str, operation: &str) -> Result<&Pulse> {
        let pulse_name = self
            .element(element)?
            .operations
            .get(operation)
            .ok_or_else(|| undefined("operation", operation, format!("elements.{element}")))?;
        self.pulses
            .get(pulse_name)
            .ok_or_else(|| {
                undefined(
                    "pulse",
                    pulse_name,
                    format!("elements.{element}.operations.{operation}"),
                )
            })
    }

    pub fn waveform_for(&self, pulse: &Pulse) -> Result<&Waveform> {
        self.waveforms
            .get(&pulse.waveform)
            .ok_or_else(|| undefined("waveform", &pulse.waveform, "pulse".to_string()))
    }

    fn port_exists(&self, port: &PortRef, kind: PortKind) -> bool {
        let Some(module) = self
            .controllers
            .get(&port.controller)
            .and_then(|c| c.modules.get(&port.slot))
        else {
            return false;
        };
        match kind {
            PortKind::AnalogOutput => module.analog_outputs.contains_key(&port.port),
            PortKind::AnalogInput => module.analog_inputs.contains_key(&port.port),
            PortKind::DigitalOutput => module.digital_outputs.contains_key(&port.port),
        }
    }

    fn check_port(&self, port: &PortRef, kind: PortKind, field: String) -> Result<()> {
        if self.port_exists(port, kind) {
            return Ok(());
        }
        Err(Error::invalid(
            field,
            format!(
                "port ({}, {}, {}) is not declared as {kind:?} on the controller",
                port.controller, port.slot, port.port
            ),
        ))
    }

    /// Checks hardware ranges and referential integrity.
    pub fn validate(&self, traits: &DeviceTraits) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::invalid("host", "must not be empty"));
        }
        for (name, controller) in &self.controllers {
            for (slot, module) in &controller.modules {
                let field = format!("controllers.{name}.modules.{slot}");
                if !traits.chassis_slots.contains(slot) {
                    return Err(Error::invalid(field, "chassis slot out of range"));
                }
                if module.kind != traits.module_kind {
                    return Err(Error::invalid(
                        field,
                        format!(
                            "module kind '{}' does not match '{}'",
                            module.kind, traits.module_kind
                        ),
                    ));
                }
                for port in module.analog_outputs.keys() {
                    if !traits.analog_outputs.contains(port) {
                        return Err(Error::invalid(
                            format!("{field}.analog_outputs.{port}"),
                            "port out of range",
                        ));
                    }
                }
                for (port, input) in &module.analog_inputs {
                    if !traits.analog_inputs.contains(port) {
                        return Err(Error::invalid(
                            format!("{field}.analog_inputs.{port}"),
                            "port out of range",
                        ));
                    }
                    if !traits.input_gain_db.contains(&input.gain_db) {
                        return Err(Error::invalid(
                            format!("{field}.analog_inputs.{port}.gain_db"),
                            format!("gain {} dB out of range", input.gain_db),
                        ));
                    }
                }
                for port in module.digital_outputs.keys() {
                    if !traits.digital_outputs.contains(port) {
                        return Err(Error::invalid(
                            format!("{field}.digital_outputs.{port}"),
                            "port out of range",
                        ));
                    }
                }
            }
        }

        for (name, element) in &self.elements {
            let field = format!("elements.{name}");
            check_intermediate_frequency(
                &format!("{field}.intermediate_frequency"),
                element.intermediate_frequency,
                traits,
            )?;
            self.check_port(&element.output, PortKind::AnalogOutput, format!("{field}.output"))?;
            if let Some(input) = &element.input {
                self.check_port(input, PortKind::AnalogInput, format!("{field}.input"))?;
            }
            for (marker, port) in &element.digital_inputs {
                self.check_port(
                    port,
                    PortKind::DigitalOutput,
                    format!("{field}.digital_inputs.{marker}"),
                )?;
            }
            if let Some(tof) = element.time_of_flight
                && !is_on_grid(tof)
            {
                return Err(Error::invalid(
                    format!("{field}.time_of_flight"),
                    format!("{tof} is not a multiple of the 4 ns clock cycle"),
                ));
            }
            for (operation, pulse) in &element.operations {
                let pulse_def = self
                    .pulses
                    .get(pulse)
                    .ok_or_else(|| {
                        undefined("pulse", pulse, format!("{field}.operations.{operation}"))
                    })?;
                if pulse_def.kind == PulseKind::Measurement && element.input.is_none() {
                    return Err(Error::invalid(
                        format!("{field}.operations.{operation}"),
                        "measurement pulse on an element without an input",
                    ));
                }
                if pulse_def.digital_marker.is_some() && element.digital_inputs.is_empty() {
                    return Err(Error::invalid(
                        format!("{field}.operations.{operation}"),
                        "pulse carries a marker but the element has no digital input",
                    ));
                }
            }
        }

        for (name, pulse) in &self.pulses {
            let field = format!("pulses.{name}");
            check_pulse_length(&format!("{field}.length"), pulse.length, traits)?;
            let waveform = self
                .waveforms
                .get(&pulse.waveform)
                .ok_or_else(|| undefined("waveform", &pulse.waveform, field.clone()))?;
            if let Waveform::Arbitrary { samples } = waveform {
                let expected = traits.samples_for(pulse.length.value());
                if samples.len() != expected {
                    return Err(Error::invalid(
                        format!("{field}.waveform"),
                        format!(
                            "waveform '{}' has {} samples, pulse length needs {expected}",
                            pulse.waveform,
                            samples.len()
                        ),
                    ));
                }
            }
            if let Some(marker) = &pulse.digital_marker
                && !self.digital_waveforms.contains_key(marker)
            {
                return Err(undefined("digital waveform", marker, field.clone()));
            }
            match pulse.kind {
                PulseKind::Control if !pulse.integration_weights.is_empty() => {
                    return Err(Error::invalid(
                        format!("{field}.integration_weights"),
                        "control pulses cannot carry integration weights",
                    ));
                }
                PulseKind::Measurement if pulse.integration_weights.is_empty() => {
                    return Err(Error::invalid(
                        format!("{field}.integration_weights"),
                        "measurement pulses need integration weights",
                    ));
                }
                _ => {}
            }
            for (label, weights) in &pulse.integration_weights {
                let def = self
                    .integration_weights
                    .get(weights)
                    .ok_or_else(|| {
                        undefined(
                            "integration weights",
                            weights,
                            format!("{field}.integration_weights.{label}"),
                        )
                    })?;
                if def.length_ns() != pulse.length.value().round() as u64 {
                    return Err(Error::invalid(
                        format!("{field}.integration_weights.{label}"),
                        format!(
                            "weights '{weights}' span {} ns, pulse is {}",
                            def.length_ns(),
                            pulse.length
                        ),
                    ));
                }
            }
        }

        for (name, waveform) in &self.waveforms {
            check_waveform(&format!("waveforms.{name}"), waveform, traits)?;
        }
        for (name, waveform) in &self.digital_waveforms {
            if waveform.samples.is_empty() || waveform.samples.iter().any(|(state, _)| *state > 1) {
                return Err(Error::invalid(
                    format!("digital_waveforms.{name}"),
                    "segments must be non-empty with states 0 or 1",
                ));
            }
        }
        for (name, weights) in &self.integration_weights {
            if weights.cosine.len() != weights.sine.len()
                || weights.cosine.iter().zip(&weights.sine).any(|(c, s)| c.1 != s.1 || c.1 % 4 != 0)
            {
                return Err(Error::invalid(
                    format!("integration_weights.{name}"),
                    "cosine and sine segments must align on the 4 ns grid",
                ));
            }
        }
        Ok(())
    }

    /// Renders the configuration in the dictionary format of the hardware runtime.
    pub fn to_runtime_config(&self) -> Value {
        let port = |p: &PortRef| json!([p.controller, p.slot, p.port]);
        let controllers: serde_json::Map<String, Value> = self
            .controllers
            .iter()
            .map(|(name, controller)| {
                let fems: serde_json::Map<String, Value> = controller
                    .modules
                    .iter()
                    .map(|(slot, module)| {
                        let analog_outputs: serde_json::Map<String, Value> = module
                            .analog_outputs
                            .iter()
                            .map(|(p, out)| {
                                (
                                    p.to_string(),
                                    json!({
                                        "offset": out.offset,
                                        "sampling_rate": 1e9,
                                        "output_mode": "direct",
                                    }),
                                )
                            })
                            .collect();
                        let analog_inputs: serde_json::Map<String, Value> = module
                            .analog_inputs
                            .iter()
                            .map(|(p, input)| {
                                (
                                    p.to_string(),
                                    json!({
                                        "offset": input.offset,
                                        "gain_db": input.gain_db,
                                        "sampling_rate": 1e9,
                                    }),
                                )
                            })
                            .collect();
                        let digital_outputs: serde_json::Map<String, Value> = module
                            .digital_outputs
                            .iter()
                            .map(|(p, out)| {
                                let body = if out.inverted {
                                    json!({"inverted": true})
                                } else {
                                    json!({})
                                };
                                (p.to_string(), body)
                            })
                            .collect();
                        (
                            slot.to_string(),
                            json!({
                                "type": module.kind,
                                "analog_outputs": analog_outputs,
                                "analog_inputs": analog_inputs,
                                "digital_outputs": digital_outputs,
                            }),
                        )
                    })
                    .collect();
                (name.clone(), json!({"type": controller.model, "fems": fems}))
            })
            .collect();

        let elements: serde_json::Map<String, Value> = self
            .elements
            .iter()
            .map(|(name, element)| {
                let mut body = json!({
                    "singleInput": {"port": port(&element.output)},
                    "intermediate_frequency": element.intermediate_frequency.value(),
                    "operations": element.operations,
                    "digitalInputs": element
                        .digital_inputs
                        .iter()
                        .map(|(marker, p)| {
                            let body = json!({"port": port(p), "delay": 0, "buffer": 0});
                            (marker.clone(), body)
                        })
                        .collect::<serde_json::Map<_, _>>(),
                });
                if let Some(input) = &element.input {
                    body["outputs"] = json!({"out1": port(input)});
                }
                if let Some(tof) = element.time_of_flight {
                    body["time_of_flight"] = json!(tof.value().round() as i64);
                }
                if element.sticky {
                    body["sticky"] = json!({"analog": true, "digital": true});
                }
                (name.clone(), body)
            })
            .collect();

        let pulses: serde_json::Map<String, Value> = self
            .pulses
            .iter()
            .map(|(name, pulse)| {
                let operation = match pulse.kind {
                    PulseKind::Control => "control",
                    PulseKind::Measurement => "measure",
                };
                let mut body = json!({
                    "operation": operation,
                    "length": pulse.length.value().round() as i64,
                    "waveforms": {"single": pulse.waveform},
                });
                if let Some(marker) = &pulse.digital_marker {
                    body["digital_marker"] = json!(marker);
                }
                if pulse.kind == PulseKind::Measurement {
                    body["integration_weights"] = json!(pulse.integration_weights);
                }
                (name.clone(), body)
            })
            .collect();

        json!({
            "controllers": controllers,
            "elements": elements,
            "pulses": pulses,
            "waveforms": self.waveforms,
            "digital_waveforms": self.digital_waveforms,
            "integration_weights": self.integration_weights,
        })
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, traits: &DeviceTraits) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: DeviceConfig = serde_json::from_str(&text)?;
        config.validate(traits)?;
        Ok(config)
    }
}
