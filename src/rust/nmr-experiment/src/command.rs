// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! User commands that make up the excitation part of a repetition.

use nmr_units::{Hz, Nanoseconds};

use crate::error::{Error, Result};

/// A command argument that is either fixed or stepped by the sweep variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Sweepable<T> {
    Fixed(T),
    Swept(Vec<T>),
}

impl<T: Copy + Into<f64>> Sweepable<T> {
    pub fn swept_values(&self) -> Option<Vec<f64>> {
        match self {
            Sweepable::Fixed(_) => None,
            Sweepable::Swept(values) => Some(values.iter().map(|v| (*v).into()).collect()),
        }
    }
}

/// Plays an operation of an element.
///
/// `amplitude` scales the pulse waveform and `phase` is in degrees. A
/// `length` overrides the pulse length.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseCommand {
    pub operation: String,
    pub element: String,
    pub amplitude: Sweepable<f64>,
    pub phase: Sweepable<f64>,
    pub length: Option<Sweepable<Nanoseconds>>,
}

impl PulseCommand {
    pub fn new(operation: &str, element: &str) -> Self {
        PulseCommand {
            operation: operation.to_string(),
            element: element.to_string(),
            amplitude: Sweepable::Fixed(1.0),
            phase: Sweepable::Fixed(0.0),
            length: None,
        }
    }

    pub fn with_amplitude(mut self, amplitude: Sweepable<f64>) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn with_phase(mut self, phase: Sweepable<f64>) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_length(mut self, length: Sweepable<Nanoseconds>) -> Self {
        self.length = Some(length);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Pulse(PulseCommand),
    Delay(Sweepable<Nanoseconds>),
    /// Aligns the listed elements, or all of them.
    Align(Option<Vec<String>>),
    Frequency {
        element: String,
        frequency: Sweepable<Hz>,
    },
}

impl Command {
    /// Swept arguments of the command with their field suffix.
    pub fn swept_arguments(&self) -> Vec<(&'static str, Vec<f64>)> {
        let mut swept = vec![];
        match self {
            Command::Pulse(pulse) => {
                if let Some(values) = pulse.amplitude.swept_values() {
                    swept.push(("amplitude", values));
                }
                if let Some(values) = pulse.phase.swept_values() {
                    swept.push(("phase", values));
                }
                if let Some(values) = pulse.length.as_ref().and_then(|l| l.swept_values()) {
                    swept.push(("length", values));
                }
            }
            Command::Delay(duration) => {
                if let Some(values) = duration.swept_values() {
                    swept.push(("duration", values));
                }
            }
            Command::Frequency { frequency, .. } => {
                if let Some(values) = frequency.swept_values() {
                    swept.push(("frequency", values));
                }
            }
            Command::Align(_) => {}
        }
        swept
    }
}

// Relative tolerance for proportional sweep vectors.
const PROPORTION_TOLERANCE: f64 = 1e-9;

/// The single variable every swept argument of an experiment steps with.
///
/// The first swept argument defines it. Every further swept argument must be
/// a positive multiple of it, so that one loop index drives all of them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepVariable {
    values: Option<Vec<f64>>,
}

impl SweepVariable {
    pub fn values(&self) -> Option<&[f64]> {
        self.values.as_deref()
    }

    pub fn is_defined(&self) -> bool {
        self.values.is_some()
    }

    pub fn len(&self) -> usize {
        self.values.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a swept argument and returns its ratio to the sweep variable.
    pub fn register(&mut self, field: &str, values: &[f64]) -> Result<f64> {
        if values.is_empty() {
            return Err(Error::validation(field, "swept values must not be empty"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::validation(field, "swept values must be finite"));
        }
        if values.iter().all(|v| *v == 0.0) {
            return Err(Error::validation(field, "swept values must not all be zero"));
        }
        let Some(reference) = &self.values else {
            self.values = Some(values.to_vec());
            return Ok(1.0);
        };
        let ratio = proportion(reference, values).ok_or_else(|| {
            Error::validation(
                field,
                "inconsistent loop variables: swept values must be a positive multiple of the first swept argument",
            )
        })?;
        Ok(ratio)
    }
}

fn proportion(reference: &[f64], values: &[f64]) -> Option<f64> {
    if reference.len() != values.len() {
        return None;
    }
    let norm: f64 = reference.iter().map(|r| r * r).sum();
    let ratio = reference.iter().zip(values).map(|(r, v)| r * v).sum::<f64>() / norm;
    if ratio <= 0.0 {
        return None;
    }
    let scale = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    reference
        .iter()
        .zip(values)
        .all(|(r, v)| (r * ratio - v).abs() <= PROPORTION_TOLERANCE * scale)
        .then_some(ratio)
}
