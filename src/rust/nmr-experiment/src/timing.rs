// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Quantization of physical durations onto the sequencer clock grid.
//!
//! Durations that set the physics of the measurement (pulse lengths, the
//! readout delay, the dwell time) must already lie on the grid. Anything else
//! is rounded to the nearest cycle and the change is reported.

use nmr_units::cycles::{to_cycles_exact, to_cycles_rounded, to_nanoseconds};
use nmr_units::duration::clock_cycles;
use nmr_units::{ClockCycles, MIN_WAIT_CYCLES, Nanoseconds};
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingClass {
    /// Off-grid values are rejected.
    SafetyRelevant,
    /// Off-grid values are rounded with a [`RoundingWarning`].
    Cosmetic,
}

/// A duration that was changed to make it executable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundingWarning {
    pub field: String,
    pub requested: Nanoseconds,
    pub executed: Nanoseconds,
}

impl std::fmt::Display for RoundingWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "'{}' of {} executed as {}",
            self.field, self.requested, self.executed
        )
    }
}

/// Converts durations to clock cycles and collects the rounding it applied.
#[derive(Debug, Default)]
pub struct Quantizer {
    warnings: Vec<RoundingWarning>,
}

impl Quantizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> &[RoundingWarning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<RoundingWarning> {
        self.warnings
    }

    /// Converts `value` to clock cycles according to its timing class.
    pub fn quantize(
        &mut self,
        field: &str,
        value: Nanoseconds,
        class: TimingClass,
    ) -> Result<ClockCycles> {
        if !value.value().is_finite() || value.value() < 0.0 {
            return Err(timing_error(field, value, "must be finite and non-negative"));
        }
        if let Some(cycles) = to_cycles_exact(value) {
            return Ok(cycles);
        }
        match class {
            TimingClass::SafetyRelevant => Err(timing_error(
                field,
                value,
                "not a whole number of 4 ns clock cycles",
            )),
            TimingClass::Cosmetic => {
                let cycles = to_cycles_rounded(value);
                self.warn(field, value, cycles);
                Ok(cycles)
            }
        }
    }

    /// Quantizes a wait.
    ///
    /// Returns `None` for a zero-length cosmetic wait, which is dropped. Waits
    /// shorter than the sequencer minimum are lengthened if cosmetic and rejected otherwise.
    pub fn wait(
        &mut self,
        field: &str,
        value: Nanoseconds,
        class: TimingClass,
    ) -> Result<Option<ClockCycles>> {
        let cycles = self.quantize(field, value, class)?;
        if cycles.value() >= MIN_WAIT_CYCLES {
            return Ok(Some(cycles));
        }
        match class {
            TimingClass::Cosmetic if cycles.value() == 0 => Ok(None),
            TimingClass::Cosmetic => {
                let raised = clock_cycles(MIN_WAIT_CYCLES);
                self.warn(field, value, raised);
                Ok(Some(raised))
            }
            TimingClass::SafetyRelevant => Err(timing_error(
                field,
                value,
                format!("shorter than the minimum wait of {MIN_WAIT_CYCLES} clock cycles"),
            )),
        }
    }

    fn warn(&mut self, field: &str, requested: Nanoseconds, cycles: ClockCycles) {
        let warning = RoundingWarning {
            field: field.to_string(),
            requested,
            executed: to_nanoseconds(cycles),
        };
        // Repeated rounding of the same field replaces the earlier record.
        self.warnings.retain(|w| w.field != warning.field);
        nmr_log::warn!("{}", warning);
        self.warnings.push(warning);
    }
}

fn timing_error(field: &str, value: Nanoseconds, reason: impl ToString) -> Error {
    Error::Timing {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    }
}
