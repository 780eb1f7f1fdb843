// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Output safety: amplitude, length and duty-cycle ceilings, and the
//! switch/amplifier sequences that protect the receiver.
//!
//! A value known at compile time that exceeds its ceiling is an error. A value
//! computed on the device is clamped to the ceiling and the clamp is reported.

use indexmap::IndexMap;
use nmr_config::DeviceTraits;
use nmr_units::CLOCK_CYCLE_NS;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::node::NodeChild;
use crate::program::{Op, leaf};

/// Time for the receiver switch to settle, in clock cycles.
pub const RX_SWITCH_DELAY: i64 = 230;
/// Time for the power amplifier to come out of blanking, in clock cycles.
pub const AMPLIFIER_UNBLANKING_TIME: i64 = 500;
/// Time for the power amplifier to blank, in clock cycles.
pub const AMPLIFIER_BLANKING_TIME: i64 = 500;
/// Shortest wait left between the mode switches and the acquisition.
pub const MIN_PRE_SCAN_CYCLES: i64 = 16;

pub const TTL_ON: &str = "voltage_on";
pub const TTL_OFF: &str = "voltage_off";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Quantity {
    Amplitude,
    /// Clock cycles.
    Duration,
    DutyCycle,
}

/// Largest magnitude allowed for a value at one program site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ceiling {
    pub site: String,
    pub quantity: Quantity,
    pub limit: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Known while compiling.
    Static,
    /// Computed on the device.
    Runtime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Guarded {
    Accepted(f64),
    Clamped { requested: f64, emitted: f64 },
    Rejected { requested: f64, reason: String },
}

impl Guarded {
    /// The value put on the output, if any.
    pub fn emitted(&self) -> Option<f64> {
        match self {
            Guarded::Accepted(value) => Some(*value),
            Guarded::Clamped { emitted, .. } => Some(*emitted),
            Guarded::Rejected { .. } => None,
        }
    }
}

/// Checks `value` against `ceiling`.
///
/// Never returns an emitted value with a magnitude above `ceiling`.
pub fn guard(value: f64, ceiling: f64, origin: Origin) -> Guarded {
    if !value.is_finite() {
        return Guarded::Rejected {
            requested: value,
            reason: "value is not finite".to_string(),
        };
    }
    if value.abs() <= ceiling {
        return Guarded::Accepted(value);
    }
    match origin {
        Origin::Static => Guarded::Rejected {
            requested: value,
            reason: format!("magnitude {} exceeds the ceiling of {ceiling}", value.abs()),
        },
        Origin::Runtime => Guarded::Clamped {
            requested: value,
            emitted: ceiling.copysign(value),
        },
    }
}

/// Ceilings applied to one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyLimits {
    pub max_amplitude: f64,
    pub max_pulse_cycles: i64,
    pub max_duty_cycle: f64,
    /// Longest single wait the sequencer executes.
    pub max_wait_cycles: i64,
}

impl SafetyLimits {
    pub fn from_traits(traits: &DeviceTraits) -> Self {
        SafetyLimits {
            max_amplitude: traits.max_amplitude,
            max_pulse_cycles: (traits.max_pulse_length_ns / CLOCK_CYCLE_NS as f64).floor() as i64,
            max_duty_cycle: traits.max_duty_cycle,
            max_wait_cycles: i32::MAX as i64,
        }
    }

    /// Lowers the amplitude ceiling; a higher value leaves it unchanged.
    pub fn with_max_amplitude(mut self, max_amplitude: f64) -> Self {
        self.max_amplitude = self.max_amplitude.min(max_amplitude);
        self
    }

    pub fn amplitude_ceiling(&self, site: &str) -> Ceiling {
        self.ceiling(site, Quantity::Amplitude, self.max_amplitude)
    }

    pub fn pulse_ceiling(&self, site: &str) -> Ceiling {
        self.ceiling(site, Quantity::Duration, self.max_pulse_cycles as f64)
    }

    pub fn wait_ceiling(&self, site: &str) -> Ceiling {
        self.ceiling(site, Quantity::Duration, self.max_wait_cycles as f64)
    }

    fn ceiling(&self, site: &str, quantity: Quantity, limit: f64) -> Ceiling {
        Ceiling {
            site: site.to_string(),
            quantity,
            limit,
        }
    }

    /// Checks a value known at compile time; exceeding the ceiling is a compilation error.
    pub fn check_static(&self, ceiling: &Ceiling, value: f64) -> Result<f64> {
        match guard(value, ceiling.limit, Origin::Static) {
            Guarded::Accepted(value) => Ok(value),
            Guarded::Rejected { reason, .. } => Err(Error::compilation(&ceiling.site, reason)),
            Guarded::Clamped { .. } => Err(Error::new("static values are never clamped")),
        }
    }

    /// Checks the fraction of a repetition during which the drive is on.
    pub fn check_duty_cycle(&self, on_cycles: i64, period_cycles: i64) -> Result<f64> {
        if period_cycles <= 0 {
            return Err(Error::compilation("duty_cycle", "repetition has no duration"));
        }
        let duty = on_cycles as f64 / period_cycles as f64;
        if duty > self.max_duty_cycle {
            return Err(Error::compilation(
                "duty_cycle",
                format!(
                    "drive on for {on_cycles} of {period_cycles} cycles ({:.1} %), limit is {:.1} %",
                    duty * 100.0,
                    self.max_duty_cycle * 100.0
                ),
            ));
        }
        Ok(duty)
    }
}

/// One clamp applied by the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClampEvent {
    pub site: String,
    pub quantity: Quantity,
    pub requested: f64,
    pub emitted: f64,
    /// Index of the repetition the clamp happened in.
    pub shot: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteClamps {
    pub quantity: Quantity,
    pub count: usize,
    /// Requested value with the largest magnitude.
    pub worst_requested: f64,
    pub emitted: f64,
}

/// Clamp events of a run aggregated per program site.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClampSummary {
    pub total: usize,
    pub sites: IndexMap<String, SiteClamps>,
}

impl ClampSummary {
    pub fn record(&mut self, event: &ClampEvent) {
        self.total += 1;
        let entry = self
            .sites
            .entry(event.site.clone())
            .or_insert_with(|| SiteClamps {
                quantity: event.quantity,
                count: 0,
                worst_requested: event.requested,
                emitted: event.emitted,
            });
        entry.count += 1;
        if event.requested.abs() > entry.worst_requested.abs() {
            entry.worst_requested = event.requested;
            entry.emitted = event.emitted;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// The digital lines that gate the RF path.
#[derive(Debug, Clone, Copy)]
pub struct Lines<'a> {
    pub switch: &'a str,
    pub amplifier: &'a str,
}

fn ttl(element: &str, operation: &str) -> NodeChild<Op> {
    leaf(Op::play(element, operation, 0.0))
}

/// Isolates the receiver, then unblanks the amplifier for transmission.
pub fn drive_mode(lines: Lines<'_>) -> Vec<NodeChild<Op>> {
    vec![
        leaf(Op::align(&[])),
        ttl(lines.switch, TTL_OFF),
        leaf(Op::wait(RX_SWITCH_DELAY)),
        ttl(lines.amplifier, TTL_ON),
        leaf(Op::wait(AMPLIFIER_UNBLANKING_TIME)),
        leaf(Op::align(&[])),
    ]
}

/// Blanks the amplifier, then connects the receiver.
pub fn readout_mode(lines: Lines<'_>) -> Vec<NodeChild<Op>> {
    vec![
        leaf(Op::align(&[])),
        ttl(lines.amplifier, TTL_OFF),
        leaf(Op::wait(AMPLIFIER_BLANKING_TIME)),
        ttl(lines.switch, TTL_ON),
        leaf(Op::wait(RX_SWITCH_DELAY)),
        leaf(Op::align(&[])),
    ]
}

/// Amplifier blanked and receiver isolated.
pub fn safe_mode(lines: Lines<'_>) -> Vec<NodeChild<Op>> {
    vec![
        leaf(Op::align(&[])),
        ttl(lines.amplifier, TTL_OFF),
        ttl(lines.switch, TTL_OFF),
        leaf(Op::wait(AMPLIFIER_BLANKING_TIME)),
        leaf(Op::align(&[])),
    ]
}

/// Wait between the end of the excitation and the start of the readout
/// switching, given the readout delay in clock cycles.
pub fn pre_scan_cycles(readout_delay_cycles: i64) -> i64 {
    readout_delay_cycles - 2 * AMPLIFIER_BLANKING_TIME - RX_SWITCH_DELAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmr_config::OPX1000_LF_TRAITS;
    use proptest::prelude::*;

    #[test]
    fn test_static_over_ceiling_rejected() {
        let limits = SafetyLimits::from_traits(&OPX1000_LF_TRAITS);
        let ceiling = limits.amplitude_ceiling("commands[0].amplitude");
        assert_eq!(limits.check_static(&ceiling, 0.5).unwrap(), 0.5);
        let err = limits.check_static(&ceiling, 0.55).unwrap_err();
        assert_eq!(err.field(), Some("commands[0].amplitude"));
    }

    #[test]
    fn test_runtime_over_ceiling_clamped() {
        assert_eq!(
            guard(-0.7, 0.5, Origin::Runtime),
            Guarded::Clamped {
                requested: -0.7,
                emitted: -0.5
            }
        );
        assert!(matches!(
            guard(f64::NAN, 0.5, Origin::Runtime),
            Guarded::Rejected { .. }
        ));
    }

    #[test]
    fn test_duty_cycle() {
        let limits = SafetyLimits::from_traits(&OPX1000_LF_TRAITS);
        assert!(limits.check_duty_cycle(100, 10_000).is_ok());
        let err = limits.check_duty_cycle(2_000, 10_000).unwrap_err();
        assert_eq!(err.field(), Some("duty_cycle"));
    }

    #[test]
    fn test_reduced_amplitude_ceiling() {
        let limits = SafetyLimits::from_traits(&OPX1000_LF_TRAITS).with_max_amplitude(0.1);
        assert_eq!(limits.max_amplitude, 0.1);
        let limits = limits.with_max_amplitude(0.9);
        assert_eq!(limits.max_amplitude, 0.1);
    }

    #[test]
    fn test_clamp_summary() {
        let mut summary = ClampSummary::default();
        for (shot, requested) in [(0, 0.6), (1, 0.8), (2, 0.7)] {
            summary.record(&ClampEvent {
                site: "commands[1].amplitude".to_string(),
                quantity: Quantity::Amplitude,
                requested,
                emitted: 0.5,
                shot,
            });
        }
        assert_eq!(summary.total, 3);
        let site = &summary.sites["commands[1].amplitude"];
        assert_eq!(site.count, 3);
        assert_eq!(site.worst_requested, 0.8);
    }

    #[test]
    fn test_mode_sequences_toggle_lines() {
        let lines = Lines {
            switch: "switch",
            amplifier: "amplifier",
        };
        let plays = |nodes: Vec<NodeChild<Op>>| -> Vec<(String, String)> {
            nodes
                .iter()
                .filter_map(|n| match &n.kind {
                    Op::Play {
                        element, operation, ..
                    } => Some((element.clone(), operation.clone())),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(
            plays(drive_mode(lines)),
            vec![
                ("switch".to_string(), TTL_OFF.to_string()),
                ("amplifier".to_string(), TTL_ON.to_string())
            ]
        );
        assert_eq!(
            plays(safe_mode(lines)),
            vec![
                ("amplifier".to_string(), TTL_OFF.to_string()),
                ("switch".to_string(), TTL_OFF.to_string())
            ]
        );
        assert_eq!(pre_scan_cycles(5000), 3770);
    }

    proptest! {
        #[test]
        fn test_emitted_never_exceeds_ceiling(value in -10.0f64..10.0, ceiling in 0.0f64..1.0) {
            for origin in [Origin::Static, Origin::Runtime] {
                if let Some(emitted) = guard(value, ceiling, origin).emitted() {
                    prop_assert!(emitted.abs() <= ceiling);
                }
            }
        }
    }
}
