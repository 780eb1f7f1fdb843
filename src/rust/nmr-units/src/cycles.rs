// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Conversion between physical durations and sequencer clock cycles.
//!
//! The sequencer timing model counts in clock cycles of [`CLOCK_CYCLE_NS`] nanoseconds.
//! A duration is representable only if it is an integer number of cycles.

use crate::duration::{ClockCycles, Nanoseconds, clock_cycles, nanoseconds};

/// Length of one sequencer clock cycle.
pub const CLOCK_CYCLE_NS: i64 = 4;

/// Shortest wait the sequencer can execute.
pub const MIN_WAIT_CYCLES: i64 = 4;

// Physical values arrive as floats; sub-picosecond residue is treated as representation noise.
const GRID_TOLERANCE_NS: f64 = 1e-6;

/// Whether `duration` lies on the clock-cycle grid.
pub fn is_on_grid(duration: Nanoseconds) -> bool {
    let cycles = duration.value() / CLOCK_CYCLE_NS as f64;
    duration.value().is_finite()
        && (cycles - cycles.round()).abs() * (CLOCK_CYCLE_NS as f64) < GRID_TOLERANCE_NS
}

/// Converts a duration to clock cycles, or `None` if it is not an integer number of cycles.
pub fn to_cycles_exact(duration: Nanoseconds) -> Option<ClockCycles> {
    if !is_on_grid(duration) {
        return None;
    }
    Some(clock_cycles(
        (duration.value() / CLOCK_CYCLE_NS as f64).round() as i64,
    ))
}

/// Converts a duration to the nearest number of clock cycles, ties away from zero.
pub fn to_cycles_rounded(duration: Nanoseconds) -> ClockCycles {
    clock_cycles((duration.value() / CLOCK_CYCLE_NS as f64).round() as i64)
}

pub fn to_nanoseconds(cycles: ClockCycles) -> Nanoseconds {
    nanoseconds((cycles.value() * CLOCK_CYCLE_NS) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exact_conversion() {
        assert_eq!(to_cycles_exact(nanoseconds(1100.0)), Some(clock_cycles(275)));
        assert_eq!(to_cycles_exact(nanoseconds(0.0)), Some(clock_cycles(0)));
        assert_eq!(to_cycles_exact(nanoseconds(20_000.0)), Some(clock_cycles(5000)));
        assert_eq!(to_cycles_exact(nanoseconds(1101.0)), None);
        assert_eq!(to_cycles_exact(nanoseconds(2.5)), None);
        assert_eq!(to_cycles_exact(nanoseconds(f64::NAN)), None);
        assert_eq!(to_cycles_exact(nanoseconds(f64::INFINITY)), None);
    }

    #[test]
    fn test_rounded_conversion() {
        assert_eq!(to_cycles_rounded(nanoseconds(1101.0)), clock_cycles(275));
        assert_eq!(to_cycles_rounded(nanoseconds(1102.0)), clock_cycles(276));
        assert_eq!(to_cycles_rounded(nanoseconds(1103.0)), clock_cycles(276));
        assert_eq!(to_cycles_rounded(nanoseconds(4e9)), clock_cycles(1_000_000_000));
    }

    proptest! {
        #[test]
        fn test_grid_round_trip(cycles in 0i64..10_000_000_000) {
            let ns = to_nanoseconds(clock_cycles(cycles));
            let back = to_cycles_exact(ns);
            prop_assert_eq!(back, Some(clock_cycles(cycles)));
            prop_assert_eq!(to_nanoseconds(clock_cycles(cycles)), ns);
        }

        #[test]
        fn test_off_grid_rejected(cycles in 0i64..1_000_000, residue in 1i64..4) {
            let ns = nanoseconds((cycles * CLOCK_CYCLE_NS + residue) as f64);
            prop_assert!(to_cycles_exact(ns).is_none());
            let rounded = to_nanoseconds(to_cycles_rounded(ns));
            prop_assert!((rounded.value() - ns.value()).abs() <= (CLOCK_CYCLE_NS / 2) as f64);
        }
    }
}
