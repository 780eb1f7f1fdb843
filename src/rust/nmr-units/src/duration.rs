// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Formatter, Result as FormatterResult};

quantity!(Duration);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Nanosecond;

impl Display for Nanosecond {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatterResult {
        write!(f, "ns")
    }
}

/// One tick of the sequencer clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockCycle;

impl Display for ClockCycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatterResult {
        write!(f, "cycles")
    }
}

/// A physical duration in nanoseconds.
pub type Nanoseconds<T = f64> = Duration<Nanosecond, T>;

/// A duration counted in sequencer clock cycles.
pub type ClockCycles<T = i64> = Duration<ClockCycle, T>;

pub const fn nanoseconds<T>(value: T) -> Nanoseconds<T> {
    Duration {
        value,
        unit: Nanosecond,
    }
}

pub fn microseconds(value: f64) -> Nanoseconds {
    nanoseconds(value * 1e3)
}

pub fn milliseconds(value: f64) -> Nanoseconds {
    nanoseconds(value * 1e6)
}

pub fn seconds(value: f64) -> Nanoseconds {
    nanoseconds(value * 1e9)
}

pub const fn clock_cycles(value: i64) -> ClockCycles {
    Duration {
        value,
        unit: ClockCycle,
    }
}

impl Nanoseconds {
    pub fn as_microseconds(self) -> f64 {
        self.value * 1e-3
    }

    pub fn as_seconds(self) -> f64 {
        self.value * 1e-9
    }
}
