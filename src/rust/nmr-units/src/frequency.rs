// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Display, Formatter, Result as FormatterResult};

quantity!(Frequency);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hertz;

impl Display for Hertz {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatterResult {
        write!(f, "Hz")
    }
}

pub type Hz<T = f64> = Frequency<Hertz, T>;

pub const fn hertz<T>(value: T) -> Hz<T> {
    Frequency { value, unit: Hertz }
}

pub fn kilohertz(value: f64) -> Hz {
    hertz(value * 1e3)
}

pub fn megahertz(value: f64) -> Hz {
    hertz(value * 1e6)
}

impl Hz {
    pub fn as_megahertz(self) -> f64 {
        self.value * 1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency() {
        assert_eq!(megahertz(282.1901), hertz(282_190_100.0));
        assert_eq!(megahertz(282.1901) - hertz(750.0), hertz(282_189_350.0));
        assert_eq!(kilohertz(0.75), hertz(750.0));
        assert_eq!(format!("{}", hertz(750.0)), "750 Hz");
        assert!(hertz(0.0) < megahertz(750.0));
    }
}
