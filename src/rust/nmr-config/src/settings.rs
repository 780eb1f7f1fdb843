// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Physical parameters of an NMR experiment.
//!
//! [`ExperimentSettings`] is a plain value: the framework reads it but never
//! mutates it. Validation checks physical plausibility only. Whether a value is
//! representable on a particular device is decided by the configuration builder.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use nmr_units::duration::{Nanoseconds, microseconds, nanoseconds, seconds};
use nmr_units::frequency::{Hz, hertz, megahertz};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Largest normalized amplitude accepted for the excitation pulse.
pub const MAX_PULSE_AMPLITUDE: f64 = 0.5;
/// Shortest excitation pulse the amplifier chain handles cleanly.
pub const MIN_PULSE_LENGTH_NS: f64 = 64.0;
/// Shortest dead time between excitation and acquisition.
pub const MIN_READOUT_DELAY_NS: f64 = 5_000.0;
/// Upper bound (exclusive) of the carrier the LF front end can synthesize.
pub const MAX_RF_FREQUENCY_HZ: f64 = 750e6;
/// Most points a sweep range may expand to.
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

/// An inclusive, evenly spaced range of sweep values.
///
/// `start == stop` describes a single-point sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

// Float steps rarely land exactly on `stop`.
const SWEEP_TOLERANCE: f64 = 1e-9;

impl SweepRange {
    pub fn new(start: f64, stop: f64, step: f64) -> Result<Self> {
        let range = SweepRange { start, stop, step };
        range.validate("sweep")?;
        Ok(range)
    }

    pub fn single(value: f64) -> Self {
        SweepRange {
            start: value,
            stop: value,
            step: 1.0,
        }
    }

    /// Checks that the range is finite, monotonic in the direction of `step`
    /// and at most [`MAX_SWEEP_POINTS`] long.
    pub fn validate(&self, field: &str) -> Result<()> {
        if !(self.start.is_finite() && self.stop.is_finite() && self.step.is_finite()) {
            return Err(Error::invalid(field, "sweep bounds must be finite"));
        }
        if self.step == 0.0 {
            return Err(Error::invalid(field, "sweep step must be non-zero"));
        }
        if (self.stop - self.start) / self.step < -SWEEP_TOLERANCE {
            return Err(Error::invalid(
                field,
                format!(
                    "sweep from {} to {} never advances with step {}",
                    self.start, self.stop, self.step
                ),
            ));
        }
        let steps = self.steps();
        if !steps.is_finite() || steps >= MAX_SWEEP_POINTS as f64 {
            return Err(Error::invalid(
                field,
                format!(
                    "sweep from {} to {} with step {} exceeds {MAX_SWEEP_POINTS} points",
                    self.start, self.stop, self.step
                ),
            ));
        }
        Ok(())
    }

    fn steps(&self) -> f64 {
        (((self.stop - self.start) / self.step).max(0.0) + SWEEP_TOLERANCE).floor()
    }

    /// Number of values, at most [`MAX_SWEEP_POINTS`] even for an unvalidated range.
    pub fn len(&self) -> usize {
        (self.steps() as usize).saturating_add(1).min(MAX_SWEEP_POINTS)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn values(&self) -> Vec<f64> {
        (0..self.len())
            .map(|i| self.start + i as f64 * self.step)
            .collect()
    }
}

/// Names of the elements and operations the experiments refer to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementKeys {
    pub resonator: String,
    pub helper: String,
    pub amplifier: String,
    pub switch: String,
    /// Operation played as the final excitation pulse.
    pub pi_half: String,
}

impl Default for ElementKeys {
    fn default() -> Self {
        ElementKeys {
            resonator: "resonator".to_string(),
            helper: "helper".to_string(),
            amplifier: "amplifier".to_string(),
            switch: "switch".to_string(),
            pi_half: "pi_half".to_string(),
        }
    }
}

/// Physical parameters of one experiment.
///
/// Durations are in nanoseconds, frequencies in hertz and amplitudes normalized
/// to the full scale of the output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentSettings {
    pub experiment_name: String,
    /// Repetitions averaged into each sweep point.
    pub n_avg: u32,
    pub pulse_length: Nanoseconds,
    pub pulse_amplitude: f64,
    /// Demodulation rotation in degrees; any real value, folded into [0, 360).
    pub rotation_angle: f64,
    pub const_len: Nanoseconds,
    pub const_amp: f64,
    /// Relaxation wait between repetitions (about 5 T1).
    pub thermal_reset: Nanoseconds,
    pub center_freq: Hz,
    pub offset_freq: Hz,
    /// Dead time between the end of excitation and the first acquisition window.
    pub readout_delay: Nanoseconds,
    pub readout_amp: f64,
    /// Length of one acquisition window.
    pub dwell_time: Nanoseconds,
    pub readout_start: Nanoseconds,
    pub readout_end: Nanoseconds,
    pub excitation_length: Nanoseconds,
    pub excitation_amp: f64,
    /// Values of the swept command parameter, if the experiment sweeps one.
    pub sweep: Option<SweepRange>,
    pub qop_host: String,
    pub qop_port: u16,
    pub cluster: String,
    pub keys: ElementKeys,
    pub save_dir: Option<PathBuf>,
    /// Caller-attached fields, carried verbatim into the result metadata.
    pub metadata: IndexMap<String, Value>,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        ExperimentSettings {
            experiment_name: "nmr_experiment".to_string(),
            n_avg: 4,
            pulse_length: nanoseconds(1100.0),
            pulse_amplitude: 0.25,
            rotation_angle: 90.0,
            const_len: nanoseconds(100.0),
            const_amp: 0.03,
            thermal_reset: seconds(4.0),
            center_freq: megahertz(282.1901),
            offset_freq: hertz(750.0),
            readout_delay: microseconds(20.0),
            readout_amp: 0.01,
            dwell_time: microseconds(4.0),
            readout_start: nanoseconds(0.0),
            readout_end: microseconds(256.0),
            excitation_length: microseconds(5.0),
            excitation_amp: 0.03,
            sweep: None,
            qop_host: "192.168.88.253".to_string(),
            qop_port: 80,
            cluster: "lex".to_string(),
            keys: ElementKeys::default(),
            save_dir: None,
            metadata: IndexMap::new(),
        }
    }
}

fn require_duration(field: &str, value: Nanoseconds) -> Result<()> {
    if !value.value().is_finite() || value.value() < 0.0 {
        return Err(Error::invalid(
            field,
            format!("duration must be finite and non-negative, got {value}"),
        ));
    }
    Ok(())
}

fn require_finite(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(Error::invalid(field, "must be finite"));
    }
    Ok(())
}

impl ExperimentSettings {
    /// Carrier frequency driven on the resonator.
    pub fn rf_freq(&self) -> Hz {
        self.center_freq - self.offset_freq
    }

    pub fn rotation_angle_normalized(&self) -> f64 {
        self.rotation_angle.rem_euclid(360.0)
    }

    /// A copy with the rotation angle folded into [0, 360).
    pub fn normalized(&self) -> Self {
        ExperimentSettings {
            rotation_angle: self.rotation_angle_normalized(),
            ..self.clone()
        }
    }

    /// Number of acquisition windows between `readout_start` and `readout_end`.
    pub fn acquisition_points(&self) -> usize {
        let window = self.readout_end.value() - self.readout_start.value();
        if self.dwell_time.value() <= 0.0 || window <= 0.0 {
            return 0;
        }
        (window / self.dwell_time.value()).floor() as usize
    }

    pub fn sweep_values(&self) -> Option<Vec<f64>> {
        self.sweep.map(|range| range.values())
    }

    /// Checks physical plausibility of every parameter.
    ///
    /// Pure: the settings are not modified.
    pub fn validate(&self) -> Result<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(Error::invalid("experiment_name", "must not be empty"));
        }
        if self.n_avg < 1 {
            return Err(Error::invalid("n_avg", "must be at least 1"));
        }
        for (field, value) in [
            ("pulse_length", self.pulse_length),
            ("const_len", self.const_len),
            ("thermal_reset", self.thermal_reset),
            ("readout_delay", self.readout_delay),
            ("dwell_time", self.dwell_time),
            ("readout_start", self.readout_start),
            ("readout_end", self.readout_end),
            ("excitation_length", self.excitation_length),
        ] {
            require_duration(field, value)?;
        }
        for (field, value) in [
            ("pulse_amplitude", self.pulse_amplitude),
            ("const_amp", self.const_amp),
            ("readout_amp", self.readout_amp),
            ("excitation_amp", self.excitation_amp),
            ("rotation_angle", self.rotation_angle),
        ] {
            require_finite(field, value)?;
        }
        if self.pulse_length.value() < MIN_PULSE_LENGTH_NS {
            return Err(Error::invalid(
                "pulse_length",
                format!(
                    "must be at least {MIN_PULSE_LENGTH_NS} ns, got {}",
                    self.pulse_length
                ),
            ));
        }
        if self.pulse_amplitude.abs() > MAX_PULSE_AMPLITUDE {
            return Err(Error::invalid(
                "pulse_amplitude",
                format!(
                    "magnitude must not exceed {MAX_PULSE_AMPLITUDE}, got {}",
                    self.pulse_amplitude
                ),
            ));
        }
        if self.readout_delay.value() < MIN_READOUT_DELAY_NS {
            return Err(Error::invalid(
                "readout_delay",
                format!(
                    "must be at least {MIN_READOUT_DELAY_NS} ns, got {}",
                    self.readout_delay
                ),
            ));
        }
        let rf = self.rf_freq().value();
        if !rf.is_finite() || !(0.0..MAX_RF_FREQUENCY_HZ).contains(&rf) {
            return Err(Error::invalid(
                "center_freq",
                format!("center_freq - offset_freq must lie in [0, 750 MHz), got {rf} Hz"),
            ));
        }
        if self.dwell_time.value() <= 0.0 {
            return Err(Error::invalid("dwell_time", "must be positive"));
        }
        if self.readout_end <= self.readout_start {
            return Err(Error::invalid(
                "readout_end",
                format!(
                    "acquisition window is empty: start {}, end {}",
                    self.readout_start, self.readout_end
                ),
            ));
        }
        let window = self.readout_end.value() - self.readout_start.value();
        let windows = window / self.dwell_time.value();
        if (windows - windows.round()).abs() > 1e-9 {
            return Err(Error::invalid(
                "readout_end",
                format!(
                    "acquisition window of {window} ns is not a whole number of dwell times ({})",
                    self.dwell_time
                ),
            ));
        }
        if let Some(sweep) = &self.sweep {
            sweep.validate("sweep")?;
        }
        if self.qop_host.is_empty() {
            return Err(Error::invalid("qop_host", "must not be empty"));
        }
        Ok(())
    }

    /// Applies several changes at once.
    ///
    /// The changes are validated on a tentative copy; on any error nothing is
    /// applied. Returns the fields whose value actually changed.
    pub fn update(&mut self, changes: &Map<String, Value>) -> Result<IndexMap<String, Value>> {
        let before = self.to_value()?;
        let Value::Object(mut fields) = before.clone() else {
            return Err(Error::new("settings did not serialize to an object"));
        };
        for (key, value) in changes {
            let Some(slot) = fields.get_mut(key) else {
                return Err(Error::UnknownSetting(key.clone()));
            };
            *slot = value.clone();
        }
        let tentative: ExperimentSettings = serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::invalid("update", e))?;
        tentative.validate()?;

        let after = tentative.to_value()?;
        let changed = changes
            .keys()
            .filter(|key| before.get(key.as_str()) != after.get(key.as_str()))
            .filter_map(|key| after.get(key.as_str()).map(|v| (key.clone(), v.clone())))
            .collect::<IndexMap<_, _>>();
        *self = tentative;
        if !changed.is_empty() {
            nmr_log::info!("Updated settings: {:?}", changed.keys().collect::<Vec<_>>());
        }
        Ok(changed)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let settings: ExperimentSettings = serde_json::from_value(value)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let settings: ExperimentSettings = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = ExperimentSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.rf_freq(), hertz(282_189_350.0));
        assert_eq!(settings.acquisition_points(), 64);
    }

    #[test]
    fn test_validation_names_field() {
        let cases: Vec<(&str, Value)> = vec![
            ("n_avg", json!({"n_avg": 0})),
            ("pulse_length", json!({"pulse_length": 32.0})),
            ("pulse_amplitude", json!({"pulse_amplitude": -0.6})),
            ("readout_delay", json!({"readout_delay": 4000.0})),
            ("center_freq", json!({"center_freq": 800e6})),
            ("center_freq", json!({"offset_freq": 300e6})),
            ("readout_end", json!({"readout_end": 0.0})),
            ("readout_end", json!({"readout_end": 255_000.0})),
            ("sweep", json!({"sweep": {"start": 0.0, "stop": 1.0, "step": -0.1}})),
        ];
        for (field, change) in cases {
            let mut settings = ExperimentSettings::default();
            let err = settings.update(&changes(change)).unwrap_err();
            assert_eq!(err.field(), Some(field), "{err}");
            assert_eq!(settings, ExperimentSettings::default());
        }
    }

    #[test]
    fn test_update_is_atomic() {
        let mut settings = ExperimentSettings::default();
        let result = settings.update(&changes(json!({
            "n_avg": 16,
            "pulse_amplitude": 0.9,
        })));
        assert!(result.is_err());
        assert_eq!(settings.n_avg, 4);
    }

    #[test]
    fn test_update_reports_changed_fields() {
        let mut settings = ExperimentSettings::default();
        let changed = settings
            .update(&changes(json!({
                "n_avg": 16,
                "pulse_amplitude": 0.25,
                "rotation_angle": 450.0,
            })))
            .unwrap();
        assert_eq!(changed.keys().collect::<Vec<_>>(), vec!["n_avg", "rotation_angle"]);
        assert_eq!(settings.n_avg, 16);
        assert_eq!(settings.rotation_angle_normalized(), 90.0);
        assert_eq!(settings.normalized().rotation_angle, 90.0);
    }

    #[test]
    fn test_update_rejects_unknown_key() {
        let mut settings = ExperimentSettings::default();
        let err = settings
            .update(&changes(json!({"not_a_setting": 1})))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSetting(name) if name == "not_a_setting"));
    }

    #[test]
    fn test_value_round_trip_keeps_metadata() {
        let mut settings = ExperimentSettings::default();
        settings
            .metadata
            .insert("sample".to_string(), json!("glycine"));
        settings.sweep = Some(SweepRange::new(0.0, 0.3, 0.1).unwrap());
        let restored = ExperimentSettings::from_value(settings.to_value().unwrap()).unwrap();
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("nmr_settings_{}.json", std::process::id()));
        let settings = ExperimentSettings {
            n_avg: 32,
            ..Default::default()
        };
        settings.save_to_file(&path).unwrap();
        let loaded = ExperimentSettings::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_sweep_range() {
        let range = SweepRange::new(0.0, 0.3, 0.1).unwrap();
        assert_eq!(range.len(), 4);
        let values = range.values();
        assert!((values[3] - 0.3).abs() < 1e-12);

        let down = SweepRange::new(10.0, 0.0, -5.0).unwrap();
        assert_eq!(down.values(), vec![10.0, 5.0, 0.0]);

        assert_eq!(SweepRange::single(2.0).values(), vec![2.0]);
        assert!(SweepRange::new(0.0, 1.0, 0.0).is_err());
        assert!(SweepRange::new(0.0, f64::NAN, 1.0).is_err());
    }

    #[test]
    fn test_sweep_range_point_limit() {
        let err = SweepRange::new(0.0, 1e3, 1e-17).unwrap_err();
        assert_eq!(err.field(), Some("sweep"));
        assert!(SweepRange::new(0.0, 1e-300, 1e-310).is_err());
        let last = (MAX_SWEEP_POINTS - 1) as f64;
        assert_eq!(SweepRange::new(0.0, last, 1.0).unwrap().len(), MAX_SWEEP_POINTS);
        assert!(SweepRange::new(0.0, last + 1.0, 1.0).is_err());

        // Built without validation, the range is still bounded.
        let unchecked = SweepRange {
            start: 0.0,
            stop: 1e3,
            step: 1e-17,
        };
        assert_eq!(unchecked.len(), MAX_SWEEP_POINTS);
        assert_eq!(unchecked.values().len(), MAX_SWEEP_POINTS);
    }
}
