// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! A device runtime that executes programs in software.
//!
//! The simulator interprets the program tree on submission, applying the
//! runtime guards the way the sequencer does, and hands the results out in
//! batches. Failures can be scripted per fetch.

use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, TAU};

use indexmap::IndexMap;
use nmr_config::DeviceConfig;
use nmr_units::cycles::to_nanoseconds;
use nmr_units::duration::clock_cycles;
use nmr_units::{CLOCK_CYCLE_NS, Nanoseconds};
use num_complex::Complex64;

use crate::device::{DeviceError, DeviceRuntime, FetchReport};
use crate::live::DEMOD_FULL_SCALE;
use crate::node::Node;
use crate::program::{Bindings, LoopKind, Op, Param, PulseProgram};
use crate::safety::{ClampEvent, Guarded, Origin, guard};

/// Response of the simulated sample and probe.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalModel {
    /// Drive area (amplitude times nanoseconds) of a 90 degree rotation.
    pub nutation_area: f64,
    /// FID amplitude after a 90 degree rotation, in volts.
    pub fid_volts: f64,
    /// Free-precession frequency relative to the drive.
    pub detuning_hz: f64,
    pub t2_ns: f64,
    /// Probe resonance; the configured frequency of the measured element if unset.
    pub resonance_hz: Option<f64>,
    pub resonance_width_hz: f64,
    /// Fraction of the probe power absorbed on resonance.
    pub resonance_depth: f64,
}

impl Default for SignalModel {
    fn default() -> Self {
        SignalModel {
            nutation_area: 275.0,
            fid_volts: 1e-3,
            detuning_hz: 750.0,
            t2_ns: 200_000.0,
            resonance_hz: None,
            resonance_width_hz: 200e3,
            resonance_depth: 0.9,
        }
    }
}

impl SignalModel {
    fn fid(&self, drive_area: f64, t_ns: f64) -> Complex64 {
        let amplitude = self.fid_volts * (FRAC_PI_2 * drive_area / self.nutation_area).sin();
        let decay = (-t_ns / self.t2_ns).exp();
        Complex64::from_polar(amplitude * decay, TAU * self.detuning_hz * t_ns * 1e-9)
    }

    fn reflection(&self, probe_volts: f64, frequency: f64, resonance: f64) -> Complex64 {
        let x = 2.0 * (frequency - resonance) / self.resonance_width_hz;
        let response = Complex64::new(1.0, 0.0)
            - Complex64::new(self.resonance_depth, 0.0) / Complex64::new(1.0, x);
        response * probe_volts
    }
}

/// One averaged point of every stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPoint {
    /// Raw demodulation results.
    pub values: IndexMap<String, f64>,
    pub clamp_events: Vec<ClampEvent>,
}

/// Outcome of interpreting a program.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub total_cycles: i64,
    pub shots: u64,
    pub points: Vec<SimulatedPoint>,
}

impl SimulationReport {
    pub fn duration(&self) -> Nanoseconds {
        to_nanoseconds(clock_cycles(self.total_cycles))
    }

    pub fn clamp_events(&self) -> impl Iterator<Item = &ClampEvent> {
        self.points.iter().flat_map(|p| p.clamp_events.iter())
    }
}

/// Executes `program` against `config`.
pub fn simulate(
    program: &PulseProgram,
    config: &DeviceConfig,
    signal: &SignalModel,
) -> Result<SimulationReport, DeviceError> {
    let mut interpreter = Interpreter {
        config,
        signal,
        bindings: Bindings::new(),
        clock: 0,
        drive_end: 0,
        drive_area: 0.0,
        drive_open: false,
        frequencies: IndexMap::new(),
        sums: None,
        shot: 0,
        clamps: vec![],
        points: vec![],
    };
    interpreter.run(&program.root)?;
    Ok(SimulationReport {
        total_cycles: interpreter.clock,
        shots: interpreter.shot,
        points: interpreter.points,
    })
}

struct Interpreter<'a> {
    config: &'a DeviceConfig,
    signal: &'a SignalModel,
    bindings: Bindings,
    clock: i64,
    drive_end: i64,
    drive_area: f64,
    drive_open: bool,
    frequencies: IndexMap<String, f64>,
    // Per-stream sum and count inside an averaging loop.
    sums: Option<IndexMap<String, (f64, u32)>>,
    shot: u64,
    clamps: Vec<ClampEvent>,
    points: Vec<SimulatedPoint>,
}

fn fault(err: impl std::fmt::Display) -> DeviceError {
    DeviceError::Fault(err.to_string())
}

impl Interpreter<'_> {
    fn run(&mut self, node: &Node<Op>) -> Result<(), DeviceError> {
        match &node.kind {
            Op::Sequence => self.run_children(node),
            Op::Loop { var, kind, values } => {
                if *kind == LoopKind::Averaging {
                    if self.sums.is_some() {
                        return Err(fault("nested averaging loops"));
                    }
                    self.sums = Some(IndexMap::new());
                }
                for index in 0..values.len() {
                    self.bindings.insert(var.clone(), index);
                    if *kind == LoopKind::Averaging {
                        self.drive_open = false;
                        self.drive_area = 0.0;
                    }
                    self.run_children(node)?;
                    if *kind == LoopKind::Averaging {
                        self.shot += 1;
                    }
                }
                self.bindings.shift_remove(var);
                if let Some(sums) = self.sums.take_if(|_| *kind == LoopKind::Averaging) {
                    self.push_point(
                        sums.into_iter()
                            .map(|(stream, (sum, count))| (stream, sum / f64::from(count.max(1))))
                            .collect(),
                    );
                }
                Ok(())
            }
            Op::Play {
                element,
                operation,
                amplitude,
                phase,
                length,
            } => {
                let pulse = self.config.pulse_for(element, operation).map_err(fault)?;
                let amplitude = self.resolve(amplitude)?;
                self.resolve(phase)?;
                let cycles = match length {
                    Some(length) => self.resolve(length)?.round() as i64,
                    None => (pulse.length.value() / CLOCK_CYCLE_NS as f64).round() as i64,
                };
                if amplitude != 0.0 {
                    if !self.drive_open {
                        self.drive_open = true;
                        self.drive_area = 0.0;
                    }
                    self.drive_area += amplitude.abs() * (cycles * CLOCK_CYCLE_NS) as f64;
                    self.drive_end = self.clock + cycles;
                }
                self.clock += cycles;
                Ok(())
            }
            Op::Wait { cycles } => {
                let cycles = self.resolve(cycles)?.round() as i64;
                self.clock += cycles.max(0);
                Ok(())
            }
            Op::Align { .. } => Ok(()),
            Op::SetFrequency { element, frequency } => {
                let frequency = self.resolve(frequency)?;
                self.frequencies.insert(element.clone(), frequency);
                Ok(())
            }
            Op::Measure {
                element,
                operation,
                streams,
                ..
            } => {
                let pulse = self.config.pulse_for(element, operation).map_err(fault)?;
                let probe = self.config.waveform_for(pulse).map_err(fault)?.peak();
                let length_ns = pulse.length.value();
                let configured = self
                    .config
                    .element(element)
                    .map_err(fault)?
                    .intermediate_frequency
                    .value();
                let signal = if probe > 0.0 {
                    let frequency = self.frequencies.get(element).copied().unwrap_or(configured);
                    let resonance = self.signal.resonance_hz.unwrap_or(configured);
                    self.signal.reflection(probe, frequency, resonance)
                } else {
                    let t_ns =
                        ((self.clock - self.drive_end) * CLOCK_CYCLE_NS) as f64 + length_ns / 2.0;
                    self.signal.fid(self.drive_area, t_ns)
                };
                let raw = |volts: f64| volts * length_ns / DEMOD_FULL_SCALE;
                self.drive_open = false;
                self.clock += (length_ns / CLOCK_CYCLE_NS as f64).round() as i64;
                let values = [(&streams[0], raw(signal.re)), (&streams[1], raw(signal.im))];
                match &mut self.sums {
                    Some(sums) => {
                        for (stream, value) in values {
                            let entry = sums.entry(stream.clone()).or_insert((0.0, 0));
                            entry.0 += value;
                            entry.1 += 1;
                        }
                    }
                    None => self.push_point(
                        values
                            .into_iter()
                            .map(|(stream, value)| (stream.clone(), value))
                            .collect(),
                    ),
                }
                Ok(())
            }
        }
    }

    fn run_children(&mut self, node: &Node<Op>) -> Result<(), DeviceError> {
        for child in &node.children {
            self.run(child)?;
        }
        Ok(())
    }

    fn push_point(&mut self, values: IndexMap<String, f64>) {
        self.points.push(SimulatedPoint {
            values,
            clamp_events: std::mem::take(&mut self.clamps),
        });
    }

    fn resolve(&mut self, param: &Param) -> Result<f64, DeviceError> {
        let value = param
            .expr
            .eval(&self.bindings)
            .ok_or_else(|| fault(format!("unbound loop variable in '{}'", param.expr)))?;
        let Some(ceiling) = &param.guard else {
            return Ok(value);
        };
        match guard(value, ceiling.limit, Origin::Runtime) {
            Guarded::Accepted(value) => Ok(value),
            Guarded::Clamped { requested, emitted } => {
                self.clamps.push(ClampEvent {
                    site: ceiling.site.clone(),
                    quantity: ceiling.quantity,
                    requested,
                    emitted,
                    shot: self.shot,
                });
                Ok(emitted)
            }
            Guarded::Rejected { reason, .. } => Err(fault(format!("{}: {reason}", ceiling.site))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Communication,
    Fault,
}

/// Makes `count` consecutive fetches fail, starting with fetch number `fetch` (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedFailure {
    pub fetch: usize,
    pub count: usize,
    pub kind: FailureKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorOptions {
    pub points_per_fetch: usize,
    /// Points still buffered when the device reports that it has finished.
    pub buffered_at_finish: usize,
    pub failures: Vec<ScriptedFailure>,
    pub signal: SignalModel,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        SimulatorOptions {
            points_per_fetch: 8,
            buffered_at_finish: 0,
            failures: vec![],
            signal: SignalModel::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimulatedDevice {
    options: SimulatorOptions,
    config: Option<DeviceConfig>,
    streams: Vec<String>,
    queue: VecDeque<SimulatedPoint>,
    fetches: usize,
    last_report: Option<SimulationReport>,
    outputs_safe: bool,
}

impl SimulatedDevice {
    pub fn new(options: SimulatorOptions) -> Self {
        SimulatedDevice {
            options,
            outputs_safe: true,
            ..Default::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches
    }

    pub fn outputs_safe(&self) -> bool {
        self.outputs_safe
    }

    /// Timing of the last submitted program.
    pub fn last_report(&self) -> Option<&SimulationReport> {
        self.last_report.as_ref()
    }

    fn scripted_failure(&self) -> Option<FailureKind> {
        self.options
            .failures
            .iter()
            .find(|f| (f.fetch..f.fetch + f.count).contains(&self.fetches))
            .map(|f| f.kind)
    }
}

impl DeviceRuntime for SimulatedDevice {
    fn upload_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
        self.config = Some(config.clone());
        Ok(())
    }

    fn submit(&mut self, program: &PulseProgram) -> Result<(), DeviceError> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| DeviceError::Communication("no configuration uploaded".to_string()))?;
        program.validate_against(config).map_err(fault)?;
        let report = simulate(program, config, &self.options.signal)?;
        self.streams = program.streams.clone();
        self.queue = report.points.iter().cloned().collect();
        self.last_report = Some(report);
        self.fetches = 0;
        self.outputs_safe = false;
        Ok(())
    }

    fn fetch(&mut self) -> Result<FetchReport, DeviceError> {
        self.fetches += 1;
        match self.scripted_failure() {
            Some(FailureKind::Communication) => {
                return Err(DeviceError::Communication(format!(
                    "fetch {} timed out",
                    self.fetches
                )));
            }
            Some(FailureKind::Fault) => {
                return Err(DeviceError::Fault(format!(
                    "sequencer halted during fetch {}",
                    self.fetches
                )));
            }
            None => {}
        }
        let n = self.options.points_per_fetch.max(1).min(self.queue.len());
        let mut report = FetchReport::default();
        for stream in &self.streams {
            report.batch.channels.insert(stream.clone(), Vec::with_capacity(n));
        }
        for point in self.queue.drain(..n) {
            for (stream, value) in point.values {
                report.batch.channels.entry(stream).or_default().push(value);
            }
            report.clamp_events.extend(point.clamp_events);
        }
        report.finished = self.queue.len() <= self.options.buffered_at_finish;
        if report.finished && self.queue.is_empty() {
            self.outputs_safe = true;
        }
        Ok(report)
    }

    fn safe_shutdown(&mut self) -> Result<(), DeviceError> {
        self.queue.clear();
        self.outputs_safe = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.config = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeChild;
    use crate::program::{Expr, leaf};
    use crate::safety::{Ceiling, Quantity};
    use nmr_config::{ExperimentSettings, config_from_settings};

    fn config() -> DeviceConfig {
        config_from_settings(&ExperimentSettings::default()).unwrap()
    }

    fn measure() -> NodeChild<Op> {
        leaf(Op::Measure {
            element: "resonator".to_string(),
            operation: "no_pulse_readout".to_string(),
            demod: ["rotated_cos".to_string(), "rotated_sin".to_string()],
            streams: ["I".to_string(), "Q".to_string()],
        })
    }

    fn averaged(n_avg: usize, body: Vec<NodeChild<Op>>) -> PulseProgram {
        let avg = Node::with_children(
            Op::Loop {
                var: "n".to_string(),
                kind: LoopKind::Averaging,
                values: vec![0.0; n_avg],
            },
            body,
        );
        PulseProgram {
            root: Node::with_children(Op::Sequence, vec![avg.into()]).into(),
            streams: vec!["I".to_string(), "Q".to_string()],
            expected_points: 1,
            n_avg: n_avg as u32,
        }
    }

    #[test]
    fn test_timing_is_counted_in_cycles() {
        let program = averaged(
            2,
            vec![
                leaf(Op::play("resonator", "pi_half", 0.25)),
                leaf(Op::wait(1000)),
                measure(),
            ],
        );
        let report = simulate(&program, &config(), &SignalModel::default()).unwrap();
        // pi_half 1100 ns, wait 1000 cycles, dwell 4 us
        assert_eq!(report.total_cycles, 2 * (275 + 1000 + 1000));
        assert_eq!(report.shots, 2);
        assert_eq!(report.points.len(), 1);
        assert_eq!(report.duration(), nmr_units::duration::nanoseconds(18200.0));
    }

    #[test]
    fn test_ninety_degree_pulse_gives_full_signal() {
        let program = averaged(1, vec![leaf(Op::play("resonator", "pi_half", 0.25)), measure()]);
        let signal = SignalModel {
            detuning_hz: 0.0,
            t2_ns: f64::INFINITY,
            ..SignalModel::default()
        };
        let report = simulate(&program, &config(), &signal).unwrap();
        let i = report.points[0].values["I"];
        let volts = i * DEMOD_FULL_SCALE / 4000.0;
        assert!((volts - signal.fid_volts).abs() < 1e-12);
    }

    #[test]
    fn test_runtime_clamps_are_recorded_per_occurrence() {
        let amplitude = Param::guarded(
            Expr::Table {
                var: "n".to_string(),
                values: vec![0.2, 0.9, 0.7],
            },
            Ceiling {
                site: "commands[0].amplitude".to_string(),
                quantity: Quantity::Amplitude,
                limit: 0.5,
            },
        );
        let play = Op::Play {
            element: "resonator".to_string(),
            operation: "pi_half".to_string(),
            amplitude,
            phase: Param::constant(0.0),
            length: None,
        };
        let program = averaged(3, vec![leaf(play), measure()]);
        let report = simulate(&program, &config(), &SignalModel::default()).unwrap();
        let events: Vec<&ClampEvent> = report.clamp_events().collect();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].shot, events[0].requested, events[0].emitted), (1, 0.9, 0.5));
        assert_eq!(events[1].shot, 2);
    }

    #[test]
    fn test_fetch_batches_and_scripted_failures() {
        let mut device = SimulatedDevice::new(SimulatorOptions {
            points_per_fetch: 1,
            failures: vec![ScriptedFailure {
                fetch: 2,
                count: 1,
                kind: FailureKind::Communication,
            }],
            ..SimulatorOptions::default()
        });
        let program = averaged(1, vec![measure(), measure()]);
        assert!(matches!(
            device.submit(&program),
            Err(DeviceError::Communication(_))
        ));
        device.upload_config(&config()).unwrap();
        // Without an averaging loop every measurement is its own point.
        let program = PulseProgram {
            root: Node::with_children(Op::Sequence, vec![measure(), measure()]).into(),
            ..program
        };
        device.submit(&program).unwrap();
        assert!(!device.outputs_safe());
        let first = device.fetch().unwrap();
        assert_eq!(first.batch.points().unwrap(), 1);
        assert!(!first.finished);
        assert!(device.fetch().is_err());
        let last = device.fetch().unwrap();
        assert!(last.finished);
        assert!(device.fetch().unwrap().batch.is_empty());
        assert!(device.outputs_safe());
    }
}
