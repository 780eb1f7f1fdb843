// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! An experiment from its commands to the acquired data.
//!
//! An [`Experiment`] is validated against the settings, compiled into a
//! [`PulseProgram`], submitted to a [`DeviceSession`] and then polled until
//! the device has delivered every point. Every failure leaves the experiment
//! in [`State::Failed`] with the data acquired so far marked incomplete.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::Receiver;
use indexmap::IndexMap;
use nmr_config::{DeviceConfig, DeviceTraits, ExperimentSettings, OPX1000_LF_TRAITS};
use nmr_units::cycles::to_nanoseconds;
use nmr_units::{CLOCK_CYCLE_NS, ClockCycles, Hz, MIN_WAIT_CYCLES, Nanoseconds};

use crate::command::{Command, PulseCommand, SweepVariable, Sweepable};
use crate::device::{DeviceError, DeviceSession, FetchReport};
use crate::error::{Error, Result};
use crate::live::{Accumulator, BufferEvent, DataSet, Observers, Transform, apply_all};
use crate::node::{Node, NodeChild};
use crate::program::{Expr, LoopKind, Op, Param, PulseProgram, leaf};
use crate::result::{Completion, ExperimentResult, ResultMetadata, ShutdownRecord};
use crate::safety::{
    ClampEvent, ClampSummary, Lines, MIN_PRE_SCAN_CYCLES, SafetyLimits, TTL_OFF, TTL_ON,
    drive_mode, pre_scan_cycles, readout_mode, safe_mode,
};
use crate::simulator::{SignalModel, SimulationReport, simulate};
use crate::spectroscopy::{BYPASS_NOTICE, BypassWiring};
use crate::state::{Event, State};
use crate::sweep::{SweepAxis, SweepGeometry, SweepPlan};
use crate::timing::{Quantizer, RoundingWarning, TimingClass};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const ACQUISITION_VAR: &str = "t";
pub const SWEEP_VAR: &str = "sweep";
pub const FREQUENCY_VAR: &str = "f";
pub const STREAMS: [&str; 2] = ["I", "Q"];

/// Requests an abort from another thread. Honoured at the next poll boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub poll_interval: Duration,
    /// Extra attempts for a fetch that failed with a communication error.
    pub max_fetch_retries: u32,
    pub abort: AbortHandle,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_fetch_retries: 1,
            abort: AbortHandle::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Acquisition {
    /// Free induction decay after the commands, received with the amplifier blanked.
    Fid,
    /// Reflected probe power versus frequency.
    Reflection {
        frequencies: Vec<f64>,
        wiring: BypassWiring,
    },
}

struct Compiled {
    program: PulseProgram,
    plan: SweepPlan,
    transforms: Vec<Transform>,
    channels: Vec<String>,
    warnings: Vec<RoundingWarning>,
}

fn device_traits(config: &DeviceConfig) -> &'static DeviceTraits {
    config
        .controllers
        .values()
        .find_map(|c| {
            c.modules
                .values()
                .find_map(|m| DeviceTraits::from_model(&c.model, &m.kind))
        })
        .unwrap_or(&OPX1000_LF_TRAITS)
}

fn cycles_of(length: Nanoseconds) -> i64 {
    (length.value() / CLOCK_CYCLE_NS as f64).round() as i64
}

fn shortest(param: &Param) -> i64 {
    let value = match &param.expr {
        Expr::Const(value) => *value,
        Expr::Table { values, .. } => values.iter().copied().fold(f64::INFINITY, f64::min),
        Expr::Linear { base, .. } => *base,
    };
    value.round() as i64
}

fn require_finite(field: &str, values: &[f64]) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(Error::compilation(field, "values must be finite"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct Experiment<'a> {
    settings: &'a ExperimentSettings,
    config: &'a DeviceConfig,
    traits: &'static DeviceTraits,
    geometry: SweepGeometry,
    acquisition: Acquisition,
    limits: SafetyLimits,
    commands: Vec<Command>,
    sweep: SweepVariable,
    sweep_label: String,
    sweep_axis: Option<Vec<f64>>,
    start_with_wait: bool,
    state: State,
    program: Option<PulseProgram>,
    plan: Option<SweepPlan>,
    transforms: Vec<Transform>,
    channels: Vec<String>,
    warnings: Vec<RoundingWarning>,
    accumulator: Option<Accumulator>,
    polls: u64,
    observers: Observers,
    clamps: ClampSummary,
    clamp_events: Vec<ClampEvent>,
    completion: Option<Completion>,
    save_data_dict: IndexMap<String, DataSet>,
    shutdown: Option<ShutdownRecord>,
    notices: Vec<String>,
}

impl<'a> Experiment<'a> {
    /// FID experiment over the acquisition axis.
    pub fn one_d(settings: &'a ExperimentSettings, config: &'a DeviceConfig) -> Self {
        Self::new(SweepGeometry::Sweep1D, Acquisition::Fid, settings, config)
    }

    /// FID experiment over the sweep variable and the acquisition axis.
    pub fn two_d(settings: &'a ExperimentSettings, config: &'a DeviceConfig) -> Self {
        Self::new(SweepGeometry::Sweep2D, Acquisition::Fid, settings, config)
    }

    pub(crate) fn new(
        geometry: SweepGeometry,
        acquisition: Acquisition,
        settings: &'a ExperimentSettings,
        config: &'a DeviceConfig,
    ) -> Self {
        let traits = device_traits(config);
        Experiment {
            settings,
            config,
            traits,
            geometry,
            acquisition,
            limits: SafetyLimits::from_traits(traits),
            commands: vec![],
            sweep: SweepVariable::default(),
            sweep_label: SWEEP_VAR.to_string(),
            sweep_axis: None,
            start_with_wait: true,
            state: State::Created,
            program: None,
            plan: None,
            transforms: vec![],
            channels: vec![],
            warnings: vec![],
            accumulator: None,
            polls: 0,
            observers: Observers::default(),
            clamps: ClampSummary::default(),
            clamp_events: vec![],
            completion: None,
            save_data_dict: IndexMap::new(),
            shutdown: None,
            notices: vec![],
        }
    }

    /// Replaces the safety ceilings. Only lowering them is meaningful; the
    /// device limits still apply in the configuration.
    pub fn with_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn geometry(&self) -> SweepGeometry {
        self.geometry
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn program(&self) -> Option<&PulseProgram> {
        self.program.as_ref()
    }

    pub fn plan(&self) -> Option<&SweepPlan> {
        self.plan.as_ref()
    }

    pub fn rounding_warnings(&self) -> &[RoundingWarning] {
        &self.warnings
    }

    pub fn clamp_summary(&self) -> &ClampSummary {
        &self.clamps
    }

    pub fn clamp_events(&self) -> &[ClampEvent] {
        &self.clamp_events
    }

    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// Data acquired so far. Rows of a 2D sweep appear only once complete.
    pub fn live_data(&self) -> Option<&IndexMap<String, DataSet>> {
        self.accumulator.as_ref().map(Accumulator::data)
    }

    /// The acquired data, frozen when the experiment ends.
    pub fn save_data_dict(&self) -> &IndexMap<String, DataSet> {
        &self.save_data_dict
    }

    pub fn subscribe(&mut self, capacity: usize) -> Receiver<BufferEvent> {
        self.observers.subscribe(capacity)
    }

    fn ensure_editable(&self) -> Result<()> {
        if self.state != State::Created {
            return Err(Error::validation(
                "commands",
                format!("commands cannot change in state {:?}", self.state),
            ));
        }
        Ok(())
    }

    fn push_command(&mut self, command: Command) -> Result<&mut Self> {
        self.ensure_editable()?;
        let index = self.commands.len();
        let mut sweep = self.sweep.clone();
        for (arg, values) in command.swept_arguments() {
            sweep.register(&format!("commands[{index}].{arg}"), &values)?;
        }
        self.sweep = sweep;
        self.commands.push(command);
        Ok(self)
    }

    pub fn add_pulse(&mut self, pulse: PulseCommand) -> Result<&mut Self> {
        self.config.pulse_for(&pulse.element, &pulse.operation)?;
        self.push_command(Command::Pulse(pulse))
    }

    pub fn add_delay(&mut self, duration: Sweepable<Nanoseconds>) -> Result<&mut Self> {
        self.push_command(Command::Delay(duration))
    }

    pub fn add_align(&mut self, elements: Option<Vec<String>>) -> Result<&mut Self> {
        for element in elements.iter().flatten() {
            self.config.element(element)?;
        }
        self.push_command(Command::Align(elements))
    }

    pub fn add_frequency(&mut self, element: &str, frequency: Sweepable<Hz>) -> Result<&mut Self> {
        self.config.element(element)?;
        self.push_command(Command::Frequency {
            element: element.to_string(),
            frequency,
        })
    }

    /// Skips the relaxation wait before the first repetition.
    pub fn remove_initial_delay(&mut self, remove: bool) -> &mut Self {
        self.start_with_wait = !remove;
        self
    }

    pub fn update_sweep_label(&mut self, label: &str) -> &mut Self {
        self.sweep_label = label.to_string();
        self
    }

    /// Values shown on the sweep axis instead of the sweep variable itself.
    pub fn update_sweep_axis(&mut self, values: Vec<f64>) -> &mut Self {
        self.sweep_axis = Some(values);
        self
    }

    fn transition(&mut self, event: Event) -> Result<()> {
        self.state = self.state.transition(event)?;
        Ok(())
    }

    /// Checks the experiment against the settings and the configuration.
    pub fn validate_experiment(&mut self) -> Result<()> {
        if self.state != State::Created {
            return Err(Error::InvalidTransition {
                from: self.state,
                event: Event::Validated,
            });
        }
        if let Err(err) = self.check() {
            self.fail(&err);
            return Err(err);
        }
        if let Acquisition::Reflection { .. } = self.acquisition {
            nmr_log::warn!("{}", BYPASS_NOTICE);
            self.notices.push(BYPASS_NOTICE.to_string());
        }
        self.transition(Event::Validated)
    }

    fn check(&self) -> Result<()> {
        let s = self.settings;
        s.validate()?;
        let keys = &s.keys;
        for line in [&keys.switch, &keys.amplifier] {
            for operation in [TTL_ON, TTL_OFF] {
                self.config.pulse_for(line, operation)?;
            }
        }
        let delay_cycles = (s.readout_delay.value() / CLOCK_CYCLE_NS as f64).floor() as i64;
        if pre_scan_cycles(delay_cycles) < MIN_PRE_SCAN_CYCLES {
            return Err(Error::validation(
                "readout_delay",
                format!(
                    "{} leaves no time for the amplifier and receiver switching",
                    s.readout_delay
                ),
            ));
        }

        match &self.acquisition {
            Acquisition::Fid => {
                self.config.pulse_for(&keys.resonator, "no_pulse_readout")?;
                if self.commands.is_empty() {
                    return Err(Error::validation("commands", "no commands to play"));
                }
                if s.acquisition_points() == 0 {
                    return Err(Error::validation(
                        "readout_end",
                        "acquisition window holds no dwell period",
                    ));
                }
                let window = s.readout_delay + s.readout_end;
                if window > s.thermal_reset {
                    return Err(Error::validation(
                        "thermal_reset",
                        format!(
                            "acquisition ends {window} after the excitation, longer than the repetition wait of {}",
                            s.thermal_reset
                        ),
                    ));
                }
                match self.geometry {
                    SweepGeometry::Sweep1D if self.sweep.is_defined() => {
                        return Err(Error::validation(
                            "sweep",
                            "a 1D experiment sweeps only the acquisition axis; use a 2D experiment for swept commands",
                        ));
                    }
                    SweepGeometry::Sweep2D if !self.sweep.is_defined() => {
                        return Err(Error::validation(
                            "sweep",
                            "a 2D experiment needs at least one swept command argument",
                        ));
                    }
                    _ => {}
                }
                if let Some(axis) = &self.sweep_axis
                    && axis.len() != self.sweep.len()
                {
                    return Err(Error::validation(
                        "sweep_axis",
                        format!(
                            "{} axis values for a sweep of {} points",
                            axis.len(),
                            self.sweep.len()
                        ),
                    ));
                }
            }
            Acquisition::Reflection {
                frequencies,
                wiring,
            } => {
                if *wiring != BypassWiring::Confirmed {
                    return Err(Error::validation(
                        "amplifier_bypass",
                        "the operator has not confirmed the amplifier bypass wiring",
                    ));
                }
                self.config.pulse_for(&keys.resonator, "readout")?;
                if frequencies.is_empty() {
                    return Err(Error::validation("frequencies", "no probe frequencies"));
                }
            }
        }
        Ok(())
    }

    /// Compiles the experiment into a pulse program.
    pub fn create_experiment(&mut self) -> Result<&PulseProgram> {
        if self.state != State::Validated {
            return Err(Error::InvalidTransition {
                from: self.state,
                event: Event::Compiled,
            });
        }
        let compiled = match self.compile() {
            Ok(compiled) => compiled,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        self.transition(Event::Compiled)?;
        nmr_log::info!(
            "Compiled '{}': {} points, {} runtime guard(s)",
            self.settings.experiment_name,
            compiled.program.expected_points,
            compiled.program.runtime_guards().len()
        );
        self.plan = Some(compiled.plan);
        self.transforms = compiled.transforms;
        self.channels = compiled.channels;
        self.warnings = compiled.warnings;
        Ok(&*self.program.insert(compiled.program))
    }

    fn compile(&self) -> Result<Compiled> {
        let s = self.settings;
        let keys = &s.keys;
        let lines = Lines {
            switch: &keys.switch,
            amplifier: &keys.amplifier,
        };
        let mut q = Quantizer::new();
        let delay = q.quantize("readout_delay", s.readout_delay, TimingClass::SafetyRelevant)?;
        let pre_scan = pre_scan_cycles(delay.value());
        if pre_scan < MIN_PRE_SCAN_CYCLES {
            return Err(Error::Timing {
                field: "readout_delay".to_string(),
                value: s.readout_delay,
                reason: "shorter than the switching sequence".to_string(),
            });
        }
        let thermal = q.wait("thermal_reset", s.thermal_reset, TimingClass::Cosmetic)?;

        let mut body = vec![];
        let (plan, transforms, channels, on_cycles) = match &self.acquisition {
            Acquisition::Fid => {
                let dwell = q.quantize("dwell_time", s.dwell_time, TimingClass::SafetyRelevant)?;
                let start = q.quantize("readout_start", s.readout_start, TimingClass::Cosmetic)?;
                let dwell_ns = to_nanoseconds(dwell).value();
                let start_ns = to_nanoseconds(start).value();
                let times = (0..s.acquisition_points())
                    .map(|i| (start_ns + (i as f64 + 0.5) * dwell_ns) * 1e-3)
                    .collect();
                let inner = SweepAxis::new(
                    ACQUISITION_VAR,
                    "acquisition time",
                    "us",
                    LoopKind::Acquisition,
                    times,
                );
                let plan = match self.geometry {
                    SweepGeometry::Sweep1D => SweepPlan::one_d(inner),
                    SweepGeometry::Sweep2D => SweepPlan::two_d(self.sweep_plan_axis()?, inner),
                };

                body.extend(drive_mode(lines));
                let on_cycles = self.compile_commands(&mut q, &mut body)?;
                body.extend(safe_mode(lines));
                body.push(leaf(Op::Wait {
                    cycles: Param::guarded(
                        Expr::Linear {
                            var: ACQUISITION_VAR.to_string(),
                            base: (pre_scan + start.value()) as f64,
                            step: dwell.value() as f64,
                        },
                        self.limits.wait_ceiling("acquisition_wait"),
                    ),
                }));
                body.extend(readout_mode(lines));
                body.push(leaf(measure(
                    &keys.resonator,
                    "no_pulse_readout",
                    ["rotated_cos", "rotated_sin"],
                )));
                body.extend(safe_mode(lines));
                let transforms = vec![Transform::DemodToVolts { length_ns: dwell_ns }];
                (plan, transforms, streams(), on_cycles)
            }
            Acquisition::Reflection { frequencies, .. } => {
                for (i, f) in frequencies.iter().enumerate() {
                    self.check_frequency(&format!("frequencies[{i}]"), *f)?;
                }
                let pulse = self.config.pulse_for(&keys.resonator, "readout")?;
                let probe = self.config.waveform_for(pulse)?.peak();
                self.limits
                    .check_static(&self.limits.amplitude_ceiling("readout_amp"), probe)?;
                let plan = SweepPlan::one_d(SweepAxis::new(
                    FREQUENCY_VAR,
                    "probe frequency",
                    "Hz",
                    LoopKind::Frequency,
                    frequencies.clone(),
                ));
                body.push(leaf(Op::SetFrequency {
                    element: keys.resonator.clone(),
                    frequency: Param {
                        expr: Expr::Table {
                            var: FREQUENCY_VAR.to_string(),
                            values: frequencies.clone(),
                        },
                        guard: None,
                    },
                }));
                body.extend(readout_mode(lines));
                body.push(leaf(measure(&keys.resonator, "readout", ["cos", "sin"])));
                body.extend(safe_mode(lines));
                let polar = Transform::Polar {
                    i: STREAMS[0].to_string(),
                    q: STREAMS[1].to_string(),
                };
                let channels = polar.output_channels(streams());
                let transforms = vec![
                    Transform::DemodToVolts {
                        length_ns: pulse.length.value(),
                    },
                    polar,
                ];
                (plan, transforms, channels, cycles_of(pulse.length))
            }
        };
        if let Some(thermal) = thermal {
            body.push(leaf(Op::wait(thermal.value())));
        }
        let period = self.static_cycles(&body)?;
        self.limits.check_duty_cycle(on_cycles, period)?;

        let mut root = safe_mode(lines);
        if self.start_with_wait
            && let Some(thermal) = thermal
        {
            root.push(leaf(Op::wait(thermal.value())));
        }
        root.push(plan.nest(s.n_avg, body).into());
        let program = PulseProgram {
            root: Node::with_children(Op::Sequence, root).into(),
            streams: streams(),
            expected_points: plan.total_points(),
            n_avg: s.n_avg,
        };
        program.validate_against(self.config)?;
        Ok(Compiled {
            program,
            plan,
            transforms,
            channels,
            warnings: q.into_warnings(),
        })
    }

    fn sweep_plan_axis(&self) -> Result<SweepAxis> {
        let variable = self
            .sweep
            .values()
            .ok_or_else(|| Error::validation("sweep", "no swept command argument"))?;
        let values = match (&self.sweep_axis, self.settings.sweep_values()) {
            (Some(values), _) => values.clone(),
            (None, Some(values)) if values.len() == variable.len() => values,
            _ => variable.to_vec(),
        };
        Ok(SweepAxis::new(
            SWEEP_VAR,
            &self.sweep_label,
            "",
            LoopKind::Sweep,
            values,
        ))
    }

    fn check_frequency(&self, field: &str, frequency: f64) -> Result<()> {
        if !frequency.is_finite()
            || !(0.0..self.traits.max_intermediate_frequency).contains(&frequency)
        {
            return Err(Error::compilation(
                field,
                format!(
                    "{frequency} Hz outside [0, {}) Hz",
                    self.traits.max_intermediate_frequency
                ),
            ));
        }
        Ok(())
    }

    /// Appends the commands to `body` and returns the cycles the drive is on.
    fn compile_commands(&self, q: &mut Quantizer, body: &mut Vec<NodeChild<Op>>) -> Result<i64> {
        let min_pulse = (self.traits.min_pulse_length_ns / CLOCK_CYCLE_NS as f64).ceil() as i64;
        let table = |values: Vec<f64>| Expr::Table {
            var: SWEEP_VAR.to_string(),
            values,
        };
        let mut on_cycles = 0;
        for (i, command) in self.commands.iter().enumerate() {
            let field = |arg: &str| format!("commands[{i}].{arg}");
            match command {
                Command::Pulse(p) => {
                    let pulse = self.config.pulse_for(&p.element, &p.operation)?;
                    let waveform = self.config.waveform_for(pulse)?;
                    let peak = waveform.peak();
                    let amplitude_ceiling = self.limits.amplitude_ceiling(&field("amplitude"));
                    let (amplitude, loudest) = match &p.amplitude {
                        Sweepable::Fixed(scale) => {
                            let value = self.limits.check_static(&amplitude_ceiling, scale * peak)?;
                            (Param::constant(value), value.abs())
                        }
                        Sweepable::Swept(scales) => {
                            require_finite(&field("amplitude"), scales)?;
                            let values: Vec<f64> = scales.iter().map(|s| s * peak).collect();
                            let loudest = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
                            (Param::guarded(table(values), amplitude_ceiling), loudest)
                        }
                    };
                    let phase = match &p.phase {
                        Sweepable::Fixed(degrees) => {
                            require_finite(&field("phase"), &[*degrees])?;
                            Param::constant(*degrees)
                        }
                        Sweepable::Swept(degrees) => {
                            require_finite(&field("phase"), degrees)?;
                            Param {
                                expr: table(degrees.clone()),
                                guard: None,
                            }
                        }
                    };
                    let pulse_ceiling = self.limits.pulse_ceiling(&field("length"));
                    let check_length = |field: &str, cycles: ClockCycles| -> Result<f64> {
                        if cycles.value() < min_pulse {
                            return Err(Error::compilation(
                                field,
                                format!("{cycles} is shorter than the minimum of {min_pulse} cycles"),
                            ));
                        }
                        Ok(cycles.value() as f64)
                    };
                    let (length, longest) = match &p.length {
                        None => {
                            let cycles = cycles_of(pulse.length);
                            self.limits.check_static(&pulse_ceiling, cycles as f64)?;
                            (None, cycles)
                        }
                        Some(length) => {
                            if !matches!(waveform, nmr_config::Waveform::Constant { .. }) {
                                return Err(Error::compilation(
                                    field("length"),
                                    "only pulses with a constant waveform can change length",
                                ));
                            }
                            match length {
                                Sweepable::Fixed(ns) => {
                                    let cycles = q.quantize(
                                        &field("length"),
                                        *ns,
                                        TimingClass::SafetyRelevant,
                                    )?;
                                    let cycles = check_length(&field("length"), cycles)?;
                                    self.limits.check_static(&pulse_ceiling, cycles)?;
                                    (Some(Param::constant(cycles)), cycles as i64)
                                }
                                Sweepable::Swept(lengths) => {
                                    let mut values = Vec::with_capacity(lengths.len());
                                    for (j, ns) in lengths.iter().enumerate() {
                                        let name = field(&format!("length[{j}]"));
                                        let cycles =
                                            q.quantize(&name, *ns, TimingClass::SafetyRelevant)?;
                                        values.push(check_length(&name, cycles)?);
                                    }
                                    let longest = values
                                        .iter()
                                        .fold(0.0f64, |acc, v| acc.max(*v))
                                        .min(pulse_ceiling.limit);
                                    (
                                        Some(Param::guarded(table(values), pulse_ceiling)),
                                        longest as i64,
                                    )
                                }
                            }
                        }
                    };
                    if loudest > 0.0 {
                        on_cycles += longest;
                    }
                    body.push(leaf(Op::Play {
                        element: p.element.clone(),
                        operation: p.operation.clone(),
                        amplitude,
                        phase,
                        length,
                    }));
                }
                Command::Delay(Sweepable::Fixed(ns)) => {
                    if let Some(cycles) = q.wait(&field("duration"), *ns, TimingClass::Cosmetic)? {
                        body.push(leaf(Op::wait(cycles.value())));
                    }
                }
                Command::Delay(Sweepable::Swept(durations)) => {
                    let mut values = Vec::with_capacity(durations.len());
                    for (j, ns) in durations.iter().enumerate() {
                        let name = field(&format!("duration[{j}]"));
                        let cycles = q.wait(&name, *ns, TimingClass::Cosmetic)?;
                        values.push(cycles.map_or(MIN_WAIT_CYCLES, |c| c.value()) as f64);
                    }
                    body.push(leaf(Op::Wait {
                        cycles: Param::guarded(
                            table(values),
                            self.limits.wait_ceiling(&field("duration")),
                        ),
                    }));
                }
                Command::Align(elements) => {
                    body.push(leaf(Op::Align {
                        elements: elements.clone().unwrap_or_default(),
                    }));
                }
                Command::Frequency { element, frequency } => {
                    let frequency = match frequency {
                        Sweepable::Fixed(hz) => {
                            self.check_frequency(&field("frequency"), hz.value())?;
                            Param::constant(hz.value())
                        }
                        Sweepable::Swept(values) => {
                            for (j, hz) in values.iter().enumerate() {
                                self.check_frequency(
                                    &field(&format!("frequency[{j}]")),
                                    hz.value(),
                                )?;
                            }
                            Param {
                                expr: table(values.iter().map(|hz| hz.value()).collect()),
                                guard: None,
                            }
                        }
                    };
                    body.push(leaf(Op::SetFrequency {
                        element: element.clone(),
                        frequency,
                    }));
                }
            }
        }
        Ok(on_cycles)
    }

    /// Shortest duration of one repetition in clock cycles.
    fn static_cycles(&self, body: &[NodeChild<Op>]) -> Result<i64> {
        body.iter()
            .map(|node| -> Result<i64> {
                Ok(match &node.kind {
                    Op::Play {
                        length: Some(length),
                        ..
                    } => shortest(length),
                    Op::Play {
                        element, operation, ..
                    }
                    | Op::Measure {
                        element, operation, ..
                    } => cycles_of(self.config.pulse_for(element, operation)?.length),
                    Op::Wait { cycles } => shortest(cycles),
                    _ => 0,
                })
            })
            .sum()
    }

    /// Compiles if needed, runs the program on `session` and polls until the end.
    pub fn execute(&mut self, session: &mut DeviceSession, options: &RunOptions) -> Result<()> {
        if self.state == State::Created {
            self.validate_experiment()?;
        }
        if self.state == State::Validated {
            self.create_experiment()?;
        }
        self.start(session)?;
        loop {
            match self.live_data_processing(session, options)? {
                PollOutcome::Finished => return Ok(()),
                PollOutcome::Continue => {
                    if !options.poll_interval.is_zero() {
                        std::thread::sleep(options.poll_interval);
                    }
                }
            }
        }
    }

    /// Uploads the configuration if needed and submits the compiled program.
    ///
    /// While another experiment is active on `session` this returns an error
    /// and the experiment stays compiled.
    pub fn start(&mut self, session: &mut DeviceSession) -> Result<()> {
        if self.state != State::Compiled {
            return Err(Error::InvalidTransition {
                from: self.state,
                event: Event::Submitted,
            });
        }
        session.check_idle()?;
        if let Err(err) = session.ensure_config(self.config) {
            self.fail(&err);
            return Err(err);
        }
        let submitted = match &self.program {
            Some(program) => session.submit(program),
            None => return Err(Error::new("compiled experiment has no program")),
        };
        if let Err(err) = submitted {
            // The program may have started partially.
            return Err(self.fail_with_shutdown(session, err));
        }
        let Some(plan) = &self.plan else {
            return Err(Error::new("compiled experiment has no sweep plan"));
        };
        self.accumulator = Some(Accumulator::new(plan, &self.channels));
        self.transition(Event::Submitted)?;
        nmr_log::info!(
            "Running '{}' on {}:{}",
            self.settings.experiment_name,
            session.connection().host,
            session.connection().port
        );
        Ok(())
    }

    /// One poll: fetch a batch, transform it and append it to the buffers.
    ///
    /// Failures stop the run, attempt a safe shutdown and are returned.
    pub fn live_data_processing(
        &mut self,
        session: &mut DeviceSession,
        options: &RunOptions,
    ) -> Result<PollOutcome> {
        if !self.state.is_running() {
            return Err(Error::InvalidTransition {
                from: self.state,
                event: Event::PollStarted,
            });
        }
        if options.abort.is_aborted() {
            return Err(self.abort(session));
        }
        self.transition(Event::PollStarted)?;
        self.polls += 1;
        let report = match fetch_with_retry(session, options.max_fetch_retries) {
            Ok(report) => report,
            Err(err) => return Err(self.fail_with_shutdown(session, err.into())),
        };
        // The device has already emitted these values, whatever happens to the data.
        self.record_clamps(&report.clamp_events);
        // A batch fetched after the abort request is discarded.
        if options.abort.is_aborted() {
            return Err(self.abort(session));
        }
        if let Err(err) = self.commit(&report) {
            return Err(self.fail_with_shutdown(session, err));
        }
        self.transition(Event::PollFinished)?;

        let Some(accumulator) = &self.accumulator else {
            return Err(Error::new("running experiment has no buffers"));
        };
        if !report.finished || (!report.batch.is_empty() && !accumulator.is_full()) {
            return Ok(PollOutcome::Continue);
        }
        if !accumulator.is_full() {
            let err = DeviceError::Fault(format!(
                "device finished after {} of {} points",
                accumulator.points(),
                accumulator.capacity()
            ));
            return Err(self.fail_with_shutdown(session, err.into()));
        }
        session.release();
        self.finish()?;
        Ok(PollOutcome::Finished)
    }

    fn record_clamps(&mut self, events: &[ClampEvent]) {
        if events.is_empty() {
            return;
        }
        nmr_log::warn!("{} output value(s) clamped to their safety ceiling", events.len());
        for event in events {
            self.clamps.record(event);
        }
        self.clamp_events.extend_from_slice(events);
    }

    fn commit(&mut self, report: &FetchReport) -> Result<()> {
        if report.batch.is_empty() {
            return Ok(());
        }
        let batch = apply_all(&self.transforms, report.batch.clone())?;
        let accumulator = self
            .accumulator
            .as_mut()
            .ok_or_else(|| Error::new("running experiment has no buffers"))?;
        let events = accumulator.apply(&batch)?;
        nmr_log::diagnostic!(
            "Batch {}: {} of {} points",
            accumulator.batches(),
            accumulator.points(),
            accumulator.capacity()
        );
        for event in &events {
            self.observers.publish(event);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.transition(Event::Completed)?;
        self.completion = Some(Completion::Complete);
        self.freeze();
        self.observers.publish(&BufferEvent::Finished { complete: true });
        nmr_log::info!(
            "Experiment '{}' complete ({} clamp event(s))",
            self.settings.experiment_name,
            self.clamps.total
        );
        Ok(())
    }

    fn abort(&mut self, session: &mut DeviceSession) -> Error {
        nmr_log::info!("Abort requested for '{}'", self.settings.experiment_name);
        self.fail_with_shutdown(session, Error::Aborted)
    }

    fn fail_with_shutdown(&mut self, session: &mut DeviceSession, err: Error) -> Error {
        let record = match session.safe_shutdown() {
            Ok(()) => ShutdownRecord {
                reason: err.to_string(),
                succeeded: true,
                error: None,
            },
            Err(shutdown_err) => {
                nmr_log::error!("Safe shutdown failed: {}", shutdown_err);
                ShutdownRecord {
                    reason: err.to_string(),
                    succeeded: false,
                    error: Some(shutdown_err.to_string()),
                }
            }
        };
        self.shutdown = Some(record);
        self.fail(&err);
        err
    }

    fn fail(&mut self, err: &Error) {
        let kind = err.kind();
        nmr_log::error!("Experiment '{}' failed: {}", self.settings.experiment_name, err);
        if let Ok(next) = self.state.transition(Event::Failed(kind)) {
            self.state = next;
        }
        self.completion = Some(Completion::Incomplete {
            kind,
            reason: err.to_string(),
        });
        self.freeze();
        self.observers.publish(&BufferEvent::Finished { complete: false });
    }

    fn freeze(&mut self) {
        if let Some(accumulator) = &self.accumulator {
            self.save_data_dict = accumulator.data().clone();
        }
    }

    /// Timing and clamp report of the compiled program, without a device.
    pub fn simulate_experiment(&self, signal: &SignalModel) -> Result<SimulationReport> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| Error::new("experiment is not compiled"))?;
        Ok(simulate(program, self.config, signal)?)
    }

    /// The record for storage; available once the experiment has ended.
    pub fn result(&self) -> Result<ExperimentResult> {
        let Some(completion) = self.completion.clone().filter(|_| self.state.is_terminal()) else {
            return Err(Error::new(format!(
                "experiment has not ended (state {:?})",
                self.state
            )));
        };
        Ok(ExperimentResult {
            name: self.settings.experiment_name.clone(),
            completion,
            axes: self
                .plan
                .as_ref()
                .map(|plan| plan.axes().into_iter().cloned().collect())
                .unwrap_or_default(),
            data: self.save_data_dict.clone(),
            metadata: ResultMetadata {
                n_avg: self.settings.n_avg,
                geometry: self.geometry,
                settings: self.settings.to_value()?,
                device_config: self.config.to_runtime_config(),
                batches: self.accumulator.as_ref().map_or(0, Accumulator::batches),
                polls: self.polls,
                clamps: self.clamps.clone(),
                rounding_warnings: self.warnings.clone(),
                safe_shutdown: self.shutdown.clone(),
                notices: self.notices.clone(),
                user: self.settings.metadata.clone(),
            },
        })
    }
}

fn streams() -> Vec<String> {
    STREAMS.iter().map(|s| s.to_string()).collect()
}

fn measure(element: &str, operation: &str, demod: [&str; 2]) -> Op {
    Op::Measure {
        element: element.to_string(),
        operation: operation.to_string(),
        demod: demod.map(str::to_string),
        streams: STREAMS.map(str::to_string),
    }
}

fn fetch_with_retry(session: &mut DeviceSession, retries: u32) -> Result<FetchReport, DeviceError> {
    let mut attempt = 0;
    loop {
        match session.fetch() {
            Ok(report) => return Ok(report),
            Err(DeviceError::Communication(reason)) if attempt < retries => {
                attempt += 1;
                nmr_log::warn!("Fetch failed ({}), retry {} of {}", reason, attempt, retries);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConnection, DeviceRuntime};
    use crate::error::ErrorKind;
    use crate::simulator::{FailureKind, ScriptedFailure, SimulatedDevice, SimulatorOptions};
    use nmr_config::config_from_settings;
    use nmr_units::duration::{microseconds, nanoseconds};

    fn settings() -> ExperimentSettings {
        ExperimentSettings {
            experiment_name: "fid".to_string(),
            n_avg: 2,
            thermal_reset: microseconds(400.0),
            readout_end: microseconds(32.0),
            ..ExperimentSettings::default()
        }
    }

    fn session(config: &DeviceConfig, options: SimulatorOptions) -> DeviceSession {
        DeviceSession::open(
            DeviceConnection::from_config(config),
            Box::new(SimulatedDevice::new(options)),
        )
    }

    fn quick() -> RunOptions {
        RunOptions {
            poll_interval: Duration::ZERO,
            ..RunOptions::default()
        }
    }

    fn one_point_per_fetch(failures: Vec<ScriptedFailure>) -> SimulatorOptions {
        SimulatorOptions {
            points_per_fetch: 1,
            failures,
            ..SimulatorOptions::default()
        }
    }

    fn points(data: &IndexMap<String, DataSet>, channel: &str) -> usize {
        data.get(channel).map_or(0, DataSet::points)
    }

    #[test]
    fn test_fid_runs_to_completion() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.execute(&mut session, &quick()).unwrap();

        assert_eq!(experiment.state(), State::Complete);
        let data = experiment.save_data_dict();
        assert_eq!(data.keys().collect::<Vec<_>>(), vec!["I", "Q"]);
        assert!(matches!(&data["I"], DataSet::OneD(values) if values.len() == 8));
        let result = experiment.result().unwrap();
        assert!(result.is_complete());
        assert_eq!(result.axes[0].values[0], 2.0);
        assert!(result.metadata.safe_shutdown.is_none());
        assert_eq!(session.uploads(), 1);
        assert_eq!(session.submissions(), 1);
    }

    #[test]
    fn test_program_shape() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap()
            .add_delay(Sweepable::Fixed(nanoseconds(100.0)))
            .unwrap();
        experiment.validate_experiment().unwrap();
        let program = experiment.create_experiment().unwrap();
        assert_eq!(program.expected_points, 8);
        assert_eq!(
            program.elements(),
            vec!["amplifier", "switch", "resonator"]
        );
        let listing = program.to_string();
        assert!(listing.contains("for t in 8 (Acquisition)"));
        assert!(listing.contains("for n in 2 (Averaging)"));
        assert!(listing.contains("measure no_pulse_readout on resonator"));
        assert_eq!(experiment.state(), State::Compiled);
        assert!(experiment.rounding_warnings().is_empty());
    }

    #[test]
    fn test_single_point_sweep_with_long_pulse() {
        let settings = ExperimentSettings {
            pulse_length: nanoseconds(4000.0),
            readout_end: microseconds(4.0),
            ..settings()
        };
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::two_d(&settings, &config);
        experiment
            .add_pulse(
                PulseCommand::new("pi_half", "resonator")
                    .with_amplitude(Sweepable::Swept(vec![1.0])),
            )
            .unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        experiment.execute(&mut session, &quick()).unwrap();
        let plan = experiment.plan().unwrap();
        assert_eq!(plan.rows(), 1);
        assert_eq!(plan.row_len(), 1);
        assert!(
            matches!(&experiment.save_data_dict()["I"], DataSet::TwoD(rows) if rows.len() == 1)
        );
        for channel in ["I", "Q"] {
            assert_eq!(points(experiment.save_data_dict(), channel), 1);
        }
    }

    #[test]
    fn test_static_amplitude_over_ceiling_fails_compilation() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        let mut experiment = Experiment::one_d(&settings, &config);
        // 0.25 * 2.2 is 10 % above the 0.5 ceiling.
        experiment
            .add_pulse(
                PulseCommand::new("pi_half", "resonator")
                    .with_amplitude(Sweepable::Fixed(2.2)),
            )
            .unwrap();
        let err = experiment.execute(&mut session, &quick()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Compilation);
        assert_eq!(err.field(), Some("commands[0].amplitude"));
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Compilation));
        assert_eq!(session.submissions(), 0);
        assert_eq!(session.uploads(), 0);
        assert!(experiment.program().is_none());
    }

    #[test]
    fn test_communication_failure_keeps_fetched_batches() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(
            &config,
            one_point_per_fetch(vec![ScriptedFailure {
                fetch: 4,
                count: 100,
                kind: FailureKind::Communication,
            }]),
        );
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        let err = experiment.execute(&mut session, &quick()).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Communication);
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Communication));
        assert_eq!(points(experiment.save_data_dict(), "I"), 3);
        assert_eq!(session.shutdowns(), 1);
        let result = experiment.result().unwrap();
        assert_eq!(result.metadata.batches, 3);
        assert!(!result.is_complete());
        let shutdown = result.metadata.safe_shutdown.unwrap();
        assert!(shutdown.succeeded);
    }

    #[test]
    fn test_transient_failure_is_retried_once() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(
            &config,
            one_point_per_fetch(vec![ScriptedFailure {
                fetch: 2,
                count: 1,
                kind: FailureKind::Communication,
            }]),
        );
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.execute(&mut session, &quick()).unwrap();
        assert_eq!(experiment.state(), State::Complete);
        assert_eq!(points(experiment.save_data_dict(), "Q"), 8);
    }

    #[test]
    fn test_device_fault_is_not_retried() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(
            &config,
            one_point_per_fetch(vec![ScriptedFailure {
                fetch: 2,
                count: 1,
                kind: FailureKind::Fault,
            }]),
        );
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        let err = experiment.execute(&mut session, &quick()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFault);
        assert_eq!(points(experiment.save_data_dict(), "I"), 1);
        assert_eq!(session.shutdowns(), 1);
    }

    struct AbortOnFetch {
        inner: SimulatedDevice,
        abort: AbortHandle,
        at: usize,
    }

    impl DeviceRuntime for AbortOnFetch {
        fn upload_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError> {
            self.inner.upload_config(config)
        }

        fn submit(&mut self, program: &PulseProgram) -> Result<(), DeviceError> {
            self.inner.submit(program)
        }

        fn fetch(&mut self) -> Result<FetchReport, DeviceError> {
            let report = self.inner.fetch()?;
            if self.inner.fetches() == self.at {
                self.abort.abort();
            }
            Ok(report)
        }

        fn safe_shutdown(&mut self) -> Result<(), DeviceError> {
            self.inner.safe_shutdown()
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            self.inner.close()
        }
    }

    #[test]
    fn test_abort_discards_batch_fetched_after_request() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let options = quick();
        let runtime = AbortOnFetch {
            inner: SimulatedDevice::new(one_point_per_fetch(vec![])),
            abort: options.abort.clone(),
            at: 2,
        };
        let mut session =
            DeviceSession::open(DeviceConnection::from_config(&config), Box::new(runtime));
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        let err = experiment.execute(&mut session, &options).unwrap_err();
        assert!(matches!(err, Error::Aborted));
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Aborted));
        assert_eq!(points(experiment.save_data_dict(), "I"), 1);
        assert_eq!(session.shutdowns(), 1);
    }

    #[test]
    fn test_clamps_of_discarded_batch_are_recorded() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let options = quick();
        let runtime = AbortOnFetch {
            inner: SimulatedDevice::new(SimulatorOptions::default()),
            abort: options.abort.clone(),
            at: 1,
        };
        let mut session =
            DeviceSession::open(DeviceConnection::from_config(&config), Box::new(runtime));
        let mut experiment = Experiment::two_d(&settings, &config);
        experiment
            .add_pulse(
                PulseCommand::new("pi_half", "resonator")
                    .with_amplitude(Sweepable::Swept(vec![2.4, 3.0])),
            )
            .unwrap();
        let err = experiment.execute(&mut session, &options).unwrap_err();
        assert!(matches!(err, Error::Aborted));

        // The first row was played at 0.6 and clamped, but never stored.
        assert!(experiment.save_data_dict().values().all(|d| d.points() == 0));
        assert_eq!(experiment.clamp_events().len(), 16);
        let result = experiment.result().unwrap();
        assert_eq!(result.metadata.clamps.total, 16);
        assert_eq!(result.metadata.batches, 0);
    }

    #[test]
    fn test_one_active_experiment_per_session() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, one_point_per_fetch(vec![]));
        let compiled = || {
            let mut experiment = Experiment::one_d(&settings, &config);
            experiment
                .add_pulse(PulseCommand::new("pi_half", "resonator"))
                .unwrap();
            experiment.validate_experiment().unwrap();
            experiment.create_experiment().unwrap();
            experiment
        };
        let mut first = compiled();
        let mut second = compiled();
        first.start(&mut session).unwrap();
        first.live_data_processing(&mut session, &quick()).unwrap();
        assert!(session.is_busy());

        let err = second.start(&mut session).unwrap_err();
        assert_eq!(err.field(), Some("session"));
        assert_eq!(second.state(), State::Compiled);
        assert_eq!(session.submissions(), 1);
        assert_eq!(session.shutdowns(), 0);

        let options = quick();
        let mut outcome = PollOutcome::Continue;
        while outcome == PollOutcome::Continue {
            outcome = first.live_data_processing(&mut session, &options).unwrap();
        }
        assert_eq!(first.state(), State::Complete);
        assert_eq!(points(first.save_data_dict(), "I"), 8);
        assert!(!session.is_busy());
        second.execute(&mut session, &quick()).unwrap();
        assert_eq!(second.state(), State::Complete);
        assert_eq!(session.submissions(), 2);
    }

    #[test]
    fn test_session_released_after_failure() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(
            &config,
            one_point_per_fetch(vec![ScriptedFailure {
                fetch: 2,
                count: 1,
                kind: FailureKind::Fault,
            }]),
        );
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        assert!(experiment.execute(&mut session, &quick()).is_err());
        assert!(!session.is_busy());
    }

    #[test]
    fn test_abort_before_first_poll() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.validate_experiment().unwrap();
        experiment.create_experiment().unwrap();
        experiment.start(&mut session).unwrap();
        let options = quick();
        options.abort.abort();
        assert!(experiment.live_data_processing(&mut session, &options).is_err());
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Aborted));
        assert!(experiment.save_data_dict().values().all(|d| d.points() == 0));
    }

    #[test]
    fn test_drains_after_device_finished() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(
            &config,
            SimulatorOptions {
                points_per_fetch: 2,
                buffered_at_finish: 3,
                ..SimulatorOptions::default()
            },
        );
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.execute(&mut session, &quick()).unwrap();
        assert_eq!(points(experiment.save_data_dict(), "I"), 8);
        assert_eq!(experiment.result().unwrap().metadata.batches, 4);
    }

    #[test]
    fn test_two_d_runtime_clamps_recorded_per_occurrence() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        let mut experiment = Experiment::two_d(&settings, &config);
        // Effective amplitudes 0.25, 0.6 and 0.75 against a ceiling of 0.5.
        experiment
            .add_pulse(
                PulseCommand::new("pi_half", "resonator")
                    .with_amplitude(Sweepable::Swept(vec![1.0, 2.4, 3.0])),
            )
            .unwrap();
        experiment.update_sweep_label("amplitude scale");
        let rows = experiment.subscribe(64);
        experiment.execute(&mut session, &quick()).unwrap();

        // Two clamped sweep values, 8 points, 2 averages.
        assert_eq!(experiment.clamp_events().len(), 32);
        let site = &experiment.clamp_summary().sites["commands[0].amplitude"];
        assert_eq!(site.count, 32);
        assert_eq!(site.worst_requested, 0.75);
        assert!(experiment.clamp_events().iter().all(|e| e.emitted <= 0.5));

        let DataSet::TwoD(data) = &experiment.save_data_dict()["I"] else {
            panic!("expected rows");
        };
        assert_eq!(data.len(), 3);
        assert!(data.iter().all(|row| row.len() == 8));
        let completed = rows
            .try_iter()
            .filter(|e| matches!(e, BufferEvent::RowCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
        let result = experiment.result().unwrap();
        assert_eq!(result.axes[0].label, "amplitude scale");
        assert_eq!(result.metadata.clamps.total, 32);
    }

    #[test]
    fn test_sweep_geometry_is_checked() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::two_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        let err = experiment.validate_experiment().unwrap_err();
        assert_eq!(err.field(), Some("sweep"));
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Configuration));

        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_delay(Sweepable::Swept(vec![nanoseconds(100.0), nanoseconds(200.0)]))
            .unwrap();
        assert_eq!(
            experiment.validate_experiment().unwrap_err().field(),
            Some("sweep")
        );
    }

    #[test]
    fn test_empty_commands_rejected() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        assert_eq!(
            experiment.validate_experiment().unwrap_err().field(),
            Some("commands")
        );
    }

    #[test]
    fn test_invalid_settings_fail_validation() {
        let valid = settings();
        let config = config_from_settings(&valid).unwrap();
        let settings = ExperimentSettings {
            readout_delay: nanoseconds(4900.0),
            ..valid
        };
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        let err = experiment.validate_experiment().unwrap_err();
        assert_eq!(err.field(), Some("readout_delay"));
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Configuration));
    }

    #[test]
    fn test_inconsistent_sweep_leaves_commands_unchanged() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::two_d(&settings, &config);
        experiment
            .add_delay(Sweepable::Swept(vec![nanoseconds(100.0), nanoseconds(200.0)]))
            .unwrap();
        let err = experiment
            .add_pulse(
                PulseCommand::new("pi_half", "resonator")
                    .with_amplitude(Sweepable::Swept(vec![0.5, 0.25])),
            )
            .unwrap_err();
        assert_eq!(err.field(), Some("commands[1].amplitude"));
        assert_eq!(experiment.commands().len(), 1);
        assert!(format!("{experiment:?}").contains("state: Created"));
    }

    #[test]
    fn test_off_grid_pulse_length_rejected() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("cw", "resonator").with_length(Sweepable::Fixed(
                nanoseconds(402.0),
            )))
            .unwrap();
        experiment.validate_experiment().unwrap();
        let err = experiment.create_experiment().unwrap_err();
        assert!(matches!(err, Error::Timing { .. }));
        assert_eq!(err.field(), Some("commands[0].length"));
    }

    #[test]
    fn test_cosmetic_rounding_reported_in_result() {
        let settings = ExperimentSettings {
            thermal_reset: nanoseconds(400_002.0),
            ..settings()
        };
        let config = config_from_settings(&settings).unwrap();
        let mut session = session(&config, SimulatorOptions::default());
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap()
            .add_delay(Sweepable::Fixed(nanoseconds(0.0)))
            .unwrap();
        experiment.execute(&mut session, &quick()).unwrap();
        let warnings = &experiment.result().unwrap().metadata.rounding_warnings;
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "thermal_reset");
        assert_eq!(warnings[0].executed, nanoseconds(400_004.0));
    }

    #[test]
    fn test_duty_cycle_limit() {
        let settings = ExperimentSettings {
            thermal_reset: microseconds(300.0),
            ..settings()
        };
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(
                PulseCommand::new("cw", "resonator")
                    .with_length(Sweepable::Fixed(microseconds(40.0))),
            )
            .unwrap();
        experiment.validate_experiment().unwrap();
        let err = experiment.create_experiment().unwrap_err();
        assert_eq!(err.field(), Some("duty_cycle"));
        assert_eq!(experiment.state(), State::Failed(ErrorKind::Compilation));
    }

    #[test]
    fn test_simulated_timing() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.remove_initial_delay(true);
        experiment.validate_experiment().unwrap();
        experiment.create_experiment().unwrap();
        let report = experiment
            .simulate_experiment(&SignalModel::default())
            .unwrap();
        assert_eq!(report.shots, 16);
        assert_eq!(report.points.len(), 8);
        // Every repetition waits out the thermal reset.
        assert!(report.duration() > microseconds(16.0 * 400.0));
        assert!(report.duration() < microseconds(16.0 * 500.0));
    }

    #[test]
    fn test_commands_frozen_after_validation() {
        let settings = settings();
        let config = config_from_settings(&settings).unwrap();
        let mut experiment = Experiment::one_d(&settings, &config);
        experiment
            .add_pulse(PulseCommand::new("pi_half", "resonator"))
            .unwrap();
        experiment.validate_experiment().unwrap();
        assert!(experiment.add_align(None).is_err());
        assert!(experiment.result().is_err());
    }
}
