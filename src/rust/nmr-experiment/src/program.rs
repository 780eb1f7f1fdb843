// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The compiled pulse program.
//!
//! A program is a tree of [`Op`] nodes. Loops bind their variable to the
//! iteration index; parameters that depend on a loop variable are evaluated
//! by the device at run time and carry the safety ceiling they are checked against.

use std::fmt::{self, Display};

use indexmap::{IndexMap, IndexSet};
use nmr_config::{DeviceConfig, PulseKind};

use crate::error::{Error, Result};
use crate::node::{Node, NodeChild};
use crate::safety::Ceiling;

/// Current iteration index of every enclosing loop.
pub type Bindings = IndexMap<String, usize>;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    /// One value per iteration of the loop over `var`.
    Table { var: String, values: Vec<f64> },
    /// `base + step * i` for iteration `i` of the loop over `var`.
    Linear { var: String, base: f64, step: f64 },
}

impl Expr {
    pub fn eval(&self, bindings: &Bindings) -> Option<f64> {
        match self {
            Expr::Const(value) => Some(*value),
            Expr::Table { var, values } => values.get(*bindings.get(var)?).copied(),
            Expr::Linear { var, base, step } => {
                let index = *bindings.get(var)?;
                Some(base + step * index as f64)
            }
        }
    }
}

/// A value known at compile time or resolved by the device at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub expr: Expr,
    /// Runtime ceiling; values beyond it are clamped on the device.
    pub guard: Option<Ceiling>,
}

impl Param {
    pub fn constant(value: f64) -> Self {
        Param {
            expr: Expr::Const(value),
            guard: None,
        }
    }

    pub fn guarded(expr: Expr, ceiling: Ceiling) -> Self {
        Param {
            expr,
            guard: Some(ceiling),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    /// Repetitions of the body that are averaged into one point.
    Averaging,
    /// A user sweep variable.
    Sweep,
    /// Successive acquisition windows after the excitation.
    Acquisition,
    /// Probe frequency of a resonance sweep.
    Frequency,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Sequence,
    Loop {
        var: String,
        kind: LoopKind,
        /// Axis value of every iteration.
        values: Vec<f64>,
    },
    /// Plays an operation of `element`.
    ///
    /// `amplitude` is the peak output amplitude, `phase` is in degrees and
    /// `length` overrides the pulse length in clock cycles.
    Play {
        element: String,
        operation: String,
        amplitude: Param,
        phase: Param,
        length: Option<Param>,
    },
    /// Wait in clock cycles.
    Wait { cycles: Param },
    /// Synchronizes `elements`; an empty list synchronizes all.
    Align { elements: Vec<String> },
    /// Plays a measurement pulse and demodulates the input into two streams.
    Measure {
        element: String,
        operation: String,
        demod: [String; 2],
        streams: [String; 2],
    },
    SetFrequency { element: String, frequency: Param },
}

impl Op {
    pub fn play(element: &str, operation: &str, amplitude: f64) -> Self {
        Op::Play {
            element: element.to_string(),
            operation: operation.to_string(),
            amplitude: Param::constant(amplitude),
            phase: Param::constant(0.0),
            length: None,
        }
    }

    pub fn wait(cycles: i64) -> Self {
        Op::Wait {
            cycles: Param::constant(cycles as f64),
        }
    }

    pub fn align(elements: &[&str]) -> Self {
        Op::Align {
            elements: elements.iter().map(|e| e.to_string()).collect(),
        }
    }
}

pub(crate) fn leaf(op: Op) -> NodeChild<Op> {
    Node::new(op).into()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PulseProgram {
    pub root: NodeChild<Op>,
    /// Result streams in the order the device reports them.
    pub streams: Vec<String>,
    /// Points every stream holds once the program has finished.
    pub expected_points: usize,
    pub n_avg: u32,
}

impl PulseProgram {
    /// Elements the program addresses, in order of first use.
    pub fn elements(&self) -> Vec<&str> {
        let mut elements = IndexSet::new();
        self.root.walk(&mut |op, _| match op {
            Op::Play { element, .. }
            | Op::Measure { element, .. }
            | Op::SetFrequency { element, .. } => {
                elements.insert(element.as_str());
            }
            Op::Align { elements: targets } => {
                elements.extend(targets.iter().map(String::as_str));
            }
            _ => {}
        });
        elements.into_iter().collect()
    }

    /// Runtime ceilings embedded in the program.
    pub fn runtime_guards(&self) -> Vec<&Ceiling> {
        let mut guards = vec![];
        self.root.walk(&mut |op, _| {
            let params: Vec<&Param> = match op {
                Op::Play {
                    amplitude,
                    phase,
                    length,
                    ..
                } => [Some(amplitude), Some(phase), length.as_ref()]
                    .into_iter()
                    .flatten()
                    .collect(),
                Op::Wait { cycles } => vec![cycles],
                Op::SetFrequency { frequency, .. } => vec![frequency],
                _ => vec![],
            };
            guards.extend(params.into_iter().filter_map(|p| p.guard.as_ref()));
        });
        guards
    }

    /// Checks that every element, operation and demodulation label exists in `config`.
    pub fn validate_against(&self, config: &DeviceConfig) -> Result<()> {
        let mut result = Ok(());
        self.root.walk(&mut |op, _| {
            if result.is_err() {
                return;
            }
            result = check_op(op, config, &self.streams);
        });
        result
    }
}

fn check_op(op: &Op, config: &DeviceConfig, streams: &[String]) -> Result<()> {
    match op {
        Op::Play {
            element, operation, ..
        } => {
            config.pulse_for(element, operation)?;
        }
        Op::Measure {
            element,
            operation,
            demod,
            streams: targets,
        } => {
            let pulse = config.pulse_for(element, operation)?;
            if pulse.kind != PulseKind::Measurement {
                return Err(Error::compilation(
                    format!("{element}.{operation}"),
                    "operation is not a measurement pulse",
                ));
            }
            if let Some(label) = demod
                .iter()
                .find(|label| !pulse.integration_weights.contains_key(*label))
            {
                return Err(Error::compilation(
                    format!("{element}.{operation}"),
                    format!("no integration weights labelled '{label}'"),
                ));
            }
            if let Some(stream) = targets.iter().find(|s| !streams.contains(s)) {
                return Err(Error::compilation(
                    format!("{element}.{operation}"),
                    format!("stream '{stream}' is not declared"),
                ));
            }
        }
        Op::SetFrequency { element, .. } => {
            config.element(element)?;
        }
        Op::Align { elements } => {
            for element in elements {
                config.element(element)?;
            }
        }
        Op::Sequence | Op::Loop { .. } | Op::Wait { .. } => {}
    }
    Ok(())
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(value) => write!(f, "{value}"),
            Expr::Table { var, values } => write!(f, "table[{var}; {}]", values.len()),
            Expr::Linear { var, base, step } => write!(f, "{base} + {step}*{var}"),
        }
    }
}

impl Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if let Some(guard) = &self.guard {
            write!(f, " (<= {})", guard.limit)?;
        }
        Ok(())
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Sequence => write!(f, "sequence"),
            Op::Loop { var, kind, values } => {
                write!(f, "for {var} in {} ({kind:?})", values.len())
            }
            Op::Play {
                element,
                operation,
                amplitude,
                phase,
                length,
            } => {
                write!(f, "play {operation} on {element} amp={amplitude} phase={phase}")?;
                if let Some(length) = length {
                    write!(f, " len={length}")?;
                }
                Ok(())
            }
            Op::Wait { cycles } => write!(f, "wait {cycles}"),
            Op::Align { elements } if elements.is_empty() => write!(f, "align all"),
            Op::Align { elements } => write!(f, "align {}", elements.join(", ")),
            Op::Measure {
                element,
                operation,
                demod,
                streams,
            } => write!(
                f,
                "measure {operation} on {element} {}->{} {}->{}",
                demod[0], streams[0], demod[1], streams[1]
            ),
            Op::SetFrequency { element, frequency } => {
                write!(f, "update_frequency {element} {frequency}")
            }
        }
    }
}

/// Indented listing of the program, one operation per line.
impl Display for PulseProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "# streams: {} ({} points, n_avg = {})",
            self.streams.join(", "),
            self.expected_points,
            self.n_avg
        )?;
        let mut result = Ok(());
        self.root.walk(&mut |op, depth| {
            if result.is_ok() {
                result = writeln!(f, "{:indent$}{op}", "", indent = 2 * depth);
            }
        });
        result
    }
}
