// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Pulsed NMR experiments on a pulse sequencer.
//!
//! Commands are collected in an [`Experiment`], checked against the
//! [`nmr_config::ExperimentSettings`], compiled into a [`PulseProgram`] and
//! run through a [`DeviceSession`]. Data arrives in batches and is appended
//! atomically to the live buffers.

pub mod command;
pub mod device;
mod error;
pub mod experiment;
pub mod live;
pub mod node;
pub mod program;
pub mod result;
pub mod safety;
pub mod simulator;
pub mod spectroscopy;
pub mod state;
pub mod sweep;
pub mod timing;

pub use command::{Command, PulseCommand, Sweepable};
pub use device::{DeviceConnection, DeviceError, DeviceRuntime, DeviceSession, FetchReport};
pub use error::{Error, ErrorKind, Result};
pub use experiment::{AbortHandle, Experiment, PollOutcome, RunOptions};
pub use live::{Batch, BufferEvent, DataSet};
pub use program::PulseProgram;
pub use result::{Completion, ExperimentResult, ResultSink};
pub use safety::{ClampEvent, ClampSummary, SafetyLimits};
pub use simulator::{SignalModel, SimulatedDevice, SimulatorOptions};
pub use spectroscopy::{BypassWiring, resonance_sweep};
pub use state::State;
pub use sweep::SweepGeometry;
pub use timing::RoundingWarning;
