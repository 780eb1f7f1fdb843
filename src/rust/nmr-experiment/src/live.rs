// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Live data: batches fetched from the device, their transformation and the
//! buffers they are appended to.
//!
//! [`Accumulator::apply`] checks a batch completely before touching the
//! buffers, so a batch is either appended completely or not at all.

use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use indexmap::IndexMap;
use num_complex::Complex64;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::sweep::{SweepGeometry, SweepPlan};

/// Scale of the demodulation result relative to the input voltage.
pub const DEMOD_FULL_SCALE: f64 = 4096.0;

/// Converts a demodulated sum over `length_ns` to volts.
pub fn demod_to_volts(raw: f64, length_ns: f64) -> f64 {
    DEMOD_FULL_SCALE * raw / length_ns
}

/// New points of every stream from one fetch, in acquisition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub channels: IndexMap<String, Vec<f64>>,
}

impl Batch {
    /// Number of points, or an error if the channels disagree.
    pub fn points(&self) -> Result<usize> {
        let mut lengths = self.channels.values().map(Vec::len);
        let Some(first) = lengths.next() else {
            return Ok(0);
        };
        if lengths.any(|len| len != first) {
            return Err(Error::new("batch channels have different lengths"));
        }
        Ok(first)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.values().all(Vec::is_empty)
    }
}

/// A pure per-batch transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Converts raw demodulation results to volts.
    DemodToVolts { length_ns: f64 },
    /// Adds magnitude and phase channels computed from an I/Q pair.
    Polar { i: String, q: String },
}

impl Transform {
    pub fn apply(&self, mut batch: Batch) -> Result<Batch> {
        match self {
            Transform::DemodToVolts { length_ns } => {
                for values in batch.channels.values_mut() {
                    values.iter_mut().for_each(|v| *v = demod_to_volts(*v, *length_ns));
                }
            }
            Transform::Polar { i, q } => {
                let (Some(re), Some(im)) = (batch.channels.get(i), batch.channels.get(q)) else {
                    return Err(Error::new(format!("batch has no channels '{i}' and '{q}'")));
                };
                let points: Vec<Complex64> = re
                    .iter()
                    .zip(im)
                    .map(|(re, im)| Complex64::new(*re, *im))
                    .collect();
                batch
                    .channels
                    .insert("magnitude".to_string(), points.iter().map(|z| z.norm()).collect());
                batch
                    .channels
                    .insert("phase".to_string(), points.iter().map(|z| z.arg()).collect());
            }
        }
        Ok(batch)
    }

    /// Channel names after the transformation.
    pub fn output_channels(&self, mut channels: Vec<String>) -> Vec<String> {
        if let Transform::Polar { .. } = self {
            for name in ["magnitude", "phase"] {
                if !channels.iter().any(|c| c == name) {
                    channels.push(name.to_string());
                }
            }
        }
        channels
    }
}

pub fn apply_all(transforms: &[Transform], batch: Batch) -> Result<Batch> {
    transforms.iter().try_fold(batch, |batch, t| t.apply(batch))
}

/// Acquired data of one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataSet {
    OneD(Vec<f64>),
    TwoD(Vec<Vec<f64>>),
}

impl DataSet {
    /// Number of complete points.
    pub fn points(&self) -> usize {
        match self {
            DataSet::OneD(values) => values.len(),
            DataSet::TwoD(rows) => rows.iter().map(Vec::len).sum(),
        }
    }
}

/// Notification sent to observers after a batch was committed.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    Appended {
        batch: usize,
        points: IndexMap<String, Vec<f64>>,
    },
    RowCompleted {
        row: usize,
        values: IndexMap<String, Vec<f64>>,
    },
    Finished {
        complete: bool,
    },
}

/// Accumulated data of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    geometry: SweepGeometry,
    row_len: usize,
    capacity: usize,
    data: IndexMap<String, DataSet>,
    // 2D points of the row in progress; never visible in `data`.
    pending: IndexMap<String, Vec<f64>>,
    points: usize,
    batches: usize,
}

impl Accumulator {
    pub fn new(plan: &SweepPlan, channels: &[String]) -> Self {
        let empty = || match plan.geometry {
            SweepGeometry::Sweep1D => DataSet::OneD(vec![]),
            SweepGeometry::Sweep2D => DataSet::TwoD(vec![]),
        };
        Accumulator {
            geometry: plan.geometry,
            row_len: plan.row_len(),
            capacity: plan.total_points(),
            data: channels.iter().map(|c| (c.clone(), empty())).collect(),
            pending: channels.iter().map(|c| (c.clone(), vec![])).collect(),
            points: 0,
            batches: 0,
        }
    }

    pub fn data(&self) -> &IndexMap<String, DataSet> {
        &self.data
    }

    /// Points received, including those of an unfinished row.
    pub fn points(&self) -> usize {
        self.points
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.points == self.capacity
    }

    /// Non-empty batches appended so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Points held back until their row is complete.
    pub fn pending_points(&self) -> usize {
        self.pending.values().next().map_or(0, Vec::len)
    }

    /// Appends `batch` and returns the events to publish.
    ///
    /// A rejected batch leaves the buffers unchanged; an empty one is a no-op.
    pub fn apply(&mut self, batch: &Batch) -> Result<Vec<BufferEvent>> {
        let n = batch.points()?;
        if n == 0 {
            return Ok(vec![]);
        }
        if batch.channels.len() != self.data.len()
            || self.data.keys().any(|c| !batch.channels.contains_key(c))
        {
            return Err(Error::new(format!(
                "batch channels {:?} do not match the buffers {:?}",
                batch.channels.keys().collect::<Vec<_>>(),
                self.data.keys().collect::<Vec<_>>()
            )));
        }
        if self.points + n > self.capacity {
            return Err(Error::new(format!(
                "batch of {n} points overflows the buffer ({} of {} filled)",
                self.points, self.capacity
            )));
        }

        // Nothing below can fail.
        self.points += n;
        self.batches += 1;
        let mut events = vec![BufferEvent::Appended {
            batch: self.batches,
            points: self
                .data
                .keys()
                .map(|c| (c.clone(), batch.channels[c].clone()))
                .collect(),
        }];
        match self.geometry {
            SweepGeometry::Sweep1D => {
                for (channel, data) in self.data.iter_mut() {
                    if let DataSet::OneD(values) = data {
                        values.extend_from_slice(&batch.channels[channel]);
                    }
                }
            }
            SweepGeometry::Sweep2D => {
                for (channel, pending) in self.pending.iter_mut() {
                    pending.extend_from_slice(&batch.channels[channel]);
                }
                while self.pending_points() >= self.row_len {
                    let mut completed = IndexMap::new();
                    for (channel, pending) in self.pending.iter_mut() {
                        let row: Vec<f64> = pending.drain(..self.row_len).collect();
                        if let Some(DataSet::TwoD(rows)) = self.data.get_mut(channel) {
                            rows.push(row.clone());
                        }
                        completed.insert(channel.clone(), row);
                    }
                    let row = self.data.values().next().map_or(0, DataSet::points) / self.row_len;
                    events.push(BufferEvent::RowCompleted {
                        row: row - 1,
                        values: completed,
                    });
                }
            }
        }
        Ok(events)
    }
}

/// Fire-and-forget subscribers to buffer events.
///
/// A full observer queue drops the event for that observer; the run never waits.
#[derive(Debug, Default)]
pub struct Observers {
    senders: Vec<Sender<BufferEvent>>,
    dropped: usize,
}

impl Observers {
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<BufferEvent> {
        let (sender, receiver) = bounded(capacity);
        self.senders.push(sender);
        receiver
    }

    pub fn publish(&mut self, event: &BufferEvent) {
        let mut dropped = 0;
        self.senders
            .retain(|sender| match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        if dropped > 0 {
            nmr_log::diagnostic!("{} observer(s) lagging, event dropped", dropped);
        }
        self.dropped += dropped;
    }

    /// Events not delivered because an observer queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
