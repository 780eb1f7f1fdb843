// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sweep geometry: how the acquisition loops nest and how results are shaped.

use serde::Serialize;

use crate::node::{Node, NodeChild};
use crate::program::{LoopKind, Op};

pub const AVERAGING_VAR: &str = "n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SweepGeometry {
    /// One axis; every stream is a sequence of points.
    Sweep1D,
    /// An outer axis over an inner axis; every stream is a sequence of rows.
    Sweep2D,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepAxis {
    /// Loop variable driving the axis.
    pub var: String,
    pub label: String,
    pub unit: String,
    #[serde(skip)]
    pub kind: LoopKind,
    pub values: Vec<f64>,
}

impl SweepAxis {
    pub fn new(var: &str, label: &str, unit: &str, kind: LoopKind, values: Vec<f64>) -> Self {
        SweepAxis {
            var: var.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
            kind,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The axes of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPlan {
    pub geometry: SweepGeometry,
    pub outer: Option<SweepAxis>,
    pub inner: SweepAxis,
}

impl SweepPlan {
    pub fn one_d(axis: SweepAxis) -> Self {
        SweepPlan {
            geometry: SweepGeometry::Sweep1D,
            outer: None,
            inner: axis,
        }
    }

    pub fn two_d(outer: SweepAxis, inner: SweepAxis) -> Self {
        SweepPlan {
            geometry: SweepGeometry::Sweep2D,
            outer: Some(outer),
            inner,
        }
    }

    /// Points per row.
    pub fn row_len(&self) -> usize {
        self.inner.len()
    }

    pub fn rows(&self) -> usize {
        self.outer.as_ref().map_or(1, SweepAxis::len)
    }

    pub fn total_points(&self) -> usize {
        self.rows() * self.row_len()
    }

    pub fn axes(&self) -> Vec<&SweepAxis> {
        self.outer.iter().chain(std::iter::once(&self.inner)).collect()
    }

    /// Wraps one repetition in the loop nest of the plan.
    ///
    /// Averaging is innermost, so each point is complete before the next starts.
    pub fn nest(&self, n_avg: u32, body: Vec<NodeChild<Op>>) -> Node<Op> {
        let averaging = Node::with_children(
            Op::Loop {
                var: AVERAGING_VAR.to_string(),
                kind: LoopKind::Averaging,
                values: (0..n_avg).map(f64::from).collect(),
            },
            body,
        );
        let axis_loop = |axis: &SweepAxis, child: Node<Op>| {
            Node::with_children(
                Op::Loop {
                    var: axis.var.clone(),
                    kind: axis.kind,
                    values: axis.values.clone(),
                },
                vec![child.into()],
            )
        };
        let inner = axis_loop(&self.inner, averaging);
        match &self.outer {
            Some(outer) => axis_loop(outer, inner),
            None => inner,
        }
    }
}
