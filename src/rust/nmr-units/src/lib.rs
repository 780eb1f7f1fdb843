// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Unit-typed quantities for pulse-sequencer timing.
//!
//! ```rust
//! use nmr_units::cycles::to_cycles_exact;
//! use nmr_units::duration::{clock_cycles, microseconds};
//!
//! assert_eq!(to_cycles_exact(microseconds(20.0)), Some(clock_cycles(5000)));
//! ```

#[macro_use]
mod unit;

pub mod cycles;
pub mod duration;
pub mod frequency;

pub use cycles::{CLOCK_CYCLE_NS, MIN_WAIT_CYCLES};
pub use duration::{ClockCycles, Nanoseconds};
pub use frequency::Hz;
