// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of an experiment.
//!
//! ```text
//! Created -> Validated -> Compiled -> Running <-> Processing -> Complete
//!                 any non-terminal state -> Failed
//! ```

use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Created,
    Validated,
    Compiled,
    /// Waiting for the next poll. `polls` counts the completed poll cycles.
    Running { polls: u64 },
    /// A poll is fetching and appending a batch.
    Processing { polls: u64 },
    Complete,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Validated,
    Compiled,
    Submitted,
    PollStarted,
    PollFinished,
    Completed,
    Failed(ErrorKind),
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Complete | State::Failed(_))
    }

    /// Whether a program has been handed to the device and not yet finalized.
    pub fn is_running(&self) -> bool {
        matches!(self, State::Running { .. } | State::Processing { .. })
    }

    pub fn transition(self, event: Event) -> Result<State> {
        let next = match (self, event) {
            (State::Created, Event::Validated) => State::Validated,
            (State::Validated, Event::Compiled) => State::Compiled,
            (State::Compiled, Event::Submitted) => State::Running { polls: 0 },
            (State::Running { polls }, Event::PollStarted) => State::Processing { polls },
            (State::Processing { polls }, Event::PollFinished) => {
                State::Running { polls: polls + 1 }
            }
            // Completion needs at least one poll cycle that appended data.
            (State::Running { polls } | State::Processing { polls }, Event::Completed)
                if polls > 0 =>
            {
                State::Complete
            }
            (state, Event::Failed(kind)) if !state.is_terminal() => State::Failed(kind),
            (from, event) => return Err(Error::InvalidTransition { from, event }),
        };
        Ok(next)
    }
}
