// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Experiment settings and the device configuration derived from them.

pub mod builder;
pub mod device_config;
pub mod device_traits;
mod error;
pub mod from_settings;
pub mod settings;

pub use builder::ConfigBuilder;
pub use device_config::{DeviceConfig, Element, Pulse, PulseKind, Waveform};
pub use device_traits::{DeviceTraits, OPX1000_LF_TRAITS};
pub use error::{Error, Result};
pub use from_settings::config_from_settings;
pub use settings::{ElementKeys, ExperimentSettings, SweepRange};
