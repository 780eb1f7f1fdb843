// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The boundary to the pulse-sequencer runtime.

use nmr_config::DeviceConfig;

use crate::error::{Error, Result};
use crate::live::Batch;
use crate::program::PulseProgram;
use crate::safety::ClampEvent;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The exchange with the device failed; retrying may succeed.
    #[error("Communication with the device failed: {0}")]
    Communication(String),
    /// The device reported an error. Never retried.
    #[error("Device fault: {0}")]
    Fault(String),
}

/// Result of one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    /// Raw points produced since the previous fetch.
    pub batch: Batch,
    /// Runtime clamps applied while producing the batch.
    pub clamp_events: Vec<ClampEvent>,
    /// The program has finished; buffered data may remain.
    pub finished: bool,
}

/// A pulse-sequencer runtime.
///
/// Implementations report failures as [`DeviceError`]; the experiment decides
/// about retries and shutdown.
pub trait DeviceRuntime {
    fn upload_config(&mut self, config: &DeviceConfig) -> Result<(), DeviceError>;

    /// Starts executing `program` with the uploaded configuration.
    fn submit(&mut self, program: &PulseProgram) -> Result<(), DeviceError>;

    fn fetch(&mut self) -> Result<FetchReport, DeviceError>;

    /// Stops the program and drives every output to its safe state.
    fn safe_shutdown(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Where a session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnection {
    pub host: String,
    pub port: u16,
    pub cluster: String,
}

impl DeviceConnection {
    pub fn from_config(config: &DeviceConfig) -> Self {
        DeviceConnection {
            host: config.host.clone(),
            port: config.port,
            cluster: config.cluster.clone(),
        }
    }
}

/// An open connection to one device.
///
/// The configuration is uploaded once and again only when it changes. At most
/// one submitted program is active at a time.
pub struct DeviceSession {
    connection: DeviceConnection,
    runtime: Box<dyn DeviceRuntime>,
    uploaded: Option<DeviceConfig>,
    active: bool,
    uploads: usize,
    submissions: usize,
    shutdowns: usize,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("connection", &self.connection)
            .field("active", &self.active)
            .field("uploads", &self.uploads)
            .field("submissions", &self.submissions)
            .field("shutdowns", &self.shutdowns)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn open(connection: DeviceConnection, runtime: Box<dyn DeviceRuntime>) -> Self {
        nmr_log::info!(
            "Opened session to {}:{} (cluster '{}')",
            connection.host,
            connection.port,
            connection.cluster
        );
        DeviceSession {
            connection,
            runtime,
            uploaded: None,
            active: false,
            uploads: 0,
            submissions: 0,
            shutdowns: 0,
        }
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.connection
    }

    /// Uploads `config` unless it is the configuration already on the device.
    ///
    /// Returns whether an upload happened.
    pub fn ensure_config(&mut self, config: &DeviceConfig) -> Result<bool> {
        self.check_idle()?;
        let target = DeviceConnection::from_config(config);
        if target != self.connection {
            return Err(nmr_config::Error::invalid(
                "host",
                format!(
                    "configuration targets {}:{} but the session is connected to {}:{}",
                    target.host, target.port, self.connection.host, self.connection.port
                ),
            )
            .into());
        }
        if self.uploaded.as_ref() == Some(config) {
            return Ok(false);
        }
        self.runtime.upload_config(config)?;
        self.uploaded = Some(config.clone());
        self.uploads += 1;
        Ok(true)
    }

    /// Whether a submitted program has neither completed nor been shut down.
    pub fn is_busy(&self) -> bool {
        self.active
    }

    /// Errors while another program is active on this connection.
    pub fn check_idle(&self) -> Result<()> {
        if self.active {
            return Err(Error::validation(
                "session",
                format!(
                    "a program is already running on {}:{}",
                    self.connection.host, self.connection.port
                ),
            ));
        }
        Ok(())
    }

    pub fn submit(&mut self, program: &PulseProgram) -> Result<()> {
        self.check_idle()?;
        // A failed submission may have started the program partially.
        self.active = true;
        self.runtime.submit(program)?;
        self.submissions += 1;
        Ok(())
    }

    /// Marks the active program as complete.
    pub(crate) fn release(&mut self) {
        self.active = false;
    }

    pub fn fetch(&mut self) -> Result<FetchReport, DeviceError> {
        self.runtime.fetch()
    }

    pub fn safe_shutdown(&mut self) -> Result<(), DeviceError> {
        self.shutdowns += 1;
        self.active = false;
        self.runtime.safe_shutdown()
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    /// Safe-shutdown attempts, successful or not.
    pub fn shutdowns(&self) -> usize {
        self.shutdowns
    }

    pub fn close(mut self) -> Result<()> {
        self.runtime.close().map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmr_config::{ExperimentSettings, config_from_settings};

    #[derive(Default)]
    struct Recorder;

    impl DeviceRuntime for Recorder {
        fn upload_config(&mut self, _config: &DeviceConfig) -> Result<(), DeviceError> {
            Ok(())
        }

        fn submit(&mut self, _program: &PulseProgram) -> Result<(), DeviceError> {
            Ok(())
        }

        fn fetch(&mut self) -> Result<FetchReport, DeviceError> {
            Ok(FetchReport::default())
        }

        fn safe_shutdown(&mut self) -> Result<(), DeviceError> {
            Err(DeviceError::Communication("link down".to_string()))
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_config_uploaded_once() {
        let settings = ExperimentSettings::default();
        let config = config_from_settings(&settings).unwrap();
        let mut session =
            DeviceSession::open(DeviceConnection::from_config(&config), Box::new(Recorder));
        assert!(session.ensure_config(&config).unwrap());
        assert!(!session.ensure_config(&config).unwrap());
        let mut changed = config.clone();
        changed.pulses["pi_half_pulse"].length = nmr_units::duration::nanoseconds(1200.0);
        assert!(session.ensure_config(&changed).unwrap());
        assert_eq!(session.uploads(), 2);
    }

    #[test]
    fn test_reloaded_config_is_not_uploaded_again() {
        let config = config_from_settings(&ExperimentSettings::default()).unwrap();
        let mut session =
            DeviceSession::open(DeviceConnection::from_config(&config), Box::new(Recorder));
        assert!(session.ensure_config(&config).unwrap());
        let saved = serde_json::to_string(&config).unwrap();
        let reloaded: DeviceConfig = serde_json::from_str(&saved).unwrap();
        assert!(!session.ensure_config(&reloaded).unwrap());
        assert_eq!(session.uploads(), 1);
    }

    #[test]
    fn test_config_for_another_host_rejected() {
        let config = config_from_settings(&ExperimentSettings::default()).unwrap();
        let connection = DeviceConnection {
            host: "10.0.0.1".to_string(),
            ..DeviceConnection::from_config(&config)
        };
        let mut session = DeviceSession::open(connection, Box::new(Recorder));
        let err = session.ensure_config(&config).unwrap_err();
        assert_eq!(err.field(), Some("host"));
        assert_eq!(session.uploads(), 0);
    }

    #[test]
    fn test_shutdown_attempts_counted_on_failure() {
        let config = config_from_settings(&ExperimentSettings::default()).unwrap();
        let mut session =
            DeviceSession::open(DeviceConnection::from_config(&config), Box::new(Recorder));
        assert!(session.safe_shutdown().is_err());
        assert_eq!(session.shutdowns(), 1);
        session.close().unwrap();
    }
}
