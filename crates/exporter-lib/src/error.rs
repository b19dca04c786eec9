//! Exporter error types
//!
//! One enum covers every failure class the pipeline distinguishes. Fatal
//! init errors and connection loss bubble up to the supervisor; scrape-local
//! errors are contained in the pipeline driver.

use crate::dcgm::DcgmError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    /// A counter row names a field DCGM does not know.
    #[error("invalid counter: field '{0}' is not a known DCGM field")]
    InvalidCounter(String),

    /// An explicit device selection names an entity that does not exist.
    #[error("device not found: {kind} id {id} is not present in the inventory")]
    DeviceNotFound { kind: &'static str, id: i32 },

    /// MIG instances whose profile name could not be resolved.
    #[error("could not resolve MIG profile name for entity ids {0:?}")]
    MigProfileMissing(Vec<u32>),

    /// The DCGM connection was invalidated; the process must exit.
    #[error("DCGM connection lost")]
    ConnectionLost,

    /// Invalid configuration (selection DSL, log level, web config).
    #[error("configuration error: {0}")]
    Config(String),

    /// A transient failure during one scrape; the previous snapshot stays.
    #[error("scrape failed: {0}")]
    Scrape(String),

    #[error(transparent)]
    Dcgm(DcgmError),
}

impl From<DcgmError> for ExporterError {
    fn from(e: DcgmError) -> Self {
        match e {
            DcgmError::ConnectionLost => ExporterError::ConnectionLost,
            other => ExporterError::Dcgm(other),
        }
    }
}

impl ExporterError {
    /// True when the supervisor must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExporterError::ConnectionLost)
    }
}

pub type Result<T> = std::result::Result<T, ExporterError>;
