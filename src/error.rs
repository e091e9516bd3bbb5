use thiserror::Error;

use crate::adapters::clock::ClockError;
use crate::adapters::ntp_client::NtpClientError;
use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// Top-level error type for the rksd library.
#[derive(Error, Debug)]
pub enum RksdError {
    /// Configuration rejected at startup.
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// Thread/message/timer substrate failure.
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
    /// Clock adjustment failure.
    #[error("clock: {0}")]
    Clock(#[from] ClockError),
    /// NTP daemon control failure.
    #[error("ntp: {0}")]
    Ntp(#[from] NtpClientError),
    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Other error cases.
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RksdError>;
