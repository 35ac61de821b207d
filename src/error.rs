//! Error taxonomy shared by every driver, the session and the event loop.

use crate::usb::UsbError;

pub type Result<T> = std::result::Result<T, LabError>;

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("Generic error: {0}")]
    Generic(String),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Resource exhaustion: {0}")]
    Malloc(String),

    /// Internal invariant violated. A well-behaved caller never sees this.
    #[error("Internal error: {0}")]
    Bug(String),

    #[error("Unsupported samplerate: {0} Hz")]
    Samplerate(u64),

    #[error("Device is closed")]
    DeviceClosed,

    #[error("Not applicable: {0}")]
    NotApplicable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device is already in use")]
    DeviceBusy,

    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl LabError {
    pub fn generic(reason: impl Into<String>) -> Self {
        Self::Generic(reason.into())
    }

    pub fn argument(reason: impl Into<String>) -> Self {
        Self::Argument(reason.into())
    }

    pub fn malloc(reason: impl Into<String>) -> Self {
        Self::Malloc(reason.into())
    }

    pub fn bug(reason: impl Into<String>) -> Self {
        Self::Bug(reason.into())
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self::NotApplicable(reason.into())
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    /// Legacy negative status code for front-ends that speak integers.
    pub fn code(&self) -> i32 {
        match self {
            Self::Generic(_) | Self::Usb(_) | Self::SerialPort(_) | Self::Io(_) | Self::Zip(_) => -1,
            Self::Malloc(_) => -2,
            Self::Argument(_) => -3,
            Self::Bug(_) => -4,
            Self::Samplerate(_) => -5,
            Self::NotApplicable(_) => -6,
            Self::DeviceClosed => -7,
            Self::Timeout { .. } => -8,
            Self::NotFound(_) => -9,
            Self::DeviceBusy => -10,
        }
    }
}
