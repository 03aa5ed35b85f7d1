//! Error types for Vessel
//!
//! Every failure maps onto one of four fixed kinds (see [`ErrorKind`]).
//! Nothing in this crate retries internally; callers decide.

use std::io;

use thiserror::Error;

/// Result type alias using VesselError
pub type Result<T> = std::result::Result<T, VesselError>;

/// The fixed classification every [`VesselError`] falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad magic/version/checksum in persisted or framed state
    Format,
    /// Authentication failure on encrypted data
    Security,
    /// Missing/unwritable storage or misuse of a container's lifecycle
    Resource,
    /// Failure to re-attach a container after restart
    Resume,
}

/// Unified error type for Vessel operations
#[derive(Debug, Error)]
pub enum VesselError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(io::Error),

    // -------------------------------------------------------------------------
    // Format Errors
    // -------------------------------------------------------------------------
    #[error("Format error: {0}")]
    Format(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Security Errors
    // -------------------------------------------------------------------------
    #[error("Security error: {0}")]
    Security(String),

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Resource error: {0}")]
    Resource(String),

    // -------------------------------------------------------------------------
    // Resume Errors
    // -------------------------------------------------------------------------
    #[error("Resume error: {0}")]
    Resume(String),
}

impl VesselError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            VesselError::Io(_) | VesselError::Resource(_) => ErrorKind::Resource,
            VesselError::Format(_) | VesselError::Serialization(_) => ErrorKind::Format,
            VesselError::Security(_) => ErrorKind::Security,
            VesselError::Resume(_) => ErrorKind::Resume,
        }
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        VesselError::Resource(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        VesselError::Format(msg.into())
    }

    /// Wrap this error so it can travel through `std::io::Read`/`Write`
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            VesselError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// Unwraps a `VesselError` that was smuggled through an `io::Error`
impl From<io::Error> for VesselError {
    fn from(err: io::Error) -> Self {
        if err
            .get_ref()
            .map(|inner| inner.is::<VesselError>())
            .unwrap_or(false)
        {
            if let Some(inner) = err.into_inner() {
                if let Ok(vessel) = inner.downcast::<VesselError>() {
                    return *vessel;
                }
            }
            return VesselError::resource("lost wrapped error");
        }
        VesselError::Io(err)
    }
}

impl From<bincode::Error> for VesselError {
    fn from(err: bincode::Error) -> Self {
        VesselError::Serialization(err.to_string())
    }
}
