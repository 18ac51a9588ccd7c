//! Dispatch error kinds.
//!
//! Every kind surfaces to HTTP clients as a distinct `status` string plus a
//! status code; validation errors carry no state change, resource errors
//! are raised only after partial acquisitions have been rolled back.

use crate::config::{Mode, TransportError};
use crate::container::ContainerError;
use crate::lock::LockError;
use crate::staging::StagingError;
use crate::template::TemplateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    #[error("unknown probe id {0}")]
    UnknownProbe(u32),

    #[error(
        "probe {probe_id} (interface '{interface}') is not compatible with \
         target '{target}' in mode '{mode}'"
    )]
    IncompatibleProbe {
        probe_id: u32,
        interface: String,
        target: String,
        mode: Mode,
    },

    #[error(transparent)]
    InvalidTransport(#[from] TransportError),

    #[error("probe {0} is not connected")]
    ProbeNotConnected(u32),

    #[error("probe {0} is busy")]
    ProbeBusy(u32),

    #[error("dispatch for probe {0} aborted by a concurrent stop")]
    DispatchAborted(u32),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("container '{container}' failed to start: {detail}")]
    ContainerStartFailed { container: String, detail: String },

    #[error("tool exited with code {exit_code}")]
    ToolFailed { exit_code: i32, log: String },

    #[error(transparent)]
    Staging(StagingError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// The wire-level `status` string for this kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest(_) => "InvalidRequest",
            DispatchError::UnknownTarget(_) => "UnknownTarget",
            DispatchError::UnknownProbe(_) => "UnknownProbe",
            DispatchError::IncompatibleProbe { .. } => "IncompatibleProbe",
            DispatchError::InvalidTransport(_) => "InvalidTransport",
            DispatchError::ProbeNotConnected(_) => "ProbeNotConnected",
            DispatchError::ProbeBusy(_) => "ProbeBusy",
            DispatchError::DispatchAborted(_) => "DispatchAborted",
            DispatchError::Template(_) => "TemplateError",
            DispatchError::ContainerStartFailed { .. } => "ContainerStartFailed",
            DispatchError::ToolFailed { .. } => "ToolFailed",
            DispatchError::Staging(e) => match e {
                StagingError::Io(_) => "Internal",
                _ => "InvalidRequest",
            },
            DispatchError::Internal(_) => "Internal",
        }
    }

    /// The HTTP status code this kind maps to.
    pub fn http_status(&self) -> u16 {
        match self {
            DispatchError::InvalidRequest(_)
            | DispatchError::IncompatibleProbe { .. }
            | DispatchError::InvalidTransport(_) => 400,
            DispatchError::UnknownTarget(_) | DispatchError::UnknownProbe(_) => 404,
            DispatchError::ProbeBusy(_) | DispatchError::DispatchAborted(_) => 409,
            DispatchError::ProbeNotConnected(_)
            | DispatchError::ContainerStartFailed { .. } => 503,
            DispatchError::Template(_)
            | DispatchError::ToolFailed { .. }
            | DispatchError::Internal(_) => 500,
            DispatchError::Staging(e) => match e {
                StagingError::Io(_) => 500,
                _ => 400,
            },
        }
    }

    /// Captured tool output, where this kind carries any.
    pub fn log(&self) -> Option<&str> {
        match self {
            DispatchError::ToolFailed { log, .. } => Some(log),
            _ => None,
        }
    }
}

impl From<LockError> for DispatchError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Busy(id) => DispatchError::ProbeBusy(id),
            LockError::Io { .. } => DispatchError::Internal(e.to_string()),
        }
    }
}

impl From<StagingError> for DispatchError {
    fn from(e: StagingError) -> Self {
        DispatchError::Staging(e)
    }
}

impl From<ContainerError> for DispatchError {
    fn from(e: ContainerError) -> Self {
        match e {
            ContainerError::StartFailed { container, detail } => {
                DispatchError::ContainerStartFailed { container, detail }
            }
            other => DispatchError::Internal(other.to_string()),
        }
    }
}
