//! Crate-level error types.
//!
//! Errors fall into three groups:
//!
//! - **Exhaustion** never surfaces here. Arrays, atlases and the staging stack
//!   grow instead of failing.
//! - **API misuse** ([`GraphicsError::ApiMisuse`]) means the caller broke a
//!   contract (double free, wrong dynamic index count, stale staging marker).
//!   The operation is aborted and the error is logged with the call site.
//! - **Device failure** ([`GraphicsError::Backend`]) comes from the GPU device
//!   and is fatal. The library hands it back; the embedding application decides
//!   how to terminate.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors produced by the resource and frame management layer.
#[derive(Error, Debug)]
pub enum GraphicsError {
    /// The device failed. Not recoverable.
    #[error("device failure: {0}")]
    Backend(#[from] BackendError),

    /// A caller violated an API contract.
    #[error("API misuse at {location}: {message}")]
    ApiMisuse {
        message: String,
        location: CallSite,
    },

    /// An id does not name a live resource in the context.
    #[error("unknown {kind} id {id}")]
    UnknownResource { kind: &'static str, id: u64 },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GraphicsError {
    /// Build an [`ApiMisuse`](Self::ApiMisuse) error for the caller's location and log it.
    #[track_caller]
    pub fn misuse(message: impl Into<String>) -> Self {
        let location = CallSite::from(Location::caller());
        let message = message.into();
        log::error!("API misuse at {location}: {message}");
        Self::ApiMisuse { message, location }
    }

    /// Whether the error came from the device and leaves it in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// Whether the error is a caller contract violation.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::ApiMisuse { .. })
    }
}

/// Source location attached to an API misuse report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl From<&'static Location<'static>> for CallSite {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

pub type GraphicsResult<T> = Result<T, GraphicsError>;
