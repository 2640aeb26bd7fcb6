// error.rs -- Error taxonomy shared by the codec, both engines and every
// device backend.
//
// All variants are unrecoverable for the current run: they propagate to the
// top-level caller unchanged and nothing retries. `ErrorKind` is the
// payload-free tag the tile scheduler records in `SchedulerState::Failed`.

use std::fmt;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DiffusionError>;

#[derive(Debug, Error)]
pub enum DiffusionError {
    /// Malformed image header, unsupported channel depth or a pixel buffer
    /// whose length does not match its declared layout.
    #[error("image format error: {0}")]
    Format(String),

    /// `ProcessingParams` outside their valid ranges.
    #[error("invalid processing parameters: {0}")]
    InvalidParams(String),

    #[error("no accelerator platforms were found")]
    NoPlatform,

    #[error("no accelerator devices were found on platform `{platform}`")]
    NoDevice { platform: String },

    /// The stencil program failed to build. `log` is the backend's own
    /// diagnostic text, passed through verbatim.
    #[error("stencil program failed to build:\n{log}")]
    Compile { log: String },

    /// The packed image does not fit in device memory. Raised before any
    /// buffer is allocated.
    #[error(
        "image needs {required} bytes of device memory but `{device}` offers only {available}"
    )]
    Capacity {
        required: u64,
        available: u64,
        device: String,
    },

    /// Backend failure during allocation, enqueue, wait or readback.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Payload-free classification of a [`DiffusionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    InvalidParams,
    NoPlatform,
    NoDevice,
    Compile,
    Capacity,
    Dispatch,
    Io,
}

impl DiffusionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiffusionError::Format(_) => ErrorKind::Format,
            DiffusionError::InvalidParams(_) => ErrorKind::InvalidParams,
            DiffusionError::NoPlatform => ErrorKind::NoPlatform,
            DiffusionError::NoDevice { .. } => ErrorKind::NoDevice,
            DiffusionError::Compile { .. } => ErrorKind::Compile,
            DiffusionError::Capacity { .. } => ErrorKind::Capacity,
            DiffusionError::Dispatch(_) => ErrorKind::Dispatch,
            DiffusionError::Io(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Format => "format",
            ErrorKind::InvalidParams => "invalid-params",
            ErrorKind::NoPlatform => "no-platform",
            ErrorKind::NoDevice => "no-device",
            ErrorKind::Compile => "compile",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(DiffusionError::NoPlatform.kind(), ErrorKind::NoPlatform);
        let err = DiffusionError::Capacity {
            required: 64,
            available: 32,
            device: "fake".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Capacity);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(DiffusionError::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_compile_error_carries_log() {
        let err = DiffusionError::Compile {
            log: "error: expected `;`".into(),
        };
        let text = err.to_string();
        assert!(text.contains("expected `;`"), "{text}");
    }

    #[test]
    fn test_capacity_message_names_sizes() {
        let err = DiffusionError::Capacity {
            required: 1024,
            available: 512,
            device: "tiny".into(),
        };
        let text = err.to_string();
        assert!(text.contains("1024") && text.contains("512") && text.contains("tiny"));
    }
}
