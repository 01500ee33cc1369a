//! Error types for runtime construction and program builds.

use opencl3::error_codes::ClError;

/// Errors that are fatal to runtime construction.
///
/// Construction failure is a recoverable condition for the embedding
/// engine: it matches on this error and falls back to another compute
/// backend instead of unwinding.
#[derive(thiserror::Error, Debug)]
pub enum CreateError {
    /// No OpenCL platform is available on this machine.
    #[error("no OpenCL platform available")]
    NoPlatform,
    /// The selected platform exposes no GPU-class device.
    #[error("no OpenCL GPU device available")]
    NoDevice,
    /// Context or command queue creation failed.
    #[error("OpenCL error during runtime construction: {0}")]
    Api(#[from] ClError),
}

/// Errors raised while resolving or compiling a kernel program.
///
/// None of these are retried automatically: an unknown source is a
/// configuration error, and a compile failure indicates a source/driver
/// incompatibility the caller routes around (typically by disabling the
/// code path that needs the kernel).
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// No embedded kernel source is registered under this identifier.
    #[error("no embedded kernel source named '{0}'")]
    UnknownSource(String),
    /// The device compiler rejected the source; the build log is attached.
    #[error("device compiler rejected program '{program}': {log}")]
    CompileFailed { program: String, log: String },
    /// An OpenCL call outside the compile step failed.
    #[error("OpenCL error: {0}")]
    Api(#[from] ClError),
}
