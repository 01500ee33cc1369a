//! Opal: OpenCL compute runtime for on-device tensor inference.
//!
//! Opal owns a single GPU device and everything around it that an
//! inference engine needs but should not pay for twice: capability
//! probing, kernel compilation with a memoizing build cache, tuned
//! launch-shape storage, cross-run persistence of compiled binaries and
//! tuning results, and command-queue profiling.
//!
//! # Architecture
//!
//! - **capability**: one-time device probing and vendor classification
//! - **program**: build-option resolution and the compiled-program cache
//! - **tuning**: exact-match table of tuned local work sizes
//! - **runtime**: the [`Runtime`] type tying device, queue, caches, and
//!   persistence together
//!
//! Kernel dispatch, operator selection, and the tuning search itself live
//! in the layers above; they drive one [`Runtime`] per device from a
//! single thread.

pub mod capability;
pub mod error;
pub mod program;
pub mod runtime;
pub mod sources;
pub mod tuning;

mod cache;

pub use capability::{CapabilitySnapshot, GpuFamily};
pub use error::{BuildError, CreateError};
pub use program::{resolve_build_options, BuildKey};
pub use runtime::Runtime;
pub use tuning::TuningTable;

// The OpenCL wrapper types (kernels, events, queues) appear in this
// crate's public API.
pub use opencl3;
