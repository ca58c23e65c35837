//! A reference-counted pool of per-stream GPU resources
//!
//! This library lets several inference pipelines share one hardware stream and the
//! expensive library handles created against it:
//! - CPU and GPU (CUDA) context resource bundles
//! - Reference-counted acquire/release keyed by stream identity
//! - Owned vs borrowed streams, torn down exactly once
//! - A scratch allocator adapter for tensor-contraction devices
//!
//! # Features
//! - `cuda` - Enables the CUDA platform (requires CUDA toolkit)
//! - `debug_logs` - Routes `debug_println!` output through `tracing`
//!
//! # Example
//! ```rust
//! use gpu_resource_pool::{test_utils::MockPlatform, Place, ResourceManager};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mock = MockPlatform::new();
//!     let manager = ResourceManager::new(mock.platform());
//!
//!     // A null stream asks the bundle to create and own a new one
//!     let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
//!     let again = manager.init_gpu_resource(Place::Gpu(0), Some(stream))?;
//!     assert_eq!(stream, again);
//!     assert_eq!(manager.ref_count(stream), 2);
//!
//!     let bundle = manager.get_gpu_resource(stream)?;
//!     println!("blas handle: {:?}", bundle.blas_handle());
//!     drop(bundle);
//!
//!     manager.destroy_gpu_resource(stream)?;
//!     manager.destroy_gpu_resource(stream)?;
//!     assert_eq!(manager.ref_count(stream), 0);
//!     Ok(())
//! }
//! ```

// --- Central debug_println macro definition ---
/// Conditional logging macro. Emits a `tracing` debug event if 'debug_logs' feature is enabled.
#[cfg(feature = "debug_logs")]
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        ::tracing::debug!(target: module_path!(), "{}", ::std::format_args!($($arg)*))
    };
}

/// Conditional logging macro (disabled version). Does nothing.
#[cfg(not(feature = "debug_logs"))]
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

// Declare the modules within the crate
pub mod backend;
pub mod contraction;
pub mod error;
pub mod handle;
pub mod manager;
pub mod properties;
pub mod resource;
pub mod scratch;

// Mock platform, used by the integration tests and by callers without a GPU
pub mod test_utils;

use std::fmt;

/// Represents the device a resource bundle is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    /// Host
    Cpu,
    /// GPU with a specific device index
    Gpu(u32),
}

impl Place {
    /// Device index for GPU places, `None` for the host.
    pub fn gpu_index(&self) -> Option<u32> {
        match self {
            Place::Cpu => None,
            Place::Gpu(index) => Some(*index),
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Place::Gpu(_))
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Cpu => write!(f, "Place(cpu)"),
            Place::Gpu(index) => write!(f, "Place(gpu:{})", index),
        }
    }
}

// Re-export the public types for easier use by consumers of the library
pub use backend::{
    Allocation, Allocator, BackendLibraries, DeviceDriver, DevicePtr, HandleKind, MathMode,
    Platform, RawHandle, StreamId,
};
pub use contraction::{GpuContractionDevice, HostContractionDevice};
pub use error::Error;
pub use handle::{DeviceGuard, LibraryHandle, StreamHandle, StreamOwnership};
pub use manager::{global_manager, init_global_manager, ResourceManager};
pub use properties::{DeviceProperties, TensorCoreSupport};
pub use resource::{CpuContextResource, GpuContextResource};
pub use scratch::{ScratchAllocator, SCRATCH_SIZE};
