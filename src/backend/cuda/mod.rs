mod context;
mod libraries;
mod storage;

pub use context::CudaDriver;
pub use libraries::CudaLibraries;
pub use storage::{CudaAllocation, CudaAllocator};
