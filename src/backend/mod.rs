//! Contracts for the external collaborators a resource bundle is built from.
//!
//! The pool never talks to a GPU directly. It sequences calls into three
//! collaborators: the device driver (streams, properties, device binding),
//! the memory allocator, and the backend numerical libraries. Each is a
//! trait object so a manager can run against CUDA or against the mock
//! platform in [`crate::test_utils`].

use crate::error::Error;
use crate::properties::DeviceProperties;
use crate::Place;
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[cfg(feature = "cuda")]
pub mod cuda;

/// Opaque identity of a hardware execution queue.
///
/// Also the lookup key of the resource manager's registry. A null stream is
/// spelled `Option::<StreamId>::None`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(NonZeroUsize);

impl StreamId {
    pub fn from_raw(stream: *mut c_void) -> Option<Self> {
        Self::from_addr(stream as usize)
    }

    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(StreamId)
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    pub fn addr(&self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:#x})", self.0.get())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Raw device address. Zero is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque handle into a backend library. Never dereferenced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(*mut c_void);

// Library handles are plain tokens here; thread-safety of their use is the
// owning library's contract.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    pub fn from_raw(handle: *mut c_void) -> Self {
        RawHandle(handle)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Which backend library a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Deep-neural-network primitives (cuDNN)
    Dnn,
    /// Dense factorization solver (cuSOLVER)
    Solver,
    /// Linear algebra (cuBLAS)
    Blas,
    /// Lightweight linear algebra (cuBLASLt)
    BlasLt,
    /// Sparse linear algebra (cuSPARSE)
    Sparse,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Dnn => "dnn",
            HandleKind::Solver => "solver",
            HandleKind::Blas => "blas",
            HandleKind::BlasLt => "blasLt",
            HandleKind::Sparse => "sparse",
        };
        f.write_str(name)
    }
}

/// Math mode of a linear-algebra handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathMode {
    Default,
    /// Tensor-core math (runtime 9000+)
    TensorOp,
    /// TF32 tensor-core math (runtime 11000+)
    Tf32TensorOp,
}

/// Device driver layer: streams, device binding and property queries.
pub trait DeviceDriver: Send + Sync {
    /// Device currently bound to the calling thread, or `None` if the thread
    /// has nothing bound.
    fn current_device(&self) -> Result<Option<u32>, Error>;

    /// Binds `device` to the calling thread.
    fn set_device(&self, device: u32) -> Result<(), Error>;

    /// Leaves the calling thread with no device bound.
    fn clear_device(&self) -> Result<(), Error>;

    /// Creates a new stream on `device`. The caller owns it.
    fn create_stream(&self, device: u32) -> Result<StreamId, Error>;

    /// Destroys a stream previously returned by `create_stream`.
    fn destroy_stream(&self, stream: StreamId) -> Result<(), Error>;

    fn device_properties(&self, device: u32) -> Result<DeviceProperties, Error>;

    /// Enqueues a byte fill of `bytes` at `dst` on `stream`.
    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), Error>;
}

/// A device buffer handed out by an [`Allocator`]. Released on drop.
pub trait Allocation: Send + Sync {
    fn ptr(&self) -> DevicePtr;
    fn size(&self) -> usize;
}

/// External memory allocator. Must be callable from library callback contexts.
pub trait Allocator: Send + Sync {
    fn allocate(&self, place: Place, size: usize) -> Result<Box<dyn Allocation>, Error>;
}

/// Init/destroy entry points of the backend numerical libraries.
pub trait BackendLibraries: Send + Sync {
    /// Creates a handle of `kind` bound to `stream` on `device`.
    fn create_handle(
        &self,
        kind: HandleKind,
        stream: StreamId,
        device: u32,
    ) -> Result<RawHandle, Error>;

    fn destroy_handle(&self, kind: HandleKind, handle: RawHandle) -> Result<(), Error>;

    /// Configures the math mode of a `HandleKind::Blas` handle.
    fn set_math_mode(&self, handle: RawHandle, mode: MathMode) -> Result<(), Error>;
}

/// The set of collaborators a [`crate::ResourceManager`] builds bundles from.
#[derive(Clone)]
pub struct Platform {
    pub driver: Arc<dyn DeviceDriver>,
    pub allocator: Arc<dyn Allocator>,
    pub libraries: Arc<dyn BackendLibraries>,
}

impl Platform {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        allocator: Arc<dyn Allocator>,
        libraries: Arc<dyn BackendLibraries>,
    ) -> Self {
        Self {
            driver,
            allocator,
            libraries,
        }
    }

    /// Platform backed by the CUDA driver, a `cust` allocator and the CUDA libraries.
    #[cfg(feature = "cuda")]
    pub fn cuda() -> Result<Self, Error> {
        let driver = Arc::new(cuda::CudaDriver::new()?);
        let allocator = Arc::new(cuda::CudaAllocator::new(driver.clone()));
        let libraries = Arc::new(cuda::CudaLibraries::new());
        Ok(Self::new(driver, allocator, libraries))
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
