use crate::backend::{DeviceDriver, HandleKind, MathMode, Platform, RawHandle, StreamId};
use crate::contraction::GpuContractionDevice;
use crate::error::Error;
use crate::handle::{DeviceGuard, LibraryHandle, StreamHandle};
use crate::properties::{DeviceProperties, TensorCoreSupport};
use crate::scratch::ScratchAllocator;
use crate::Place;
use std::fmt;
use std::sync::Arc;

/// Linear-algebra handles. Tensor-core variants exist only when the runtime supports them.
struct BlasHandles {
    // Drop order is the reverse of creation order.
    tf32_tensor_core: Option<LibraryHandle>,
    tensor_core: Option<LibraryHandle>,
    base: LibraryHandle,
}

impl BlasHandles {
    fn create(
        platform: &Platform,
        stream: StreamId,
        device: u32,
        support: TensorCoreSupport,
    ) -> Result<Self, Error> {
        let libraries = &platform.libraries;
        let base =
            LibraryHandle::create_blas(libraries.clone(), stream, device, MathMode::Default)?;
        let tensor_core = if support.tensor_op {
            Some(LibraryHandle::create_blas(
                libraries.clone(),
                stream,
                device,
                MathMode::TensorOp,
            )?)
        } else {
            None
        };
        let tf32_tensor_core = if support.tf32 {
            Some(LibraryHandle::create_blas(
                libraries.clone(),
                stream,
                device,
                MathMode::Tf32TensorOp,
            )?)
        } else {
            None
        };
        Ok(Self {
            tf32_tensor_core,
            tensor_core,
            base,
        })
    }

    fn destroy(&mut self, teardown: &mut Teardown) {
        if let Some(handle) = self.tf32_tensor_core.as_mut() {
            teardown.record(handle.destroy());
        }
        if let Some(handle) = self.tensor_core.as_mut() {
            teardown.record(handle.destroy());
        }
        teardown.record(self.base.destroy());
    }
}

/// Keeps the first error of a teardown walk while letting every step run.
#[derive(Default)]
struct Teardown {
    first_error: Option<Error>,
}

impl Teardown {
    fn record(&mut self, result: Result<(), Error>) {
        if let Err(e) = result {
            tracing::warn!("resource teardown step failed: {}", e);
            if self.first_error.is_none() {
                self.first_error = Some(e);
            }
        }
    }

    fn finish(self) -> Result<(), Error> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// All device resources bound to one stream.
///
/// Built all-or-nothing by [`GpuContextResource::new`] and immutable afterwards.
/// Construction order is: stream, device properties, contraction device, dnn,
/// solver, blas (base, tensor-core, tf32), blasLt, sparse. Teardown runs the
/// exact reverse with the bundle's device bound, destroying the stream last and
/// only if it is owned. A bundle that is dropped instead of released runs the
/// same teardown and logs failures.
pub struct GpuContextResource {
    // Declared in teardown order; a failed `new` rolls back through field drops.
    sparse: LibraryHandle,
    blas_lt: LibraryHandle,
    blas: BlasHandles,
    solver: LibraryHandle,
    dnn: LibraryHandle,
    contraction_device: GpuContractionDevice,
    properties: DeviceProperties,
    stream: StreamHandle,
    driver: Arc<dyn DeviceDriver>,
    place: Place,
    device: u32,
    released: bool,
}

impl GpuContextResource {
    /// Builds the bundle for `place`. A `None` stream makes the bundle create
    /// and own a new one; `Some` is borrowed and never destroyed here.
    ///
    /// On failure every step that already completed is undone in reverse order
    /// before the error is returned.
    pub fn new(
        platform: &Platform,
        place: Place,
        stream: Option<StreamId>,
    ) -> Result<Self, Error> {
        let device = place.gpu_index().ok_or_else(|| {
            Error::InvalidArgument(format!("GPU resources require a GPU place, got {}", place))
        })?;
        let _guard = DeviceGuard::new(&*platform.driver, device)?;

        let stream = match stream {
            None => StreamHandle::create(platform.driver.clone(), device)?,
            Some(id) => StreamHandle::borrow(platform.driver.clone(), id),
        };
        let stream_id = stream.id();

        let properties = platform.driver.device_properties(device)?;
        debug_println!(
            "[GpuContextResource::new] device {} properties: {:?}",
            device,
            properties
        );

        let contraction_device = GpuContractionDevice::new(
            ScratchAllocator::new(
                place,
                stream_id,
                platform.allocator.clone(),
                platform.driver.clone(),
            ),
            properties,
        );

        let libraries = &platform.libraries;
        let dnn = LibraryHandle::create(libraries.clone(), HandleKind::Dnn, stream_id, device)?;
        let solver =
            LibraryHandle::create(libraries.clone(), HandleKind::Solver, stream_id, device)?;
        let blas = BlasHandles::create(
            platform,
            stream_id,
            device,
            TensorCoreSupport::detect(&properties),
        )?;
        let blas_lt =
            LibraryHandle::create(libraries.clone(), HandleKind::BlasLt, stream_id, device)?;
        let sparse =
            LibraryHandle::create(libraries.clone(), HandleKind::Sparse, stream_id, device)?;

        debug_println!(
            "[GpuContextResource::new] bundle ready on stream {} (owned: {})",
            stream_id,
            stream.is_owned()
        );
        Ok(Self {
            sparse,
            blas_lt,
            blas,
            solver,
            dnn,
            contraction_device,
            properties,
            stream,
            driver: platform.driver.clone(),
            place,
            device,
            released: false,
        })
    }

    /// Tears the bundle down in reverse construction order.
    ///
    /// Every step runs even if an earlier one fails; the first failure is returned.
    pub fn release(mut self) -> Result<(), Error> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut teardown = Teardown::default();
        let driver = self.driver.clone();
        let guard = DeviceGuard::new(&*driver, self.device);
        if let Err(e) = &guard {
            tracing::warn!("tearing down without binding device {}: {}", self.device, e);
        }

        teardown.record(self.sparse.destroy());
        teardown.record(self.blas_lt.destroy());
        self.blas.destroy(&mut teardown);
        teardown.record(self.solver.destroy());
        teardown.record(self.dnn.destroy());
        teardown.record(self.contraction_device.release_allocations());
        teardown.record(self.stream.destroy());

        drop(guard);
        teardown.finish()
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn stream(&self) -> StreamId {
        self.stream.id()
    }

    /// Whether the stream was created by this bundle.
    pub fn owns_stream(&self) -> bool {
        self.stream.is_owned()
    }

    pub fn dnn_handle(&self) -> RawHandle {
        self.dnn.raw()
    }

    pub fn blas_handle(&self) -> RawHandle {
        self.blas.base.raw()
    }

    /// Tensor-core linear-algebra handle, if the runtime supports it.
    pub fn blas_tensor_core_handle(&self) -> Option<RawHandle> {
        self.blas.tensor_core.as_ref().map(LibraryHandle::raw)
    }

    /// TF32 tensor-core linear-algebra handle, if the runtime supports it.
    pub fn blas_tf32_handle(&self) -> Option<RawHandle> {
        self.blas.tf32_tensor_core.as_ref().map(LibraryHandle::raw)
    }

    pub fn blas_lt_handle(&self) -> RawHandle {
        self.blas_lt.raw()
    }

    pub fn solver_handle(&self) -> RawHandle {
        self.solver.raw()
    }

    pub fn sparse_handle(&self) -> RawHandle {
        self.sparse.raw()
    }

    pub fn contraction_device(&self) -> &GpuContractionDevice {
        &self.contraction_device
    }

    pub fn device_properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn compute_capability(&self) -> i32 {
        self.properties.compute_capability
    }

    pub fn runtime_version(&self) -> i32 {
        self.properties.runtime_version
    }

    pub fn driver_version(&self) -> i32 {
        self.properties.driver_version
    }

    pub fn multiprocessors(&self) -> i32 {
        self.properties.multiprocessors
    }

    pub fn max_threads_per_mp(&self) -> i32 {
        self.properties.max_threads_per_mp
    }

    pub fn max_threads_per_block(&self) -> i32 {
        self.properties.max_threads_per_block
    }

    pub fn max_grid_dim_size(&self) -> [i32; 3] {
        self.properties.max_grid_dim_size
    }
}

impl Drop for GpuContextResource {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!("failed to tear down resources of stream {}: {}", self.stream.id(), e);
        }
    }
}

impl fmt::Debug for GpuContextResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContextResource")
            .field("place", &self.place)
            .field("stream", &self.stream)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
