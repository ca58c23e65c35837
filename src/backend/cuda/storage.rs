use crate::backend::{Allocation, Allocator, DeviceDriver, DevicePtr};
use crate::error::Error;
use crate::handle::DeviceGuard;
use crate::Place;
use cust::memory::DeviceBuffer;
use std::sync::Arc;

use super::CudaDriver;

// Helper for CudaError conversion
fn map_cuda_error(e: cust::error::CudaError) -> Error {
    Error::OutOfMemory(e.to_string())
}

/// A raw byte buffer on the device. Freed when dropped.
pub struct CudaAllocation {
    data: DeviceBuffer<u8>,
}

// The buffer is only ever touched through its raw address by device code.
unsafe impl Send for CudaAllocation {}
unsafe impl Sync for CudaAllocation {}

impl Allocation for CudaAllocation {
    fn ptr(&self) -> DevicePtr {
        DevicePtr(self.data.as_device_ptr().as_raw())
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Allocator handing out `cust` device buffers on the requested place.
pub struct CudaAllocator {
    driver: Arc<CudaDriver>,
}

impl CudaAllocator {
    pub fn new(driver: Arc<CudaDriver>) -> Self {
        Self { driver }
    }
}

impl Allocator for CudaAllocator {
    fn allocate(&self, place: Place, size: usize) -> Result<Box<dyn Allocation>, Error> {
        let device = place.gpu_index().ok_or_else(|| {
            Error::InvalidArgument(format!("CudaAllocator cannot allocate on {}", place))
        })?;
        let _guard = DeviceGuard::new(self.driver.as_ref() as &dyn DeviceDriver, device)?;
        debug_println!("[CudaAllocator::allocate] {} bytes on {}", size, place);
        let data = unsafe { DeviceBuffer::<u8>::uninitialized(size) }.map_err(map_cuda_error)?;
        Ok(Box::new(CudaAllocation { data }))
    }
}
