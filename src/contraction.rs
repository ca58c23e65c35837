//! Tensor-contraction device abstractions handed to kernels.

use crate::backend::{DevicePtr, StreamId};
use crate::error::Error;
use crate::properties::DeviceProperties;
use crate::scratch::ScratchAllocator;

/// Host contraction device. Single-threaded, holds nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostContractionDevice;

impl HostContractionDevice {
    pub fn new() -> Self {
        HostContractionDevice
    }

    pub fn num_threads(&self) -> usize {
        1
    }
}

/// GPU contraction device bound to one stream.
///
/// Allocations made through it go to the external allocator via the
/// [`ScratchAllocator`] and are force-freed when the device is released.
#[derive(Debug)]
pub struct GpuContractionDevice {
    stream_device: ScratchAllocator,
    properties: DeviceProperties,
}

impl GpuContractionDevice {
    pub fn new(stream_device: ScratchAllocator, properties: DeviceProperties) -> Self {
        Self {
            stream_device,
            properties,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream_device.stream()
    }

    pub fn device_properties(&self) -> &DeviceProperties {
        &self.properties
    }

    pub fn stream_device(&self) -> &ScratchAllocator {
        &self.stream_device
    }

    pub fn allocate(&self, num_bytes: usize) -> Result<Option<DevicePtr>, Error> {
        self.stream_device.allocate(num_bytes)
    }

    pub fn deallocate(&self, ptr: DevicePtr) -> Result<(), Error> {
        self.stream_device.deallocate(ptr)
    }

    pub fn scratchpad(&self) -> Result<DevicePtr, Error> {
        self.stream_device.scratchpad()
    }

    pub fn semaphore(&self) -> Result<DevicePtr, Error> {
        self.stream_device.semaphore()
    }

    pub fn num_multiprocessors(&self) -> i32 {
        self.properties.multiprocessors
    }

    pub fn max_threads_per_block(&self) -> i32 {
        self.properties.max_threads_per_block
    }

    pub fn max_threads_per_multiprocessor(&self) -> i32 {
        self.properties.max_threads_per_mp
    }

    pub fn major_device_version(&self) -> i32 {
        self.properties.major()
    }

    pub fn minor_device_version(&self) -> i32 {
        self.properties.minor()
    }

    /// Upper bound on resident blocks across the device.
    pub fn max_blocks(&self) -> i32 {
        if self.properties.max_threads_per_block <= 0 {
            return 0;
        }
        self.properties.multiprocessors * self.properties.max_threads_per_mp
            / self.properties.max_threads_per_block
    }

    /// Frees all outstanding allocations.
    pub fn release(self) -> Result<(), Error> {
        self.release_allocations()
    }

    pub(crate) fn release_allocations(&self) -> Result<(), Error> {
        self.stream_device.release_all().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPlatform;
    use crate::Place;

    #[test]
    fn test_launch_limits_follow_properties() {
        let mock = MockPlatform::new();
        let props = mock.driver.properties();
        let stream = StreamId::from_addr(0x9000).unwrap();
        let device = GpuContractionDevice::new(
            ScratchAllocator::new(
                Place::Gpu(0),
                stream,
                mock.allocator.clone(),
                mock.driver.clone(),
            ),
            props,
        );
        assert_eq!(device.stream(), stream);
        assert_eq!(device.num_multiprocessors(), props.multiprocessors);
        assert_eq!(device.major_device_version(), props.major());
        assert_eq!(
            device.max_blocks(),
            props.multiprocessors * props.max_threads_per_mp / props.max_threads_per_block
        );
    }

    #[test]
    fn test_release_frees_outstanding_allocations() {
        let mock = MockPlatform::new();
        let stream = StreamId::from_addr(0x9000).unwrap();
        let device = GpuContractionDevice::new(
            ScratchAllocator::new(
                Place::Gpu(0),
                stream,
                mock.allocator.clone(),
                mock.driver.clone(),
            ),
            mock.driver.properties(),
        );
        device.allocate(256).unwrap();
        device.semaphore().unwrap();
        assert_eq!(mock.allocator.live_allocations(), 2);
        device.release().unwrap();
        assert_eq!(mock.allocator.live_allocations(), 0);
    }

    #[test]
    fn test_host_device_is_single_threaded() {
        assert_eq!(HostContractionDevice::new().num_threads(), 1);
    }
}
