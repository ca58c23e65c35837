#![cfg(feature = "cuda")] // Only compile when CUDA feature is enabled

use gpu_resource_pool::{Error, Place, Platform, ResourceManager};
use serial_test::serial;

#[serial]
#[test]
fn test_cuda_owned_stream_lifecycle() -> Result<(), Error> {
    let manager = ResourceManager::new(Platform::cuda()?);

    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
    assert_eq!(manager.ref_count(stream), 1);

    let bundle = manager.get_gpu_resource(stream)?;
    assert!(bundle.owns_stream());
    assert!(!bundle.blas_handle().is_null());
    assert!(!bundle.solver_handle().is_null());
    assert!(!bundle.sparse_handle().is_null());
    assert!(bundle.multiprocessors() > 0);
    assert!(bundle.max_threads_per_block() > 0);
    println!("device properties: {:?}", bundle.device_properties());
    drop(bundle);

    assert_eq!(manager.init_gpu_resource(Place::Gpu(0), Some(stream))?, stream);
    manager.destroy_gpu_resource(stream)?;
    manager.destroy_gpu_resource(stream)?;
    assert_eq!(manager.ref_count(stream), 0);
    Ok(())
}

#[serial]
#[test]
fn test_cuda_scratchpad_and_semaphore() -> Result<(), Error> {
    let manager = ResourceManager::new(Platform::cuda()?);
    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
    {
        let bundle = manager.get_gpu_resource(stream)?;
        let device = bundle.contraction_device();
        let pad = device.scratchpad()?;
        let sem = device.semaphore()?;
        assert_eq!(sem, pad.offset(gpu_resource_pool::SCRATCH_SIZE));
        let buf = device.allocate(1 << 20)?.expect("1 MiB allocation");
        device.deallocate(buf)?;
        assert_eq!(device.stream_device().outstanding(), 1);
    }
    manager.destroy_gpu_resource(stream)
}
