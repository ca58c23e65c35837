//! Scratch allocator adapter bookkeeping.

use gpu_resource_pool::{
    test_utils::MockPlatform, DevicePtr, Error, Place, ScratchAllocator, StreamId, SCRATCH_SIZE,
};
use std::sync::Arc;
use std::thread;

fn adapter(mock: &MockPlatform) -> ScratchAllocator {
    ScratchAllocator::new(
        Place::Gpu(0),
        StreamId::from_addr(0x4000).unwrap(),
        mock.allocator.clone(),
        mock.driver.clone(),
    )
}

#[test]
fn test_zero_byte_allocation_skips_allocator() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = adapter(&mock);
    assert_eq!(scratch.allocate(0)?, None);
    assert_eq!(mock.allocator.allocate_calls(), 0);
    assert_eq!(scratch.outstanding(), 0);
    Ok(())
}

#[test]
fn test_allocate_then_deallocate_empties_map() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = adapter(&mock);
    let ptr = scratch.allocate(512)?.expect("non-empty allocation");
    assert!(!ptr.is_null());
    assert_eq!(scratch.outstanding(), 1);
    assert_eq!(scratch.outstanding_bytes(), 512);

    scratch.deallocate(ptr)?;
    assert_eq!(scratch.outstanding(), 0);
    assert_eq!(mock.allocator.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_deallocate_unknown_or_null_is_noop() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = adapter(&mock);
    let ptr = scratch.allocate(64)?.unwrap();

    scratch.deallocate(DevicePtr(0x1234_5678))?;
    scratch.deallocate(DevicePtr::NULL)?;
    assert_eq!(scratch.outstanding(), 1);

    // A second free of the same address is also ignored.
    scratch.deallocate(ptr)?;
    scratch.deallocate(ptr)?;
    assert_eq!(scratch.outstanding(), 0);
    Ok(())
}

#[test]
fn test_allocator_failure_propagates_and_tracks_nothing() {
    let mock = MockPlatform::new();
    mock.allocator.fail_allocations(true);
    let scratch = adapter(&mock);
    assert!(matches!(scratch.allocate(128), Err(Error::OutOfMemory(_))));
    assert!(scratch.scratchpad().is_err());
    assert_eq!(scratch.outstanding(), 0);
}

#[test]
fn test_scratchpad_and_semaphore_layout() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = adapter(&mock);
    let pad = scratch.scratchpad()?;
    let sem = scratch.semaphore()?;
    assert_eq!(sem, pad.offset(SCRATCH_SIZE));
    assert_eq!(scratch.outstanding(), 1);
    assert_eq!(scratch.outstanding_bytes(), SCRATCH_SIZE + std::mem::size_of::<u32>());
    Ok(())
}

#[test]
fn test_drop_frees_outstanding_allocations() -> Result<(), Error> {
    let mock = MockPlatform::new();
    {
        let scratch = adapter(&mock);
        scratch.allocate(32)?;
        scratch.allocate(64)?;
        assert_eq!(mock.allocator.live_allocations(), 2);
    }
    assert_eq!(mock.allocator.live_allocations(), 0);
    Ok(())
}

#[test]
fn test_concurrent_allocate_and_free() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = Arc::new(adapter(&mock));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let scratch = Arc::clone(&scratch);
            thread::spawn(move || -> Result<(), Error> {
                for j in 0..50 {
                    let ptr = scratch.allocate(16 * (i + 1) + j)?.unwrap();
                    scratch.deallocate(ptr)?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }
    assert_eq!(scratch.outstanding(), 0);
    assert_eq!(mock.allocator.allocate_calls(), 400);
    Ok(())
}

#[test]
fn test_deallocating_scratchpad_keeps_it_alive() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let scratch = adapter(&mock);
    let pad = scratch.scratchpad()?;
    let sem = scratch.semaphore()?;

    scratch.deallocate(pad)?;
    assert_eq!(scratch.outstanding(), 1);
    assert_eq!(mock.allocator.live_allocations(), 1);
    assert_eq!(scratch.scratchpad()?, pad);
    assert_eq!(scratch.semaphore()?, sem);
    assert_eq!(mock.allocator.allocate_calls(), 1);
    Ok(())
}
