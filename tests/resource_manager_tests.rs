//! Acquire/release semantics of the resource manager.

use gpu_resource_pool::{
    test_utils::MockPlatform, Error, Place, ResourceManager, StreamId,
};

fn external_stream(addr: usize) -> StreamId {
    StreamId::from_addr(addr).expect("non-null test stream")
}

#[test]
fn test_null_stream_creates_owned_stream() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());

    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
    assert_eq!(manager.ref_count(stream), 1);
    assert!(mock.driver.is_live(stream));
    assert!(manager.get_gpu_resource(stream)?.owns_stream());

    manager.destroy_gpu_resource(stream)?;
    assert_eq!(manager.ref_count(stream), 0);
    assert!(!mock.driver.is_live(stream));
    assert_eq!(mock.driver.streams_destroyed(), 1);
    Ok(())
}

#[test]
fn test_borrowed_stream_is_never_destroyed() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let external = external_stream(0xdead_0000);

    let stream = manager.init_gpu_resource(Place::Gpu(0), Some(external))?;
    assert_eq!(stream, external);
    assert!(!manager.get_gpu_resource(stream)?.owns_stream());
    assert_eq!(mock.driver.streams_created(), 0);

    manager.destroy_gpu_resource(stream)?;
    assert_eq!(manager.ref_count(stream), 0);
    assert_eq!(mock.driver.streams_destroyed(), 0);
    assert_eq!(mock.libraries.live_handles(), 0);
    Ok(())
}

#[test]
fn test_reacquire_reuses_bundle() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());

    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
    let first = manager.get_gpu_resource(stream)?;
    let again = manager.init_gpu_resource(Place::Gpu(0), Some(stream))?;
    assert_eq!(again, stream);
    assert_eq!(manager.ref_count(stream), 2);
    assert_eq!(mock.driver.property_queries(), 1);

    let second = manager.get_gpu_resource(stream)?;
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.blas_handle(), second.blas_handle());
    Ok(())
}

#[test]
fn test_ref_count_tracks_acquires_minus_releases() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let external = external_stream(0xbeef_0000);

    // Three rounds of acquire-heavy then release-to-zero sequences.
    for round in 1..=3 {
        let acquires = round * 2 + 1;
        for i in 0..acquires {
            manager.init_gpu_resource(Place::Gpu(0), Some(external))?;
            assert_eq!(manager.ref_count(external), i + 1);
        }
        for i in (0..acquires).rev() {
            manager.destroy_gpu_resource(external)?;
            assert_eq!(manager.ref_count(external), i);
        }
        // Exactly one construction and one teardown per round.
        assert_eq!(mock.driver.property_queries(), round);
        assert_eq!(mock.libraries.live_handles(), 0);
    }
    Ok(())
}

#[test]
fn test_increase_and_decrease() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;

    assert_eq!(manager.increase(stream)?, 2);
    assert_eq!(manager.increase(stream)?, 3);
    assert_eq!(manager.decrease(stream)?, 2);
    assert_eq!(manager.decrease(stream)?, 1);
    assert!(mock.driver.is_live(stream));
    assert_eq!(manager.decrease(stream)?, 0);
    assert!(!mock.driver.is_live(stream));
    assert!(manager.get_gpu_resource(stream).is_err());
    Ok(())
}

#[test]
fn test_unknown_stream_is_invalid_argument() {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let unknown = external_stream(0x5eed_0000);

    assert!(matches!(
        manager.destroy_gpu_resource(unknown),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        manager.get_gpu_resource(unknown),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(manager.increase(unknown), Err(Error::InvalidArgument(_))));
    assert!(matches!(manager.decrease(unknown), Err(Error::InvalidArgument(_))));
    assert_eq!(manager.ref_count(unknown), 0);
}

#[test]
fn test_unknown_stream_error_names_the_stream() {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let err = manager
        .destroy_gpu_resource(external_stream(0xabc0))
        .unwrap_err();
    assert!(err.to_string().contains("0xabc0"), "got: {}", err);
}

#[test]
fn test_released_stream_is_gone() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    let stream = manager.init_gpu_resource(Place::Gpu(0), None)?;
    manager.destroy_gpu_resource(stream)?;

    assert!(matches!(
        manager.destroy_gpu_resource(stream),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(mock.driver.streams_destroyed(), 1);
    Ok(())
}

#[test]
fn test_independent_managers_do_not_share_state() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let a = ResourceManager::new(mock.platform());
    let b = ResourceManager::new(mock.platform());
    let stream = a.init_gpu_resource(Place::Gpu(0), None)?;

    assert_eq!(a.ref_count(stream), 1);
    assert_eq!(b.ref_count(stream), 0);
    assert!(b.get_gpu_resource(stream).is_err());
    Ok(())
}

#[test]
fn test_cpu_place_rejected_without_registering() {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    assert!(matches!(
        manager.init_gpu_resource(Place::Cpu, None),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(manager.gpu_resource_count(), 0);
}

#[test]
fn test_get_cpu_resource_before_init_fails() {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    assert!(matches!(
        manager.get_cpu_resource(),
        Err(Error::PreconditionNotMet(_))
    ));
}

#[test]
fn test_init_cpu_resource_is_idempotent() -> Result<(), Error> {
    let mock = MockPlatform::new();
    let manager = ResourceManager::new(mock.platform());
    manager.init_cpu_resource()?;
    let first = manager.get_cpu_resource()?;
    manager.init_cpu_resource()?;
    manager.init_cpu_resource()?;
    let second = manager.get_cpu_resource()?;
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.contraction_device().num_threads(), 1);
    Ok(())
}
