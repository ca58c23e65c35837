//! Process-wide registry of context resource bundles.
//!
//! GPU bundles are keyed by stream identity and reference counted. Every
//! registry mutation, including bundle construction and teardown, runs under
//! one GPU lock, so a stream is never registered twice and never torn down
//! twice. The CPU bundle is created once under its own lock.

use crate::backend::{Platform, StreamId};
use crate::error::Error;
use crate::resource::{CpuContextResource, GpuContextResource};
use crate::Place;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

struct GpuEntry {
    resource: Arc<GpuContextResource>,
    ref_count: usize,
}

#[derive(Default)]
struct GpuRegistry {
    entries: HashMap<StreamId, GpuEntry>,
}

impl GpuRegistry {
    fn increase(&mut self, stream: StreamId) -> Result<usize, Error> {
        let entry = self
            .entries
            .get_mut(&stream)
            .ok_or_else(|| not_found(stream, "ref_count"))?;
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// Drops one reference. At zero the entry is erased and the bundle torn down.
    fn decrease(&mut self, stream: StreamId) -> Result<usize, Error> {
        let entry = self
            .entries
            .get_mut(&stream)
            .ok_or_else(|| not_found(stream, "ref_count"))?;
        entry.ref_count -= 1;
        let remaining = entry.ref_count;
        if remaining == 0 {
            if let Some(entry) = self.entries.remove(&stream) {
                debug_println!("[ResourceManager] last reference to stream {} released", stream);
                release_bundle(entry.resource)?;
            }
        }
        Ok(remaining)
    }
}

fn not_found(stream: StreamId, table: &str) -> Error {
    Error::InvalidArgument(format!("The stream[{}] not found in {}.", stream, table))
}

fn release_bundle(resource: Arc<GpuContextResource>) -> Result<(), Error> {
    match Arc::try_unwrap(resource) {
        Ok(resource) => resource.release(),
        Err(shared) => {
            // Someone still holds the bundle; it tears itself down when they drop it.
            tracing::warn!(
                "stream {} released while {} bundle references are still alive",
                shared.stream(),
                Arc::strong_count(&shared) - 1
            );
            Ok(())
        }
    }
}

pub struct ResourceManager {
    platform: Platform,
    cpu_resource: Mutex<Option<Arc<CpuContextResource>>>,
    gpu_resources: Mutex<GpuRegistry>,
}

impl ResourceManager {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            cpu_resource: Mutex::new(None),
            gpu_resources: Mutex::new(GpuRegistry::default()),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    fn lock_cpu(&self) -> Result<MutexGuard<'_, Option<Arc<CpuContextResource>>>, Error> {
        self.cpu_resource.lock().map_err(|_| Error::poisoned("CPU resource"))
    }

    fn lock_gpu(&self) -> Result<MutexGuard<'_, GpuRegistry>, Error> {
        self.gpu_resources.lock().map_err(|_| Error::poisoned("GPU resource"))
    }

    /// Creates the CPU bundle on first call; later calls do nothing.
    pub fn init_cpu_resource(&self) -> Result<(), Error> {
        let mut cpu = self.lock_cpu()?;
        if cpu.is_none() {
            debug_println!("[ResourceManager::init_cpu_resource] creating CPU resource");
            *cpu = Some(Arc::new(CpuContextResource::new()));
        }
        Ok(())
    }

    pub fn get_cpu_resource(&self) -> Result<Arc<CpuContextResource>, Error> {
        self.lock_cpu()?.clone().ok_or_else(|| {
            Error::PreconditionNotMet("cpu_resource should be not null!".to_string())
        })
    }

    /// Acquires the bundle for `stream`, building it if the stream is unseen.
    ///
    /// With `None` a new owned stream is created and returned. With a known
    /// stream the reference count is bumped and the same identity returned.
    pub fn init_gpu_resource(
        &self,
        place: Place,
        stream: Option<StreamId>,
    ) -> Result<StreamId, Error> {
        let mut registry = self.lock_gpu()?;
        if let Some(stream) = stream {
            if registry.entries.contains_key(&stream) {
                registry.increase(stream)?;
                return Ok(stream);
            }
        }

        let resource = GpuContextResource::new(&self.platform, place, stream)?;
        let s = resource.stream();
        debug_println!("[ResourceManager::init_gpu_resource] registered stream {} on {}", s, place);
        registry.entries.insert(
            s,
            GpuEntry {
                resource: Arc::new(resource),
                ref_count: 1,
            },
        );
        Ok(s)
    }

    /// Releases one reference to `stream`, tearing the bundle down at zero.
    pub fn destroy_gpu_resource(&self, stream: StreamId) -> Result<(), Error> {
        let mut registry = self.lock_gpu()?;
        if !registry.entries.contains_key(&stream) {
            return Err(not_found(stream, "gpu_resources"));
        }
        registry.decrease(stream).map(|_| ())
    }

    pub fn get_gpu_resource(&self, stream: StreamId) -> Result<Arc<GpuContextResource>, Error> {
        let registry = self.lock_gpu()?;
        registry
            .entries
            .get(&stream)
            .map(|entry| entry.resource.clone())
            .ok_or_else(|| not_found(stream, "gpu_resources"))
    }

    /// Adds a reference to a registered stream and returns the new count.
    pub fn increase(&self, stream: StreamId) -> Result<usize, Error> {
        self.lock_gpu()?.increase(stream)
    }

    /// Drops a reference to a registered stream and returns the new count.
    pub fn decrease(&self, stream: StreamId) -> Result<usize, Error> {
        self.lock_gpu()?.decrease(stream)
    }

    /// Current count for `stream`, or 0 if it is not registered.
    pub fn ref_count(&self, stream: StreamId) -> usize {
        self.gpu_resources
            .lock()
            .ok()
            .and_then(|registry| registry.entries.get(&stream).map(|entry| entry.ref_count))
            .unwrap_or(0)
    }

    /// Number of registered streams.
    pub fn gpu_resource_count(&self) -> usize {
        self.gpu_resources
            .lock()
            .map(|registry| registry.entries.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("gpu_resources", &self.gpu_resource_count())
            .finish_non_exhaustive()
    }
}

lazy_static! {
    static ref GLOBAL_RESOURCE_MANAGER: Mutex<Option<Arc<ResourceManager>>> = Mutex::new(None);
}

/// Initializes the process-wide manager. Later calls return the existing one
/// and ignore `platform`.
pub fn init_global_manager(platform: Platform) -> Result<Arc<ResourceManager>, Error> {
    let mut global = GLOBAL_RESOURCE_MANAGER
        .lock()
        .map_err(|_| Error::poisoned("global resource manager"))?;
    let manager = global.get_or_insert_with(|| {
        debug_println!("Initializing global resource manager");
        Arc::new(ResourceManager::new(platform))
    });
    Ok(manager.clone())
}

pub fn global_manager() -> Result<Arc<ResourceManager>, Error> {
    let global = GLOBAL_RESOURCE_MANAGER
        .lock()
        .map_err(|_| Error::poisoned("global resource manager"))?;
    global.clone().ok_or_else(|| {
        Error::PreconditionNotMet(
            "Resource manager not initialized. Call init_global_manager first.".into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPlatform;

    #[test]
    fn test_held_bundle_outlives_release() {
        let mock = MockPlatform::new();
        let manager = ResourceManager::new(mock.platform());
        let stream = manager.init_gpu_resource(Place::Gpu(0), None).unwrap();
        let held = manager.get_gpu_resource(stream).unwrap();

        manager.destroy_gpu_resource(stream).unwrap();
        assert_eq!(manager.ref_count(stream), 0);
        assert_eq!(mock.driver.live_streams(), 1);

        drop(held);
        assert_eq!(mock.driver.live_streams(), 0);
        assert_eq!(mock.libraries.live_handles(), 0);
    }
}
