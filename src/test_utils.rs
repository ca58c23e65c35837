//! In-memory platform for exercising the pool without a GPU.
//!
//! Every collaborator counts what it is asked to do and can be told to fail,
//! so tests can check construction/teardown sequencing and rollback.

use crate::backend::{
    Allocation, Allocator, BackendLibraries, DeviceDriver, DevicePtr, HandleKind, MathMode,
    Platform, RawHandle, StreamId,
};
use crate::error::Error;
use crate::properties::DeviceProperties;
use crate::Place;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

const FIRST_STREAM: usize = 0x1000;
const FIRST_HANDLE: usize = 0x10_0000;
const FIRST_ADDRESS: u64 = 0x7f00_0000_0000;

pub struct MockDriver {
    device_count: u32,
    properties: Mutex<DeviceProperties>,
    current: Mutex<HashMap<ThreadId, u32>>,
    next_stream: AtomicUsize,
    live: Mutex<HashSet<StreamId>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    property_queries: AtomicUsize,
    memsets: AtomicUsize,
    fail_create_stream: AtomicBool,
    fail_destroy_stream: AtomicBool,
    fail_properties: AtomicBool,
    fail_memset: AtomicBool,
}

impl MockDriver {
    pub fn new(device_count: u32) -> Self {
        Self {
            device_count,
            properties: Mutex::new(DeviceProperties {
                compute_capability: 80,
                runtime_version: 12020,
                driver_version: 12040,
                multiprocessors: 108,
                max_threads_per_mp: 2048,
                max_threads_per_block: 1024,
                max_grid_dim_size: [2147483647, 65535, 65535],
            }),
            current: Mutex::new(HashMap::new()),
            next_stream: AtomicUsize::new(FIRST_STREAM),
            live: Mutex::new(HashSet::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            property_queries: AtomicUsize::new(0),
            memsets: AtomicUsize::new(0),
            fail_create_stream: AtomicBool::new(false),
            fail_destroy_stream: AtomicBool::new(false),
            fail_properties: AtomicBool::new(false),
            fail_memset: AtomicBool::new(false),
        }
    }

    pub fn properties(&self) -> DeviceProperties {
        *self.properties.lock().unwrap()
    }

    pub fn set_runtime_version(&self, version: i32) {
        self.properties.lock().unwrap().runtime_version = version;
    }

    /// Streams created and not yet destroyed.
    pub fn live_streams(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_live(&self, stream: StreamId) -> bool {
        self.live.lock().unwrap().contains(&stream)
    }

    pub fn streams_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn streams_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// One query happens per bundle construction attempt.
    pub fn property_queries(&self) -> usize {
        self.property_queries.load(Ordering::SeqCst)
    }

    pub fn memsets(&self) -> usize {
        self.memsets.load(Ordering::SeqCst)
    }

    pub fn fail_create_stream(&self, fail: bool) {
        self.fail_create_stream.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy_stream(&self, fail: bool) {
        self.fail_destroy_stream.store(fail, Ordering::SeqCst);
    }

    pub fn fail_properties(&self, fail: bool) {
        self.fail_properties.store(fail, Ordering::SeqCst);
    }

    pub fn fail_memset(&self, fail: bool) {
        self.fail_memset.store(fail, Ordering::SeqCst);
    }
}

impl DeviceDriver for MockDriver {
    fn current_device(&self) -> Result<Option<u32>, Error> {
        let current = self.current.lock().unwrap();
        Ok(current.get(&thread::current().id()).copied())
    }

    fn set_device(&self, device: u32) -> Result<(), Error> {
        if device >= self.device_count {
            return Err(Error::DriverError(format!(
                "invalid device ordinal {} (have {})",
                device, self.device_count
            )));
        }
        self.current
            .lock()
            .unwrap()
            .insert(thread::current().id(), device);
        Ok(())
    }

    fn clear_device(&self) -> Result<(), Error> {
        self.current.lock().unwrap().remove(&thread::current().id());
        Ok(())
    }

    fn create_stream(&self, device: u32) -> Result<StreamId, Error> {
        if self.fail_create_stream.load(Ordering::SeqCst) {
            return Err(Error::DriverError(format!(
                "stream creation failed on device {}",
                device
            )));
        }
        let addr = self.next_stream.fetch_add(0x100, Ordering::SeqCst);
        let stream = StreamId::from_addr(addr)
            .ok_or_else(|| Error::InternalLogicError("null mock stream".to_string()))?;
        self.live.lock().unwrap().insert(stream);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), Error> {
        if self.fail_destroy_stream.load(Ordering::SeqCst) {
            return Err(Error::DriverError(format!("failed to destroy stream {}", stream)));
        }
        if !self.live.lock().unwrap().remove(&stream) {
            return Err(Error::DriverError(format!("stream {} is not live", stream)));
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn device_properties(&self, device: u32) -> Result<DeviceProperties, Error> {
        self.property_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_properties.load(Ordering::SeqCst) || device >= self.device_count {
            return Err(Error::DriverError(format!(
                "cannot query properties of device {}",
                device
            )));
        }
        Ok(self.properties())
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        _value: u8,
        _bytes: usize,
        _stream: StreamId,
    ) -> Result<(), Error> {
        if self.fail_memset.load(Ordering::SeqCst) {
            return Err(Error::DriverError(format!("memset at {} failed", dst)));
        }
        self.memsets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockAllocation {
    ptr: DevicePtr,
    size: usize,
    live: Arc<Mutex<HashMap<DevicePtr, usize>>>,
}

impl Allocation for MockAllocation {
    fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MockAllocation {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(&self.ptr);
        }
    }
}

pub struct MockAllocator {
    next_address: AtomicU64,
    live: Arc<Mutex<HashMap<DevicePtr, usize>>>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MockAllocator {
    pub fn new() -> Self {
        Self {
            next_address: AtomicU64::new(FIRST_ADDRESS),
            live: Arc::new(Mutex::new(HashMap::new())),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    pub fn allocate_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Buffers handed out and not yet dropped.
    pub fn live_allocations(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for MockAllocator {
    fn allocate(&self, place: Place, size: usize) -> Result<Box<dyn Allocation>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::OutOfMemory(format!(
                "cannot allocate {} bytes on {}",
                size, place
            )));
        }
        // Keep addresses 256-byte aligned like a real device allocator.
        let span = ((size as u64) + 255) & !255;
        let ptr = DevicePtr(self.next_address.fetch_add(span.max(256), Ordering::SeqCst));
        self.live.lock().unwrap().insert(ptr, size);
        Ok(Box::new(MockAllocation {
            ptr,
            size,
            live: self.live.clone(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryEvent {
    Created(HandleKind),
    Destroyed(HandleKind),
}

pub struct MockLibraries {
    next_handle: AtomicUsize,
    live: Mutex<HashMap<usize, HandleKind>>,
    events: Mutex<Vec<LibraryEvent>>,
    math_modes: Mutex<Vec<MathMode>>,
    fail_create: Mutex<Option<HandleKind>>,
    fail_destroy: Mutex<Option<HandleKind>>,
    fail_math_mode: AtomicBool,
}

impl MockLibraries {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicUsize::new(FIRST_HANDLE),
            live: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            math_modes: Mutex::new(Vec::new()),
            fail_create: Mutex::new(None),
            fail_destroy: Mutex::new(None),
            fail_math_mode: AtomicBool::new(false),
        }
    }

    pub fn live_handles(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn live_handles_of(&self, kind: HandleKind) -> usize {
        self.live
            .lock()
            .unwrap()
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    pub fn events(&self) -> Vec<LibraryEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn math_modes(&self) -> Vec<MathMode> {
        self.math_modes.lock().unwrap().clone()
    }

    /// Makes every creation of `kind` fail until reset with `None`.
    pub fn fail_create(&self, kind: Option<HandleKind>) {
        *self.fail_create.lock().unwrap() = kind;
    }

    pub fn fail_destroy(&self, kind: Option<HandleKind>) {
        *self.fail_destroy.lock().unwrap() = kind;
    }

    pub fn fail_math_mode(&self, fail: bool) {
        self.fail_math_mode.store(fail, Ordering::SeqCst);
    }
}

impl Default for MockLibraries {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendLibraries for MockLibraries {
    fn create_handle(
        &self,
        kind: HandleKind,
        stream: StreamId,
        _device: u32,
    ) -> Result<RawHandle, Error> {
        if *self.fail_create.lock().unwrap() == Some(kind) {
            return Err(Error::library(
                kind,
                format!("init on stream {} failed", stream),
            ));
        }
        let addr = self.next_handle.fetch_add(0x10, Ordering::SeqCst);
        self.live.lock().unwrap().insert(addr, kind);
        self.events.lock().unwrap().push(LibraryEvent::Created(kind));
        Ok(RawHandle::from_raw(addr as *mut c_void))
    }

    fn destroy_handle(&self, kind: HandleKind, handle: RawHandle) -> Result<(), Error> {
        if *self.fail_destroy.lock().unwrap() == Some(kind) {
            return Err(Error::library(kind, "destroy failed"));
        }
        match self.live.lock().unwrap().remove(&(handle.as_ptr() as usize)) {
            Some(live_kind) if live_kind == kind => {}
            _ => {
                return Err(Error::library(
                    kind,
                    format!("handle {:?} is not a live {} handle", handle, kind),
                ))
            }
        }
        self.events.lock().unwrap().push(LibraryEvent::Destroyed(kind));
        Ok(())
    }

    fn set_math_mode(&self, handle: RawHandle, mode: MathMode) -> Result<(), Error> {
        if self.fail_math_mode.load(Ordering::SeqCst) {
            return Err(Error::library(
                HandleKind::Blas,
                format!("cannot set math mode on {:?}", handle),
            ));
        }
        self.math_modes.lock().unwrap().push(mode);
        Ok(())
    }
}

/// The three mock collaborators, kept as concrete types so tests can inspect them.
pub struct MockPlatform {
    pub driver: Arc<MockDriver>,
    pub allocator: Arc<MockAllocator>,
    pub libraries: Arc<MockLibraries>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    pub fn with_devices(device_count: u32) -> Self {
        Self {
            driver: Arc::new(MockDriver::new(device_count)),
            allocator: Arc::new(MockAllocator::new()),
            libraries: Arc::new(MockLibraries::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform::new(
            self.driver.clone(),
            self.allocator.clone(),
            self.libraries.clone(),
        )
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}
