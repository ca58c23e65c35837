//! Scratch allocator adapter for the GPU tensor-contraction device.
//!
//! The contraction engine calls back into `allocate`/`deallocate` with raw
//! addresses and expects the caller to keep the bookkeeping. The adapter keeps
//! every live allocation keyed by address, so anything the engine forgets to
//! free is released when the adapter goes away.

use crate::backend::{Allocation, Allocator, DeviceDriver, DevicePtr, StreamId};
use crate::error::Error;
use crate::handle::DeviceGuard;
use crate::Place;
use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Size of the reusable scratch region, in bytes.
pub const SCRATCH_SIZE: usize = 1024;

pub struct ScratchAllocator {
    place: Place,
    stream: StreamId, // not owned
    allocator: Arc<dyn Allocator>,
    driver: Arc<dyn DeviceDriver>,
    allocations: Mutex<HashMap<DevicePtr, Box<dyn Allocation>>>,
    scratch: OnceLock<DevicePtr>,
    semaphore: OnceLock<DevicePtr>,
}

impl ScratchAllocator {
    pub fn new(
        place: Place,
        stream: StreamId,
        allocator: Arc<dyn Allocator>,
        driver: Arc<dyn DeviceDriver>,
    ) -> Self {
        Self {
            place,
            stream,
            allocator,
            driver,
            allocations: Mutex::new(HashMap::new()),
            scratch: OnceLock::new(),
            semaphore: OnceLock::new(),
        }
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    fn lock_allocations(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<DevicePtr, Box<dyn Allocation>>>, Error> {
        self.allocations
            .lock()
            .map_err(|_| Error::poisoned("scratch allocation map"))
    }

    /// Allocates `num_bytes` from the external allocator and tracks it.
    ///
    /// Returns `Ok(None)` for a zero-byte request without calling the allocator.
    pub fn allocate(&self, num_bytes: usize) -> Result<Option<DevicePtr>, Error> {
        if num_bytes == 0 {
            return Ok(None);
        }
        let buf = self.allocator.allocate(self.place, num_bytes)?;
        let ptr = buf.ptr();
        debug_println!("[ScratchAllocator::allocate] allocated at {} requested {}", ptr, num_bytes);
        self.lock_allocations()?.insert(ptr, buf);
        Ok(Some(ptr))
    }

    /// Releases a tracked allocation. Null and unknown addresses are ignored,
    /// as is the scratch region, which lives as long as the adapter.
    pub fn deallocate(&self, ptr: DevicePtr) -> Result<(), Error> {
        if ptr.is_null() || self.scratch.get() == Some(&ptr) {
            return Ok(());
        }
        let released = self.lock_allocations()?.remove(&ptr);
        // Drop the allocation outside the lock.
        drop(released);
        Ok(())
    }

    /// The shared scratch region, allocated on first use.
    pub fn scratchpad(&self) -> Result<DevicePtr, Error> {
        if let Some(ptr) = self.scratch.get() {
            return Ok(*ptr);
        }
        let ptr = self
            .allocate(SCRATCH_SIZE + size_of::<u32>())?
            .ok_or_else(|| Error::InternalLogicError("empty scratch allocation".to_string()))?;
        if let Err(ptr) = self.scratch.set(ptr) {
            // Lost the race to another first use; keep theirs.
            self.deallocate(ptr)?;
        }
        self.scratch
            .get()
            .copied()
            .ok_or_else(|| Error::InternalLogicError("scratchpad not initialized".to_string()))
    }

    /// The `u32` semaphore at the end of the scratch region, zeroed on the
    /// bound stream on first use.
    pub fn semaphore(&self) -> Result<DevicePtr, Error> {
        if let Some(ptr) = self.semaphore.get() {
            return Ok(*ptr);
        }
        let ptr = self.scratchpad()?.offset(SCRATCH_SIZE);
        let device = self.place.gpu_index().ok_or_else(|| {
            Error::InvalidArgument(format!("no device stream on {}", self.place))
        })?;
        let _guard = DeviceGuard::new(&*self.driver, device)?;
        self.driver.memset_async(ptr, 0, size_of::<u32>(), self.stream)?;
        let _ = self.semaphore.set(ptr);
        Ok(ptr)
    }

    /// Number of live tracked allocations.
    pub fn outstanding(&self) -> usize {
        self.allocations.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.allocations
            .lock()
            .map(|a| a.values().map(|buf| buf.size()).sum())
            .unwrap_or(0)
    }

    /// Frees every tracked allocation, returning how many were still live.
    pub fn release_all(&self) -> Result<usize, Error> {
        let drained: Vec<Box<dyn Allocation>> =
            self.lock_allocations()?.drain().map(|(_, buf)| buf).collect();
        let count = drained.len();
        if count > 0 {
            debug_println!(
                "[ScratchAllocator::release_all] force-freeing {} allocations on stream {}",
                count,
                self.stream
            );
        }
        Ok(count)
    }
}

impl fmt::Debug for ScratchAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchAllocator")
            .field("place", &self.place)
            .field("stream", &self.stream)
            .field("scratch", &self.scratch.get())
            .field("semaphore", &self.semaphore.get())
            .finish_non_exhaustive()
    }
}
