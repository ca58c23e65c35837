//! Ownership types for native streams and library handles.
//!
//! Each type releases its native resource exactly once: either through an
//! explicit `release`, which reports failures, or on drop, which can only log
//! them. Whether a stream is destroyed is decided by the [`StreamOwnership`]
//! fixed at construction, never by looking at the handle value.

use crate::backend::{BackendLibraries, DeviceDriver, HandleKind, MathMode, RawHandle, StreamId};
use crate::error::Error;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOwnership {
    /// Created by the bundle, destroyed with it.
    Owned,
    /// Supplied by the caller, never destroyed here.
    Borrowed,
}

pub struct StreamHandle {
    id: StreamId,
    ownership: StreamOwnership,
    driver: Arc<dyn DeviceDriver>,
    released: bool,
}

impl StreamHandle {
    /// Creates a new stream on `device`, owned by the returned handle.
    pub fn create(driver: Arc<dyn DeviceDriver>, device: u32) -> Result<Self, Error> {
        let id = driver.create_stream(device)?;
        debug_println!("[StreamHandle::create] Created owned stream {} on device {}", id, device);
        Ok(Self {
            id,
            ownership: StreamOwnership::Owned,
            driver,
            released: false,
        })
    }

    /// Wraps an externally supplied stream. Releasing it is a no-op.
    pub fn borrow(driver: Arc<dyn DeviceDriver>, id: StreamId) -> Self {
        Self {
            id,
            ownership: StreamOwnership::Borrowed,
            driver,
            released: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn ownership(&self) -> StreamOwnership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == StreamOwnership::Owned
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.destroy()
    }

    /// Destroys the stream if owned. Later calls, and the drop, do nothing.
    pub(crate) fn destroy(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.is_owned() {
            debug_println!("[StreamHandle::destroy] Destroying owned stream {}", self.id);
            self.driver.destroy_stream(self.id)?;
        }
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("failed to destroy stream {}: {}", self.id, e);
        }
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("ownership", &self.ownership)
            .finish()
    }
}

/// A backend-library handle bound to one stream.
pub struct LibraryHandle {
    kind: HandleKind,
    raw: RawHandle,
    libraries: Arc<dyn BackendLibraries>,
    released: bool,
}

impl LibraryHandle {
    pub fn create(
        libraries: Arc<dyn BackendLibraries>,
        kind: HandleKind,
        stream: StreamId,
        device: u32,
    ) -> Result<Self, Error> {
        let raw = libraries.create_handle(kind, stream, device)?;
        debug_println!("[LibraryHandle::create] {} handle {:?} on stream {}", kind, raw, stream);
        Ok(Self {
            kind,
            raw,
            libraries,
            released: false,
        })
    }

    /// Creates a linear-algebra handle and switches it to `mode`.
    ///
    /// If setting the mode fails the fresh handle is destroyed before the error
    /// is returned.
    pub fn create_blas(
        libraries: Arc<dyn BackendLibraries>,
        stream: StreamId,
        device: u32,
        mode: MathMode,
    ) -> Result<Self, Error> {
        let handle = Self::create(libraries, HandleKind::Blas, stream, device)?;
        if mode != MathMode::Default {
            handle.libraries.set_math_mode(handle.raw, mode)?;
        }
        Ok(handle)
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.destroy()
    }

    pub(crate) fn destroy(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.libraries.destroy_handle(self.kind, self.raw)
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("failed to destroy {} handle {:?}: {}", self.kind, self.raw, e);
        }
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}

/// Binds a device for a scoped region and restores the previous binding on drop.
///
/// A thread that had nothing bound is left with nothing bound again.
pub struct DeviceGuard<'a> {
    driver: &'a dyn DeviceDriver,
    // `None` when the device was already bound and nothing needs restoring.
    restore: Option<Option<u32>>,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, device: u32) -> Result<Self, Error> {
        let current = driver.current_device()?;
        let restore = if current != Some(device) {
            driver.set_device(device)?;
            Some(current)
        } else {
            None
        };
        Ok(Self { driver, restore })
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        let result = match self.restore {
            Some(Some(previous)) => self.driver.set_device(previous),
            Some(None) => self.driver.clear_device(),
            None => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("failed to restore device binding {:?}: {}", self.restore, e);
        }
    }
}
