// CUDA driver layer using cust
// Handles per-device contexts, stream creation and property queries

use crate::backend::{DeviceDriver, DevicePtr, StreamId};
use crate::error::Error;
use crate::properties::DeviceProperties;
use cust::context::{Context, CurrentContext};
use cust::device::{Device, DeviceAttribute};
use cust::stream::{Stream, StreamFlags};
use cust::sys::{cudaError_enum, CUcontext};
use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::Mutex;

extern "C" {
    fn cudaRuntimeGetVersion(runtime_version: *mut c_int) -> c_int;
}

struct SendSyncStream(Stream);
unsafe impl Send for SendSyncStream {}
unsafe impl Sync for SendSyncStream {}

struct SendSyncContext {
    context: Context,
    raw: CUcontext,
}
unsafe impl Send for SendSyncContext {}
unsafe impl Sync for SendSyncContext {}

fn check_driver(call: &str, status: cudaError_enum) -> Result<(), Error> {
    if status != cudaError_enum::CUDA_SUCCESS {
        return Err(Error::CudaError(format!("{} failed: {:?}", call, status)));
    }
    Ok(())
}

fn raw_current() -> Result<CUcontext, Error> {
    let mut current: CUcontext = ptr::null_mut();
    check_driver("cuCtxGetCurrent", unsafe { cust::sys::cuCtxGetCurrent(&mut current) })?;
    Ok(current)
}

fn bind_raw(context: CUcontext) -> Result<(), Error> {
    check_driver("cuCtxSetCurrent", unsafe { cust::sys::cuCtxSetCurrent(context) })
}

pub struct CudaDriver {
    devices: Vec<Device>,
    contexts: Vec<SendSyncContext>,
    streams: Mutex<HashMap<StreamId, SendSyncStream>>,
}

impl CudaDriver {
    pub fn new() -> Result<Self, Error> {
        cust::init(cust::CudaFlags::empty())?;
        let count = Device::num_devices()?;
        let caller_context = raw_current()?;
        let mut devices = Vec::with_capacity(count as usize);
        let mut contexts = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let device = Device::get_device(ordinal)?;
            let context = Context::new(device).map_err(|e| Error::CudaError(e.to_string()))?;
            CurrentContext::set_current(&context)?;
            let raw = raw_current()?;
            devices.push(device);
            contexts.push(SendSyncContext { context, raw });
        }
        bind_raw(caller_context)?;
        debug_println!("[CudaDriver::new] Initialized {} CUDA device(s)", count);
        Ok(Self {
            devices,
            contexts,
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn device(&self, ordinal: u32) -> Result<Device, Error> {
        self.devices.get(ordinal as usize).copied().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "CUDA device {} out of range ({} available)",
                ordinal,
                self.devices.len()
            ))
        })
    }

    fn runtime_version() -> Result<i32, Error> {
        let mut version: c_int = 0;
        let status = unsafe { cudaRuntimeGetVersion(&mut version) };
        if status != 0 {
            return Err(Error::CudaError(format!(
                "cudaRuntimeGetVersion failed with status {}",
                status
            )));
        }
        Ok(version)
    }
}

impl DeviceDriver for CudaDriver {
    fn current_device(&self) -> Result<Option<u32>, Error> {
        let current = raw_current()?;
        if current.is_null() {
            return Ok(None);
        }
        let ordinal = self
            .contexts
            .iter()
            .position(|c| c.raw == current)
            .ok_or_else(|| {
                Error::PreconditionNotMet(format!(
                    "current CUDA context {:p} is not managed by this driver",
                    current
                ))
            })?;
        Ok(Some(ordinal as u32))
    }

    fn set_device(&self, device: u32) -> Result<(), Error> {
        let context = self.contexts.get(device as usize).ok_or_else(|| {
            Error::InvalidArgument(format!("No CUDA context for device {}", device))
        })?;
        CurrentContext::set_current(&context.context)?;
        Ok(())
    }

    fn clear_device(&self) -> Result<(), Error> {
        bind_raw(ptr::null_mut())
    }

    fn create_stream(&self, device: u32) -> Result<StreamId, Error> {
        self.set_device(device)?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        let id = StreamId::from_raw(stream.as_inner() as *mut c_void)
            .ok_or_else(|| Error::CudaError("cuStreamCreate returned a null stream".into()))?;
        self.streams
            .lock()
            .map_err(|_| Error::poisoned("CUDA stream table"))?
            .insert(id, SendSyncStream(stream));
        Ok(id)
    }

    fn destroy_stream(&self, stream: StreamId) -> Result<(), Error> {
        let owned = self
            .streams
            .lock()
            .map_err(|_| Error::poisoned("CUDA stream table"))?
            .remove(&stream)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("Stream {} was not created by this driver", stream))
            })?;
        Stream::drop(owned.0).map_err(|(e, _)| Error::CudaError(e.to_string()))
    }

    fn device_properties(&self, device: u32) -> Result<DeviceProperties, Error> {
        let dev = self.device(device)?;
        let major = dev.get_attribute(DeviceAttribute::ComputeCapabilityMajor)?;
        let minor = dev.get_attribute(DeviceAttribute::ComputeCapabilityMinor)?;
        let api = cust::CudaApiVersion::get()?;
        Ok(DeviceProperties {
            compute_capability: major * 10 + minor,
            runtime_version: Self::runtime_version()?,
            driver_version: api.major() * 1000 + api.minor() * 10,
            multiprocessors: dev.get_attribute(DeviceAttribute::MultiprocessorCount)?,
            max_threads_per_mp: dev.get_attribute(DeviceAttribute::MaxThreadsPerMultiprocessor)?,
            max_threads_per_block: dev.get_attribute(DeviceAttribute::MaxThreadsPerBlock)?,
            max_grid_dim_size: [
                dev.get_attribute(DeviceAttribute::MaxGridDimX)?,
                dev.get_attribute(DeviceAttribute::MaxGridDimY)?,
                dev.get_attribute(DeviceAttribute::MaxGridDimZ)?,
            ],
        })
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamId,
    ) -> Result<(), Error> {
        let status = unsafe {
            cust::sys::cuMemsetD8Async(dst.0, value, bytes, stream.as_raw() as cust::sys::CUstream)
        };
        check_driver("cuMemsetD8Async", status)
    }
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        debug_println!("Dropping CudaDriver");
    }
}
