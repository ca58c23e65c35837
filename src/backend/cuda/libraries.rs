// Backend library handles: cuDNN, cuSOLVER, cuBLAS, cuBLASLt and cuSPARSE
// Linking is configured by build.rs when the `cuda` feature is enabled.

use crate::backend::{BackendLibraries, HandleKind, MathMode, RawHandle, StreamId};
use crate::error::Error;
use cublas_sys;
use std::ffi::{c_int, c_void};

type Status = c_int;
type RawPtr = *mut c_void;

const CUBLAS_DEFAULT_MATH: c_int = 0;
const CUBLAS_TENSOR_OP_MATH: c_int = 1;
const CUBLAS_TF32_TENSOR_OP_MATH: c_int = 3;

extern "C" {
    fn cublasSetStream_v2(handle: RawPtr, stream: RawPtr) -> Status;
    fn cublasSetMathMode(handle: RawPtr, mode: c_int) -> Status;

    fn cublasLtCreate(handle: *mut RawPtr) -> Status;
    fn cublasLtDestroy(handle: RawPtr) -> Status;

    fn cudnnCreate(handle: *mut RawPtr) -> Status;
    fn cudnnSetStream(handle: RawPtr, stream: RawPtr) -> Status;
    fn cudnnDestroy(handle: RawPtr) -> Status;

    fn cusolverDnCreate(handle: *mut RawPtr) -> Status;
    fn cusolverDnSetStream(handle: RawPtr, stream: RawPtr) -> Status;
    fn cusolverDnDestroy(handle: RawPtr) -> Status;

    fn cusparseCreate(handle: *mut RawPtr) -> Status;
    fn cusparseSetStream(handle: RawPtr, stream: RawPtr) -> Status;
    fn cusparseDestroy(handle: RawPtr) -> Status;
}

fn check(kind: HandleKind, call: &str, status: Status) -> Result<(), Error> {
    if status != 0 {
        return Err(Error::library(
            kind,
            format!("{} failed with status {}", call, status),
        ));
    }
    Ok(())
}

/// Creates a handle with `create`, then binds it to `stream` with `set_stream`.
/// A handle that fails to bind is destroyed again.
unsafe fn create_bound(
    kind: HandleKind,
    stream: StreamId,
    create: unsafe extern "C" fn(*mut RawPtr) -> Status,
    set_stream: unsafe extern "C" fn(RawPtr, RawPtr) -> Status,
    destroy: unsafe extern "C" fn(RawPtr) -> Status,
) -> Result<RawPtr, Error> {
    let mut handle: RawPtr = std::ptr::null_mut();
    check(kind, "create", create(&mut handle))?;
    if let Err(e) = check(kind, "set stream", set_stream(handle, stream.as_raw())) {
        destroy(handle);
        return Err(e);
    }
    Ok(handle)
}

/// The CUDA numerical libraries, driven through their C entry points.
#[derive(Debug, Default)]
pub struct CudaLibraries;

impl CudaLibraries {
    pub fn new() -> Self {
        CudaLibraries
    }

    fn create_blas(stream: StreamId) -> Result<RawPtr, Error> {
        let mut handle = std::ptr::null_mut();
        unsafe {
            let status = cublas_sys::cublasCreate_v2(&mut handle);
            if status != cublas_sys::cublasStatus_t::CUBLAS_STATUS_SUCCESS {
                return Err(Error::CublasError("Failed to create cuBLAS handle".to_string()));
            }
            let raw = handle as RawPtr;
            let status = cublasSetStream_v2(raw, stream.as_raw());
            if let Err(e) = check(HandleKind::Blas, "cublasSetStream_v2", status) {
                cublas_sys::cublasDestroy_v2(handle);
                return Err(e);
            }
            Ok(raw)
        }
    }
}

impl BackendLibraries for CudaLibraries {
    fn create_handle(
        &self,
        kind: HandleKind,
        stream: StreamId,
        _device: u32,
    ) -> Result<RawHandle, Error> {
        let raw = unsafe {
            match kind {
                HandleKind::Blas => Self::create_blas(stream)?,
                HandleKind::BlasLt => {
                    // cuBLASLt handles are not stream-bound; the stream is passed per call.
                    let mut handle: RawPtr = std::ptr::null_mut();
                    check(kind, "cublasLtCreate", cublasLtCreate(&mut handle))?;
                    handle
                }
                HandleKind::Dnn => {
                    create_bound(kind, stream, cudnnCreate, cudnnSetStream, cudnnDestroy)?
                }
                HandleKind::Solver => create_bound(
                    kind,
                    stream,
                    cusolverDnCreate,
                    cusolverDnSetStream,
                    cusolverDnDestroy,
                )?,
                HandleKind::Sparse => create_bound(
                    kind,
                    stream,
                    cusparseCreate,
                    cusparseSetStream,
                    cusparseDestroy,
                )?,
            }
        };
        Ok(RawHandle::from_raw(raw))
    }

    fn destroy_handle(&self, kind: HandleKind, handle: RawHandle) -> Result<(), Error> {
        let raw = handle.as_ptr();
        unsafe {
            match kind {
                HandleKind::Blas => {
                    let status = cublas_sys::cublasDestroy_v2(raw as cublas_sys::cublasHandle_t);
                    if status != cublas_sys::cublasStatus_t::CUBLAS_STATUS_SUCCESS {
                        return Err(Error::CublasError(
                            "Failed to destroy cuBLAS handle".to_string(),
                        ));
                    }
                    Ok(())
                }
                HandleKind::BlasLt => check(kind, "cublasLtDestroy", cublasLtDestroy(raw)),
                HandleKind::Dnn => check(kind, "cudnnDestroy", cudnnDestroy(raw)),
                HandleKind::Solver => check(kind, "cusolverDnDestroy", cusolverDnDestroy(raw)),
                HandleKind::Sparse => check(kind, "cusparseDestroy", cusparseDestroy(raw)),
            }
        }
    }

    fn set_math_mode(&self, handle: RawHandle, mode: MathMode) -> Result<(), Error> {
        let mode = match mode {
            MathMode::Default => CUBLAS_DEFAULT_MATH,
            MathMode::TensorOp => CUBLAS_TENSOR_OP_MATH,
            MathMode::Tf32TensorOp => CUBLAS_TF32_TENSOR_OP_MATH,
        };
        check(
            HandleKind::Blas,
            "cublasSetMathMode",
            unsafe { cublasSetMathMode(handle.as_ptr(), mode) },
        )
    }
}
