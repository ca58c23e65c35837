//! Context resource bundles: the unit of shared, reference-counted device resources.

mod cpu;
mod gpu;

pub use cpu::CpuContextResource;
pub use gpu::GpuContextResource;
