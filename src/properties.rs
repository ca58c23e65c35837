//! Static device capabilities, queried once per GPU bundle.

/// Runtime version from which tensor-core math is available.
pub const TENSOR_OP_MIN_RUNTIME: i32 = 9000;
/// Runtime version from which TF32 tensor-core math is available.
pub const TF32_MIN_RUNTIME: i32 = 11000;

/// Cached result of the device property probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProperties {
    /// `major * 10 + minor`, e.g. 80 for sm_80
    pub compute_capability: i32,
    pub runtime_version: i32,
    pub driver_version: i32,
    pub multiprocessors: i32,
    pub max_threads_per_mp: i32,
    pub max_threads_per_block: i32,
    pub max_grid_dim_size: [i32; 3],
}

impl DeviceProperties {
    pub fn major(&self) -> i32 {
        self.compute_capability / 10
    }

    pub fn minor(&self) -> i32 {
        self.compute_capability % 10
    }
}

/// Which extra linear-algebra handles a bundle gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorCoreSupport {
    pub tensor_op: bool,
    pub tf32: bool,
}

impl TensorCoreSupport {
    pub fn detect(properties: &DeviceProperties) -> Self {
        Self {
            tensor_op: properties.runtime_version >= TENSOR_OP_MIN_RUNTIME,
            tf32: properties.runtime_version >= TF32_MIN_RUNTIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(runtime_version: i32) -> DeviceProperties {
        DeviceProperties {
            compute_capability: 75,
            runtime_version,
            driver_version: 12020,
            multiprocessors: 40,
            max_threads_per_mp: 1024,
            max_threads_per_block: 1024,
            max_grid_dim_size: [2147483647, 65535, 65535],
        }
    }

    #[test]
    fn test_detect_tensor_core_support() {
        assert_eq!(
            TensorCoreSupport::detect(&props(8000)),
            TensorCoreSupport::default()
        );
        assert_eq!(
            TensorCoreSupport::detect(&props(10020)),
            TensorCoreSupport {
                tensor_op: true,
                tf32: false
            }
        );
        assert_eq!(
            TensorCoreSupport::detect(&props(11000)),
            TensorCoreSupport {
                tensor_op: true,
                tf32: true
            }
        );
    }

    #[test]
    fn test_major_minor() {
        let p = props(12000);
        assert_eq!(p.major(), 7);
        assert_eq!(p.minor(), 5);
    }
}
