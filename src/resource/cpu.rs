use crate::contraction::HostContractionDevice;

/// Host-side bundle. Holds only the host contraction device.
#[derive(Debug, Default)]
pub struct CpuContextResource {
    cpu_contraction_device: HostContractionDevice,
}

impl CpuContextResource {
    pub fn new() -> Self {
        Self {
            cpu_contraction_device: HostContractionDevice::new(),
        }
    }

    pub fn contraction_device(&self) -> &HostContractionDevice {
        &self.cpu_contraction_device
    }
}
