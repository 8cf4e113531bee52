use candle_core::Device;

/// Pick the device to train on.
///
/// Uses the first CUDA or Metal device when the corresponding feature is
/// enabled and such a device is present, the CPU otherwise.
pub fn default_device() -> Device {
    if let Ok(device) = Device::new_cuda(0) {
        return device;
    }
    if let Ok(device) = Device::new_metal(0) {
        return device;
    }
    Device::Cpu
}

#[cfg(test)]
pub(crate) mod tests {
    use candle_core::Device;

    use super::default_device;

    /// Get devices to test on.
    pub fn test_devices() -> Vec<Device> {
        let mut devices = vec![Device::Cpu];
        let accelerator = default_device();
        if !accelerator.is_cpu() {
            devices.push(accelerator);
        }
        devices
    }

    #[test]
    fn cpu_is_always_tested() {
        assert!(test_devices()[0].is_cpu());
    }
}
