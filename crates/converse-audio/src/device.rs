use converse_foundation::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host};

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Input-device enumeration and selection. Switching the active device
/// while a session is open goes through release-then-reacquire in the
/// capture thread; this type never mutates a live stream.
pub struct DeviceManager {
    host: Host,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    pub fn enumerate(&self) -> Vec<DeviceInfo> {
        let default_name = self.default_input_name();
        let mut devices = Vec::new();
        if let Ok(inputs) = self.host.input_devices() {
            for device in inputs {
                if let Ok(name) = device.name() {
                    let is_default = default_name.as_deref() == Some(name.as_str());
                    devices.push(DeviceInfo { name, is_default });
                }
            }
        }
        devices
    }

    pub fn input_names(&self) -> Vec<String> {
        self.enumerate().into_iter().map(|d| d.name).collect()
    }

    pub fn default_input_name(&self) -> Option<String> {
        self.host.default_input_device().and_then(|d| d.name().ok())
    }

    /// Resolve a requested device name (or the system default) to a device.
    pub fn resolve(&self, requested: Option<&str>) -> Result<Device, CaptureError> {
        match requested {
            Some(name) => {
                let mut inputs = self
                    .host
                    .input_devices()
                    .map_err(|e| CaptureError::PermissionDenied {
                        reason: e.to_string(),
                    })?;
                inputs
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| CaptureError::DeviceNotFound {
                        name: Some(name.to_string()),
                    })
            }
            None => self
                .host
                .default_input_device()
                .ok_or(CaptureError::DeviceNotFound { name: None }),
        }
    }
}

/// Fallback order for opening a device: the requested name first, then the
/// OS default, then everything else, without duplicates.
pub fn candidate_order(
    requested: Option<&str>,
    default: Option<&str>,
    all: &[String],
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(name) = requested {
        out.push(name.to_string());
    }
    if let Some(name) = default {
        if !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    for name in all {
        if !out.iter().any(|n| n == name) {
            out.push(name.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_does_not_panic_without_hardware() {
        let manager = DeviceManager::new();
        let _ = manager.enumerate();
        let _ = manager.default_input_name();
    }

    #[test]
    fn candidate_order_prefers_requested_then_default() {
        let all = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let order = candidate_order(Some("b"), Some("a"), &all);
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn candidate_order_deduplicates() {
        let all = vec!["a".to_string(), "b".to_string()];
        let order = candidate_order(Some("a"), Some("a"), &all);
        assert_eq!(order, vec!["a", "b"]);
    }
}
