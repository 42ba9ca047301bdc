//! Accelerator selection and per-request memory scopes.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Serialize, Serializer};

use crate::config::EngineConfig;
use crate::error::DeviceError;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Accelerator(u32),
    Host,
}

impl DeviceId {
    pub fn is_host(&self) -> bool {
        matches!(self, DeviceId::Host)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Accelerator(i) => write!(f, "cuda:{i}"),
            DeviceId::Host => f.write_str("cpu"),
        }
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The driver seam. Device indices are always below `device_count()`.
pub trait DeviceBackend: Send + Sync + fmt::Debug {
    fn device_count(&self) -> u32;
    fn name(&self, index: u32) -> String;
    fn total_memory(&self, index: u32) -> u64;
    fn allocated_memory(&self, index: u32) -> u64;
    fn reserved_memory(&self, index: u32) -> u64;
    /// Caps how much of the device this process may allocate.
    fn set_memory_fraction(&self, index: u32, fraction: f32);
    /// Returns cached but unused allocations to the device.
    fn empty_cache(&self, index: u32);
}

/// A machine without accelerators.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl DeviceBackend for HostBackend {
    fn device_count(&self) -> u32 {
        0
    }

    fn name(&self, _index: u32) -> String {
        "CPU".to_string()
    }

    fn total_memory(&self, _index: u32) -> u64 {
        0
    }

    fn allocated_memory(&self, _index: u32) -> u64 {
        0
    }

    fn reserved_memory(&self, _index: u32) -> u64 {
        0
    }

    fn set_memory_fraction(&self, _index: u32, _fraction: f32) {}

    fn empty_cache(&self, _index: u32) {}
}

#[derive(Debug, Clone)]
struct SimulatedDevice {
    name: String,
    total: u64,
    allocated: u64,
    reserved: u64,
    fraction: f32,
}

/// Driver calls seen by a [`SimulatedBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedCalls {
    pub set_memory_fraction: usize,
    pub empty_cache: usize,
}

/// In-memory accelerators with simple allocation accounting.
///
/// Allocations grow both the allocated and reserved counters; `free` shrinks only the
/// allocated one, leaving the memory cached until `empty_cache`.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    devices: Mutex<Vec<SimulatedDevice>>,
    calls: Mutex<SimulatedCalls>,
}

impl SimulatedBackend {
    /// `count` identical devices with `memory_mb` of memory each.
    pub fn new(count: u32, memory_mb: u64) -> Self {
        let devices = (0..count)
            .map(|i| SimulatedDevice {
                name: format!("Simulated Accelerator {i}"),
                total: memory_mb * MIB,
                allocated: 0,
                reserved: 0,
                fraction: 1.0,
            })
            .collect();
        Self {
            devices: Mutex::new(devices),
            calls: Mutex::new(SimulatedCalls::default()),
        }
    }

    pub fn allocate(&self, index: u32, bytes: u64) {
        if let Some(d) = self.devices.lock().get_mut(index as usize) {
            d.allocated += bytes;
            d.reserved = d.reserved.max(d.allocated);
        }
    }

    pub fn free(&self, index: u32, bytes: u64) {
        if let Some(d) = self.devices.lock().get_mut(index as usize) {
            d.allocated = d.allocated.saturating_sub(bytes);
        }
    }

    pub fn memory_fraction(&self, index: u32) -> Option<f32> {
        self.devices.lock().get(index as usize).map(|d| d.fraction)
    }

    pub fn calls(&self) -> SimulatedCalls {
        *self.calls.lock()
    }

    fn with_device<T: Default>(&self, index: u32, f: impl FnOnce(&SimulatedDevice) -> T) -> T {
        self.devices.lock().get(index as usize).map(f).unwrap_or_default()
    }
}

impl DeviceBackend for SimulatedBackend {
    fn device_count(&self) -> u32 {
        self.devices.lock().len() as u32
    }

    fn name(&self, index: u32) -> String {
        self.with_device(index, |d| d.name.clone())
    }

    fn total_memory(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.total)
    }

    fn allocated_memory(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.allocated)
    }

    fn reserved_memory(&self, index: u32) -> u64 {
        self.with_device(index, |d| d.reserved)
    }

    fn set_memory_fraction(&self, index: u32, fraction: f32) {
        self.calls.lock().set_memory_fraction += 1;
        if let Some(d) = self.devices.lock().get_mut(index as usize) {
            d.fraction = fraction;
        }
    }

    fn empty_cache(&self, index: u32) {
        self.calls.lock().empty_cache += 1;
        if let Some(d) = self.devices.lock().get_mut(index as usize) {
            d.reserved = d.allocated;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceReport {
    pub device: DeviceId,
    pub name: String,
    pub memory_total: u64,
    pub memory_allocated: u64,
    pub memory_reserved: u64,
    pub memory_free: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceleratorInfo {
    pub available: bool,
    pub count: u32,
    pub devices: Vec<DeviceReport>,
}

/// Picks devices and hands out [`ResourceScope`]s.
///
/// Scopes are a soft quota: the manager sets the ceiling and clears caches but never makes
/// one request wait for another.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    backend: Arc<dyn DeviceBackend>,
    allow_list: Vec<u32>,
    require_accelerator: bool,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            allow_list: config.devices.clone(),
            require_accelerator: config.require_accelerator,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// First allowed device if it exists, else accelerator 0, else the host.
    pub fn select_device(&self) -> DeviceId {
        let count = self.backend.device_count();
        if count == 0 {
            return DeviceId::Host;
        }
        match self.allow_list.first() {
            Some(&first) if first < count => DeviceId::Accelerator(first),
            _ => DeviceId::Accelerator(0),
        }
    }

    pub fn acquire_scope(&self, fraction: f32) -> Result<ResourceScope, DeviceError> {
        check_fraction(fraction)?;
        let device = self.select_device();
        if device.is_host() {
            if self.require_accelerator {
                return Err(DeviceError::DeviceUnavailable(
                    "no accelerator present".to_string(),
                ));
            }
            log::warn!("no accelerator available, running on the host");
        }
        self.acquire_scope_on(device, fraction)
    }

    pub fn acquire_scope_on(
        &self,
        device: DeviceId,
        fraction: f32,
    ) -> Result<ResourceScope, DeviceError> {
        check_fraction(fraction)?;
        if let DeviceId::Accelerator(index) = device {
            let count = self.backend.device_count();
            if index >= count {
                return Err(DeviceError::DeviceUnavailable(format!(
                    "{device} does not exist ({count} accelerators)"
                )));
            }
            self.backend.set_memory_fraction(index, fraction);
            self.backend.empty_cache(index);
        }
        log::debug!("entered resource scope on {device} with memory fraction {fraction}");
        Ok(ResourceScope {
            device,
            fraction,
            backend: self.backend.clone(),
            entered: Instant::now(),
        })
    }

    pub fn report(&self, device: DeviceId) -> DeviceReport {
        match device {
            DeviceId::Accelerator(index) if index < self.backend.device_count() => {
                let total = self.backend.total_memory(index);
                let allocated = self.backend.allocated_memory(index);
                DeviceReport {
                    device,
                    name: self.backend.name(index),
                    memory_total: total,
                    memory_allocated: allocated,
                    memory_reserved: self.backend.reserved_memory(index),
                    memory_free: total.saturating_sub(allocated),
                }
            }
            _ => DeviceReport {
                device: DeviceId::Host,
                name: "CPU".to_string(),
                memory_total: 0,
                memory_allocated: 0,
                memory_reserved: 0,
                memory_free: 0,
            },
        }
    }

    pub fn report_all(&self) -> AcceleratorInfo {
        let count = self.backend.device_count();
        AcceleratorInfo {
            available: count > 0,
            count,
            devices: (0..count)
                .map(|i| self.report(DeviceId::Accelerator(i)))
                .collect(),
        }
    }

    /// Whether the selected device has `required_mb` that is not already reserved.
    pub fn is_memory_available(&self, required_mb: u64) -> bool {
        match self.select_device() {
            DeviceId::Host => false,
            DeviceId::Accelerator(index) => {
                let total = self.backend.total_memory(index);
                let reserved = self.backend.reserved_memory(index);
                total.saturating_sub(reserved) >= required_mb * MIB
            }
        }
    }

    /// Empties the cache of every accelerator.
    pub fn clear_cache(&self) {
        for index in 0..self.backend.device_count() {
            self.backend.empty_cache(index);
        }
    }
}

fn check_fraction(fraction: f32) -> Result<(), DeviceError> {
    if fraction > 0.0 && fraction <= 1.0 {
        Ok(())
    } else {
        Err(DeviceError::InvalidFraction(fraction))
    }
}

/// A claim on part of one device for the duration of a pipeline call.
///
/// Dropping the scope empties the device cache, whichever way the call ended.
#[must_use = "the device cache is cleared as soon as the scope is dropped"]
#[derive(Debug)]
pub struct ResourceScope {
    device: DeviceId,
    fraction: f32,
    backend: Arc<dyn DeviceBackend>,
    entered: Instant,
}

impl ResourceScope {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn fraction(&self) -> f32 {
        self.fraction
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if let DeviceId::Accelerator(index) = self.device {
            self.backend.empty_cache(index);
        }
        log::debug!(
            "left resource scope on {} after {:?}",
            self.device,
            self.entered.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(backend: Arc<dyn DeviceBackend>, devices: Vec<u32>) -> ResourceManager {
        let config = EngineConfig {
            devices,
            ..Default::default()
        };
        ResourceManager::new(backend, &config)
    }

    #[test]
    fn device_selection() {
        let sim = Arc::new(SimulatedBackend::new(2, 1024));
        assert_eq!(manager(sim.clone(), vec![1, 0]).select_device(), DeviceId::Accelerator(1));
        assert_eq!(manager(sim.clone(), vec![5]).select_device(), DeviceId::Accelerator(0));
        assert_eq!(manager(sim, vec![]).select_device(), DeviceId::Accelerator(0));
        assert_eq!(manager(Arc::new(HostBackend), vec![0]).select_device(), DeviceId::Host);
    }

    #[test]
    fn display() {
        assert_eq!(DeviceId::Accelerator(2).to_string(), "cuda:2");
        assert_eq!(DeviceId::Host.to_string(), "cpu");
        assert_eq!(serde_json::to_string(&DeviceId::Host).unwrap(), "\"cpu\"");
    }

    #[test]
    fn fraction_is_validated() {
        let m = manager(Arc::new(HostBackend), vec![0]);
        for bad in [0.0, -0.1, 1.01, f32::NAN] {
            assert!(matches!(m.acquire_scope(bad), Err(DeviceError::InvalidFraction(_))));
        }
        assert!(m.acquire_scope(1.0).is_ok());
    }

    #[test]
    fn scope_sets_ceiling_and_clears_cache() {
        let sim = Arc::new(SimulatedBackend::new(1, 1024));
        let m = manager(sim.clone(), vec![0]);
        sim.allocate(0, 100 * MIB);
        sim.free(0, 60 * MIB);
        assert_eq!(sim.reserved_memory(0), 100 * MIB);

        let scope = m.acquire_scope(0.5).unwrap();
        assert_eq!(scope.device(), DeviceId::Accelerator(0));
        assert_eq!(sim.memory_fraction(0), Some(0.5));
        assert_eq!(sim.reserved_memory(0), 40 * MIB);

        sim.allocate(0, 10 * MIB);
        sim.free(0, 10 * MIB);
        drop(scope);
        assert_eq!(sim.reserved_memory(0), 40 * MIB);
        assert_eq!(
            sim.calls(),
            SimulatedCalls {
                set_memory_fraction: 1,
                empty_cache: 2
            }
        );
    }

    #[test]
    fn host_scope_and_report() {
        let m = manager(Arc::new(HostBackend), vec![0]);
        let a = m.acquire_scope(0.8).unwrap();
        let b = m.acquire_scope(0.8).unwrap();
        assert_eq!(a.device(), DeviceId::Host);
        let report = m.report(b.device());
        assert_eq!(report.name, "CPU");
        assert_eq!(report.memory_total, 0);
        assert_eq!(report.memory_free, 0);
        assert!(!m.is_memory_available(1));
        assert!(!m.report_all().available);
    }

    #[test]
    fn host_is_rejected_when_accelerator_required() {
        let config = EngineConfig {
            require_accelerator: true,
            ..Default::default()
        };
        let m = ResourceManager::new(Arc::new(HostBackend), &config);
        assert!(matches!(m.acquire_scope(0.5), Err(DeviceError::DeviceUnavailable(_))));
    }

    #[test]
    fn explicit_device_must_exist() {
        let m = manager(Arc::new(SimulatedBackend::new(1, 1024)), vec![0]);
        assert!(m.acquire_scope_on(DeviceId::Accelerator(0), 0.5).is_ok());
        assert!(matches!(
            m.acquire_scope_on(DeviceId::Accelerator(3), 0.5),
            Err(DeviceError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn memory_availability() {
        let sim = Arc::new(SimulatedBackend::new(1, 1024));
        let m = manager(sim.clone(), vec![0]);
        assert!(m.is_memory_available(1024));
        sim.allocate(0, 512 * MIB);
        assert!(m.is_memory_available(512));
        assert!(!m.is_memory_available(513));

        let info = m.report_all();
        assert!(info.available);
        assert_eq!(info.devices[0].memory_free, 512 * MIB);
    }
}
