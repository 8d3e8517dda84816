use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A peer that completed the name handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub ip: IpAddr,
    pub name: String,
}

impl Device {
    pub fn new(ip: IpAddr, name: impl Into<String>) -> Self {
        Self {
            ip,
            name: name.into(),
        }
    }
}

/// Known peers keyed by IP address, shared by every discovery flow
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<HashMap<IpAddr, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a device unless its IP is already known.
    ///
    /// Names are never updated in place; returns false when an entry for the
    /// IP already exists.
    pub fn insert(&self, device: Device) -> bool {
        let mut devices = self.lock();
        if devices.contains_key(&device.ip) {
            debug!("Device {} already registered, keeping existing entry", device.ip);
            return false;
        }
        info!("Registered device: {} ({})", device.name, device.ip);
        devices.insert(device.ip, device);
        true
    }

    pub fn remove(&self, ip: &IpAddr) -> Option<Device> {
        let removed = self.lock().remove(ip);
        if let Some(device) = &removed {
            info!("Removed device: {} ({})", device.name, device.ip);
        }
        removed
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.lock().contains_key(ip)
    }

    pub fn get(&self, ip: &IpAddr) -> Option<Device> {
        self.lock().get(ip).cloned()
    }

    /// Snapshot of every known device, ordered by IP
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.ip.cmp(&b.ip));
        devices
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Addresses heard announcing themselves that still await a handshake
#[derive(Debug, Clone, Default)]
pub struct PendingDiscoveries {
    queue: Arc<Mutex<VecDeque<IpAddr>>>,
}

impl PendingDiscoveries {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<IpAddr>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an address. Repeated announcements collapse into one entry.
    pub fn push(&self, ip: IpAddr) -> bool {
        let mut queue = self.lock();
        if queue.contains(&ip) {
            return false;
        }
        queue.push_back(ip);
        true
    }

    /// Take the oldest queued address
    pub fn pop(&self) -> Option<IpAddr> {
        self.lock().pop_front()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.lock().contains(ip)
    }

    pub fn snapshot(&self) -> Vec<IpAddr> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
