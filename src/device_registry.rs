//! Set of currently reachable receivers with a name-sorted view.
//!
//! Discovery callbacks and presentation reads may come from different threads, so
//! all access goes through one mutex. The sorted view is rebuilt on every mutation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use crate::remote::RemotePlayer;

/// A discovered receiver and the proxy used to control it.
#[derive(Clone)]
pub struct Device {
    id: String,
    name: String,
    player: Arc<dyn RemotePlayer>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        player: Arc<dyn RemotePlayer>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            player,
        }
    }

    /// Snapshots id and name from the proxy.
    pub fn from_player(player: Arc<dyn RemotePlayer>) -> Self {
        Self {
            id: player.unique_identifier(),
            name: player.name(),
            player,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn player(&self) -> &Arc<dyn RemotePlayer> {
        &self.player
    }

    /// Identifiers compare case-insensitively.
    pub fn matches_id(&self, id: &str) -> bool {
        self.id.eq_ignore_ascii_case(id)
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Presentation-facing copy of a device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoundOutcome {
    Added,
    Updated,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<String, Device>,
    sorted: Vec<Device>,
}

impl RegistryState {
    fn resort(&mut self) {
        let mut sorted: Vec<Device> = self.devices.values().cloned().collect();
        // Ties on name fall back to the id so the view does not depend on map order.
        sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        self.sorted = sorted;
    }
}

fn registry_key(id: &str) -> String {
    id.to_ascii_lowercase()
}

/// Devices keyed by identifier.
#[derive(Default)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inserts the device, replacing an entry with the same identifier.
    pub fn on_device_found(&self, device: Device) -> FoundOutcome {
        let mut state = self.lock_state();
        let key = registry_key(device.id());
        let outcome = if state.devices.contains_key(&key) {
            info!("DeviceRegistry: updating {} ({})", device.name(), device.id());
            FoundOutcome::Updated
        } else {
            info!("DeviceRegistry: adding {} ({})", device.name(), device.id());
            FoundOutcome::Added
        };
        state.devices.insert(key, device);
        state.resort();
        outcome
    }

    /// Removes the device by identifier and returns the stored entry, if any.
    pub fn on_device_lost(&self, device: &Device) -> Option<Device> {
        let mut state = self.lock_state();
        let removed = state.devices.remove(&registry_key(device.id()));
        if let Some(removed) = removed.as_ref() {
            info!("DeviceRegistry: removing {} ({})", removed.name(), removed.id());
            state.resort();
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock_state().devices.contains_key(&registry_key(id))
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.lock_state().devices.get(&registry_key(id)).cloned()
    }

    /// Devices ordered by display name.
    pub fn sorted_view(&self) -> Vec<Device> {
        self.lock_state().sorted.clone()
    }

    pub fn sorted_summaries(&self) -> Vec<DeviceSummary> {
        self.lock_state()
            .sorted
            .iter()
            .map(Device::summary)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_state().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.devices.clear();
        state.sorted.clear();
    }
}
