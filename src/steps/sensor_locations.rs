use super::{StepError, StepOutcome, ValidationError};
use crate::backend_client::{Device, DeviceId, Facility, SetupBackend, UpdateDeviceRequest};
use futures_util::future::join_all;
use log::{error, info};
use serde::Serialize;

/// Physical positions a kit's sensors are placed at.
pub const LOCATION_SLOTS: [&str; 14] = [
    "Refrigerator 1",
    "Refrigerator 2",
    "Refrigerator 3",
    "Freezer 1",
    "Freezer 2",
    "Freezer 3",
    "Dry Cabinet 1",
    "Dry Cabinet 2",
    "Dry Cabinet 3",
    "Dry Cabinet 4",
    "Drying Racks",
    "Ambient 1",
    "Ambient 2",
    "Ambient 3",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSlot {
    pub name: &'static str,
    pub device: Option<Device>,
    /// Set when confirming with this slot still empty.
    pub required: bool,
    /// The device already carries this slot's name on the backend.
    pub committed: bool,
}

impl LocationSlot {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            device: None,
            required: false,
            committed: false,
        }
    }
}

/// Assign every sensor to exactly one location.
///
/// A device is either in `available` or in exactly one slot, never both.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorLocationsStep {
    pub slots: Vec<LocationSlot>,
    pub available: Vec<Device>,
}

impl Default for SensorLocationsStep {
    fn default() -> Self {
        Self {
            slots: LOCATION_SLOTS.iter().copied().map(LocationSlot::new).collect(),
            available: Vec::new(),
        }
    }
}

impl SensorLocationsStep {
    /// Load the facility's sensors into the pool.
    ///
    /// Sensors already named after a slot are placed there as committed, so an
    /// interrupted confirmation picks up where it stopped.
    pub async fn activate<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
    ) -> StepOutcome {
        let devices = match backend.facility_devices(facility.id).await {
            Ok(devices) => devices,
            Err(e) => {
                error!("failed to load sensors of facility {}: {e:#}", facility.id);
                return StepOutcome::Failed(StepError::transient("load sensors", &e));
            }
        };

        *self = Self::default();

        for sensor in devices.into_iter().filter(Device::is_sensor) {
            match self
                .slots
                .iter_mut()
                .find(|slot| slot.device.is_none() && slot.name == sensor.name)
            {
                Some(slot) => {
                    slot.device = Some(sensor);
                    slot.committed = true;
                }
                None => self.available.push(sensor),
            }
        }
        self.sort_pool();

        StepOutcome::AwaitingInput
    }

    /// Put `device_id` from the pool into `slot`. The slot's previous device goes back to the pool.
    pub fn assign(&mut self, slot: usize, device_id: DeviceId) -> Result<(), ValidationError> {
        let Some(location) = self.slots.get(slot) else {
            return Err(ValidationError::UnknownSlot(slot));
        };
        if location
            .device
            .as_ref()
            .is_some_and(|device| device.id == device_id)
        {
            return Ok(());
        }

        let Some(position) = self.available.iter().position(|d| d.id == device_id) else {
            return Err(ValidationError::DeviceUnavailable(device_id));
        };

        let device = self.available.remove(position);
        let location = &mut self.slots[slot];
        let previous = location.device.replace(device);
        location.required = false;
        location.committed = false;

        if let Some(previous) = previous {
            self.available.push(previous);
            self.sort_pool();
        }

        Ok(())
    }

    /// Empty `slot` and return its device to the pool.
    pub fn clear(&mut self, slot: usize) -> Result<(), ValidationError> {
        let Some(location) = self.slots.get_mut(slot) else {
            return Err(ValidationError::UnknownSlot(slot));
        };
        location.committed = false;
        if let Some(device) = location.device.take() {
            self.available.push(device);
            self.sort_pool();
        }
        Ok(())
    }

    pub fn is_fully_assigned(&self) -> bool {
        self.slots.iter().all(|slot| slot.device.is_some())
    }

    /// Rename every assigned device after its slot.
    ///
    /// Renames run concurrently. Each success is remembered, so a retry only
    /// re-issues the ones that failed.
    pub async fn confirm<B: SetupBackend>(&mut self, backend: &B) -> StepOutcome {
        let missing: Vec<String> = self
            .slots
            .iter_mut()
            .filter(|slot| slot.device.is_none())
            .map(|slot| {
                slot.required = true;
                slot.name.to_string()
            })
            .collect();

        if !missing.is_empty() {
            return StepOutcome::Failed(ValidationError::UnassignedLocations(missing).into());
        }

        let pending: Vec<(usize, DeviceId, UpdateDeviceRequest)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.committed)
            .filter_map(|(index, slot)| {
                slot.device.as_ref().map(|device| {
                    (index, device.id, UpdateDeviceRequest::rename(device, slot.name))
                })
            })
            .collect();

        let results = join_all(
            pending
                .iter()
                .map(|(_, device_id, request)| backend.update_device(*device_id, request.clone())),
        )
        .await;

        let mut failed = Vec::new();
        for ((index, device_id, _), result) in pending.iter().zip(results) {
            let slot = &mut self.slots[*index];
            match result {
                Ok(()) => {
                    slot.committed = true;
                    if let Some(device) = slot.device.as_mut() {
                        device.name = slot.name.to_string();
                    }
                }
                Err(e) => {
                    error!("failed to move device {device_id} to {}: {e:#}", slot.name);
                    failed.push(slot.name);
                }
            }
        }

        if failed.is_empty() {
            info!("all {} sensor locations saved", self.slots.len());
            StepOutcome::Finished
        } else {
            StepOutcome::Failed(StepError::Transient {
                operation: "save sensor locations".to_string(),
                detail: format!("could not save {}", failed.join(", ")),
            })
        }
    }

    fn sort_pool(&mut self) {
        self.available.sort_by_key(|device| device.id);
    }
}
