use super::{StepError, StepOutcome, sensor_locations::LOCATION_SLOTS};
use crate::{
    backend_client::{ConnectionState, Facility, SetupBackend},
    polling::{PollConfig, PollOutcome, PollStatus, poll_until},
};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Number of sensors in a kit, one per location slot.
pub const EXPECTED_SENSOR_COUNT: usize = LOCATION_SLOTS.len();

/// Wait until every sensor of the kit shows up in the facility's devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectSensorsStep {
    pub found: usize,
    pub total: usize,
}

impl Default for DetectSensorsStep {
    fn default() -> Self {
        Self {
            found: 0,
            total: EXPECTED_SENSOR_COUNT,
        }
    }
}

enum Detection {
    Complete(usize),
    FacilityChanged(ConnectionState),
}

impl DetectSensorsStep {
    pub async fn activate<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
        poll: PollConfig,
        cancel: &CancellationToken,
        report: &(dyn Fn(usize) + Send + Sync),
    ) -> StepOutcome {
        if facility.connection_state != ConnectionState::Connected {
            info!("facility {} is not connected, skipping sensor detection", facility.id);
            return StepOutcome::Skipped;
        }

        let total = self.total;
        let found = AtomicUsize::new(self.found);

        let outcome = poll_until(poll, cancel, || {
            let found = &found;
            async move {
                let devices = backend.facility_devices(facility.id).await?;
                let sensors = devices.iter().filter(|device| device.is_sensor()).count();
                if found.swap(sensors, Ordering::SeqCst) != sensors {
                    report(sensors);
                }
                if sensors >= total {
                    return Ok(PollStatus::Ready(Detection::Complete(sensors)));
                }

                let state = backend.facility(facility.id).await?.connection_state;
                Ok(if state == ConnectionState::Connected {
                    PollStatus::Pending
                } else {
                    PollStatus::Ready(Detection::FacilityChanged(state))
                })
            }
        })
        .await;

        self.found = found.load(Ordering::SeqCst);

        match outcome {
            PollOutcome::Completed {
                value: Detection::Complete(sensors),
                attempts,
            } => {
                info!("detected {sensors} sensors after {attempts} checks");
                StepOutcome::Finished
            }
            PollOutcome::Completed {
                value: Detection::FacilityChanged(state),
                ..
            } => {
                info!(
                    "facility {} is {state:?} now, stopping sensor detection",
                    facility.id
                );
                StepOutcome::Skipped
            }
            PollOutcome::TimedOut { .. } => {
                warn!("sensor detection timed out with {}/{total} sensors", self.found);
                StepOutcome::Failed(StepError::Timeout(format!(
                    "only {} of {total} sensors were found",
                    self.found
                )))
            }
            PollOutcome::Failed { error, .. } => {
                error!("failed to poll devices of facility {}: {error:#}", facility.id);
                StepOutcome::Failed(StepError::transient("detect sensors", &error))
            }
            PollOutcome::Cancelled => StepOutcome::Cancelled,
        }
    }
}
