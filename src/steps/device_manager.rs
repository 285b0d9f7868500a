use super::{StepError, StepOutcome};
use crate::{
    backend_client::{ConnectionState, DeviceManagerId, Facility, SetupBackend},
    polling::{PollConfig, PollOutcome, PollStatus, poll_until},
};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum InstallPhase {
    #[default]
    Idle,
    Connecting,
    PollingProgress {
        progress: Option<u8>,
    },
    Finished,
}

/// Connect the device manager to the facility and wait for its install.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceManagerStep {
    pub device_manager_id: Option<DeviceManagerId>,
    #[serde(flatten)]
    pub phase: InstallPhase,
}

impl DeviceManagerStep {
    pub async fn activate<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
        known_manager: Option<DeviceManagerId>,
        poll: PollConfig,
        cancel: &CancellationToken,
        report: &(dyn Fn(InstallPhase) + Send + Sync),
    ) -> StepOutcome {
        self.phase = InstallPhase::Idle;

        if facility.connection_state == ConnectionState::Configured {
            info!("facility {} already configured, skipping device manager", facility.id);
            return StepOutcome::Skipped;
        }

        let manager_id = match known_manager {
            Some(id) => id,
            None => match backend.device_manager_for_facility(facility.id).await {
                Ok(Some(manager)) => manager.id,
                Ok(None) => {
                    return StepOutcome::Failed(StepError::Transient {
                        operation: "find device manager".to_string(),
                        detail: format!("no device manager belongs to facility {}", facility.id),
                    });
                }
                Err(e) => {
                    error!("failed to find device manager of facility {}: {e:#}", facility.id);
                    return StepOutcome::Failed(StepError::transient("find device manager", &e));
                }
            },
        };
        self.device_manager_id = Some(manager_id);

        if facility.connection_state == ConnectionState::NotConnected {
            self.set_phase(InstallPhase::Connecting, report);

            if let Err(e) = backend.connect_device_manager(manager_id, facility.id).await {
                error!("failed to connect device manager {manager_id}: {e:#}");
                self.phase = InstallPhase::Idle;
                return StepOutcome::Failed(StepError::transient("connect device manager", &e));
            }
            info!("device manager {manager_id} connected to facility {}", facility.id);
        } else {
            // the first poll check tells whether a previous session left off mid-install
            info!("device manager {manager_id} already connected, checking install");
        }

        self.set_phase(InstallPhase::PollingProgress { progress: None }, report);

        let last_progress = Mutex::new(None);
        let outcome = poll_until(poll, cancel, || {
            let last_progress = &last_progress;
            async move {
                let manager = backend.device_manager(manager_id).await?;
                if let Ok(mut last) = last_progress.lock() {
                    *last = manager.update_progress;
                }
                report(InstallPhase::PollingProgress {
                    progress: manager.update_progress,
                });
                Ok(if manager.update_finished() {
                    PollStatus::Ready(())
                } else {
                    PollStatus::Pending
                })
            }
        })
        .await;

        let progress = last_progress.lock().map(|p| *p).unwrap_or(None);

        match outcome {
            PollOutcome::Completed { attempts, .. } => {
                info!("device manager {manager_id} finished after {attempts} checks");
                self.set_phase(InstallPhase::Finished, report);
                StepOutcome::Finished
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                warn!("device manager {manager_id} install timed out");
                self.phase = InstallPhase::PollingProgress { progress };
                StepOutcome::Failed(StepError::Timeout(format!(
                    "the device manager did not finish its setup within {} minutes",
                    elapsed.as_secs() / 60
                )))
            }
            PollOutcome::Failed { error, .. } => {
                error!("failed to poll device manager {manager_id}: {error:#}");
                self.phase = InstallPhase::PollingProgress { progress };
                StepOutcome::Failed(StepError::transient("check device manager", &error))
            }
            PollOutcome::Cancelled => StepOutcome::Cancelled,
        }
    }

    fn set_phase(&mut self, phase: InstallPhase, report: &(dyn Fn(InstallPhase) + Send + Sync)) {
        self.phase = phase;
        report(phase);
    }
}
