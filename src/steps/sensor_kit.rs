use super::{LookupError, StepError, StepOutcome, ValidationError};
use crate::backend_client::{ConnectionState, DeviceManager, Facility, SetupBackend};
use log::{error, info, warn};
use serde::Serialize;

/// Identify the sensor kit by the short code printed on its device manager.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorKitStep {
    pub code: String,
    pub device_manager: Option<DeviceManager>,
}

impl SensorKitStep {
    pub fn activate(&mut self, facility: &Facility) -> StepOutcome {
        if facility.connection_state != ConnectionState::NotConnected {
            info!("facility {} already connected, skipping sensor kit ID", facility.id);
            return StepOutcome::Skipped;
        }
        StepOutcome::AwaitingInput
    }

    pub async fn submit<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
        code: &str,
    ) -> StepOutcome {
        let code = code.trim();
        self.code = code.to_string();

        if code.is_empty() {
            return StepOutcome::Failed(ValidationError::Required { field: "sensor kit ID" }.into());
        }

        let manager = match backend.device_manager_by_short_code(code).await {
            Ok(Some(manager)) => manager,
            Ok(None) => {
                warn!("sensor kit key {code} not recognized");
                return StepOutcome::Failed(LookupError::KeyNotRecognized(code.to_string()).into());
            }
            Err(e) => {
                error!("failed to look up sensor kit key {code}: {e:#}");
                return StepOutcome::Failed(StepError::transient("look up sensor kit", &e));
            }
        };

        if let Some(owner) = manager.facility_id {
            if owner != facility.id {
                warn!(
                    "sensor kit key {code} belongs to facility {owner}, not {}",
                    facility.id
                );
                return StepOutcome::Failed(
                    LookupError::KeyBelongsToAnotherFacility(code.to_string()).into(),
                );
            }
        }

        info!("sensor kit key {code} resolved to device manager {}", manager.id);
        self.device_manager = Some(manager);
        StepOutcome::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::MockSetupBackend;
    use anyhow::anyhow;

    fn facility(id: i64) -> Facility {
        Facility {
            id,
            name: "Seed Bank".to_string(),
            connection_state: ConnectionState::NotConnected,
        }
    }

    fn manager(facility_id: Option<i64>) -> DeviceManager {
        DeviceManager {
            id: 5,
            short_code: "123456".to_string(),
            facility_id,
            is_online: true,
            update_progress: None,
        }
    }

    #[test]
    fn skips_when_already_connected() {
        let mut step = SensorKitStep::default();
        let mut connected = facility(43);
        connected.connection_state = ConnectionState::Connected;
        assert!(matches!(step.activate(&connected), StepOutcome::Skipped));
        assert!(step.device_manager.is_none());
    }

    #[tokio::test]
    async fn empty_code_is_required_error_without_lookup() {
        let backend = MockSetupBackend::new();
        let mut step = SensorKitStep::default();
        let outcome = step.submit(&backend, &facility(43), "   ").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepError::Validation(ValidationError::Required { .. }))
        ));
    }

    #[tokio::test]
    async fn unknown_code_is_not_recognized() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_manager_by_short_code()
            .returning(|_| Ok(None));
        let mut step = SensorKitStep::default();
        let outcome = step.submit(&backend, &facility(43), "ABC123").await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepError::Lookup(LookupError::KeyNotRecognized(_)))
        ));
    }

    #[tokio::test]
    async fn code_of_other_facility_does_not_advance() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_manager_by_short_code()
            .withf(|code| code == "123456")
            .returning(|_| Ok(Some(manager(Some(42)))));
        let mut step = SensorKitStep::default();
        let outcome = step.submit(&backend, &facility(43), "123456").await;
        match outcome {
            StepOutcome::Failed(error) => {
                assert_eq!(error.view().title, "Key belongs to another facility");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(step.device_manager.is_none());
    }

    #[tokio::test]
    async fn unbound_code_resolves_manager() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_manager_by_short_code()
            .returning(|_| Ok(Some(manager(None))));
        let mut step = SensorKitStep::default();
        let outcome = step.submit(&backend, &facility(43), " 123456 ").await;
        assert!(matches!(outcome, StepOutcome::Finished));
        assert_eq!(step.code, "123456");
        assert_eq!(step.device_manager.map(|m| m.id), Some(5));
    }

    #[tokio::test]
    async fn lookup_failure_is_retryable() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_manager_by_short_code()
            .returning(|_| Err(anyhow!("connection reset")));
        let mut step = SensorKitStep::default();
        match step.submit(&backend, &facility(43), "123456").await {
            StepOutcome::Failed(error) => assert!(error.is_retryable()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
