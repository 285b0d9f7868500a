use super::{StepError, StepOutcome, ValidationError};
use crate::backend_client::{
    ConnectionState, CreateDeviceRequest, DeviceTemplate, DeviceTemplateId, Facility,
    PV_TEMPLATE_CATEGORY, SetupBackend,
};
use log::{error, info};
use serde::Serialize;

/// Select the photovoltaic system powering the kit.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PvSystemStep {
    pub templates: Vec<DeviceTemplate>,
    pub selected: Option<DeviceTemplateId>,
}

impl PvSystemStep {
    pub async fn activate<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
    ) -> StepOutcome {
        if facility.connection_state != ConnectionState::NotConnected {
            info!("facility {} already connected, skipping PV system", facility.id);
            return StepOutcome::Skipped;
        }

        let templates = match backend.device_templates(PV_TEMPLATE_CATEGORY).await {
            Ok(templates) => templates,
            Err(e) => {
                error!("failed to load PV system templates: {e:#}");
                return StepOutcome::Failed(StepError::transient("load PV systems", &e));
            }
        };

        let devices = match backend.facility_devices(facility.id).await {
            Ok(devices) => devices,
            Err(e) => {
                error!("failed to load devices of facility {}: {e:#}", facility.id);
                return StepOutcome::Failed(StepError::transient("load devices", &e));
            }
        };

        if let Some(existing) = devices
            .iter()
            .find(|device| templates.iter().any(|template| template.matches(device)))
        {
            info!(
                "PV system {} ({} {}) already registered",
                existing.id, existing.make, existing.model
            );
            return StepOutcome::Skipped;
        }

        self.templates = templates;
        StepOutcome::AwaitingInput
    }

    /// Create a device from the chosen template.
    pub async fn select<B: SetupBackend>(
        &mut self,
        backend: &B,
        facility: &Facility,
        template_id: DeviceTemplateId,
    ) -> StepOutcome {
        let Some(template) = self.templates.iter().find(|t| t.id == template_id) else {
            return StepOutcome::Failed(ValidationError::UnknownTemplate(template_id).into());
        };

        self.selected = Some(template_id);

        match backend
            .create_device(CreateDeviceRequest::from_template(facility.id, template))
            .await
        {
            Ok(device_id) => {
                info!("created PV system device {device_id} from template {template_id}");
                StepOutcome::Finished
            }
            Err(e) => {
                error!("failed to create PV system device: {e:#}");
                StepOutcome::Failed(StepError::transient("create PV system", &e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::{Device, MockSetupBackend};
    use anyhow::anyhow;

    fn facility(connection_state: ConnectionState) -> Facility {
        Facility {
            id: 42,
            name: "Seed Bank".to_string(),
            connection_state,
        }
    }

    fn template(id: i64, make: &str, model: &str) -> DeviceTemplate {
        DeviceTemplate {
            id,
            category: PV_TEMPLATE_CATEGORY.to_string(),
            name: format!("{make} {model}"),
            device_type: "BMU".to_string(),
            make: make.to_string(),
            model: model.to_string(),
            protocol: Some("modbus".to_string()),
            address: Some("192.168.2.50".to_string()),
            port: Some(502),
            settings: None,
            polling_interval: Some(60),
            verbosity: None,
        }
    }

    fn device(id: i64, make: &str, model: &str) -> Device {
        Device {
            id,
            facility_id: 42,
            name: format!("{make} {model}"),
            device_type: "BMU".to_string(),
            make: make.to_string(),
            model: model.to_string(),
            protocol: None,
            address: None,
            port: None,
            settings: None,
            polling_interval: None,
            parent_id: None,
            verbosity: None,
        }
    }

    #[tokio::test]
    async fn skips_when_facility_connected() {
        let backend = MockSetupBackend::new();
        let mut step = PvSystemStep::default();
        let outcome = step
            .activate(&backend, &facility(ConnectionState::Connected))
            .await;
        assert!(matches!(outcome, StepOutcome::Skipped));
    }

    #[tokio::test]
    async fn skips_when_matching_device_exists() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_templates()
            .returning(|_| Ok(vec![template(1, "Blue Ion", "LX")]));
        backend
            .expect_facility_devices()
            .returning(|_| Ok(vec![device(7, "Blue Ion", "LX")]));

        let mut step = PvSystemStep::default();
        let outcome = step
            .activate(&backend, &facility(ConnectionState::NotConnected))
            .await;
        assert!(matches!(outcome, StepOutcome::Skipped));
    }

    #[tokio::test]
    async fn waits_for_selection_without_matching_device() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_templates()
            .withf(|category| category == "PV")
            .returning(|_| Ok(vec![template(1, "Blue Ion", "LX"), template(2, "Tesla", "PW2")]));
        backend
            .expect_facility_devices()
            .returning(|_| Ok(vec![device(7, "Other", "Device")]));

        let mut step = PvSystemStep::default();
        let outcome = step
            .activate(&backend, &facility(ConnectionState::NotConnected))
            .await;
        assert!(matches!(outcome, StepOutcome::AwaitingInput));
        assert_eq!(step.templates.len(), 2);
    }

    #[tokio::test]
    async fn template_fetch_failure_is_transient() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_device_templates()
            .returning(|_| Err(anyhow!("503 service unavailable")));

        let mut step = PvSystemStep::default();
        let outcome = step
            .activate(&backend, &facility(ConnectionState::NotConnected))
            .await;
        match outcome {
            StepOutcome::Failed(error) => assert!(error.is_retryable()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn selection_creates_exactly_one_matching_device() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_create_device()
            .times(1)
            .withf(|request| {
                request.facility_id == 42
                    && request.make == "Tesla"
                    && request.model == "PW2"
                    && request.device_type == "BMU"
            })
            .returning(|_| Ok(99));

        let mut step = PvSystemStep {
            templates: vec![template(1, "Blue Ion", "LX"), template(2, "Tesla", "PW2")],
            selected: None,
        };
        let outcome = step
            .select(&backend, &facility(ConnectionState::NotConnected), 2)
            .await;
        assert!(matches!(outcome, StepOutcome::Finished));
        assert_eq!(step.selected, Some(2));
    }

    #[tokio::test]
    async fn unknown_template_is_rejected_without_request() {
        let backend = MockSetupBackend::new();
        let mut step = PvSystemStep {
            templates: vec![template(1, "Blue Ion", "LX")],
            selected: None,
        };
        let outcome = step
            .select(&backend, &facility(ConnectionState::NotConnected), 5)
            .await;
        assert!(matches!(
            outcome,
            StepOutcome::Failed(StepError::Validation(ValidationError::UnknownTemplate(5)))
        ));
    }
}
