use super::{StepError, StepOutcome};
use crate::backend_client::{Facility, SetupBackend};
use log::{error, info};

/// Mark the facility configured, which ends the setup.
pub async fn configure<B: SetupBackend>(backend: &B, facility: &Facility) -> StepOutcome {
    match backend.mark_configured(facility.id).await {
        Ok(()) => {
            info!("facility {} configured", facility.id);
            StepOutcome::Finished
        }
        Err(e) => {
            error!("failed to mark facility {} configured: {e:#}", facility.id);
            StepOutcome::Failed(StepError::transient("finish setup", &e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_client::{ConnectionState, MockSetupBackend};
    use anyhow::anyhow;

    fn facility() -> Facility {
        Facility {
            id: 42,
            name: "Seed Bank".to_string(),
            connection_state: ConnectionState::Connected,
        }
    }

    #[tokio::test]
    async fn marks_facility_configured() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_mark_configured()
            .times(1)
            .withf(|id| *id == 42)
            .returning(|_| Ok(()));
        assert!(matches!(
            configure(&backend, &facility()).await,
            StepOutcome::Finished
        ));
    }

    #[tokio::test]
    async fn failure_is_generic_and_retryable() {
        let mut backend = MockSetupBackend::new();
        backend
            .expect_mark_configured()
            .returning(|_| Err(anyhow!("500")));
        match configure(&backend, &facility()).await {
            StepOutcome::Failed(error) => {
                assert!(error.is_retryable());
                assert_eq!(error.view().title, "Something went wrong");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
