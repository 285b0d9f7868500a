//! One onboarding session for one facility.
//!
//! The session owns the flow controller and the local state of every step.
//! Step outcomes are turned into flow events here, and after every change
//! a fresh [`SessionView`] is published on a watch channel so readers never
//! have to wait for a running poll.

use crate::{
    backend_client::{DeviceId, DeviceTemplateId, Facility, FacilityId, SetupBackend},
    flow::{CompletedSteps, FlowController, FlowError, FlowEvent, SetupFlowState},
    polling::PollConfig,
    steps::{
        StepError, StepErrorView, StepOutcome, ValidationError,
        configure::configure,
        detect_sensors::DetectSensorsStep,
        device_manager::{DeviceManagerStep, InstallPhase},
        pv_system::PvSystemStep,
        sensor_kit::SensorKitStep,
        sensor_locations::SensorLocationsStep,
    },
};
use log::{debug, error, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub type FinishHook = Box<dyn FnOnce(FacilityId) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "camelCase")]
pub enum StepView {
    PvSystem(PvSystemStep),
    SensorKitId(SensorKitStep),
    DeviceManager(DeviceManagerStep),
    DetectSensors(DetectSensorsStep),
    SensorLocations(SensorLocationsStep),
    Configure,
    Complete,
}

/// Serializable snapshot of a session, what the UI renders.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub facility_id: FacilityId,
    pub facility: Option<Facility>,
    pub state: SetupFlowState,
    pub completed: CompletedSteps,
    pub step: StepView,
    pub error: Option<StepErrorView>,
    /// The active step is loading or waiting on the backend.
    pub running: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{expected} step is not active, current step is {current}")]
    StepNotActive {
        expected: SetupFlowState,
        current: SetupFlowState,
    },
    #[error("{0} step is still loading")]
    StepNotReady(SetupFlowState),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("there is nothing to retry")]
    NothingToRetry,
}

/// What `retry` re-runs after a retryable failure.
#[derive(Clone, Debug, PartialEq, Eq)]
enum RetryAction {
    Activate,
    SelectPvSystem(DeviceTemplateId),
    SubmitSensorKitCode(String),
    ConfirmLocations,
    Configure,
}

pub struct SetupSession<B: SetupBackend> {
    backend: Arc<B>,
    facility_id: FacilityId,
    facility: Option<Facility>,
    flow: FlowController,
    poll: PollConfig,
    cancel: CancellationToken,
    pv_system: PvSystemStep,
    sensor_kit: SensorKitStep,
    device_manager: DeviceManagerStep,
    detect_sensors: DetectSensorsStep,
    sensor_locations: SensorLocationsStep,
    error: Option<StepError>,
    retry: Option<RetryAction>,
    needs_activation: bool,
    running: bool,
    view_tx: watch::Sender<SessionView>,
    on_finish: Option<FinishHook>,
}

impl<B: SetupBackend> SetupSession<B> {
    pub fn new(
        backend: Arc<B>,
        facility_id: FacilityId,
        poll: PollConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (view_tx, _) = watch::channel(SessionView {
            facility_id,
            facility: None,
            state: SetupFlowState::PvSystem,
            completed: CompletedSteps::default(),
            step: StepView::PvSystem(PvSystemStep::default()),
            error: None,
            running: false,
        });

        let session = Self {
            backend,
            facility_id,
            facility: None,
            flow: FlowController::new(),
            poll,
            cancel,
            pv_system: PvSystemStep::default(),
            sensor_kit: SensorKitStep::default(),
            device_manager: DeviceManagerStep::default(),
            detect_sensors: DetectSensorsStep::default(),
            sensor_locations: SensorLocationsStep::default(),
            error: None,
            retry: None,
            needs_activation: true,
            running: false,
            view_tx,
            on_finish: None,
        };
        session.publish();
        session
    }

    /// Called once when the flow reaches its terminal state.
    pub fn with_finish_hook(mut self, hook: FinishHook) -> Self {
        self.on_finish = Some(hook);
        self
    }

    pub fn facility_id(&self) -> FacilityId {
        self.facility_id
    }

    pub fn current(&self) -> SetupFlowState {
        self.flow.current()
    }

    pub fn needs_activation(&self) -> bool {
        self.needs_activation
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }

    pub fn view(&self) -> SessionView {
        let state = self.flow.current();
        let step = match state {
            SetupFlowState::PvSystem => StepView::PvSystem(self.pv_system.clone()),
            SetupFlowState::SensorKitId => StepView::SensorKitId(self.sensor_kit.clone()),
            SetupFlowState::DeviceManager => StepView::DeviceManager(self.device_manager.clone()),
            SetupFlowState::DetectSensors => StepView::DetectSensors(self.detect_sensors.clone()),
            SetupFlowState::SensorLocations => {
                StepView::SensorLocations(self.sensor_locations.clone())
            }
            SetupFlowState::Configure => StepView::Configure,
            SetupFlowState::Complete => StepView::Complete,
        };

        SessionView {
            facility_id: self.facility_id,
            facility: self.facility.clone(),
            state,
            completed: self.flow.completed().clone(),
            step,
            error: self.error.as_ref().map(StepError::view),
            running: self.running || self.needs_activation,
        }
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }

    /// Activate the current step and keep going while steps finish or skip on
    /// their own. Returns once a step waits for input, fails, or the session
    /// is cancelled.
    pub async fn run_active_step(&mut self) {
        while self.needs_activation && !self.cancel.is_cancelled() {
            self.needs_activation = false;
            self.running = true;
            self.publish();

            let state = self.flow.current();
            debug!("activating {state} step for facility {}", self.facility_id);
            let outcome = self.activate(state).await;

            self.running = false;
            if matches!(outcome, StepOutcome::Cancelled) {
                info!("setup of facility {} cancelled", self.facility_id);
                return;
            }
            self.apply(state, outcome, RetryAction::Activate);
        }
    }

    async fn activate(&mut self, state: SetupFlowState) -> StepOutcome {
        if state.is_terminal() {
            return StepOutcome::AwaitingInput;
        }

        let facility = match self.refresh_facility().await {
            Ok(facility) => facility,
            Err(outcome) => return outcome,
        };

        let backend = &*self.backend;
        let view_tx = &self.view_tx;

        match state {
            SetupFlowState::PvSystem => self.pv_system.activate(backend, &facility).await,
            SetupFlowState::SensorKitId => self.sensor_kit.activate(&facility),
            SetupFlowState::DeviceManager => {
                let known_manager = self.sensor_kit.device_manager.as_ref().map(|m| m.id);
                let report = |phase: InstallPhase| {
                    view_tx.send_modify(|view| {
                        if let StepView::DeviceManager(step) = &mut view.step {
                            step.phase = phase;
                        }
                    })
                };
                self.device_manager
                    .activate(
                        backend,
                        &facility,
                        known_manager,
                        self.poll,
                        &self.cancel,
                        &report,
                    )
                    .await
            }
            SetupFlowState::DetectSensors => {
                let report = |found: usize| {
                    view_tx.send_modify(|view| {
                        if let StepView::DetectSensors(step) = &mut view.step {
                            step.found = found;
                        }
                    })
                };
                self.detect_sensors
                    .activate(backend, &facility, self.poll, &self.cancel, &report)
                    .await
            }
            SetupFlowState::SensorLocations => {
                self.sensor_locations.activate(backend, &facility).await
            }
            SetupFlowState::Configure | SetupFlowState::Complete => StepOutcome::AwaitingInput,
        }
    }

    async fn refresh_facility(&mut self) -> Result<Facility, StepOutcome> {
        match self.backend.facility(self.facility_id).await {
            Ok(facility) => {
                self.facility = Some(facility.clone());
                Ok(facility)
            }
            Err(e) => {
                error!("failed to load facility {}: {e:#}", self.facility_id);
                Err(StepOutcome::Failed(StepError::transient("load facility", &e)))
            }
        }
    }

    /// Turn a step outcome into a flow event and publish the result.
    fn apply(&mut self, state: SetupFlowState, outcome: StepOutcome, retry: RetryAction) {
        match outcome {
            StepOutcome::Finished | StepOutcome::Skipped => {
                let event = match (state, &outcome) {
                    (SetupFlowState::Configure, _) => FlowEvent::SetupConfigured,
                    (_, StepOutcome::Skipped) => FlowEvent::StepSkipped,
                    _ => FlowEvent::StepFinished,
                };
                self.error = None;
                self.retry = None;

                match self.flow.dispatch(event) {
                    Ok(transition) if transition.to.is_terminal() => self.finish(),
                    Ok(_) => self.needs_activation = true,
                    Err(e) => error!("setup flow rejected outcome of {state} step: {e}"),
                }
            }
            StepOutcome::AwaitingInput => {
                self.error = None;
                self.retry = None;
            }
            StepOutcome::Failed(error) => {
                self.retry = error.is_retryable().then_some(retry);
                self.error = Some(error);
            }
            StepOutcome::Cancelled => {}
        }

        self.publish();
    }

    fn finish(&mut self) {
        info!("setup of facility {} complete", self.facility_id);
        if let Some(hook) = self.on_finish.take() {
            hook(self.facility_id);
        }
    }

    fn ensure_active(&self, expected: SetupFlowState) -> Result<(), CommandError> {
        let current = self.flow.current();
        if current != expected {
            return Err(CommandError::StepNotActive { expected, current });
        }
        if self.needs_activation || self.running {
            return Err(CommandError::StepNotReady(current));
        }
        Ok(())
    }

    /// Facility as seen by the last activation, loaded again if that failed.
    async fn command_facility(
        &mut self,
        state: SetupFlowState,
        retry: &RetryAction,
    ) -> Option<Facility> {
        if let Some(facility) = &self.facility {
            return Some(facility.clone());
        }
        match self.refresh_facility().await {
            Ok(facility) => Some(facility),
            Err(outcome) => {
                self.apply(state, outcome, retry.clone());
                None
            }
        }
    }

    pub async fn select_pv_system(
        &mut self,
        template_id: DeviceTemplateId,
    ) -> Result<(), CommandError> {
        let state = SetupFlowState::PvSystem;
        self.ensure_active(state)?;

        let retry = RetryAction::SelectPvSystem(template_id);
        let Some(facility) = self.command_facility(state, &retry).await else {
            return Ok(());
        };

        let outcome = self
            .pv_system
            .select(&*self.backend, &facility, template_id)
            .await;
        self.apply(state, outcome, retry);
        Ok(())
    }

    pub async fn submit_sensor_kit_code(&mut self, code: &str) -> Result<(), CommandError> {
        let state = SetupFlowState::SensorKitId;
        self.ensure_active(state)?;

        let retry = RetryAction::SubmitSensorKitCode(code.to_string());
        let Some(facility) = self.command_facility(state, &retry).await else {
            return Ok(());
        };

        let outcome = self
            .sensor_kit
            .submit(&*self.backend, &facility, code)
            .await;
        self.apply(state, outcome, retry);
        Ok(())
    }

    pub fn assign_location(
        &mut self,
        slot: usize,
        device_id: DeviceId,
    ) -> Result<(), CommandError> {
        self.ensure_active(SetupFlowState::SensorLocations)?;

        match self.sensor_locations.assign(slot, device_id) {
            Ok(()) => self.clear_validation_error(),
            Err(e @ ValidationError::UnknownSlot(_)) => {
                return Err(CommandError::InvalidInput(e.to_string()));
            }
            Err(e) => {
                self.retry = None;
                self.error = Some(e.into());
            }
        }
        self.publish();
        Ok(())
    }

    pub fn clear_location(&mut self, slot: usize) -> Result<(), CommandError> {
        self.ensure_active(SetupFlowState::SensorLocations)?;

        self.sensor_locations
            .clear(slot)
            .map_err(|e| CommandError::InvalidInput(e.to_string()))?;
        self.publish();
        Ok(())
    }

    pub async fn confirm_locations(&mut self) -> Result<(), CommandError> {
        let state = SetupFlowState::SensorLocations;
        self.ensure_active(state)?;

        let outcome = self.sensor_locations.confirm(&*self.backend).await;
        self.apply(state, outcome, RetryAction::ConfirmLocations);
        Ok(())
    }

    pub async fn configure(&mut self) -> Result<(), CommandError> {
        let state = SetupFlowState::Configure;
        self.ensure_active(state)?;

        let retry = RetryAction::Configure;
        let Some(facility) = self.command_facility(state, &retry).await else {
            return Ok(());
        };

        let outcome = configure(&*self.backend, &facility).await;
        self.apply(state, outcome, retry);
        Ok(())
    }

    /// Re-run whatever failed last. Polling steps start over with a fresh deadline.
    pub async fn retry(&mut self) -> Result<(), CommandError> {
        let Some(action) = self.retry.take() else {
            return Err(CommandError::NothingToRetry);
        };

        info!("retrying {action:?} on {} step", self.flow.current());
        self.error = None;

        match action {
            RetryAction::Activate => {
                self.needs_activation = true;
                self.publish();
                Ok(())
            }
            RetryAction::SelectPvSystem(template_id) => self.select_pv_system(template_id).await,
            RetryAction::SubmitSensorKitCode(code) => self.submit_sensor_kit_code(&code).await,
            RetryAction::ConfirmLocations => self.confirm_locations().await,
            RetryAction::Configure => self.configure().await,
        }
    }

    fn clear_validation_error(&mut self) {
        if matches!(self.error, Some(StepError::Validation(_))) {
            self.error = None;
        }
    }
}
