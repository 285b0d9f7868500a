use crate::{
    backend_client::{DeviceId, DeviceTemplateId, FacilityId, SetupBackend},
    polling::PollConfig,
    session::{CommandError, SessionView, SetupSession},
};
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio_util::sync::CancellationToken;

pub type FinishCallback = Arc<dyn Fn(FacilityId) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SetupServiceError {
    #[error("no facility selected")]
    NoFacilitySelected,
    #[error("setup of facility {0} is busy, try again later")]
    Busy(FacilityId),
    #[error(transparent)]
    Command(#[from] CommandError),
}

struct ActiveSession<B: SetupBackend> {
    facility_id: FacilityId,
    session: SharedSession<B>,
    view: watch::Receiver<SessionView>,
    cancel: CancellationToken,
}

type SharedSession<B> = Arc<AsyncMutex<SetupSession<B>>>;
type SessionGuard<B> = OwnedMutexGuard<SetupSession<B>>;

/// Holds the setup session of the currently selected facility.
pub struct SetupService<B: SetupBackend> {
    backend: Arc<B>,
    poll: PollConfig,
    on_finish: Option<FinishCallback>,
    active: Mutex<Option<ActiveSession<B>>>,
}

impl<B: SetupBackend + 'static> SetupService<B> {
    pub fn new(backend: B, poll: PollConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            poll,
            on_finish: None,
            active: Mutex::new(None),
        }
    }

    pub fn with_finish_callback(mut self, callback: FinishCallback) -> Self {
        self.on_finish = Some(callback);
        self
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession<B>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start setup for `facility_id`.
    ///
    /// Switching to another facility cancels the polls of the previous session
    /// and throws its state away. Selecting the current facility again keeps
    /// the running session.
    pub fn select_facility(&self, facility_id: FacilityId) -> SessionView {
        let mut active = self.lock_active();

        if let Some(current) = active.as_ref().filter(|a| a.facility_id == facility_id) {
            debug!("facility {facility_id} already selected");
            return current.view.borrow().clone();
        }

        let cancel = CancellationToken::new();
        let mut session =
            SetupSession::new(self.backend.clone(), facility_id, self.poll, cancel.clone());
        if let Some(callback) = &self.on_finish {
            let callback = callback.clone();
            session = session.with_finish_hook(Box::new(move |id| callback(id)));
        }
        let view = session.subscribe();
        let session = Arc::new(AsyncMutex::new(session));

        if let Some(previous) = active.replace(ActiveSession {
            facility_id,
            session: session.clone(),
            view: view.clone(),
            cancel,
        }) {
            info!(
                "switching setup from facility {} to {facility_id}",
                previous.facility_id
            );
            previous.cancel.cancel();
        } else {
            info!("starting setup of facility {facility_id}");
        }
        drop(active);

        Self::spawn_activation(session);
        let current = view.borrow().clone();
        current
    }

    pub fn view(&self) -> Result<SessionView, SetupServiceError> {
        self.lock_active()
            .as_ref()
            .map(|active| active.view.borrow().clone())
            .ok_or(SetupServiceError::NoFacilitySelected)
    }

    pub fn subscribe(&self) -> Result<watch::Receiver<SessionView>, SetupServiceError> {
        self.lock_active()
            .as_ref()
            .map(|active| active.view.clone())
            .ok_or(SetupServiceError::NoFacilitySelected)
    }

    /// Cancel the running session, if any.
    pub fn shutdown(&self) {
        if let Some(active) = self.lock_active().take() {
            info!("stopping setup of facility {}", active.facility_id);
            active.cancel.cancel();
        }
    }

    pub async fn select_pv_system(
        &self,
        template_id: DeviceTemplateId,
    ) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.select_pv_system(template_id).await;
        Self::complete(session, guard, result)
    }

    pub async fn submit_sensor_kit_code(
        &self,
        code: &str,
    ) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.submit_sensor_kit_code(code).await;
        Self::complete(session, guard, result)
    }

    pub fn assign_location(
        &self,
        slot: usize,
        device_id: DeviceId,
    ) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.assign_location(slot, device_id);
        Self::complete(session, guard, result)
    }

    pub fn clear_location(&self, slot: usize) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.clear_location(slot);
        Self::complete(session, guard, result)
    }

    pub async fn confirm_locations(&self) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.confirm_locations().await;
        Self::complete(session, guard, result)
    }

    pub async fn configure(&self) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.configure().await;
        Self::complete(session, guard, result)
    }

    pub async fn retry(&self) -> Result<SessionView, SetupServiceError> {
        let (session, mut guard) = self.acquire()?;
        let result = guard.retry().await;
        Self::complete(session, guard, result)
    }

    /// Lock the active session without waiting; a session busy polling is reported as such.
    fn acquire(&self) -> Result<(SharedSession<B>, SessionGuard<B>), SetupServiceError> {
        let active = self.lock_active();
        let active = active.as_ref().ok_or(SetupServiceError::NoFacilitySelected)?;

        let guard = active
            .session
            .clone()
            .try_lock_owned()
            .map_err(|_| SetupServiceError::Busy(active.facility_id))?;
        Ok((active.session.clone(), guard))
    }

    /// Hand the session to a background activation if the command advanced the flow.
    fn complete(
        session: SharedSession<B>,
        guard: SessionGuard<B>,
        result: Result<(), CommandError>,
    ) -> Result<SessionView, SetupServiceError> {
        result?;

        let view = guard.view();
        if guard.needs_activation() {
            drop(guard);
            Self::spawn_activation(session);
        }
        Ok(view)
    }

    fn spawn_activation(session: SharedSession<B>) {
        tokio::spawn(async move {
            session.lock().await.run_active_step().await;
        });
    }
}
