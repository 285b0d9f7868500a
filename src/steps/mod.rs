//! Onboarding steps
//!
//! Each step owns its local state and is only driven while the flow
//! controller has it as current state. Activation and user input both end in
//! a [`StepOutcome`] which the session turns into a flow event.

pub mod configure;
pub mod detect_sensors;
pub mod device_manager;
pub mod pv_system;
pub mod sensor_kit;
pub mod sensor_locations;

use serde::Serialize;

#[derive(Debug)]
pub enum StepOutcome {
    /// Work done, move to the next step.
    Finished,
    /// Nothing to do for this facility, move to the next step.
    Skipped,
    /// Waiting for the user.
    AwaitingInput,
    Failed(StepError),
    /// The session was cancelled while the step was running.
    Cancelled,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },
    #[error("unknown PV system template {0}")]
    UnknownTemplate(i64),
    #[error("device {0} is not available for assignment")]
    DeviceUnavailable(i64),
    #[error("location slot {0} does not exist")]
    UnknownSlot(usize),
    #[error("please fill out all locations: {}", .0.join(", "))]
    UnassignedLocations(Vec<String>),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LookupError {
    #[error("sensor kit key {0} is not recognized")]
    KeyNotRecognized(String),
    #[error("sensor kit key {0} belongs to another facility")]
    KeyBelongsToAnotherFacility(String),
}

/// Errors shown inline on the active step.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StepError {
    /// User input missing or invalid, cleared on correction.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Remote entity not found or not owned by this facility.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// A request failed; retry re-issues it.
    #[error("{operation} failed: {detail}")]
    Transient { operation: String, detail: String },
    /// Polling exceeded its deadline; retry restarts it.
    #[error("{0}")]
    Timeout(String),
}

impl StepError {
    pub fn transient(operation: &str, error: &anyhow::Error) -> Self {
        StepError::Transient {
            operation: operation.to_string(),
            detail: format!("{error:#}"),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient { .. } | StepError::Timeout(_))
    }

    fn kind(&self) -> ErrorKind {
        match self {
            StepError::Validation(_) => ErrorKind::Validation,
            StepError::Lookup(_) => ErrorKind::Lookup,
            StepError::Transient { .. } => ErrorKind::Transient,
            StepError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            StepError::Validation(ValidationError::UnassignedLocations(_)) => {
                "Please fill out all locations"
            }
            StepError::Validation(_) => "Invalid input",
            StepError::Lookup(LookupError::KeyNotRecognized(_)) => "Key not recognized",
            StepError::Lookup(LookupError::KeyBelongsToAnotherFacility(_)) => {
                "Key belongs to another facility"
            }
            StepError::Transient { .. } => "Something went wrong",
            StepError::Timeout(_) => "This is taking longer than expected",
        }
    }

    pub fn view(&self) -> StepErrorView {
        StepErrorView {
            kind: self.kind(),
            title: self.title().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    Lookup,
    Transient,
    Timeout,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorView {
    pub kind: ErrorKind,
    pub title: String,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn only_transient_and_timeout_are_retryable() {
        assert!(!StepError::from(ValidationError::Required { field: "code" }).is_retryable());
        assert!(
            !StepError::from(LookupError::KeyNotRecognized("1".to_string())).is_retryable()
        );
        assert!(StepError::transient("create device", &anyhow!("503")).is_retryable());
        assert!(StepError::Timeout("late".to_string()).is_retryable());
    }

    #[test]
    fn view_carries_title_and_message() {
        let view = StepError::from(LookupError::KeyBelongsToAnotherFacility(
            "123456".to_string(),
        ))
        .view();
        assert_eq!(view.kind, ErrorKind::Lookup);
        assert_eq!(view.title, "Key belongs to another facility");
        assert_eq!(
            view.message,
            "sensor kit key 123456 belongs to another facility"
        );
        assert!(!view.retryable);
    }

    #[test]
    fn unassigned_locations_lists_slots() {
        let error = ValidationError::UnassignedLocations(vec![
            "Freezer 1".to_string(),
            "Ambient 3".to_string(),
        ]);
        assert_eq!(
            error.to_string(),
            "please fill out all locations: Freezer 1, Ambient 3"
        );
    }
}
