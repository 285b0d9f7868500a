use super::CompletedSteps;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Onboarding step currently shown to the user.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SetupFlowState {
    /// Pick the photovoltaic system the kit is powered by.
    PvSystem,
    /// Enter the short code printed on the sensor kit.
    SensorKitId,
    /// Connect the device manager and wait for its software install.
    DeviceManager,
    /// Wait until every sensor of the kit reported in.
    DetectSensors,
    /// Assign each sensor to its physical location.
    SensorLocations,
    /// Final confirmation.
    Configure,
    /// Setup finished, the flow is left.
    Complete,
}

impl SetupFlowState {
    pub const ALL: [SetupFlowState; 7] = [
        SetupFlowState::PvSystem,
        SetupFlowState::SensorKitId,
        SetupFlowState::DeviceManager,
        SetupFlowState::DetectSensors,
        SetupFlowState::SensorLocations,
        SetupFlowState::Configure,
        SetupFlowState::Complete,
    ];

    /// Successor in the step sequence, `None` for the terminal state.
    pub fn next(self) -> Option<SetupFlowState> {
        match self {
            SetupFlowState::PvSystem => Some(SetupFlowState::SensorKitId),
            SetupFlowState::SensorKitId => Some(SetupFlowState::DeviceManager),
            SetupFlowState::DeviceManager => Some(SetupFlowState::DetectSensors),
            SetupFlowState::DetectSensors => Some(SetupFlowState::SensorLocations),
            SetupFlowState::SensorLocations => Some(SetupFlowState::Configure),
            SetupFlowState::Configure => Some(SetupFlowState::Complete),
            SetupFlowState::Complete => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SetupFlowState::Complete
    }
}

impl fmt::Display for SetupFlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupFlowState::PvSystem => "PV system",
            SetupFlowState::SensorKitId => "sensor kit ID",
            SetupFlowState::DeviceManager => "device manager",
            SetupFlowState::DetectSensors => "detect sensors",
            SetupFlowState::SensorLocations => "sensor locations",
            SetupFlowState::Configure => "configure",
            SetupFlowState::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Events that drive the setup flow.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowEvent {
    /// The active step did its work and the user may move on.
    StepFinished,
    /// The active step had nothing to do for this facility.
    StepSkipped,
    /// The facility was marked configured.
    SetupConfigured,
    /// Another facility was selected, start over.
    FacilityChanged,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum FlowError {
    #[error("event {event:?} is not allowed in state {state}")]
    IllegalTransition {
        state: SetupFlowState,
        event: FlowEvent,
    },
    #[error("cannot advance from {from} to {to} while {current} is active")]
    IllegalAdvance {
        current: SetupFlowState,
        from: SetupFlowState,
        to: SetupFlowState,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Transition {
    pub from: SetupFlowState,
    pub to: SetupFlowState,
    pub event: FlowEvent,
}

/// Transition table: `None` marks an illegal (state, event) pair.
pub fn transition(state: SetupFlowState, event: FlowEvent) -> Option<SetupFlowState> {
    match (state, event) {
        (_, FlowEvent::FacilityChanged) => Some(SetupFlowState::PvSystem),
        (SetupFlowState::Configure, FlowEvent::SetupConfigured) => Some(SetupFlowState::Complete),
        (SetupFlowState::Configure | SetupFlowState::Complete, _) => None,
        (state, FlowEvent::StepFinished | FlowEvent::StepSkipped) => state.next(),
        (_, FlowEvent::SetupConfigured) => None,
    }
}

/// Current position of the flow plus the steps already passed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowController {
    current: SetupFlowState,
    completed: CompletedSteps,
}

impl Default for FlowController {
    fn default() -> Self {
        Self {
            current: SetupFlowState::PvSystem,
            completed: CompletedSteps::default(),
        }
    }
}

impl FlowController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SetupFlowState {
        self.current
    }

    pub fn completed(&self) -> &CompletedSteps {
        &self.completed
    }

    pub fn is_active(&self, state: SetupFlowState) -> bool {
        self.current == state
    }

    pub fn is_complete(&self) -> bool {
        self.current.is_terminal()
    }

    /// Apply `event` to the current state.
    ///
    /// Leaving a state marks it completed, except for `FacilityChanged` which
    /// clears the completion record. Illegal events leave the controller as is.
    pub fn dispatch(&mut self, event: FlowEvent) -> Result<Transition, FlowError> {
        let from = self.current;
        let to =
            transition(from, event).ok_or(FlowError::IllegalTransition { state: from, event })?;

        if event == FlowEvent::FacilityChanged {
            self.completed.reset();
        } else {
            self.completed.mark(from);
        }
        self.current = to;

        info!("setup flow: {from} -> {to} ({event:?})");

        Ok(Transition { from, to, event })
    }

    /// Checked form of moving from one step to the next.
    ///
    /// Only succeeds when `from` is the current state and `to` is its successor.
    pub fn advance(
        &mut self,
        from: SetupFlowState,
        to: SetupFlowState,
    ) -> Result<Transition, FlowError> {
        let event = if from == SetupFlowState::Configure {
            FlowEvent::SetupConfigured
        } else {
            FlowEvent::StepFinished
        };

        if from != self.current || transition(from, event) != Some(to) {
            return Err(FlowError::IllegalAdvance {
                current: self.current,
                from,
                to,
            });
        }

        self.dispatch(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod table {
        use super::*;

        #[test]
        fn finished_walks_the_step_sequence() {
            let mut state = SetupFlowState::PvSystem;
            let mut visited = vec![state];
            while let Some(next) = transition(state, FlowEvent::StepFinished) {
                state = next;
                visited.push(state);
            }
            assert_eq!(
                visited,
                vec![
                    SetupFlowState::PvSystem,
                    SetupFlowState::SensorKitId,
                    SetupFlowState::DeviceManager,
                    SetupFlowState::DetectSensors,
                    SetupFlowState::SensorLocations,
                    SetupFlowState::Configure,
                ]
            );
        }

        #[test]
        fn configure_only_leaves_through_setup_configured() {
            assert_eq!(
                transition(SetupFlowState::Configure, FlowEvent::StepFinished),
                None
            );
            assert_eq!(
                transition(SetupFlowState::Configure, FlowEvent::StepSkipped),
                None
            );
            assert_eq!(
                transition(SetupFlowState::Configure, FlowEvent::SetupConfigured),
                Some(SetupFlowState::Complete)
            );
        }

        #[test]
        fn setup_configured_is_illegal_before_configure() {
            for state in SetupFlowState::ALL {
                if state != SetupFlowState::Configure {
                    assert_eq!(transition(state, FlowEvent::SetupConfigured), None);
                }
            }
        }

        #[test]
        fn facility_change_always_restarts() {
            for state in SetupFlowState::ALL {
                assert_eq!(
                    transition(state, FlowEvent::FacilityChanged),
                    Some(SetupFlowState::PvSystem)
                );
            }
        }

        #[test]
        fn complete_is_terminal() {
            assert_eq!(
                transition(SetupFlowState::Complete, FlowEvent::StepFinished),
                None
            );
            assert!(SetupFlowState::Complete.is_terminal());
        }
    }

    mod controller {
        use super::*;

        #[test]
        fn dispatch_marks_source_completed() {
            let mut flow = FlowController::new();
            let transition = flow.dispatch(FlowEvent::StepSkipped).unwrap();
            assert_eq!(transition.from, SetupFlowState::PvSystem);
            assert_eq!(transition.to, SetupFlowState::SensorKitId);
            assert!(flow.completed().contains(SetupFlowState::PvSystem));
            assert!(flow.is_active(SetupFlowState::SensorKitId));
        }

        #[test]
        fn illegal_event_leaves_state_untouched() {
            let mut flow = FlowController::new();
            let before = flow.clone();
            let err = flow.dispatch(FlowEvent::SetupConfigured).unwrap_err();
            assert_eq!(
                err,
                FlowError::IllegalTransition {
                    state: SetupFlowState::PvSystem,
                    event: FlowEvent::SetupConfigured
                }
            );
            assert_eq!(flow, before);
        }

        #[test]
        fn completed_steps_only_grow_until_facility_change() {
            let mut flow = FlowController::new();
            let events = [
                FlowEvent::StepFinished,
                FlowEvent::StepSkipped,
                FlowEvent::StepFinished,
                FlowEvent::StepFinished,
                FlowEvent::StepFinished,
                FlowEvent::SetupConfigured,
            ];

            let mut previous = flow.completed().clone();
            for event in events {
                flow.dispatch(event).unwrap();
                let current = flow.completed().clone();
                assert!(previous.iter().all(|state| current.contains(state)));
                assert!(current.len() >= previous.len());
                previous = current;
            }
            assert!(flow.is_complete());
            assert_eq!(flow.completed().len(), 6);

            flow.dispatch(FlowEvent::FacilityChanged).unwrap();
            assert!(flow.completed().is_empty());
            assert!(flow.is_active(SetupFlowState::PvSystem));
        }

        #[test]
        fn advance_rejects_jumps() {
            let mut flow = FlowController::new();
            let err = flow
                .advance(SetupFlowState::PvSystem, SetupFlowState::SensorLocations)
                .unwrap_err();
            assert!(matches!(err, FlowError::IllegalAdvance { .. }));
            assert!(flow.is_active(SetupFlowState::PvSystem));
        }

        #[test]
        fn advance_rejects_inactive_source() {
            let mut flow = FlowController::new();
            let err = flow
                .advance(SetupFlowState::SensorKitId, SetupFlowState::DeviceManager)
                .unwrap_err();
            assert!(matches!(err, FlowError::IllegalAdvance { .. }));
        }

        #[test]
        fn advance_follows_successor() {
            let mut flow = FlowController::new();
            flow.advance(SetupFlowState::PvSystem, SetupFlowState::SensorKitId)
                .unwrap();
            assert!(flow.is_active(SetupFlowState::SensorKitId));
        }
    }
}
