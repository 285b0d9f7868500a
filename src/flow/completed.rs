use super::SetupFlowState;
use serde::Serialize;
use std::collections::BTreeSet;

/// Steps that were passed through at least once.
///
/// Only grows while a session runs; `reset` is the single way to shrink it and
/// is used when the target facility changes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CompletedSteps(BTreeSet<SetupFlowState>);

impl CompletedSteps {
    pub fn mark(&mut self, state: SetupFlowState) {
        self.0.insert(state);
    }

    pub fn contains(&self, state: SetupFlowState) -> bool {
        self.0.contains(&state)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SetupFlowState> + '_ {
        self.0.iter().copied()
    }

    pub fn reset(&mut self) {
        self.0.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_twice_keeps_one_entry() {
        let mut completed = CompletedSteps::default();
        completed.mark(SetupFlowState::PvSystem);
        completed.mark(SetupFlowState::PvSystem);
        assert_eq!(completed.len(), 1);
        assert!(completed.contains(SetupFlowState::PvSystem));
    }

    #[test]
    fn reset_clears_everything() {
        let mut completed = CompletedSteps::default();
        completed.mark(SetupFlowState::PvSystem);
        completed.mark(SetupFlowState::SensorKitId);
        completed.reset();
        assert!(completed.is_empty());
    }

    #[test]
    fn serializes_in_step_order() {
        let mut completed = CompletedSteps::default();
        completed.mark(SetupFlowState::DeviceManager);
        completed.mark(SetupFlowState::PvSystem);
        let json = serde_json::to_string(&completed).unwrap();
        assert_eq!(json, r#"["pvSystem","deviceManager"]"#);
    }
}
