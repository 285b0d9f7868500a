//! Setup flow controller.
//!
//! An explicit finite-state machine over the onboarding steps: a state enum,
//! a transition table and a single dispatcher.

pub mod completed;
pub mod state_machine;

pub use completed::CompletedSteps;
pub use state_machine::{FlowController, FlowError, FlowEvent, SetupFlowState, Transition};
