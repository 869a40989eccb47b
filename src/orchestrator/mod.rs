pub mod controller;
pub mod machine;
pub mod state;

pub use controller::{CompletionSignal, Controller, InvocationFlags};
pub use machine::{MachineOutcome, StageMachine, StagePlan, StopReason};
pub use state::{RunState, Stage, StageMarker};
