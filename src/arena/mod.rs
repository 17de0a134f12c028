// Arena game loop: stage machine and frame-driven runner

mod machine;
mod runner;
mod state;

pub use machine::{ArenaStateMachine, StopHandle};
pub use runner::{run, RunOutcome};
pub use state::{ArenaState, StageFailure, Transition};
