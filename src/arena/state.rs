use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Stage of the arena game loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ArenaState {
    FindingBases,
    FindingAgents,
    HomingAgents,
    FacingOpponents,
    WaitingForBall,
    PlayingGame,
    /// Terminal
    Stopped,
}

impl ArenaState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArenaState::Stopped)
    }
}

impl fmt::Display for ArenaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArenaState::FindingBases => "finding bases",
            ArenaState::FindingAgents => "finding agents",
            ArenaState::HomingAgents => "homing agents",
            ArenaState::FacingOpponents => "facing opponents",
            ArenaState::WaitingForBall => "waiting for ball",
            ArenaState::PlayingGame => "playing game",
            ArenaState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Broadcast on every state change
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    /// Arena run this transition belongs to
    pub session: Uuid,
    pub from: ArenaState,
    pub to: ArenaState,
    /// Tick on which the transition happened (first tick is 1)
    pub tick: u64,
    pub at: DateTime<Utc>,
}

/// Why the arena stopped on its own
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageFailure {
    #[error("{stage} did not complete within {}s", .timeout.as_secs())]
    Timeout { stage: ArenaState, timeout: Duration },
}

impl StageFailure {
    /// Stage that failed
    pub fn stage(&self) -> ArenaState {
        match self {
            StageFailure::Timeout { stage, .. } => *stage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_names_the_stage() {
        let failure = StageFailure::Timeout {
            stage: ArenaState::FindingBases,
            timeout: Duration::from_secs(60),
        };
        assert_eq!(failure.to_string(), "finding bases did not complete within 60s");
        assert_eq!(failure.stage(), ArenaState::FindingBases);
    }

    #[test]
    fn test_only_stopped_is_terminal() {
        assert!(ArenaState::Stopped.is_terminal());
        assert!(!ArenaState::PlayingGame.is_terminal());
    }
}
