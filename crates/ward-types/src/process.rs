use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Handle to the supervised gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayProcess {
    pub pid: u32,
    pub port: u16,
    pub state: GatewayState,
    pub started_at: DateTime<Utc>,
    /// True when found by scanning the process table rather than launched
    /// by this supervisor.
    #[serde(default)]
    pub adopted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Unresponsive,
    Restarting,
    Killed,
}

impl GatewayState {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: GatewayState) -> bool {
        use GatewayState::*;
        matches!(
            (self, next),
            (NotRunning, Starting)
                | (Starting, Running)
                | (Starting, NotRunning)
                | (Running, Unresponsive)
                | (Unresponsive, Running)
                | (Running, Restarting)
                | (Unresponsive, Restarting)
                | (Restarting, Starting)
                | (Killed, NotRunning)
                | (_, Killed)
        )
    }
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not_running"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Unresponsive => write!(f, "unresponsive"),
            Self::Restarting => write!(f, "restarting"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayState::*;

    #[test]
    fn happy_path_transitions() {
        assert!(NotRunning.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Unresponsive));
        assert!(Unresponsive.can_transition_to(Restarting));
        assert!(Restarting.can_transition_to(Starting));
    }

    #[test]
    fn kill_is_reachable_from_anywhere() {
        for s in [NotRunning, Starting, Running, Unresponsive, Restarting, Killed] {
            assert!(s.can_transition_to(Killed));
        }
        assert!(Killed.can_transition_to(NotRunning));
    }

    #[test]
    fn illegal_transitions() {
        assert!(!NotRunning.can_transition_to(Running));
        assert!(!Killed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
    }
}
