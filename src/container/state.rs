//! Container lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle of a container.
///
/// `Ready` and `Suspended` alternate while the container is alive;
/// `Terminated` is reached through shutdown. `Invalid` is a trap state
/// entered when the underlying runtime fails a transition; nothing but
/// observation succeeds on an invalid container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Ready,
    Suspended,
    Terminated,
    Invalid,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Ready => write!(f, "ready"),
            ContainerState::Suspended => write!(f, "suspended"),
            ContainerState::Terminated => write!(f, "terminated"),
            ContainerState::Invalid => write!(f, "invalid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(ContainerState::Ready.to_string(), "ready");
        assert_eq!(ContainerState::Invalid.to_string(), "invalid");
    }

    #[test]
    fn test_serialization() {
        assert_eq!(
            serde_json::to_string(&ContainerState::Suspended).unwrap(),
            "\"suspended\""
        );
    }
}
