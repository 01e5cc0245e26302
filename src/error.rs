use crate::domain::{AlertAction, AlertId, AlertStatus};
use thiserror::Error;

/// A precondition that must hold before an alert operation may run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("device {device_id} already has active alert #{alert_id}")]
    ActiveAlertExists { device_id: String, alert_id: AlertId },

    #[error("device {device_id} is not mapped to a switch")]
    NoSwitchMapping { device_id: String },
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert #{0} not found")]
    NotFound(AlertId),

    #[error("cannot {action} alert #{alert_id} while it is {from}")]
    InvalidTransition {
        alert_id: AlertId,
        from: AlertStatus,
        action: AlertAction,
    },

    #[error("cannot snooze alert #{alert_id} for {minutes} minutes")]
    InvalidSnooze { alert_id: AlertId, minutes: u32 },

    #[error(transparent)]
    Guard(#[from] GuardViolation),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("control publish failed: {0:#}")]
    Transport(#[source] anyhow::Error),
}

impl AlertError {
    pub fn guard(&self) -> Option<&GuardViolation> {
        match self {
            AlertError::Guard(g) => Some(g),
            _ => None,
        }
    }
}

/// Stores report their uniqueness rule as a `GuardViolation`; keep it typed.
impl From<anyhow::Error> for AlertError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GuardViolation>() {
            Ok(violation) => AlertError::Guard(violation),
            Err(err) => AlertError::Storage(err),
        }
    }
}

pub type AlertResult<T> = Result<T, AlertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_guard_violations_stay_typed() {
        let violation = GuardViolation::ActiveAlertExists { device_id: "d1".into(), alert_id: 7 };
        let err = AlertError::from(anyhow::Error::new(violation.clone()));
        assert_eq!(err.guard(), Some(&violation));

        let err = AlertError::from(anyhow::anyhow!("connection reset"));
        assert!(matches!(err, AlertError::Storage(_)));
    }
}
