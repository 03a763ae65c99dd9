// src/request/state.rs

//! Request states and the transitions between them
//!
//! ```text
//! created -> in_progress -> complete -> stale
//!                        \-> failed
//! ```
//!
//! `in_progress` may be re-entered with a new reason to report progress.
//! `failed` and `stale` are terminal.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Created,
    InProgress,
    Complete,
    Failed,
    Stale,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stale)
    }

    /// Whether a request in this state may move to `next`
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Created, InProgress)
                | (InProgress, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (Complete, Stale)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "in_progress" => Ok(Self::InProgress),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "stale" => Ok(Self::Stale),
            _ => Err(Error::ParseError(format!("Invalid request state: {s}"))),
        }
    }
}

/// One entry of a request's state history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: RequestState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use RequestState::*;
        assert!(Created.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Complete.can_transition_to(Stale));

        assert!(!Created.can_transition_to(Complete));
        assert!(!Failed.can_transition_to(Complete));
        assert!(!Stale.can_transition_to(Complete));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!Complete.can_transition_to(Failed));
    }

    #[test]
    fn test_parse() {
        for state in [
            RequestState::Created,
            RequestState::InProgress,
            RequestState::Complete,
            RequestState::Failed,
            RequestState::Stale,
        ] {
            assert_eq!(state.as_str().parse::<RequestState>().unwrap(), state);
        }
        assert!("done".parse::<RequestState>().is_err());
    }
}
