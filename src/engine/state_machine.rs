use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of one logical request inside a dispatcher partition.
///
/// A retry re-enters `Queued` under a freshly minted request id; the
/// correlation id and the caller's handle stay the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Queued,      // Waiting in a priority lane
    Dispatching, // Dequeued, router consulted
    Executing,   // Gates admitted, adapter call in flight
    Retrying,    // Backing off before re-enqueue
    Completed,   // Adapter returned success
    Failed,      // Any terminal failure, including TimedOut and Cancelled
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("Invalid transition from {0} to {1}")]
    InvalidTransition(RequestState, RequestState),
}

pub struct RequestStateMachine;

impl RequestStateMachine {
    pub fn transition(
        current: RequestState,
        next: RequestState,
    ) -> Result<RequestState, StateError> {
        use RequestState::*;
        match (current, next) {
            // Queued: dequeued, or cancelled / timed out / shut down in place
            (Queued, Dispatching) => Ok(next),
            (Queued, Failed) => Ok(next),

            // Dispatching
            (Dispatching, Executing) => Ok(next),
            (Dispatching, Retrying) => Ok(next), // NoCapacity, High only
            (Dispatching, Failed) => Ok(next),

            // Executing
            (Executing, Completed) => Ok(next),
            (Executing, Retrying) => Ok(next), // transient error with budget
            (Executing, Failed) => Ok(next),

            // Retrying
            (Retrying, Queued) => Ok(next),
            (Retrying, Failed) => Ok(next),

            // Terminal states (No exit)
            (Completed, _) | (Failed, _) => Err(StateError::InvalidTransition(current, next)),

            _ => Err(StateError::InvalidTransition(current, next)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestState::*;

    #[test]
    fn test_happy_path() {
        let s = RequestStateMachine::transition(Queued, Dispatching).unwrap();
        let s = RequestStateMachine::transition(s, Executing).unwrap();
        let s = RequestStateMachine::transition(s, Completed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_retry_loop() {
        let s = RequestStateMachine::transition(Executing, Retrying).unwrap();
        let s = RequestStateMachine::transition(s, Queued).unwrap();
        assert_eq!(s, Queued);
        assert!(RequestStateMachine::transition(Dispatching, Retrying).is_ok());
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for terminal in [Completed, Failed] {
            for next in [Queued, Dispatching, Executing, Retrying, Completed, Failed] {
                assert_eq!(
                    RequestStateMachine::transition(terminal, next),
                    Err(StateError::InvalidTransition(terminal, next))
                );
            }
        }
    }

    #[test]
    fn test_no_skipping_the_gate() {
        assert!(RequestStateMachine::transition(Queued, Executing).is_err());
        assert!(RequestStateMachine::transition(Queued, Completed).is_err());
        assert!(RequestStateMachine::transition(Retrying, Executing).is_err());
    }
}
