//! Process-wide run state

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

use crate::{Error, Result};

/// Orchestrator run state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Not running; the driver is not polled
    #[default]
    Stopped,
    /// Probing presets before the first poll
    Starting,
    /// Polling and replying
    Running,
    /// Polling, but new turns are not processed
    Paused,
    /// Driver session lost; retrying with backoff
    Reconnecting,
    /// Draining in-flight turns
    Stopping,
}

impl RunState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
        }
    }

    /// Whether `self -> next` is a defined transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RunState as S;
        matches!(
            (self, next),
            (S::Stopped, S::Starting)
                | (S::Starting, S::Running | S::Stopping | S::Stopped)
                | (S::Running, S::Paused | S::Reconnecting | S::Stopping)
                | (S::Paused, S::Running | S::Reconnecting | S::Stopping)
                | (S::Reconnecting, S::Running | S::Paused | S::Stopping | S::Stopped)
                | (S::Stopping, S::Stopped)
        )
    }

    /// Whether the driver is being polled
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Reconnecting)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run state behind a watch channel
///
/// Every change goes through [`StateMachine::transition`], so observers see
/// only defined transitions.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunState::Stopped);
        Self { tx }
    }

    #[must_use]
    pub fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if `next` is not reachable from
    /// the current state
    pub fn transition(&self, next: RunState) -> Result<RunState> {
        self.transition_from(&[], next)
    }

    /// Move to `next` only when the current state is one of `from`
    ///
    /// An empty `from` accepts any state with a defined transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the current state is not
    /// accepted
    pub fn transition_from(&self, from: &[RunState], next: RunState) -> Result<RunState> {
        let mut previous = RunState::Stopped;
        let mut allowed = false;
        self.tx.send_if_modified(|state| {
            previous = *state;
            allowed = (from.is_empty() || from.contains(state)) && state.can_transition_to(next);
            if allowed {
                *state = next;
            }
            allowed
        });

        if allowed {
            tracing::info!(from = %previous, to = %next, "run state changed");
            Ok(previous)
        } else {
            Err(Error::InvalidTransition(format!("cannot go from {previous} to {next}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let sm = StateMachine::new();
        for next in [
            RunState::Starting,
            RunState::Running,
            RunState::Paused,
            RunState::Running,
            RunState::Stopping,
            RunState::Stopped,
        ] {
            sm.transition(next).unwrap();
        }
        assert_eq!(sm.get(), RunState::Stopped);
    }

    #[test]
    fn rejects_undefined_transitions() {
        let sm = StateMachine::new();
        assert!(matches!(sm.transition(RunState::Running), Err(Error::InvalidTransition(_))));
        assert!(sm.transition(RunState::Paused).is_err());
        assert_eq!(sm.get(), RunState::Stopped);
    }

    #[test]
    fn reconnect_exhaustion_stops() {
        let sm = StateMachine::new();
        sm.transition(RunState::Starting).unwrap();
        sm.transition(RunState::Running).unwrap();
        sm.transition(RunState::Reconnecting).unwrap();
        assert!(RunState::Reconnecting.can_transition_to(RunState::Stopped));
        sm.transition(RunState::Stopped).unwrap();
    }

    #[test]
    fn transition_from_checks_source() {
        let sm = StateMachine::new();
        sm.transition(RunState::Starting).unwrap();
        sm.transition(RunState::Running).unwrap();
        assert!(sm.transition_from(&[RunState::Paused], RunState::Running).is_err());
        assert_eq!(
            sm.transition_from(&[RunState::Running], RunState::Paused).unwrap(),
            RunState::Running
        );
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();
        sm.transition(RunState::Starting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RunState::Starting);
    }
}
