use thiserror::Error;

/// Processor lifecycle state. Only ever changed with the interrupt lock held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RunState {
    /// Executing instructions.
    Started,
    /// A stop was requested or a fatal condition was hit; resets still pending.
    Stopping,
    /// Parked on the processor's condition variable.
    #[default]
    Stopped,
    /// PSW wait bit is on; parked until an enabled interrupt arrives.
    Waiting,
}

/// Events that drive [`RunState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum LifecycleEvent {
    /// Operator or SIGP stop.
    StopRequest,
    /// Program-interrupt loop, invalid new PSW, or lock-discipline breach.
    Fatal,
    /// The PSW entered a wait with every maskable class disabled.
    DisabledWait,
    /// All pending resets were applied.
    ResetsDrained,
    /// Operator or SIGP start.
    Start,
    /// Operator or SIGP restart.
    Restart,
    /// The PSW wait bit was found on.
    EnterWait,
    /// An enabled interrupt became pending for a waiting processor.
    Wake,
}

/// An event that is not accepted in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lifecycle event {event:?} is not valid in state {from:?}")]
pub struct TransitionError {
    /// State the processor was in.
    pub from: RunState,
    /// Rejected event.
    pub event: LifecycleEvent,
}

impl RunState {
    /// Applies `event`, returning the resulting state.
    ///
    /// `Stopped` only leaves via [`LifecycleEvent::Start`] or
    /// [`LifecycleEvent::Restart`]; a wake-up never resumes a stopped processor.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] when the event is not defined for `self`.
    pub const fn transition(self, event: LifecycleEvent) -> Result<Self, TransitionError> {
        use LifecycleEvent as E;
        let next = match (self, event) {
            (Self::Started | Self::Stopping | Self::Stopped, E::Start)
            | (_, E::Restart)
            | (Self::Started | Self::Waiting, E::Wake) => Self::Started,
            (Self::Started | Self::Waiting | Self::Stopping, E::StopRequest | E::Fatal)
            | (Self::Started | Self::Waiting, E::DisabledWait)
            | (Self::Stopping, E::Wake) => Self::Stopping,
            (Self::Stopping | Self::Stopped, E::ResetsDrained)
            | (Self::Stopped, E::StopRequest | E::Fatal) => Self::Stopped,
            (Self::Started | Self::Waiting, E::EnterWait) | (Self::Waiting, E::Start) => {
                Self::Waiting
            }
            _ => return Err(TransitionError { from: self, event }),
        };
        Ok(next)
    }

    /// Returns `true` while the processor should be fetching instructions.
    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(self, Self::Started)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{LifecycleEvent as E, RunState};

    #[test]
    fn run_state_default_is_stopped() {
        assert_eq!(RunState::default(), RunState::Stopped);
    }

    #[rstest]
    #[case(RunState::Started, E::StopRequest, RunState::Stopping)]
    #[case(RunState::Started, E::Fatal, RunState::Stopping)]
    #[case(RunState::Started, E::DisabledWait, RunState::Stopping)]
    #[case(RunState::Started, E::EnterWait, RunState::Waiting)]
    #[case(RunState::Waiting, E::Wake, RunState::Started)]
    #[case(RunState::Waiting, E::DisabledWait, RunState::Stopping)]
    #[case(RunState::Stopping, E::ResetsDrained, RunState::Stopped)]
    #[case(RunState::Stopping, E::Start, RunState::Started)]
    #[case(RunState::Stopped, E::Start, RunState::Started)]
    #[case(RunState::Stopped, E::Restart, RunState::Started)]
    #[case(RunState::Stopped, E::StopRequest, RunState::Stopped)]
    fn defined_transitions(#[case] from: RunState, #[case] event: E, #[case] to: RunState) {
        assert_eq!(from.transition(event), Ok(to));
    }

    #[rstest]
    #[case(E::Wake)]
    #[case(E::EnterWait)]
    #[case(E::DisabledWait)]
    fn stopped_never_resumes_without_start_or_restart(#[case] event: E) {
        let next = RunState::Stopped.transition(event);
        assert!(next.map_or(true, |state| state != RunState::Started));
    }

    #[test]
    fn stopped_rejects_wake_up() {
        let err = RunState::Stopped.transition(E::Wake).unwrap_err();
        assert_eq!(err.from, RunState::Stopped);
        assert_eq!(err.event, E::Wake);
    }
}
