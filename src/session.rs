use crate::error::FailureKind;
use crate::types::{Branch, Outcome, PhaseMetrics, PhaseRecord, RunState};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Events that move a run through its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEvent {
    DeviceDiscovered,
    WakeAcknowledged,
    AuthAccepted,
    SeenInCloud,
    TransferAccepted,
    PlaybackConfirmed,
    WakeWindowExpired,
    PrimaryExpired,
    FallbackSucceeded,
    FallbackFailed,
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunEvent::DeviceDiscovered => "device_discovered",
            RunEvent::WakeAcknowledged => "wake_acknowledged",
            RunEvent::AuthAccepted => "auth_accepted",
            RunEvent::SeenInCloud => "seen_in_cloud",
            RunEvent::TransferAccepted => "transfer_accepted",
            RunEvent::PlaybackConfirmed => "playback_confirmed",
            RunEvent::WakeWindowExpired => "wake_window_expired",
            RunEvent::PrimaryExpired => "primary_expired",
            RunEvent::FallbackSucceeded => "fallback_succeeded",
            RunEvent::FallbackFailed => "fallback_failed",
        };
        write!(f, "{}", s)
    }
}

/// Transition table: current state x event -> next state.
///
/// `None` marks an illegal transition; hitting one is a defect in the
/// orchestrator, not a runtime condition.
pub(crate) fn transition(from: RunState, event: RunEvent) -> Option<RunState> {
    use RunEvent::*;
    use RunState::*;
    match (from, event) {
        (Unknown, DeviceDiscovered) => Some(Discovered),
        (Discovered, WakeAcknowledged) => Some(LocalAwake),
        (Discovered | LocalAwake, AuthAccepted) => Some(LoggedIn),
        // Cloud visibility can arrive from anywhere on the pre-staged path,
        // including a device suspected of deep sleep that woke up anyway.
        (Unknown | Discovered | LocalAwake | LoggedIn | DeepSleepSuspected, SeenInCloud) => {
            Some(CloudVisible)
        }
        (Discovered | LocalAwake, WakeWindowExpired) => Some(DeepSleepSuspected),
        (CloudVisible, TransferAccepted) => Some(Staged),
        (Staged, PlaybackConfirmed) => Some(Playing),
        (
            Unknown | Discovered | LocalAwake | LoggedIn | CloudVisible | Staged
            | DeepSleepSuspected,
            PrimaryExpired,
        ) => Some(FallbackActive),
        (FallbackActive, FallbackSucceeded) => Some(Playing),
        (FallbackActive, FallbackFailed) => Some(Failed),
        _ => None,
    }
}

/// Phases whose durations are tracked in the run metrics
#[derive(Debug, Clone, Copy)]
pub(crate) enum Phase {
    Discovery,
    Wake,
    Auth,
    CloudPoll,
    Stage,
    Play,
    Confirm,
}

/// Per-run bookkeeping: state-machine position, metrics, chosen branch.
///
/// One instance per orchestration run, never shared between runs.
pub(crate) struct Session {
    pub id: Uuid,
    pub device: String,
    pub state: RunState,
    /// Furthest happy-path state reached, for failure diagnostics
    pub furthest: RunState,
    pub branch: Branch,
    pub metrics: PhaseMetrics,
    pub started: Instant,
    /// Cloud device id from the most recent successful match, kept for
    /// the forced-transfer fallback step
    pub last_cloud_id: Option<String>,
}

impl Session {
    pub fn new(device: &str, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            device: device.to_string(),
            state: RunState::Unknown,
            furthest: RunState::Unknown,
            branch: Branch::FullPath,
            metrics: PhaseMetrics::default(),
            started: now,
            last_cloud_id: None,
        }
    }

    /// Apply an event through the transition table.
    ///
    /// Illegal transitions are logged as defects and leave the state
    /// untouched.
    pub fn apply(&mut self, event: RunEvent) {
        match transition(self.state, event) {
            Some(next) => {
                tracing::debug!("[{}] {} -> {} ({})", self.device, self.state, next, event);
                self.state = next;
                if let Some(progress) = next.progress() {
                    if self.furthest.progress().map_or(true, |f| progress > f) {
                        self.furthest = next;
                    }
                }
            }
            None => {
                tracing::error!(
                    "[{}] illegal transition: event {} in state {}",
                    self.device,
                    event,
                    self.state
                );
            }
        }
    }

    pub fn record_phase(&mut self, phase: Phase, started_at: Instant, now: Instant, ok: bool) {
        let record = PhaseRecord {
            duration: now.saturating_duration_since(started_at),
            ok,
        };
        let slot = match phase {
            Phase::Discovery => &mut self.metrics.discovery,
            Phase::Wake => &mut self.metrics.wake,
            Phase::Auth => &mut self.metrics.auth,
            Phase::CloudPoll => &mut self.metrics.cloud_poll,
            Phase::Stage => &mut self.metrics.stage,
            Phase::Play => &mut self.metrics.play,
            Phase::Confirm => &mut self.metrics.confirm,
        };
        *slot = Some(record);
    }

    /// Record a failure kind; only the first one sticks
    pub fn record_failure_kind(&mut self, kind: FailureKind) {
        self.metrics.first_error.get_or_insert(kind);
    }

    pub fn outcome(&self, success: bool, failure: Option<FailureKind>, total: Duration) -> Outcome {
        Outcome {
            device: self.device.clone(),
            run_id: self.id,
            branch: self.branch,
            success,
            failure,
            furthest: self.furthest,
            metrics: self.metrics.clone(),
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        let mut state = RunState::Unknown;
        for event in [
            RunEvent::DeviceDiscovered,
            RunEvent::WakeAcknowledged,
            RunEvent::AuthAccepted,
            RunEvent::SeenInCloud,
            RunEvent::TransferAccepted,
            RunEvent::PlaybackConfirmed,
        ] {
            state = transition(state, event).expect("happy-path transition must be legal");
        }
        assert_eq!(state, RunState::Playing);
    }

    #[test]
    fn fast_path_skips_to_cloud_visible() {
        assert_eq!(
            transition(RunState::Unknown, RunEvent::SeenInCloud),
            Some(RunState::CloudVisible)
        );
    }

    #[test]
    fn fallback_reachable_from_every_pre_playing_state() {
        for state in [
            RunState::Unknown,
            RunState::Discovered,
            RunState::LocalAwake,
            RunState::LoggedIn,
            RunState::CloudVisible,
            RunState::Staged,
            RunState::DeepSleepSuspected,
        ] {
            assert_eq!(
                transition(state, RunEvent::PrimaryExpired),
                Some(RunState::FallbackActive),
                "primary_expired must be legal from {}",
                state
            );
        }
        assert_eq!(transition(RunState::Playing, RunEvent::PrimaryExpired), None);
        assert_eq!(transition(RunState::Failed, RunEvent::PrimaryExpired), None);
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        let mut session = Session::new("Kitchen", Instant::now());
        session.apply(RunEvent::PlaybackConfirmed);
        assert_eq!(session.state, RunState::Unknown);
    }

    #[test]
    fn furthest_tracks_progress_not_escapes() {
        let mut session = Session::new("Kitchen", Instant::now());
        session.apply(RunEvent::DeviceDiscovered);
        session.apply(RunEvent::WakeAcknowledged);
        assert_eq!(session.furthest, RunState::LocalAwake);

        session.apply(RunEvent::WakeWindowExpired);
        assert_eq!(session.state, RunState::DeepSleepSuspected);
        // The escape does not regress the furthest marker.
        assert_eq!(session.furthest, RunState::LocalAwake);

        session.apply(RunEvent::SeenInCloud);
        assert_eq!(session.furthest, RunState::CloudVisible);
    }

    #[test]
    fn deep_sleep_can_still_fall_back() {
        let mut session = Session::new("Kitchen", Instant::now());
        session.apply(RunEvent::DeviceDiscovered);
        session.apply(RunEvent::WakeWindowExpired);
        session.apply(RunEvent::PrimaryExpired);
        assert_eq!(session.state, RunState::FallbackActive);
        session.apply(RunEvent::FallbackFailed);
        assert_eq!(session.state, RunState::Failed);
        assert_eq!(session.furthest, RunState::Discovered);
    }
}
